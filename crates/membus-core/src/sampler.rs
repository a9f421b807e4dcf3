//! Poisson-spaced latency sampling.
//!
//! Independent participants sampling the same bus at a fixed period would
//! alias with each other and read their own probes as contention. Drawing the
//! gap between probes from an exponential distribution decorrelates them.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::bus::Bus;
use crate::scheduler::{Clock, MICROS_PER_SEC, Micros, Scheduler};
use crate::stats::SampleSet;

/// Configuration for a [`Sampler`].
#[derive(Debug, Clone)]
pub struct SamplerConfig {
    /// Mean probe rate.
    ///
    /// Bounded in practice by probe noise and by the per-bit statistic cost.
    ///
    /// **Default:** `1000`
    pub samples_per_sec: u32,

    /// Time released before the nominal end of every bit interval, leaving
    /// room for classification and scheduling slack.
    ///
    /// **Default:** `10_000` (10 ms)
    pub guard_us: Micros,

    /// Trim 3-sigma outliers from each window before returning it.
    ///
    /// **Default:** `false`
    pub remove_outliers: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            samples_per_sec: 1000,
            guard_us: 10_000,
            remove_outliers: false,
        }
    }
}

/// Drives [`Bus::probe`] at exponentially distributed intervals.
pub struct Sampler {
    config: SamplerConfig,
    rng: StdRng,
}

impl Sampler {
    pub fn new(config: SamplerConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Upper bound on readings for one interval of `interval_us`.
    pub fn max_samples(&self, interval_us: Micros) -> usize {
        (u64::from(self.config.samples_per_sec) * interval_us / MICROS_PER_SEC) as usize
    }

    /// Next inter-probe gap in whole microseconds.
    fn next_gap_us(&mut self) -> Micros {
        let rate_per_us = f64::from(self.config.samples_per_sec) / MICROS_PER_SEC as f64;
        let u: f64 = self.rng.random();
        (-(1.0 - u).ln() / rate_per_us) as Micros
    }

    /// Sample the bus for the interval ending at `interval_end`.
    ///
    /// Probing stops at `interval_end - guard` or after
    /// [`max_samples`](Self::max_samples) readings. Waits between probes are
    /// clamped to the stop time, so the call never overruns it by more than one
    /// probe.
    pub fn sample<B: Bus, C: Clock>(
        &mut self,
        bus: &B,
        sched: &Scheduler<C>,
        interval_end: Micros,
        interval_us: Micros,
    ) -> SampleSet {
        let stop = interval_end.saturating_sub(self.config.guard_us);
        let max = self.max_samples(interval_us);
        let mut readings = Vec::with_capacity(max);
        let mut next = sched.now_us();

        while readings.len() < max && sched.within_time(stop) {
            readings.push(bus.probe());
            next += self.next_gap_us();
            // A gap that already elapsed simply means the next probe is due.
            let _ = sched.poll_wait(next.min(stop));
        }

        if readings.is_empty() {
            log::warn!("sampling window closed before any probe ran");
        }
        SampleSet::new(readings, self.config.remove_outliers)
    }
}

/// Seed for a participant's sampler.
///
/// Mixes OS entropy with the process id and participant id. A purely
/// time-based seed would give participants started together the same probe
/// schedule.
pub fn participant_seed(participant_id: u32) -> u64 {
    let mut buf = [0u8; 8];
    let os = match getrandom::fill(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(e) => {
            log::warn!("OS entropy unavailable for sampler seed: {e}");
            0
        }
    };
    let time = crate::scheduler::SystemClock.now_us();
    os ^ time ^ (u64::from(std::process::id()) << 16) ^ (u64::from(participant_id) << 32)
}
