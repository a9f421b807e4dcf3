//! Covert channel between the first two discovered participants.
//!
//! After discovery, the phase-0 winner sends and the phase-1 winner receives.
//! Bits are clocked at a fixed rate from a shared start time. The sender
//! hammers the bus for a 1 and stays silent for a 0; the receiver keeps
//! issuing timed batches of atomic ops and reads a 1 whenever the average op
//! cost reaches a fixed cycle threshold.
//!
//! Unlike discovery there is no baseline comparison: the threshold is
//! calibrated offline, which lets bit intervals shrink to about a millisecond.

use rand::Rng;
use serde::Serialize;

use crate::bus::Bus;
use crate::discovery::PhaseResult;
use crate::error::{ConfigError, MembusError, Result};
use crate::scheduler::{Clock, MICROS_PER_SEC, Micros, Scheduler};

/// Per-interval latency readings retained for diagnostics.
pub const MAX_RETAINED_LATENCIES: usize = 5000;

/// Sync slack before the channel start time.
const SYNC_LEAD_US: Micros = 1_000;

/// Configuration for a [`CovertChannel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Atomic ops per timed batch. The clock is checked once per batch.
    ///
    /// **Default:** `10`
    pub batch_ops: usize,

    /// Time released before the end of every bit interval.
    ///
    /// **Default:** `10` (10 us)
    pub guard_us: Micros,

    /// Per-op latency above which a sender batch is discarded as a context
    /// switch or interrupt.
    ///
    /// **Default:** `20_000`
    pub max_op_cycles: u64,

    /// Average per-op latency, in cycles, separating a 1 from a 0.
    ///
    /// **Default:** `10_500`
    pub threshold_cycles: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            batch_ops: 10,
            guard_us: 10,
            max_op_cycles: 20_000,
            threshold_cycles: 10_500,
        }
    }
}

/// Length of one channel bit at `rate_bps`.
pub fn bit_interval_us(rate_bps: u32) -> Micros {
    MICROS_PER_SEC / u64::from(rate_bps.max(1))
}

/// Reject rates whose bit interval would round to zero microseconds.
pub fn check_rate(rate_bps: u32) -> std::result::Result<Micros, ConfigError> {
    if rate_bps == 0 || u64::from(rate_bps) > MICROS_PER_SEC {
        return Err(ConfigError::InvalidChannelRate(rate_bps));
    }
    Ok(bit_interval_us(rate_bps))
}

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    Sender,
    Receiver,
}

/// The local participant's part in the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelAssignment {
    pub role: Role,
    pub sender_id: u32,
    pub receiver_id: u32,
}

/// Pick the local role from completed discovery phases.
///
/// The phase-0 id sends and the phase-1 id receives. Returns `None` when fewer
/// than two phases completed, when both phases read the same id, or when
/// `local_id` is neither of them.
pub fn assign_role(phases: &PhaseResult, local_id: u32) -> Option<ChannelAssignment> {
    let (sender_id, receiver_id) = match phases.ids() {
        [s, r, ..] => (*s, *r),
        _ => return None,
    };
    if sender_id == receiver_id {
        return None;
    }
    let role = if local_id == sender_id {
        Role::Sender
    } else if local_id == receiver_id {
        Role::Receiver
    } else {
        return None;
    };
    Some(ChannelAssignment {
        role,
        sender_id,
        receiver_id,
    })
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Parse a string of `0` and `1` characters.
pub fn parse_bit_string(s: &str) -> std::result::Result<Vec<bool>, ConfigError> {
    s.chars()
        .enumerate()
        .map(|(i, c)| match c {
            '0' => Ok(false),
            '1' => Ok(true),
            other => Err(ConfigError::InvalidChannelData(format!(
                "'{other}' at position {i} is not a bit"
            ))),
        })
        .collect()
}

/// Expand hex digits to bits, most significant bit of each digit first.
pub fn hex_to_bits(hex: &str) -> std::result::Result<Vec<bool>, ConfigError> {
    let mut bits = Vec::with_capacity(hex.len() * 4);
    for (i, c) in hex.chars().enumerate() {
        let nibble = c.to_digit(16).ok_or_else(|| {
            ConfigError::InvalidChannelData(format!("'{c}' at position {i} is not a hex digit"))
        })?;
        bits.extend((0..4).rev().map(|b| nibble & (1 << b) != 0));
    }
    Ok(bits)
}

/// Render bits as a `0`/`1` string.
pub fn bits_to_string(bits: &[bool]) -> String {
    bits.iter().map(|&b| if b { '1' } else { '0' }).collect()
}

/// A random payload of `nbits` bits.
///
/// The density of ones is itself random, so repeated runs exercise both
/// sparse and dense payloads.
pub fn random_payload<R: Rng + ?Sized>(rng: &mut R, nbits: usize) -> Vec<bool> {
    let tenths_ones: u32 = rng.random_range(0..10);
    (0..nbits)
        .map(|_| rng.random_range(0..10u32) <= tenths_ones)
        .collect()
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// A decoded (or sent) payload and the bit indices that failed to decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelMessage {
    pub bits: Vec<bool>,
    pub erasures: Vec<usize>,
}

impl ChannelMessage {
    pub fn erasure_count(&self) -> usize {
        self.erasures.len()
    }
}

/// Result of one channel session.
#[derive(Debug, Clone, Default)]
pub struct ChannelSession {
    pub message: ChannelMessage,
    /// Per-op latencies of the last interval that recorded any, capped at
    /// [`MAX_RETAINED_LATENCIES`].
    pub latencies: Vec<u64>,
}

/// Running totals for one bit interval.
#[derive(Debug, Default)]
struct IntervalTally {
    cycles: u64,
    ops: u64,
}

impl IntervalTally {
    fn average(&self) -> Option<u64> {
        (self.ops > 0).then(|| self.cycles / self.ops)
    }
}

/// Replace the retained latencies with `window` unless it is empty.
fn keep_window(retained: &mut Vec<u64>, window: Vec<u64>) {
    if !window.is_empty() {
        *retained = window;
    }
}

/// Sender and receiver loops over a [`Bus`].
pub struct CovertChannel<'a, B: Bus, C: Clock> {
    bus: &'a B,
    sched: &'a Scheduler<C>,
    config: ChannelConfig,
}

impl<'a, B: Bus, C: Clock> CovertChannel<'a, B, C> {
    /// A `batch_ops` of zero is raised to one.
    pub fn new(bus: &'a B, sched: &'a Scheduler<C>, mut config: ChannelConfig) -> Self {
        config.batch_ops = config.batch_ops.max(1);
        Self { bus, sched, config }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    fn sync_to(&self, start_us: Micros) -> Result<()> {
        if let Err(e) = self.sched.poll_wait(start_us.saturating_sub(SYNC_LEAD_US)) {
            log::error!("already past the start point for covert channel data");
            return Err(e);
        }
        // Within the lead; a miss here is at most a few microseconds.
        let _ = self.sched.poll_wait(start_us);
        Ok(())
    }

    fn bit_end(&self, start_us: Micros, interval_us: Micros, idx: usize) -> Micros {
        (start_us + (idx as Micros + 1) * interval_us).saturating_sub(self.config.guard_us)
    }

    /// Transmit `data` from `start_us`, one bit per `1 / rate_bps` seconds.
    ///
    /// A 1 whose interval completed no batch, or whose average op cost stayed
    /// below the threshold, is recorded as an erasure: the receiver was
    /// evidently not contending. Zeros are not verified.
    pub fn send_data(
        &self,
        data: &[bool],
        rate_bps: u32,
        start_us: Micros,
    ) -> Result<ChannelSession> {
        let interval = check_rate(rate_bps).map_err(MembusError::from)?;
        let cfg = &self.config;
        self.sync_to(start_us)?;
        log::info!(
            "sending {} bits, bit interval {interval} us, threshold {}",
            data.len(),
            cfg.threshold_cycles
        );

        let mut session = ChannelSession {
            message: ChannelMessage {
                bits: data.to_vec(),
                erasures: Vec::new(),
            },
            latencies: Vec::new(),
        };

        for (idx, &bit) in data.iter().enumerate() {
            let end = self.bit_end(start_us, interval, idx);
            let mut tally = IntervalTally::default();

            if !bit {
                while self.sched.within_time(end) {
                    std::hint::spin_loop();
                }
                continue;
            }

            let mut window = Vec::new();
            while self.sched.within_time(end) {
                let cycles = self.bus.timed_batch(cfg.batch_ops);
                let per_op = cycles / cfg.batch_ops as u64;
                if per_op > cfg.max_op_cycles {
                    continue;
                }
                tally.cycles += cycles;
                tally.ops += cfg.batch_ops as u64;
                if window.len() < MAX_RETAINED_LATENCIES {
                    window.push(per_op);
                }
            }
            keep_window(&mut session.latencies, window);

            match tally.average() {
                Some(avg) if avg >= cfg.threshold_cycles => {}
                avg => {
                    log::debug!("bit {idx}: erasure, average {avg:?} cycles");
                    session.message.erasures.push(idx);
                }
            }
        }

        log::info!(
            "sender done: {} erasures in {} bits",
            session.message.erasure_count(),
            data.len()
        );
        Ok(session)
    }

    /// Receive `nbits` bits from `start_us`.
    ///
    /// Intervals are measured back to back. An interval in which no batch
    /// completed is an erasure and decodes as 0.
    pub fn receive_data(
        &self,
        nbits: usize,
        rate_bps: u32,
        start_us: Micros,
    ) -> Result<ChannelSession> {
        let interval = check_rate(rate_bps).map_err(MembusError::from)?;
        let cfg = &self.config;
        self.sync_to(start_us)?;
        log::info!(
            "receiving {nbits} bits, bit interval {interval} us, threshold {}",
            cfg.threshold_cycles
        );

        let mut session = ChannelSession {
            message: ChannelMessage {
                bits: Vec::with_capacity(nbits),
                erasures: Vec::new(),
            },
            latencies: Vec::new(),
        };

        for idx in 0..nbits {
            let end = self.bit_end(start_us, interval, idx);
            let mut tally = IntervalTally::default();

            let mut window = Vec::new();
            while self.sched.within_time(end) {
                let cycles = self.bus.timed_batch(cfg.batch_ops);
                tally.cycles += cycles;
                tally.ops += cfg.batch_ops as u64;
                if window.len() < MAX_RETAINED_LATENCIES {
                    window.push(cycles / cfg.batch_ops as u64);
                }
            }
            keep_window(&mut session.latencies, window);

            let bit = match tally.average() {
                Some(avg) => {
                    log::debug!("bit {idx}: average {avg} cycles over {} ops", tally.ops);
                    avg >= cfg.threshold_cycles
                }
                None => {
                    log::debug!("bit {idx}: erasure, no batch completed");
                    session.message.erasures.push(idx);
                    false
                }
            };
            session.message.bits.push(bit);
        }

        log::info!(
            "receiver done: {} erasures in {nbits} bits",
            session.message.erasure_count()
        );
        Ok(session)
    }
}
