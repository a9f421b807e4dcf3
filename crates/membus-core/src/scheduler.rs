//! Absolute-deadline scheduling.
//!
//! Participants never signal each other. Every phase and bit boundary is an
//! absolute wall-clock timestamp derived from the shared start time, and each
//! participant spins until it reaches that timestamp. Sleeping is never used on
//! this path: sleep granularity would smear the latency measurements.
//!
//! Timestamps are microseconds since the Unix epoch ([`Micros`]).

use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{MembusError, Result};

/// Microseconds since the Unix epoch.
pub type Micros = u64;

pub const MICROS_PER_SEC: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Clocks
// ---------------------------------------------------------------------------

/// A source of wall-clock time shared (via NTP, not memory) by all participants.
pub trait Clock {
    fn now_us(&self) -> Micros;
}

impl<T: Clock + ?Sized> Clock for &T {
    fn now_us(&self) -> Micros {
        (**self).now_us()
    }
}

/// The system realtime clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now_us(&self) -> Micros {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_micros() as u64
    }
}

/// Verify the realtime clock resolves at least one microsecond.
#[cfg(unix)]
pub fn check_clock_precision() -> Result<u64> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_getres only writes into the timespec we pass.
    let rc = unsafe { libc::clock_getres(libc::CLOCK_REALTIME, &mut ts) };
    let resolution_ns = if rc == 0 {
        (ts.tv_sec as u64) * 1_000_000_000 + ts.tv_nsec as u64
    } else {
        u64::MAX
    };
    log::info!("wall clock resolution: {resolution_ns} ns");
    if resolution_ns > 1_000 {
        log::error!("need at least microsecond precision on wall clock time");
        return Err(MembusError::ClockPrecisionInsufficient { resolution_ns });
    }
    Ok(resolution_ns)
}

#[cfg(not(unix))]
pub fn check_clock_precision() -> Result<u64> {
    // SystemTime is reported in 100 ns units on the remaining platforms.
    Ok(100)
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Deadline checks and busy-wait polling over a [`Clock`].
#[derive(Debug, Clone, Default)]
pub struct Scheduler<C: Clock = SystemClock> {
    clock: C,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }

    #[inline]
    pub fn now_us(&self) -> Micros {
        self.clock.now_us()
    }

    /// True iff the clock is strictly before `deadline`.
    #[inline]
    pub fn within_time(&self, deadline: Micros) -> bool {
        self.clock.now_us() < deadline
    }

    /// Spin until `deadline`.
    ///
    /// Returns [`MembusError::SyncPointMissed`] without waiting if the deadline
    /// has already passed.
    pub fn poll_wait(&self, deadline: Micros) -> Result<()> {
        let now = self.clock.now_us();
        if now >= deadline {
            return Err(MembusError::SyncPointMissed {
                deadline_us: deadline,
                now_us: now,
            });
        }
        while self.clock.now_us() < deadline {
            std::hint::spin_loop();
        }
        Ok(())
    }
}
