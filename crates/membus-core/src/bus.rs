//! Timed and untimed atomic operations on the monitored address.
//!
//! [`Bus`] is the only architecture-specific seam of the protocol: everything
//! above it (sampling, classification, discovery, the channel) is portable and
//! runs unchanged against the simulated buses in [`crate::sim`].

use crate::counter::{read_cycles, time_cycles};
use crate::locator::SplitLine;
use crate::scheduler::{Clock, Micros, Scheduler};

/// Atomic adds performed between two deadline checks in [`write_until`].
pub const WRITER_BATCH: usize = 1000;

/// Contention primitives on one shared memory address.
pub trait Bus {
    /// One sequentially consistent atomic fetch-and-add, timed in cycles.
    fn probe(&self) -> u64;

    /// `ops` back-to-back atomic fetch-and-adds, timed as a whole in cycles.
    fn timed_batch(&self, ops: usize) -> u64;

    /// `ops` back-to-back atomic fetch-and-adds, untimed.
    fn hammer(&self, ops: usize);
}

impl<T: Bus + ?Sized> Bus for &T {
    fn probe(&self) -> u64 {
        (**self).probe()
    }

    fn timed_batch(&self, ops: usize) -> u64 {
        (**self).timed_batch(ops)
    }

    fn hammer(&self, ops: usize) {
        (**self).hammer(ops)
    }
}

// ---------------------------------------------------------------------------
// Split-line atomics
// ---------------------------------------------------------------------------

/// Locked add on a word that may span two cache lines.
///
/// Rust atomics require natural alignment, so the bus-locking split access is
/// issued directly as `lock xadd`.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn split_fetch_add(line: &SplitLine) -> u64 {
    let ptr = line.target_ptr();
    let mut val: u64 = 1;
    // SAFETY: `ptr` points at 8 bytes inside the buffer owned by `line`, which
    // outlives this call. x86 permits locked accesses at any alignment.
    unsafe {
        std::arch::asm!(
            "lock xadd qword ptr [{ptr}], {val}",
            ptr = in(reg) ptr,
            val = inout(reg) val,
            options(nostack),
        );
    }
    val
}

/// Without split locks, contend on the aligned word at the line boundary.
#[cfg(not(target_arch = "x86_64"))]
#[inline(always)]
fn split_fetch_add(line: &SplitLine) -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    // SAFETY: the aligned pointer is 8-byte aligned, inside the buffer owned by
    // `line`, and only ever accessed atomically.
    let word = unsafe { AtomicU64::from_ptr(line.aligned_ptr()) };
    word.fetch_add(1, Ordering::SeqCst)
}

impl Bus for SplitLine {
    #[inline(never)]
    fn probe(&self) -> u64 {
        time_cycles(|| {
            std::hint::black_box(split_fetch_add(self));
        })
    }

    #[inline(never)]
    fn timed_batch(&self, ops: usize) -> u64 {
        time_cycles(|| {
            for _ in 0..ops {
                std::hint::black_box(split_fetch_add(self));
            }
        })
    }

    #[inline(never)]
    fn hammer(&self, ops: usize) {
        for _ in 0..ops {
            std::hint::black_box(split_fetch_add(self));
        }
    }
}

// ---------------------------------------------------------------------------
// Bus writer
// ---------------------------------------------------------------------------

/// Generate contention until `deadline`.
///
/// The deadline is checked once per [`WRITER_BATCH`] operations; reading the
/// clock costs far more than an atomic add, so checking it sparsely keeps the
/// bus saturated. Returns the number of batches issued.
pub fn write_until<B: Bus, C: Clock>(bus: &B, sched: &Scheduler<C>, deadline: Micros) -> u64 {
    let mut batches = 0u64;
    let t0 = read_cycles();
    while sched.within_time(deadline) {
        bus.hammer(WRITER_BATCH);
        batches += 1;
    }
    log::debug!(
        "bus writer: {batches} batches in {} cycles",
        read_cycles().wrapping_sub(t0)
    );
    batches
}
