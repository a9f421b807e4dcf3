//! Hardware cycle counter access.
//!
//! Latencies are measured as differences between two counter snapshots. The
//! counter is architecture specific: `rdtsc` on x86_64, the generic timer
//! (`CNTVCT_EL0`) on aarch64, and a monotonic nanosecond clock elsewhere.

// ---------------------------------------------------------------------------
// Counter reads
// ---------------------------------------------------------------------------

/// Read the cycle counter.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
pub fn read_cycles() -> u64 {
    // SAFETY: RDTSC is available on every x86_64 CPU and has no side effects.
    #[allow(unused_unsafe)]
    unsafe {
        core::arch::x86_64::_rdtsc()
    }
}

/// Read the ARM generic timer counter (CNTVCT_EL0).
///
/// Ticks at the system counter frequency, not the core clock, so latencies
/// are coarser than on x86_64 but still comparable within one run.
#[cfg(target_arch = "aarch64")]
#[inline(always)]
pub fn read_cycles() -> u64 {
    let val: u64;
    // SAFETY: CNTVCT_EL0 is readable from EL0 on Linux and macOS.
    // Read-only system register, no side effects.
    unsafe {
        std::arch::asm!("mrs {}, cntvct_el0", out(reg) val, options(nostack, nomem));
    }
    val
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
#[inline(always)]
pub fn read_cycles() -> u64 {
    monotonic_ns()
}

/// Nanoseconds since a process-local epoch.
pub fn monotonic_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

/// Time `op` in counter ticks.
///
/// Compiler fences keep the operation between the two counter reads.
#[inline(always)]
pub fn time_cycles<F: FnOnce()>(op: F) -> u64 {
    use std::sync::atomic::{Ordering, compiler_fence};
    let t0 = read_cycles();
    compiler_fence(Ordering::SeqCst);
    op();
    compiler_fence(Ordering::SeqCst);
    let t1 = read_cycles();
    t1.wrapping_sub(t0)
}
