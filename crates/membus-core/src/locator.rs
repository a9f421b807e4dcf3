//! Cache-line straddling address lookup.
//!
//! An atomic read-modify-write on an address that spans two cache lines cannot
//! be served by a single line lock. On x86 the core falls back to locking the
//! memory bus, which every other core on the socket can observe as latency.
//! This module allocates a small heap buffer and picks such an address.

use crate::error::{MembusError, Result};

/// Number of cache lines the search buffer spans.
const SEARCH_LINES: usize = 10;

/// Bytes of the target word placed before the line boundary.
const STRADDLE_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Cache line size
// ---------------------------------------------------------------------------

/// Last-level cache line size in bytes, falling back from L3 to L2.
pub fn cache_line_size() -> Option<usize> {
    let size = sysconf_line_size().or_else(sysfs_line_size).or_else(sysctl_line_size);
    if let Some(sz) = size {
        log::info!("cache line size: {sz} B");
    }
    size
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn sysconf_line_size() -> Option<usize> {
    for name in [libc::_SC_LEVEL3_CACHE_LINESIZE, libc::_SC_LEVEL2_CACHE_LINESIZE] {
        // SAFETY: sysconf has no preconditions.
        let sz = unsafe { libc::sysconf(name) };
        if sz > 0 {
            return Some(sz as usize);
        }
    }
    None
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn sysconf_line_size() -> Option<usize> {
    None
}

/// Highest-level cache reported under sysfs for cpu0.
#[cfg(target_os = "linux")]
fn sysfs_line_size() -> Option<usize> {
    let base = std::path::Path::new("/sys/devices/system/cpu/cpu0/cache");
    let mut best: Option<(u32, usize)> = None;
    for entry in std::fs::read_dir(base).ok()?.flatten() {
        let dir = entry.path();
        let level = std::fs::read_to_string(dir.join("level"))
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok());
        let line = std::fs::read_to_string(dir.join("coherency_line_size"))
            .ok()
            .and_then(|s| s.trim().parse::<usize>().ok());
        if let (Some(level), Some(line)) = (level, line) {
            if line > 0 && best.is_none_or(|(l, _)| level > l) {
                best = Some((level, line));
            }
        }
    }
    best.map(|(_, line)| line)
}

#[cfg(not(target_os = "linux"))]
fn sysfs_line_size() -> Option<usize> {
    None
}

#[cfg(target_os = "macos")]
fn sysctl_line_size() -> Option<usize> {
    let output = std::process::Command::new("sysctl")
        .args(["-n", "hw.cachelinesize"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    String::from_utf8_lossy(&output.stdout)
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|&sz| sz > 0)
}

#[cfg(not(target_os = "macos"))]
fn sysctl_line_size() -> Option<usize> {
    None
}

// ---------------------------------------------------------------------------
// Straddle search
// ---------------------------------------------------------------------------

/// Find the word index of the second line boundary inside a buffer of
/// `len_words` `u64`s starting at `base`.
///
/// The boundary at index 0 is never used: the straddling word starts four bytes
/// before the boundary and must lie inside the buffer.
pub fn second_boundary_index(base: usize, len_words: usize, line_size: usize) -> Option<usize> {
    if line_size < std::mem::size_of::<u64>() {
        return None;
    }
    let mut seen_first = false;
    for i in 1..len_words {
        let addr = base + i * std::mem::size_of::<u64>();
        if addr % line_size == 0 {
            if seen_first {
                return Some(i);
            }
            seen_first = true;
        }
    }
    None
}

/// A heap buffer together with a word address that straddles two cache lines.
///
/// The buffer is owned so the address stays valid for the lifetime of the value.
/// Only raw-pointer and inline-assembly accesses touch the buffer after
/// construction.
pub struct SplitLine {
    buf: *mut [u64],
    line_size: usize,
    /// Word index of the line boundary the target straddles.
    boundary: usize,
}

impl SplitLine {
    /// Allocate a search buffer for `line_size` and locate the straddling word.
    pub fn with_line_size(line_size: usize) -> Result<Self> {
        let len_words = SEARCH_LINES * line_size / std::mem::size_of::<u64>();
        let buf = Box::into_raw(vec![1u64; len_words].into_boxed_slice());
        let base = buf as *mut u64 as usize;
        let Some(boundary) = second_boundary_index(base, len_words, line_size) else {
            // SAFETY: `buf` came from Box::into_raw above and is not aliased.
            drop(unsafe { Box::from_raw(buf) });
            log::error!("could not find a cache line boundary in the search buffer");
            return Err(MembusError::NoCachelineAddress {
                reason: format!("no second {line_size} B boundary in {len_words} words"),
            });
        };
        let line = Self {
            buf,
            line_size,
            boundary,
        };
        log::info!(
            "found an address that falls on two cache lines: {:p}",
            line.target_ptr()
        );
        Ok(line)
    }

    pub fn line_size(&self) -> usize {
        self.line_size
    }

    /// Address of the straddling word: four bytes before the boundary.
    pub fn target_ptr(&self) -> *mut u64 {
        let boundary = self.aligned_ptr() as *mut u8;
        boundary.wrapping_sub(STRADDLE_BYTES) as *mut u64
    }

    /// Address of the aligned word that starts the second line.
    pub fn aligned_ptr(&self) -> *mut u64 {
        (self.buf as *mut u64).wrapping_add(self.boundary)
    }

    pub fn target_addr(&self) -> usize {
        self.target_ptr() as usize
    }
}

impl std::fmt::Debug for SplitLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitLine")
            .field("line_size", &self.line_size)
            .field("target", &self.target_ptr())
            .field("buffer_words", &self.buf.len())
            .finish()
    }
}

impl Drop for SplitLine {
    fn drop(&mut self) {
        // SAFETY: `buf` came from Box::into_raw in `with_line_size` and is
        // released exactly once.
        drop(unsafe { Box::from_raw(self.buf) });
    }
}

/// Locate a straddling address using the detected cache line size.
pub fn locate() -> Result<SplitLine> {
    let line_size = cache_line_size().ok_or_else(|| {
        log::error!("cannot find the cache line size on this machine");
        MembusError::NoCachelineAddress {
            reason: "cache line size unavailable".to_string(),
        }
    })?;
    SplitLine::with_line_size(line_size)
}
