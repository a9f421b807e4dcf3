//! Error types for a membus run.
//!
//! Every fatal condition aborts the run before or at the point it is detected.
//! Undecodable channel bits are not errors: they are collected as erasures in
//! [`ChannelMessage`](crate::channel::ChannelMessage).

use thiserror::Error;

/// Fatal errors raised by the core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MembusError {
    /// The wall clock cannot resolve single microseconds.
    #[error("wall clock resolution is {resolution_ns} ns, need at least microsecond precision")]
    ClockPrecisionInsufficient { resolution_ns: u64 },

    /// No heap address straddling two cache lines could be located.
    #[error("no cache-line straddling address: {reason}")]
    NoCachelineAddress { reason: String },

    /// A synchronization deadline had already passed when it was reached.
    #[error("sync point missed: deadline {deadline_us} us, now {now_us} us")]
    SyncPointMissed { deadline_us: u64, now_us: u64 },

    /// The run configuration was rejected before any timing work started.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(#[from] ConfigError),
}

impl MembusError {
    /// Stable machine-readable code written to run reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ClockPrecisionInsufficient { .. } => "CLOCK_PRECISION_LOW",
            Self::NoCachelineAddress { .. } => "NO_CACHELINE_ADDR",
            Self::SyncPointMissed { .. } => "SYNC_POINT_MISSED",
            Self::InvalidConfiguration(e) => e.code(),
        }
    }
}

/// Configuration validation failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("participant id {id} out of range [1, {limit})")]
    InvalidId { id: u64, limit: u64 },

    #[error("max_bits {0} out of range [1, 30]")]
    InvalidMaxBits(u32),

    #[error("max_phases {got} exceeds the limit of {limit}")]
    InvalidMaxPhases { got: u32, limit: u32 },

    #[error("bit duration {0} s out of range [1, 5]")]
    InvalidBitDuration(u64),

    #[error("a covert channel needs max_phases >= 2 and repeat_phases = false")]
    InvalidChannelParams,

    #[error("channel rate {0} bps out of range [1, 1000000]")]
    InvalidChannelRate(u32),

    #[error("channel data: {0}")]
    InvalidChannelData(String),

    #[error("start time {start} is not after now ({now}) or the schedule overflows")]
    InvalidStartTime { start: u64, now: u64 },
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidId { .. } => "INVALID_ID",
            Self::InvalidMaxBits(_) => "INVALID_MAX_BITS",
            Self::InvalidMaxPhases { .. } => "INVALID_MAX_PHASES",
            Self::InvalidBitDuration(_) => "INVALID_BIT_DURATION",
            Self::InvalidChannelParams => "INVALID_CHANNEL_PARAMS",
            Self::InvalidChannelRate(_) => "INVALID_CHANNEL_RATE",
            Self::InvalidChannelData(_) => "INVALID_CHANNEL_DATA",
            Self::InvalidStartTime { .. } => "INVALID_STIME",
        }
    }
}

pub type Result<T> = std::result::Result<T, MembusError>;
