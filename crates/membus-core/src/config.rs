//! Run configuration and its validation.
//!
//! A [`RunConfig`] carries everything one participant needs: its id, the
//! shared start time and the protocol shape. All participants of one
//! experiment must agree on every field except `participant_id`, `guid` and
//! the channel payload.

use serde::{Deserialize, Serialize};

use crate::channel::{check_rate, parse_bit_string};
use crate::discovery::{DiscoveryConfig, MAX_PHASES};
use crate::error::ConfigError;
use crate::scheduler::{MICROS_PER_SEC, Micros};

/// Widest supported id space.
pub const MAX_ID_BITS: u32 = 30;

/// Longest supported bit interval.
pub const MAX_BIT_DURATION_SECS: u64 = 5;

/// Channel transmission time when no payload length is given.
pub const DEFAULT_CHANNEL_UPTIME_SECS: u64 = 5;

/// Slack between the end of discovery and the start of the channel.
pub const CHANNEL_START_SLACK_SECS: u64 = 5;

/// Inputs of one participant's run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// This participant's id, in `[1, 2^max_bits)`.
    pub participant_id: u32,

    /// Shared start time, Unix seconds. Must lie in the future.
    pub start_time: u64,

    /// Phases to run; `0` runs until convergence.
    ///
    /// **Default:** `1`
    pub max_phases: u32,

    /// Re-run the first election in every phase instead of enumerating ids.
    ///
    /// **Default:** `true`
    pub repeat_phases: bool,

    /// Width of the id space.
    ///
    /// **Default:** `8`
    pub max_bits: u32,

    /// Length of one discovery bit interval, in `[1, 5]`.
    ///
    /// **Default:** `1`
    pub bit_duration_secs: u64,

    /// Open a covert channel between the first two discovered ids.
    ///
    /// **Default:** `false`
    pub setup_channel: bool,

    /// **Default:** `1000`
    pub channel_rate_bps: u32,

    /// Average op cost, in cycles, at which a channel bit reads as 1.
    ///
    /// **Default:** `10_500`
    pub channel_bit_threshold: u64,

    /// Payload as a `0`/`1` string. A random payload is sent when absent.
    pub channel_data: Option<String>,

    /// Declared payload length in bits; `0` means "derive from the rate".
    pub channel_data_len: usize,

    /// Keep sample windows in the report.
    ///
    /// **Default:** `false`
    pub save_samples: bool,

    /// Run label. A v4 UUID is generated when absent.
    pub guid: Option<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            participant_id: 0,
            start_time: 0,
            max_phases: 1,
            repeat_phases: true,
            max_bits: 8,
            bit_duration_secs: 1,
            setup_channel: false,
            channel_rate_bps: 1000,
            channel_bit_threshold: 10_500,
            channel_data: None,
            channel_data_len: 0,
            save_samples: false,
            guid: None,
        }
    }
}

impl RunConfig {
    /// Load a config from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reject configurations that cannot run. `now_secs` is the current Unix
    /// time in seconds.
    pub fn validate(&self, now_secs: u64) -> Result<(), ConfigError> {
        if self.max_bits == 0 || self.max_bits > MAX_ID_BITS {
            return Err(ConfigError::InvalidMaxBits(self.max_bits));
        }
        let limit = 1u64 << self.max_bits;
        let id = u64::from(self.participant_id);
        if id == 0 || id >= limit {
            return Err(ConfigError::InvalidId { id, limit });
        }
        if self.max_phases > MAX_PHASES {
            return Err(ConfigError::InvalidMaxPhases {
                got: self.max_phases,
                limit: MAX_PHASES,
            });
        }
        if !(1..=MAX_BIT_DURATION_SECS).contains(&self.bit_duration_secs) {
            return Err(ConfigError::InvalidBitDuration(self.bit_duration_secs));
        }
        if self.setup_channel {
            if self.repeat_phases || self.max_phases < 2 {
                return Err(ConfigError::InvalidChannelParams);
            }
            check_rate(self.channel_rate_bps)?;
            self.check_channel_data()?;
        }
        if self.start_time <= now_secs || self.end_us().is_none() {
            return Err(ConfigError::InvalidStartTime {
                start: self.start_time,
                now: now_secs,
            });
        }
        Ok(())
    }

    fn check_channel_data(&self) -> Result<(), ConfigError> {
        let given = self.channel_data.as_deref().unwrap_or_default();
        if given.len() != self.channel_data_len {
            return Err(ConfigError::InvalidChannelData(format!(
                "declared length {} does not match the {} bits provided",
                self.channel_data_len,
                given.len()
            )));
        }
        parse_bit_string(given).map(|_| ())
    }

    /// End of the whole schedule in microseconds, or `None` if it does not
    /// fit in a [`Micros`].
    fn end_us(&self) -> Option<Micros> {
        // One extra interval for the baseline.
        let intervals = u64::from(self.discovery().phase_limit()) * u64::from(self.max_bits) + 1;
        let mut tail_secs = intervals * self.bit_duration_secs;
        if self.setup_channel {
            let rate = u64::from(self.channel_rate_bps.max(1));
            tail_secs += CHANNEL_START_SLACK_SECS + self.channel_bits() as u64 / rate + 1;
        }
        self.start_time.checked_add(tail_secs)?.checked_mul(MICROS_PER_SEC)
    }

    /// Start time in microseconds. Only meaningful after [`validate`](Self::validate).
    pub fn start_us(&self) -> Micros {
        self.start_time * MICROS_PER_SEC
    }

    pub fn bit_duration_us(&self) -> Micros {
        self.bit_duration_secs * MICROS_PER_SEC
    }

    pub fn discovery(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            max_bits: self.max_bits,
            max_phases: self.max_phases,
            repeat_phases: self.repeat_phases,
            bit_duration_us: self.bit_duration_us(),
            retain_samples: self.save_samples,
        }
    }

    /// Channel start time, Unix seconds: after the last discovery bit plus
    /// [`CHANNEL_START_SLACK_SECS`].
    pub fn channel_start_secs(&self) -> u64 {
        self.start_time.saturating_add(
            u64::from(self.max_phases) * u64::from(self.max_bits) * self.bit_duration_secs
                + CHANNEL_START_SLACK_SECS,
        )
    }

    /// Number of bits to exchange over the channel.
    pub fn channel_bits(&self) -> usize {
        if self.channel_data_len == 0 {
            (DEFAULT_CHANNEL_UPTIME_SECS * u64::from(self.channel_rate_bps)) as usize
        } else {
            self.channel_data_len
        }
    }

    /// The explicit payload, if any.
    pub fn payload(&self) -> Result<Option<Vec<bool>>, ConfigError> {
        match self.channel_data.as_deref() {
            None | Some("") => Ok(None),
            Some(s) => parse_bit_string(s).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn valid() -> RunConfig {
        RunConfig {
            participant_id: 5,
            start_time: NOW + 60,
            ..RunConfig::default()
        }
    }

    fn channel() -> RunConfig {
        RunConfig {
            setup_channel: true,
            repeat_phases: false,
            max_phases: 2,
            ..valid()
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = RunConfig::default();
        assert_eq!(c.max_phases, 1);
        assert!(c.repeat_phases);
        assert_eq!(c.max_bits, 8);
        assert_eq!(c.bit_duration_secs, 1);
        assert_eq!(c.channel_rate_bps, 1000);
        assert_eq!(c.channel_bit_threshold, 10_500);
        assert!(!c.save_samples);
    }

    #[test]
    fn valid_config_passes() {
        assert_eq!(valid().validate(NOW), Ok(()));
        assert_eq!(channel().validate(NOW), Ok(()));
    }

    // -----------------------------------------------------------------------
    // Rejections
    // -----------------------------------------------------------------------

    fn code_of(c: RunConfig) -> &'static str {
        c.validate(NOW).unwrap_err().code()
    }

    #[test]
    fn id_must_fit_the_id_space() {
        assert_eq!(code_of(RunConfig { participant_id: 0, ..valid() }), "INVALID_ID");
        assert_eq!(code_of(RunConfig { participant_id: 256, ..valid() }), "INVALID_ID");
        let c = RunConfig {
            participant_id: 255,
            ..valid()
        };
        assert!(c.validate(NOW).is_ok());
    }

    #[test]
    fn bit_duration_is_bounded() {
        assert_eq!(code_of(RunConfig { bit_duration_secs: 0, ..valid() }), "INVALID_BIT_DURATION");
        assert_eq!(code_of(RunConfig { bit_duration_secs: 6, ..valid() }), "INVALID_BIT_DURATION");
    }

    #[test]
    fn shape_limits() {
        assert_eq!(code_of(RunConfig { max_bits: 0, ..valid() }), "INVALID_MAX_BITS");
        assert_eq!(code_of(RunConfig { max_bits: 31, ..valid() }), "INVALID_MAX_BITS");
        assert_eq!(code_of(RunConfig { max_phases: 16, ..valid() }), "INVALID_MAX_PHASES");
    }

    #[test]
    fn channel_needs_distinct_phases() {
        assert_eq!(
            code_of(RunConfig { repeat_phases: true, ..channel() }),
            "INVALID_CHANNEL_PARAMS"
        );
        assert_eq!(code_of(RunConfig { max_phases: 1, ..channel() }), "INVALID_CHANNEL_PARAMS");
        assert_eq!(
            code_of(RunConfig { channel_rate_bps: 0, ..channel() }),
            "INVALID_CHANNEL_RATE"
        );
    }

    #[test]
    fn channel_data_must_match_its_length() {
        let c = RunConfig {
            channel_data: Some("1011".into()),
            channel_data_len: 3,
            ..channel()
        };
        assert_eq!(code_of(c), "INVALID_CHANNEL_DATA");
        let c = RunConfig {
            channel_data: Some("10a1".into()),
            channel_data_len: 4,
            ..channel()
        };
        assert_eq!(code_of(c), "INVALID_CHANNEL_DATA");
        let c = RunConfig {
            channel_data: Some("1011".into()),
            channel_data_len: 4,
            ..channel()
        };
        assert!(c.validate(NOW).is_ok());
    }

    #[test]
    fn start_time_must_be_in_the_future() {
        assert_eq!(code_of(RunConfig { start_time: NOW, ..valid() }), "INVALID_STIME");
        assert_eq!(code_of(RunConfig { start_time: NOW - 1, ..valid() }), "INVALID_STIME");
    }

    #[test]
    fn start_time_must_fit_in_microseconds() {
        let far = u64::MAX / MICROS_PER_SEC;
        assert_eq!(code_of(RunConfig { start_time: u64::MAX / 2, ..valid() }), "INVALID_STIME");
        assert_eq!(code_of(RunConfig { start_time: far, ..valid() }), "INVALID_STIME");
        assert_eq!(code_of(RunConfig { start_time: far - 10, ..channel() }), "INVALID_STIME");

        let c = RunConfig {
            start_time: far - 1_000,
            ..channel()
        };
        assert!(c.validate(NOW).is_ok());
        assert!(c.channel_start_secs().checked_mul(MICROS_PER_SEC).is_some());
    }

    #[test]
    fn channel_rate_is_bounded_by_the_clock() {
        assert!(RunConfig { channel_rate_bps: 1_000_000, ..channel() }.validate(NOW).is_ok());
        assert_eq!(
            code_of(RunConfig { channel_rate_bps: 1_000_001, ..channel() }),
            "INVALID_CHANNEL_RATE"
        );
        assert_eq!(
            code_of(RunConfig { channel_rate_bps: 2_000_000, ..channel() }),
            "INVALID_CHANNEL_RATE"
        );
    }

    // -----------------------------------------------------------------------
    // Derived values
    // -----------------------------------------------------------------------

    #[test]
    fn channel_schedule() {
        let c = RunConfig {
            max_bits: 4,
            bit_duration_secs: 2,
            ..channel()
        };
        assert_eq!(c.channel_start_secs(), c.start_time + 2 * 4 * 2 + 5);
        assert_eq!(c.channel_bits(), 5000);
        let c = RunConfig {
            channel_data: Some("101".into()),
            channel_data_len: 3,
            ..c
        };
        assert_eq!(c.channel_bits(), 3);
        assert_eq!(c.payload().unwrap(), Some(vec![true, false, true]));
    }

    #[test]
    fn json_fills_defaults() {
        let c = RunConfig::from_json(r#"{"participant_id": 9, "start_time": 123}"#).unwrap();
        assert_eq!(c.participant_id, 9);
        assert_eq!(c.start_time, 123);
        assert_eq!(c.max_bits, 8);
        assert!(c.guid.is_none());
    }
}
