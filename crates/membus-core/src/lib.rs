//! # membus-core
//!
//! **Find your neighbors on the memory bus, then talk to them.**
//!
//! `membus-core` detects co-resident processes on a multi-tenant machine and
//! opens a covert channel between them. The only medium is contention on the
//! shared memory bus: an atomic add on a word that straddles two cache lines
//! locks the bus, and every other core sees its own atomics slow down.
//!
//! ## Quick Start
//!
//! ```no_run
//! use membus_core::{RunConfig, Runner};
//!
//! let config = RunConfig {
//!     participant_id: 5,
//!     start_time: 1_900_000_000,
//!     ..RunConfig::default()
//! };
//! let runner = Runner::on_hardware().expect("no usable memory bus");
//! let report = runner.execute(&config);
//! println!("phase ids: {:?}", report.phases);
//! ```
//!
//! ## Architecture
//!
//! Locator → Bus (probe / timed batch / hammer) → Sampler → Classifier
//! → Discovery → Channel
//!
//! - [`locator`] finds a heap address straddling two cache lines.
//! - [`bus`] issues split-line atomics, timed with the cycle [`counter`].
//! - [`sampler`] probes at Poisson-spaced instants inside a bit interval.
//! - [`classifier`] compares each window with the calibrated baseline.
//! - [`discovery`] elects the largest advertised id, one bit at a time.
//! - [`channel`] sends a payload from the first to the second elected id.
//!
//! Every boundary is an absolute wall-clock deadline polled by the
//! [`scheduler`]; participants never exchange a message. The [`Bus`] and
//! [`Clock`] traits are the only hardware seams, and [`sim`] provides
//! deterministic doubles for both.

pub mod bus;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod counter;
pub mod discovery;
pub mod error;
pub mod locator;
pub mod run;
pub mod sampler;
pub mod scheduler;
pub mod sim;
pub mod stats;

pub use bus::{Bus, WRITER_BATCH, write_until};
pub use channel::{
    ChannelAssignment, ChannelConfig, ChannelMessage, ChannelSession, CovertChannel, Role,
    assign_role, bit_interval_us, bits_to_string, check_rate, hex_to_bits, parse_bit_string,
    random_payload,
};
pub use classifier::{
    Baseline, BitClassifier, ClassifierConfig, DEFAULT_CUTOFF, Decision, KsMeanShift,
    TwoSampleStatistic,
};
pub use config::RunConfig;
pub use discovery::{
    BitAction, BitRecord, DiscoveryConfig, DiscoveryOutcome, MAX_PHASES, NeighborDiscovery,
    Participant, PhaseEnd, PhaseResult,
};
pub use error::{ConfigError, MembusError, Result};
pub use locator::{SplitLine, cache_line_size, locate};
pub use run::{ChannelReport, RunReport, Runner, SampleReport};
pub use sampler::{Sampler, SamplerConfig, participant_seed};
pub use scheduler::{Clock, MICROS_PER_SEC, Micros, Scheduler, SystemClock, check_clock_precision};
pub use stats::{SampleSet, SampleStats, trim_outliers};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
