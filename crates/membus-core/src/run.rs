//! End-to-end run of one participant: validate, discover, optionally talk.
//!
//! [`Runner`] owns the bus, the clock and every per-run buffer. Nothing
//! persists between two runs except what the caller keeps from the returned
//! [`RunReport`].

use std::path::Path;

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::bus::Bus;
use crate::channel::{
    ChannelAssignment, ChannelConfig, ChannelSession, CovertChannel, Role, assign_role,
    bits_to_string, random_payload,
};
use crate::classifier::{BitClassifier, ClassifierConfig};
use crate::config::RunConfig;
use crate::discovery::{BitRecord, NeighborDiscovery, RetainedWindow, RetainedWindows};
use crate::error::{MembusError, Result};
use crate::locator::{SplitLine, locate};
use crate::sampler::{Sampler, SamplerConfig, participant_seed};
use crate::scheduler::{Clock, MICROS_PER_SEC, Scheduler, SystemClock, check_clock_precision};

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Sample windows kept when `save_samples` is set or a channel ran.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SampleReport {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub baseline: Vec<u64>,
    pub bit1: Option<RetainedWindow>,
    pub bit0: Option<RetainedWindow>,
    /// Per-op latencies of the last channel interval.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub channel: Vec<u64>,
}

/// Outcome of a channel session, from the local participant's side.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    pub role: Role,
    pub sender_id: u32,
    pub receiver_id: u32,
    pub bits: usize,
    pub rate_bps: u32,
    pub erasures: usize,
    pub erasure_positions: Vec<usize>,
    /// Sent or received payload as a `0`/`1` string.
    pub data: String,
}

/// Everything a run produces.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub id: u32,
    pub guid: String,
    pub success: bool,
    /// Machine code of the fatal error, if any.
    pub error: Option<String>,
    pub protocol_time_secs: f64,
    pub phases: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub samples: Option<SampleReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelReport>,
    pub bits: Vec<BitRecord>,
    pub membus_version: String,
}

impl RunReport {
    fn new(config: &RunConfig) -> Self {
        Self {
            id: config.participant_id,
            guid: config
                .guid
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            success: true,
            error: None,
            protocol_time_secs: 0.0,
            phases: Vec::new(),
            samples: None,
            channel: None,
            bits: Vec::new(),
            membus_version: crate::VERSION.to_string(),
        }
    }

    /// Report for a run that never got past setup.
    pub fn failed(config: &RunConfig, err: &MembusError) -> Self {
        let mut report = Self::new(config);
        report.fail(err);
        report
    }

    fn fail(&mut self, err: &MembusError) {
        log::error!("run failed: {err}");
        self.success = false;
        self.error = Some(err.code().to_string());
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Write the report as pretty JSON to `path`.
    pub fn write_to(&self, path: &Path) -> std::io::Result<()> {
        let json = self.to_json().map_err(std::io::Error::other)?;
        std::fs::write(path, json)
    }
}

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Buffers owned by one run.
#[derive(Debug, Default)]
struct RunState {
    windows: Option<RetainedWindows>,
    channel: Option<ChannelSession>,
}

impl RunState {
    fn sample_report(&mut self, keep_samples: bool) -> Option<SampleReport> {
        let channel_latencies = self.channel.as_mut().map(|s| std::mem::take(&mut s.latencies));
        if !keep_samples && channel_latencies.is_none() {
            return None;
        }
        let windows = self.windows.take().unwrap_or_default();
        Some(SampleReport {
            baseline: windows.baseline,
            bit1: windows.bit1,
            bit0: windows.bit0,
            channel: channel_latencies.unwrap_or_default(),
        })
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Drives one participant over a [`Bus`] and a [`Clock`].
pub struct Runner<B: Bus, C: Clock> {
    bus: B,
    sched: Scheduler<C>,
    sampler_config: SamplerConfig,
    classifier_config: ClassifierConfig,
    channel_config: ChannelConfig,
    seed: Option<u64>,
}

impl Runner<SplitLine, SystemClock> {
    /// A runner on this machine's memory bus.
    ///
    /// Fails when the wall clock is too coarse or no straddling address
    /// exists.
    pub fn on_hardware() -> Result<Self> {
        check_clock_precision()?;
        let line = locate()?;
        Ok(Self::new(line, SystemClock))
    }
}

impl<B: Bus, C: Clock> Runner<B, C> {
    pub fn new(bus: B, clock: C) -> Self {
        Self {
            bus,
            sched: Scheduler::new(clock),
            sampler_config: SamplerConfig::default(),
            classifier_config: ClassifierConfig::default(),
            channel_config: ChannelConfig::default(),
            seed: None,
        }
    }

    pub fn with_sampler_config(mut self, config: SamplerConfig) -> Self {
        self.sampler_config = config;
        self
    }

    pub fn with_classifier_config(mut self, config: ClassifierConfig) -> Self {
        self.classifier_config = config;
        self
    }

    pub fn with_channel_config(mut self, config: ChannelConfig) -> Self {
        self.channel_config = config;
        self
    }

    /// Fix the sampler and payload seed. Participants must not share one.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Run `config` to completion. Fatal errors end up in the report.
    pub fn execute(&self, config: &RunConfig) -> RunReport {
        let mut report = RunReport::new(config);
        log::info!(
            "starting participant {} (guid {}), start time {}",
            config.participant_id,
            report.guid,
            config.start_time
        );
        if let Err(e) = self.run(config, &mut report) {
            report.fail(&e);
        }
        report
    }

    fn run(&self, config: &RunConfig, report: &mut RunReport) -> Result<()> {
        let now_secs = self.sched.now_us() / MICROS_PER_SEC;
        config.validate(now_secs)?;

        let id = config.participant_id;
        let seed = self.seed.unwrap_or_else(|| participant_seed(id));
        let mut sampler = Sampler::new(self.sampler_config.clone(), seed);
        let classifier = BitClassifier::new(self.classifier_config.clone());
        let mut state = RunState::default();

        let outcome = NeighborDiscovery {
            bus: &self.bus,
            sched: &self.sched,
            sampler: &mut sampler,
            classifier: &classifier,
            config: config.discovery(),
        }
        .run(id, config.start_us())?;

        report.protocol_time_secs = outcome.elapsed_secs;
        report.phases = outcome.phases.ids().to_vec();
        report.bits = outcome.records;
        state.windows = outcome.samples;

        if config.setup_channel {
            match assign_role(&outcome.phases, id) {
                Some(assignment) => {
                    let mut rng = StdRng::seed_from_u64(seed.rotate_left(17));
                    let (channel, session) = self.talk(config, assignment, &mut rng)?;
                    report.channel = Some(channel);
                    state.channel = Some(session);
                }
                None => log::info!("no neighbors to talk to or not selected as channel participant"),
            }
        }

        report.samples = state.sample_report(config.save_samples);
        Ok(())
    }

    fn talk(
        &self,
        config: &RunConfig,
        assignment: ChannelAssignment,
        rng: &mut StdRng,
    ) -> Result<(ChannelReport, ChannelSession)> {
        log::info!(
            "setting up channel between {} and {}, local role {:?}",
            assignment.sender_id,
            assignment.receiver_id,
            assignment.role
        );
        let nbits = config.channel_bits();
        let rate = config.channel_rate_bps;
        let start_us = config.channel_start_secs() * MICROS_PER_SEC;
        let channel = CovertChannel::new(
            &self.bus,
            &self.sched,
            ChannelConfig {
                threshold_cycles: config.channel_bit_threshold,
                ..self.channel_config.clone()
            },
        );

        let session = match assignment.role {
            Role::Sender => {
                let payload = match config.payload()? {
                    Some(bits) => bits,
                    None => random_payload(rng, nbits),
                };
                channel.send_data(&payload, rate, start_us)?
            }
            Role::Receiver => channel.receive_data(nbits, rate, start_us)?,
        };

        let report = ChannelReport {
            role: assignment.role,
            sender_id: assignment.sender_id,
            receiver_id: assignment.receiver_id,
            bits: nbits,
            rate_bps: rate,
            erasures: session.message.erasure_count(),
            erasure_positions: session.message.erasures.clone(),
            data: bits_to_string(&session.message.bits),
        };
        Ok((report, session))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimClock, WindowBus};

    const NOW_SECS: u64 = 1_000;

    #[test]
    fn invalid_config_fails_before_any_timing() {
        let clock = SimClock::new(NOW_SECS * MICROS_PER_SEC, 1);
        let bus = WindowBus::new(&clock, 100, 300, Vec::new());
        let runner = Runner::new(&bus, &clock).with_seed(1);
        let report = runner.execute(&RunConfig {
            participant_id: 0,
            start_time: NOW_SECS + 5,
            ..RunConfig::default()
        });
        assert!(!report.success);
        assert_eq!(report.error.as_deref(), Some("INVALID_ID"));
        assert_eq!(bus.ops(), 0);
    }

    #[test]
    fn guid_is_kept_or_generated() {
        let given = RunConfig {
            guid: Some("run-7".into()),
            ..RunConfig::default()
        };
        assert_eq!(RunReport::new(&given).guid, "run-7");
        let generated = RunReport::new(&RunConfig::default()).guid;
        assert!(uuid::Uuid::parse_str(&generated).is_ok());
    }

    #[test]
    fn failed_report_carries_the_code() {
        let err = MembusError::NoCachelineAddress {
            reason: "none".into(),
        };
        let r = RunReport::failed(&RunConfig::default(), &err);
        assert!(!r.success);
        assert_eq!(r.error.as_deref(), Some("NO_CACHELINE_ADDR"));
        let json = r.to_json().unwrap();
        assert!(json.contains("\"success\": false"));
        assert!(!json.contains("\"channel\""));
    }

    #[test]
    fn samples_are_omitted_unless_requested() {
        let mut state = RunState::default();
        assert!(state.sample_report(false).is_none());
        let report = state.sample_report(true).unwrap();
        assert!(report.baseline.is_empty());

        let mut state = RunState {
            windows: None,
            channel: Some(ChannelSession {
                latencies: vec![10_000, 11_000],
                ..ChannelSession::default()
            }),
        };
        let report = state.sample_report(false).unwrap();
        assert_eq!(report.channel, vec![10_000, 11_000]);
    }
}
