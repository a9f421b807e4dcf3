//! Neighbor discovery over the memory bus.
//!
//! Participants agree on the maximum advertised id one bit at a time, most
//! significant bit first, without exchanging a single message. In every bit
//! interval an advertising participant whose bit is 1 floods the bus; everyone
//! else listens. A listener whose own bit is 0 but who hears a 1 knows a higher
//! id is competing and withdraws for the rest of the phase. What survives a
//! phase is the largest id among the advertisers, exactly like a wired-OR
//! collision election.
//!
//! In non-repeating mode the winner of a phase stops advertising, so each
//! following phase discovers the next-largest id, until a phase reads all zeros.
//! In repeating mode every phase re-runs the first election.

use std::fmt;

use serde::Serialize;

use crate::bus::{Bus, write_until};
use crate::classifier::{Baseline, BitClassifier, TwoSampleStatistic};
use crate::config::MAX_ID_BITS;
use crate::error::Result;
use crate::sampler::Sampler;
use crate::scheduler::{Clock, MICROS_PER_SEC, Micros, Scheduler};
use crate::stats::{SampleSet, SampleStats};

/// Upper bound on recorded phases.
pub const MAX_PHASES: u32 = 15;

/// Slack before the start time at which participants begin calibrating.
const SYNC_LEAD_US: Micros = 10_000;

// ---------------------------------------------------------------------------
// Phase results
// ---------------------------------------------------------------------------

/// Ids read in each completed phase, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct PhaseResult {
    ids: Vec<u32>,
}

impl PhaseResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a phase id. Returns false once [`MAX_PHASES`] ids are held.
    pub fn push(&mut self, id: u32) -> bool {
        if self.ids.len() >= MAX_PHASES as usize {
            return false;
        }
        self.ids.push(id);
        true
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn get(&self, phase: usize) -> Option<u32> {
        self.ids.get(phase).copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl From<Vec<u32>> for PhaseResult {
    fn from(ids: Vec<u32>) -> Self {
        let mut result = Self::new();
        for id in ids {
            result.push(id);
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Participant state machine
// ---------------------------------------------------------------------------

/// What a participant does during one bit interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitAction {
    /// Generate contention; the bit is taken as read 1.
    Write,
    /// Sample and classify the bus.
    Listen,
}

/// Outcome of a finished phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEnd {
    /// The phase read `id`; more phases may follow.
    Continue(u32),
    /// Nobody advertised: the protocol has converged.
    Converged,
}

/// Per-participant protocol state: `(phase, advertising, advertised, id_read)`.
#[derive(Debug, Clone)]
pub struct Participant {
    id: u32,
    max_bits: u32,
    repeat_phases: bool,
    phase: u32,
    advertising: bool,
    advertised: bool,
    id_read: u32,
    phases: PhaseResult,
}

impl Participant {
    /// `max_bits` is clamped to [`MAX_ID_BITS`] so phase ids fit in a `u32`.
    pub fn new(id: u32, max_bits: u32, repeat_phases: bool) -> Self {
        Self {
            id,
            max_bits: max_bits.min(MAX_ID_BITS),
            repeat_phases,
            phase: 0,
            advertising: false,
            advertised: false,
            id_read: 0,
            phases: PhaseResult::new(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn phase(&self) -> u32 {
        self.phase
    }

    /// Whether this participant has won a phase and stopped advertising.
    pub fn advertised(&self) -> bool {
        self.advertised
    }

    pub fn advertising(&self) -> bool {
        self.advertising
    }

    pub fn phases(&self) -> &PhaseResult {
        &self.phases
    }

    /// Bit positions of one phase, most significant first.
    pub fn positions(&self) -> impl Iterator<Item = u32> + use<> {
        (0..self.max_bits).rev()
    }

    pub fn begin_phase(&mut self) {
        self.advertising = !self.advertised;
        self.id_read = 0;
    }

    pub fn own_bit(&self, position: u32) -> bool {
        self.id.checked_shr(position).is_some_and(|v| v & 1 != 0)
    }

    pub fn action(&self, position: u32) -> BitAction {
        if self.advertising && self.own_bit(position) {
            BitAction::Write
        } else {
            BitAction::Listen
        }
    }

    /// Fold the bit read at `position` into the phase.
    pub fn record(&mut self, position: u32, bit_read: bool) {
        if self.advertising && !self.own_bit(position) && bit_read {
            // A higher id is on the bus.
            self.advertising = false;
        }
        self.id_read = 2 * self.id_read + u32::from(bit_read);
    }

    pub fn end_phase(&mut self) -> PhaseEnd {
        let id_read = self.id_read;
        self.phase += 1;
        if !self.repeat_phases && id_read == 0 {
            return PhaseEnd::Converged;
        }
        self.phases.push(id_read);
        if !self.repeat_phases && id_read == self.id {
            self.advertised = true;
        }
        PhaseEnd::Continue(id_read)
    }
}

// ---------------------------------------------------------------------------
// Bit log
// ---------------------------------------------------------------------------

/// One bit decision, as logged for offline analysis.
#[derive(Debug, Clone, Serialize)]
pub struct BitRecord {
    pub participant: u32,
    pub phase: u32,
    pub position: u32,
    pub own_bit: bool,
    pub sent: bool,
    pub read: bool,
    /// Statistics of the listening window; `None` when the bit was written.
    pub window: Option<SampleStats>,
    pub baseline: SampleStats,
    pub statistic: f64,
}

impl BitRecord {
    /// Column header for [`BitRecord`]'s `Display` output.
    ///
    /// Downstream log parsers depend on this field order.
    pub fn header(participant: u32) -> String {
        format!(
            "[Node-{participant:3}] Phase, Position, Bit, Sent, Read, Lat Size, Lat Mean, \
             Lat Std, Lat Max, Lat Min, Base Size, Base Mean, Base Std, Statistic"
        )
    }
}

impl fmt::Display for BitRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let w = self.window.unwrap_or_default();
        write!(
            f,
            "[Node-{:3}] {:3} {:9} {:4} {:5} {:5} {:9} {:9} {:8} {:8} {:8} {:10} {:10} {:9} {:2.15}",
            self.participant,
            self.phase,
            self.position,
            u8::from(self.own_bit),
            u8::from(self.sent),
            u8::from(self.read),
            w.count,
            w.mean as u64,
            w.std_dev() as u64,
            w.max,
            w.min,
            self.baseline.count,
            self.baseline.mean as u64,
            self.baseline.std_dev() as u64,
            self.statistic,
        )
    }
}

/// Windows kept for diagnostics: the first read as 1 and the first read as 0.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetainedWindows {
    pub baseline: Vec<u64>,
    pub bit1: Option<RetainedWindow>,
    pub bit0: Option<RetainedWindow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetainedWindow {
    pub readings: Vec<u64>,
    pub statistic: f64,
}

impl RetainedWindows {
    fn offer(&mut self, bit: bool, window: &SampleSet, statistic: f64) {
        let slot = if bit { &mut self.bit1 } else { &mut self.bit0 };
        if slot.is_none() {
            *slot = Some(RetainedWindow {
                readings: window.readings.clone(),
                statistic,
            });
        }
    }
}

// ---------------------------------------------------------------------------
// Protocol driver
// ---------------------------------------------------------------------------

/// Timing and termination parameters of a discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub max_bits: u32,
    /// Phase limit; `0` runs until convergence (capped at [`MAX_PHASES`]).
    pub max_phases: u32,
    pub repeat_phases: bool,
    pub bit_duration_us: Micros,
    /// Keep sample windows for diagnostics.
    pub retain_samples: bool,
}

impl DiscoveryConfig {
    pub fn phase_limit(&self) -> u32 {
        if self.max_phases == 0 {
            MAX_PHASES
        } else {
            self.max_phases.min(MAX_PHASES)
        }
    }
}

/// Result of a discovery run.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryOutcome {
    pub phases: PhaseResult,
    pub baseline: SampleStats,
    pub records: Vec<BitRecord>,
    pub samples: Option<RetainedWindows>,
    pub elapsed_secs: f64,
}

/// Runs the discovery protocol for one participant.
pub struct NeighborDiscovery<'a, B: Bus, C: Clock, S: TwoSampleStatistic> {
    pub bus: &'a B,
    pub sched: &'a Scheduler<C>,
    pub sampler: &'a mut Sampler,
    pub classifier: &'a BitClassifier<S>,
    pub config: DiscoveryConfig,
}

impl<B: Bus, C: Clock, S: TwoSampleStatistic> NeighborDiscovery<'_, B, C, S> {
    /// Calibrate, then run phases from `start_us`.
    ///
    /// The first interval after `start_us` captures the baseline; bit
    /// intervals follow back to back. Fails only when the initial sync point
    /// has already passed.
    pub fn run(&mut self, participant_id: u32, start_us: Micros) -> Result<DiscoveryOutcome> {
        let cfg = self.config.clone();
        let bit_us = cfg.bit_duration_us;

        if let Err(e) = self.sched.poll_wait(start_us.saturating_sub(SYNC_LEAD_US)) {
            log::error!("already past the initial sync point, bad run for this participant");
            return Err(e);
        }
        let begin = self.sched.now_us();

        let mut next = start_us + bit_us;
        let calibration = self.sampler.sample(self.bus, self.sched, next, bit_us);
        let mut retained = cfg.retain_samples.then(|| RetainedWindows {
            baseline: calibration.readings.clone(),
            ..RetainedWindows::default()
        });
        let baseline = Baseline::new(calibration);
        let base_stats = *baseline.stats();
        log::info!(
            "baseline: {} samples, mean {:.0}, std {:.0} cycles",
            base_stats.count,
            base_stats.mean,
            base_stats.std_dev()
        );

        let mut me = Participant::new(participant_id, cfg.max_bits, cfg.repeat_phases);
        let mut records = Vec::new();
        log::info!(target: "membus::bits", "{}", BitRecord::header(participant_id));

        for _ in 0..cfg.phase_limit() {
            me.begin_phase();
            for position in me.positions() {
                if self.sched.poll_wait(next).is_err() {
                    log::warn!("late for bit {position} of phase {}", me.phase());
                }
                next += bit_us;

                let action = me.action(position);
                let (read, window, statistic) = match action {
                    BitAction::Write => {
                        let stop = next.saturating_sub(self.sampler.config().guard_us);
                        write_until(self.bus, self.sched, stop);
                        (true, None, 0.0)
                    }
                    BitAction::Listen => {
                        let window = self.sampler.sample(self.bus, self.sched, next, bit_us);
                        let decision = self.classifier.classify(&baseline, &window);
                        if let Some(r) = retained.as_mut() {
                            r.offer(decision.bit, &window, decision.statistic);
                        }
                        (decision.bit, Some(window.stats), decision.statistic)
                    }
                };
                me.record(position, read);

                let record = BitRecord {
                    participant: participant_id,
                    phase: me.phase(),
                    position,
                    own_bit: me.own_bit(position),
                    sent: action == BitAction::Write,
                    read,
                    window,
                    baseline: base_stats,
                    statistic,
                };
                log::info!(target: "membus::bits", "{record}");
                records.push(record);
            }

            let phase = me.phase();
            match me.end_phase() {
                PhaseEnd::Continue(id) => {
                    log::info!("[Node-{participant_id}] phase {phase}, id read: {id}");
                }
                PhaseEnd::Converged => {
                    log::info!("[Node-{participant_id}] phase {phase} read no id, protocol done");
                    break;
                }
            }
        }

        let elapsed_secs = self.sched.now_us().saturating_sub(begin) as f64 / MICROS_PER_SEC as f64;
        log::info!("the protocol ran for {elapsed_secs:.2} seconds");

        Ok(DiscoveryOutcome {
            phases: me.phases().clone(),
            baseline: base_stats,
            records,
            samples: retained,
            elapsed_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::simulate_discovery;

    // -----------------------------------------------------------------------
    // Participant
    // -----------------------------------------------------------------------

    #[test]
    fn oversized_id_space_is_clamped() {
        let p = Participant::new(5, 40, false);
        assert_eq!(p.positions().count(), MAX_ID_BITS as usize);
        assert!(p.own_bit(0));
        assert!(!p.own_bit(32));

        let sims = simulate_discovery(&[1, 2], 33, 0, false);
        for p in &sims {
            assert_eq!(p.phases().ids(), &[2, 1]);
        }
    }

    #[test]
    fn lone_participant_reads_its_own_id() {
        let mut p = Participant::new(0b1011, 4, false);
        p.begin_phase();
        for pos in p.positions() {
            let read = match p.action(pos) {
                BitAction::Write => true,
                BitAction::Listen => false,
            };
            p.record(pos, read);
        }
        assert_eq!(p.end_phase(), PhaseEnd::Continue(0b1011));
        assert!(p.advertised());
    }

    #[test]
    fn withdraws_when_outbid() {
        let mut p = Participant::new(0b0101, 4, false);
        p.begin_phase();
        assert_eq!(p.action(3), BitAction::Listen);
        p.record(3, true); // someone with bit 3 set
        assert!(!p.advertising());
        assert_eq!(p.action(2), BitAction::Listen);
    }

    #[test]
    fn repeat_mode_never_marks_advertised() {
        let mut p = Participant::new(3, 2, true);
        p.begin_phase();
        p.record(1, true);
        p.record(0, true);
        assert_eq!(p.end_phase(), PhaseEnd::Continue(3));
        assert!(!p.advertised());
        p.begin_phase();
        assert!(p.advertising());
    }

    #[test]
    fn zero_phase_converges_only_without_repeat() {
        let mut p = Participant::new(1, 2, false);
        p.begin_phase();
        p.record(1, false);
        p.record(0, false);
        assert_eq!(p.end_phase(), PhaseEnd::Converged);
        assert!(p.phases().is_empty());

        let mut p = Participant::new(1, 2, true);
        p.begin_phase();
        p.record(1, false);
        p.record(0, false);
        assert_eq!(p.end_phase(), PhaseEnd::Continue(0));
        assert_eq!(p.phases().ids(), &[0]);
    }

    // -----------------------------------------------------------------------
    // Convergence on an OR bus
    // -----------------------------------------------------------------------

    #[test]
    fn phase_zero_finds_the_maximum() {
        let ids = [3u32, 200, 17, 199, 64];
        let sims = simulate_discovery(&ids, 8, 1, false);
        for p in &sims {
            assert_eq!(p.phases().get(0), Some(200));
            assert_eq!(p.advertised(), p.id() == 200);
        }
    }

    #[test]
    fn non_repeating_mode_enumerates_all_ids() {
        let ids = [1u32, 3, 5, 7];
        let sims = simulate_discovery(&ids, 8, 0, false);
        for p in &sims {
            assert_eq!(p.phases().ids(), &[7, 5, 3, 1]);
        }
    }

    #[test]
    fn repeating_mode_re_elects_the_maximum() {
        let sims = simulate_discovery(&[9, 4, 12], 4, 3, true);
        for p in &sims {
            assert_eq!(p.phases().ids(), &[12, 12, 12]);
        }
    }

    // -----------------------------------------------------------------------
    // PhaseResult and BitRecord
    // -----------------------------------------------------------------------

    #[test]
    fn phase_result_is_capped() {
        let mut r = PhaseResult::new();
        for i in 0..MAX_PHASES {
            assert!(r.push(i));
        }
        assert!(!r.push(99));
        assert_eq!(r.len(), MAX_PHASES as usize);
    }

    #[test]
    fn bit_record_line_is_field_order_stable() {
        let rec = BitRecord {
            participant: 5,
            phase: 0,
            position: 7,
            own_bit: false,
            sent: false,
            read: true,
            window: Some(SampleStats {
                count: 900,
                mean: 11_000.0,
                variance: 400.0,
                min: 9_000,
                max: 15_000,
            }),
            baseline: SampleStats {
                count: 950,
                mean: 10_000.0,
                variance: 100.0,
                min: 8_000,
                max: 12_000,
            },
            statistic: 4.5,
        };
        let line = rec.to_string();
        let fields: Vec<&str> = line.split_whitespace().collect();
        assert_eq!(fields[0], "[Node-");
        assert_eq!(
            &fields[1..],
            &[
                "5]", "0", "7", "0", "0", "1", "900", "11000", "20", "15000", "9000", "950",
                "10000", "10", "4.500000000000000"
            ]
        );
    }

    #[test]
    fn written_bits_log_zero_window() {
        let rec = BitRecord {
            participant: 12,
            phase: 1,
            position: 0,
            own_bit: true,
            sent: true,
            read: true,
            window: None,
            baseline: SampleStats::default(),
            statistic: 0.0,
        };
        assert!(rec.to_string().starts_with("[Node- 12]   1         0    1     1     1         0"));
    }
}
