//! Integration tests for membus-core.
//!
//! These tests run whole participants against simulated clocks and buses:
//! calibration → discovery phases → role assignment → covert channel → report.

use membus_core::sim::{SimClock, WindowBus};
use membus_core::{
    BitClassifier, ClassifierConfig, MICROS_PER_SEC, Micros, NeighborDiscovery, Role, RunConfig,
    Runner, Sampler, SamplerConfig, Scheduler,
};

const LOW: u64 = 9_000;
const HIGH: u64 = 12_000;
const NOW_SECS: u64 = 1_000;

/// The `idx`-th bit interval after calibration.
fn bit_window(start: Micros, bit: Micros, idx: u64) -> (Micros, Micros) {
    let from = start + bit * (1 + idx);
    (from, from + bit)
}

fn channel_windows(start: Micros, payload: &str) -> Vec<(Micros, Micros)> {
    payload
        .chars()
        .enumerate()
        .filter(|(_, c)| *c == '1')
        .map(|(i, _)| {
            let from = start + i as Micros * 1_000;
            (from, from + 1_000)
        })
        .collect()
}

fn channel_config(id: u32) -> RunConfig {
    RunConfig {
        participant_id: id,
        start_time: NOW_SECS + 1,
        max_bits: 3,
        max_phases: 2,
        repeat_phases: false,
        setup_channel: true,
        channel_data: Some("1011".into()),
        channel_data_len: 4,
        save_samples: true,
        guid: Some(format!("it-{id}")),
        ..RunConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Discovery driver
// ---------------------------------------------------------------------------

#[test]
fn driver_reads_a_higher_neighbor() {
    // Neighbor 5 (0b101) writes bits 2 and 0 of phase 0; local 3 (0b011) hears
    // bit 2, withdraws, and reads 5.
    let start: Micros = 50_000;
    let bit: Micros = 100_000;
    let clock = SimClock::new(0, 1);
    let sched = Scheduler::new(&clock);
    let bus = WindowBus::new(
        &clock,
        LOW,
        HIGH,
        vec![bit_window(start, bit, 0), bit_window(start, bit, 2)],
    );
    let mut sampler = Sampler::new(SamplerConfig::default(), 42);
    let classifier = BitClassifier::new(ClassifierConfig::default());

    let outcome = NeighborDiscovery {
        bus: &bus,
        sched: &sched,
        sampler: &mut sampler,
        classifier: &classifier,
        config: membus_core::DiscoveryConfig {
            max_bits: 3,
            max_phases: 1,
            repeat_phases: false,
            bit_duration_us: bit,
            retain_samples: true,
        },
    }
    .run(3, start)
    .unwrap();

    assert_eq!(outcome.phases.ids(), &[5]);
    assert_eq!(outcome.records.len(), 3);
    let reads: Vec<bool> = outcome.records.iter().map(|r| r.read).collect();
    assert_eq!(reads, vec![true, false, true]);
    assert!(outcome.records.iter().all(|r| !r.sent));
    assert!(outcome.baseline.count > 0);

    let samples = outcome.samples.unwrap();
    assert!(!samples.baseline.is_empty());
    assert!(samples.bit1.is_some());
    assert!(samples.bit0.is_some());
}

#[test]
fn late_participant_misses_the_sync_point() {
    let clock = SimClock::new(10 * MICROS_PER_SEC, 1);
    let sched = Scheduler::new(&clock);
    let bus = WindowBus::new(&clock, LOW, HIGH, Vec::new());
    let mut sampler = Sampler::new(SamplerConfig::default(), 1);
    let classifier = BitClassifier::default();
    let err = NeighborDiscovery {
        bus: &bus,
        sched: &sched,
        sampler: &mut sampler,
        classifier: &classifier,
        config: membus_core::DiscoveryConfig {
            max_bits: 3,
            max_phases: 1,
            repeat_phases: true,
            bit_duration_us: MICROS_PER_SEC,
            retain_samples: false,
        },
    }
    .run(3, MICROS_PER_SEC)
    .unwrap_err();
    assert_eq!(err.code(), "SYNC_POINT_MISSED");
    assert_eq!(bus.ops(), 0);
}

// ---------------------------------------------------------------------------
// Full runs
// ---------------------------------------------------------------------------

#[test]
fn sender_run_end_to_end() {
    let config = channel_config(5);
    let start = config.start_us();
    let bit = config.bit_duration_us();
    let channel_start = config.channel_start_secs() * MICROS_PER_SEC;

    // Neighbor 3 wins phase 1 (bits 1 and 0); the receiver contends for the
    // whole channel session.
    let mut windows = vec![bit_window(start, bit, 4), bit_window(start, bit, 5)];
    windows.push((channel_start, channel_start + 4 * 1_000));

    let clock = SimClock::new(NOW_SECS * MICROS_PER_SEC, 3);
    let bus = WindowBus::new(&clock, LOW, HIGH, windows);
    let report = Runner::new(&bus, &clock).with_seed(7).execute(&config);

    assert!(report.success, "error: {:?}", report.error);
    assert_eq!(report.guid, "it-5");
    assert_eq!(report.phases, vec![5, 3]);
    assert_eq!(report.bits.len(), 6);

    let channel = report.channel.as_ref().unwrap();
    assert_eq!(channel.role, Role::Sender);
    assert_eq!((channel.sender_id, channel.receiver_id), (5, 3));
    assert_eq!(channel.data, "1011");
    assert_eq!(channel.erasures, 0);

    let samples = report.samples.as_ref().unwrap();
    assert!(!samples.baseline.is_empty());
    assert!(samples.bit1.is_some());
    assert!(samples.bit0.is_some());
    assert!(!samples.channel.is_empty());
}

#[test]
fn receiver_run_decodes_the_payload() {
    let config = channel_config(3);
    let start = config.start_us();
    let bit = config.bit_duration_us();
    let channel_start = config.channel_start_secs() * MICROS_PER_SEC;

    // Neighbor 5 wins phase 0 and stays silent afterwards, then sends 1011.
    let mut windows = vec![bit_window(start, bit, 0), bit_window(start, bit, 2)];
    windows.extend(channel_windows(channel_start, "1011"));

    let clock = SimClock::new(NOW_SECS * MICROS_PER_SEC, 3);
    let bus = WindowBus::new(&clock, LOW, HIGH, windows);
    let report = Runner::new(&bus, &clock).with_seed(8).execute(&config);

    assert!(report.success, "error: {:?}", report.error);
    assert_eq!(report.phases, vec![5, 3]);
    let channel = report.channel.as_ref().unwrap();
    assert_eq!(channel.role, Role::Receiver);
    assert_eq!(channel.data, "1011");
    assert_eq!(channel.erasures, 0);
}

#[test]
fn bystander_gets_no_channel() {
    let config = channel_config(1);
    let start = config.start_us();
    let bit = config.bit_duration_us();
    // Phase 0 reads 5, phase 1 reads 3; id 1 (0b001) hears both.
    let windows = vec![
        bit_window(start, bit, 0),
        bit_window(start, bit, 2),
        bit_window(start, bit, 4),
        bit_window(start, bit, 5),
    ];
    let clock = SimClock::new(NOW_SECS * MICROS_PER_SEC, 3);
    let bus = WindowBus::new(&clock, LOW, HIGH, windows);
    let report = Runner::new(&bus, &clock).with_seed(9).execute(&config);

    assert!(report.success);
    assert_eq!(report.phases, vec![5, 3]);
    assert!(report.channel.is_none());
}

#[test]
fn report_round_trips_through_a_file() {
    let config = RunConfig {
        participant_id: 2,
        start_time: NOW_SECS + 1,
        max_bits: 2,
        ..RunConfig::default()
    };
    let clock = SimClock::new(NOW_SECS * MICROS_PER_SEC, 5);
    let bus = WindowBus::new(&clock, LOW, HIGH, Vec::new());
    let report = Runner::new(&bus, &clock).with_seed(3).execute(&config);
    assert!(report.success);
    // Alone on the bus, a participant reads back its own id.
    assert_eq!(report.phases, vec![2]);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    report.write_to(&path).unwrap();
    let json: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(json["id"], 2);
    assert_eq!(json["success"], true);
    assert_eq!(json["phases"], serde_json::json!([2]));
    assert_eq!(json["bits"].as_array().unwrap().len(), 2);
    assert!(json.get("channel").is_none());
}

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

#[test]
#[ignore] // Hardware-dependent: needs a readable cache line size
fn locates_a_straddling_address() {
    use membus_core::Bus;
    let line = membus_core::locate().unwrap();
    let offset = line.target_addr() % line.line_size();
    assert_eq!(offset, line.line_size() - 4);
    let readings: Vec<u64> = (0..100).map(|_| line.probe()).collect();
    assert!(readings.iter().any(|&r| r > 0));
}
