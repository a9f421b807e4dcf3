use membus_core::{
    Bus, MICROS_PER_SEC, SampleStats, Sampler, SamplerConfig, Scheduler, SystemClock,
    check_clock_precision, locate, participant_seed, write_until,
};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct ProbeReport {
    clock_resolution_ns: u64,
    line_size: usize,
    target_addr: String,
    uncontended: SampleStats,
    batch_ops: usize,
    batch_cycles_per_op: f64,
    writer_batches: u64,
    writer_window_us: u64,
}

/// Average per-op cost over `batches` timed batches of `ops` adds.
fn cycles_per_op(bus: &impl Bus, batches: usize, ops: usize) -> f64 {
    if batches == 0 || ops == 0 {
        return 0.0;
    }
    let total: u64 = (0..batches).map(|_| bus.timed_batch(ops)).sum();
    total as f64 / (batches * ops) as f64
}

pub fn run(window_ms: u64, batches: usize, json: bool) {
    let clock_resolution_ns = match check_clock_precision() {
        Ok(ns) => ns,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    let line = match locate() {
        Ok(line) => line,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    let sched = Scheduler::new(SystemClock);
    let window_us = window_ms * 1_000;
    let config = SamplerConfig {
        guard_us: 0,
        ..SamplerConfig::default()
    };
    let mut sampler = Sampler::new(config, participant_seed(0));
    let end = sched.now_us() + window_us;
    let uncontended = sampler.sample(&line, &sched, end, window_us).stats;

    let batch_ops = 10;
    let batch_cycles_per_op = cycles_per_op(&line, batches, batch_ops);
    let writer_batches = write_until(&line, &sched, sched.now_us() + window_us);

    let report = ProbeReport {
        clock_resolution_ns,
        line_size: line.line_size(),
        target_addr: format!("{:#x}", line.target_addr()),
        uncontended,
        batch_ops,
        batch_cycles_per_op,
        writer_batches,
        writer_window_us: window_us,
    };

    if json {
        if let Err(e) = super::emit_json(&report, None) {
            eprintln!("{e}");
            std::process::exit(1);
        }
        return;
    }

    println!("Memory bus probe");
    println!("  Clock resolution: {} ns", report.clock_resolution_ns);
    println!("  Cache line:       {} B", report.line_size);
    println!("  Target address:   {}", report.target_addr);
    println!();
    println!("  Uncontended window ({window_ms} ms)");
    println!("    Samples:        {}", uncontended.count);
    println!("    Mean:           {:.0} cycles", uncontended.mean);
    println!("    Std dev:        {:.0} cycles", uncontended.std_dev());
    println!("    Min / max:      {} / {}", uncontended.min, uncontended.max);
    println!();
    println!(
        "  Timed batches:    {:.0} cycles/op ({batches} x {batch_ops} ops)",
        report.batch_cycles_per_op
    );
    let rate = report.writer_batches as f64 * MICROS_PER_SEC as f64 / window_us.max(1) as f64;
    println!(
        "  Bus writer:       {} batches in {window_ms} ms ({rate:.0} batches/s)",
        report.writer_batches
    );
}
