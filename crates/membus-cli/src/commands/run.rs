use clap::Args;
use membus_core::{
    MembusError, RunConfig, RunReport, Runner, Scheduler, SystemClock, bits_to_string, hex_to_bits,
};

/// Flags for `membus run`. Every flag overrides the `--config` file.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// JSON run configuration
    #[arg(long)]
    pub config: Option<String>,

    /// This participant's id, in [1, 2^max_bits)
    #[arg(long)]
    pub id: Option<u32>,

    /// Shared start time, Unix seconds
    #[arg(long, conflicts_with = "start_in")]
    pub start_time: Option<u64>,

    /// Start this many seconds from now
    #[arg(long)]
    pub start_in: Option<u64>,

    /// Phases to run (0 = until convergence)
    #[arg(long)]
    pub phases: Option<u32>,

    /// Repeat the first election in every phase (true/false)
    #[arg(long)]
    pub repeat_phases: Option<bool>,

    /// Width of the id space
    #[arg(long)]
    pub max_bits: Option<u32>,

    /// Discovery bit interval in seconds, 1 to 5
    #[arg(long)]
    pub bit_duration: Option<u64>,

    /// Open a covert channel after discovery
    #[arg(long)]
    pub channel: bool,

    /// Channel rate in bits per second
    #[arg(long)]
    pub rate: Option<u32>,

    /// Channel decision threshold in cycles per op
    #[arg(long)]
    pub threshold: Option<u64>,

    /// Channel payload as a 0/1 string
    #[arg(long, conflicts_with = "data_hex")]
    pub data: Option<String>,

    /// Channel payload as hex digits
    #[arg(long)]
    pub data_hex: Option<String>,

    /// Keep sample windows in the report
    #[arg(long)]
    pub samples: bool,

    /// Run label (default: random UUID)
    #[arg(long)]
    pub guid: Option<String>,

    /// Write the report to this path instead of stdout
    #[arg(long)]
    pub output: Option<String>,
}

impl RunArgs {
    /// Merge flags over `base`. `now_secs` anchors `--start-in`.
    pub fn apply(&self, base: RunConfig, now_secs: u64) -> Result<RunConfig, String> {
        let mut c = base;
        if let Some(id) = self.id {
            c.participant_id = id;
        }
        if let Some(t) = self.start_time {
            c.start_time = t;
        }
        if let Some(delay) = self.start_in {
            c.start_time = now_secs + delay;
        }
        if let Some(p) = self.phases {
            c.max_phases = p;
        }
        if let Some(r) = self.repeat_phases {
            c.repeat_phases = r;
        }
        if let Some(b) = self.max_bits {
            c.max_bits = b;
        }
        if let Some(d) = self.bit_duration {
            c.bit_duration_secs = d;
        }
        if self.channel {
            c.setup_channel = true;
        }
        if let Some(r) = self.rate {
            c.channel_rate_bps = r;
        }
        if let Some(t) = self.threshold {
            c.channel_bit_threshold = t;
        }
        let data = match (&self.data, &self.data_hex) {
            (Some(bits), _) => Some(bits.clone()),
            (None, Some(hex)) => {
                let bits = hex_to_bits(hex).map_err(|e| e.to_string())?;
                Some(bits_to_string(&bits))
            }
            (None, None) => None,
        };
        if let Some(data) = data {
            c.channel_data_len = data.len();
            c.channel_data = Some(data);
        }
        if self.samples {
            c.save_samples = true;
        }
        if self.guid.is_some() {
            c.guid = self.guid.clone();
        }
        Ok(c)
    }
}

fn load_config(path: Option<&str>) -> Result<RunConfig, String> {
    let Some(path) = path else {
        return Ok(RunConfig::default());
    };
    let json = std::fs::read_to_string(path).map_err(|e| format!("read {path}: {e}"))?;
    RunConfig::from_json(&json).map_err(|e| format!("parse {path}: {e}"))
}

pub fn run(args: RunArgs) {
    let now_secs = Scheduler::new(SystemClock).now_us() / membus_core::MICROS_PER_SEC;
    let config = match load_config(args.config.as_deref()).and_then(|c| args.apply(c, now_secs)) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(2);
        }
    };

    log::debug!("effective config: {config:?}");
    let report = match validate_then_run(&config, now_secs) {
        Ok(report) => report,
        Err(e) => RunReport::failed(&config, &e),
    };

    if let Err(e) = super::emit_json(&report, args.output.as_deref()) {
        eprintln!("{e}");
        std::process::exit(1);
    }
    if !report.success {
        std::process::exit(1);
    }
}

/// Validate, then locate the bus and check the clock.
fn validate_then_run(config: &RunConfig, now_secs: u64) -> Result<RunReport, MembusError> {
    config.validate(now_secs)?;
    let runner = Runner::on_hardware()?;
    Ok(runner.execute(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_the_file() {
        let base = RunConfig {
            participant_id: 1,
            max_bits: 10,
            ..RunConfig::default()
        };
        let args = RunArgs {
            id: Some(7),
            start_in: Some(30),
            repeat_phases: Some(false),
            phases: Some(3),
            channel: true,
            ..RunArgs::default()
        };
        let c = args.apply(base, 1_000).unwrap();
        assert_eq!(c.participant_id, 7);
        assert_eq!(c.max_bits, 10);
        assert_eq!(c.start_time, 1_030);
        assert_eq!(c.max_phases, 3);
        assert!(!c.repeat_phases);
        assert!(c.setup_channel);
    }

    #[test]
    fn hex_payload_sets_data_and_length() {
        let args = RunArgs {
            data_hex: Some("f0".into()),
            ..RunArgs::default()
        };
        let c = args.apply(RunConfig::default(), 0).unwrap();
        assert_eq!(c.channel_data.as_deref(), Some("11110000"));
        assert_eq!(c.channel_data_len, 8);
    }

    #[test]
    fn bad_hex_is_rejected() {
        let args = RunArgs {
            data_hex: Some("xyz".into()),
            ..RunArgs::default()
        };
        assert!(args.apply(RunConfig::default(), 0).is_err());
    }

    #[test]
    fn config_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.json");
        std::fs::write(&path, r#"{"participant_id": 4, "max_phases": 2}"#).unwrap();
        let c = load_config(path.to_str()).unwrap();
        assert_eq!(c.participant_id, 4);
        assert_eq!(c.max_phases, 2);
        assert!(load_config(Some("/nonexistent/run.json")).is_err());
        assert_eq!(load_config(None).unwrap(), RunConfig::default());
    }

    #[test]
    fn invalid_config_never_reaches_the_hardware() {
        let c = RunConfig::default();
        let err = validate_then_run(&c, 0).unwrap_err();
        assert_eq!(err.code(), "INVALID_ID");
    }
}
