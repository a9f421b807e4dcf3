pub mod probe;
pub mod run;
pub mod simulate;

use serde::Serialize;

/// Default log filter for a verbosity level. `RUST_LOG` overrides it.
pub fn log_filter(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install `env_logger` on stderr.
pub fn init_logging(verbose: u8, quiet: bool) {
    let env = env_logger::Env::default().default_filter_or(log_filter(verbose, quiet));
    env_logger::Builder::from_env(env)
        .format_timestamp_micros()
        .init();
}

/// Print `value` as pretty JSON, or write it to `path`.
pub fn emit_json<T: Serialize>(value: &T, path: Option<&str>) -> Result<(), String> {
    let json = serde_json::to_string_pretty(value).map_err(|e| format!("encode JSON: {e}"))?;
    match path {
        Some(path) => {
            std::fs::write(path, json).map_err(|e| format!("write {path}: {e}"))?;
            eprintln!("Report written to {path}");
        }
        None => println!("{json}"),
    }
    Ok(())
}
