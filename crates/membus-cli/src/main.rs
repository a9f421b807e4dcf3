//! CLI for membus: find co-resident neighbors on the memory bus and talk to them.

mod commands;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "membus")]
#[command(about = "membus: co-residency discovery and covert signalling over memory-bus contention")]
#[command(version = membus_core::VERSION)]
struct Cli {
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Locate a split-line address and measure uncontended and contended latency
    Probe {
        /// Sampling window in milliseconds
        #[arg(long, default_value = "200")]
        window_ms: u64,

        /// Timed batches for the batch latency estimate
        #[arg(long, default_value = "1000")]
        batches: usize,

        /// Print the measurements as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run one participant: discovery, then optionally the covert channel.
    /// All participants must be started with the same start time and shape.
    Run(commands::run::RunArgs),

    /// Simulate discovery for a set of ids on an ideal OR bus
    Simulate {
        /// Comma-separated participant ids
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<u32>,

        /// Width of the id space
        #[arg(long, default_value = "8")]
        max_bits: u32,

        /// Phases to run (0 = until convergence)
        #[arg(long, default_value = "0")]
        phases: u32,

        /// Repeat the first election in every phase
        #[arg(long)]
        repeat: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    commands::init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Commands::Probe {
            window_ms,
            batches,
            json,
        } => commands::probe::run(window_ms, batches, json),
        Commands::Run(args) => commands::run::run(args),
        Commands::Simulate {
            ids,
            max_bits,
            phases,
            repeat,
            json,
        } => commands::simulate::run(&ids, max_bits, phases, repeat, json),
    }
}
