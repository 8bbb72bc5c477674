//! CLI for rngcollect: timed entropy captures and bias analysis.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rngcollect")]
#[command(about = "rngcollect: sample hardware and software RNGs and track their bias")]
#[command(version = rngcollect_core::VERSION)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List entropy sources and whether they are available on this machine
    Scan,

    /// Record a timed capture to CSV. Ctrl+C stops early and keeps the file.
    Record {
        /// Source: bitb, trng, intel or pseudo
        #[arg(long, default_value = "pseudo")]
        source: String,

        /// Bits per sample (positive multiple of 8)
        #[arg(long, default_value = "2048")]
        bits: usize,

        /// Time between samples (e.g. "1s", "250ms")
        #[arg(long, default_value = "1s")]
        interval: String,

        /// Session length (e.g. "60s", "5m"). "0" runs until Ctrl+C.
        #[arg(long, default_value = "60s")]
        duration: String,

        /// XOR-fold level 0-4 (bitb only)
        #[arg(long, default_value = "0")]
        fold: u8,

        /// Explicit device node or serial port
        #[arg(long)]
        device: Option<PathBuf>,

        /// Output directory
        #[arg(long, default_value = "data/raw")]
        output: PathBuf,

        /// Free-form note stored in the session metadata
        #[arg(long)]
        note: Option<String>,
    },

    /// Replay a capture and report its Z-score trajectory and assessment
    Analyze {
        /// Capture CSV, or a raw .bin dump (with --bits)
        path: PathBuf,

        /// Block size in bits for raw .bin dumps (defaults to the capture name's s<bits>)
        #[arg(long)]
        bits: Option<usize>,

        /// Write the per-sample trajectory as CSV
        #[arg(long)]
        output: Option<PathBuf>,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Read bytes, bits or integers directly from a source
    Generate {
        /// Source: bitb, trng, intel or pseudo
        #[arg(long, default_value = "pseudo")]
        source: String,

        /// XOR-fold level 0-4 (bitb only)
        #[arg(long, default_value = "0")]
        fold: u8,

        /// Explicit device node or serial port
        #[arg(long)]
        device: Option<PathBuf>,

        /// Exactly this many bytes, printed as hex
        #[arg(long, conflicts_with_all = ["bits", "int"])]
        bytes: Option<usize>,

        /// Exactly this many bits (multiple of 8), printed as hex
        #[arg(long, conflicts_with = "int")]
        bits: Option<usize>,

        /// Uniform integers in [MIN, MAX)
        #[arg(long, num_args = 2, value_names = ["MIN", "MAX"], allow_negative_numbers = true)]
        int: Option<Vec<i64>>,

        /// How many integers to draw with --int
        #[arg(long, default_value = "1")]
        count: usize,
    },

    /// Run the HTTP control server
    Server {
        /// Port to listen on
        #[arg(long, default_value = "8042")]
        port: u16,

        /// Host to bind to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Capture output directory
        #[arg(long, default_value = "data/raw")]
        output: PathBuf,
    },
}

fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Scan => commands::scan::run(),
        Commands::Record {
            source,
            bits,
            interval,
            duration,
            fold,
            device,
            output,
            note,
        } => commands::record::run(commands::record::RecordCommandConfig {
            source: &source,
            bits,
            interval: &interval,
            duration: &duration,
            fold,
            device,
            output,
            note,
        }),
        Commands::Analyze {
            path,
            bits,
            output,
            json,
        } => commands::analyze::run(&path, bits, output.as_deref(), json),
        Commands::Generate {
            source,
            fold,
            device,
            bytes,
            bits,
            int,
            count,
        } => {
            let mode = match (bytes, bits, int) {
                (Some(n), _, _) => commands::generate::Mode::Bytes(n),
                (_, Some(n), _) => commands::generate::Mode::Bits(n),
                (_, _, Some(range)) => commands::generate::Mode::Int {
                    min: range[0],
                    max: range[1],
                    count,
                },
                _ => commands::generate::Mode::Bytes(32),
            };
            commands::generate::run(&source, fold, device, mode)
        }
        Commands::Server { port, host, output } => commands::server::run(&host, port, output),
    }
}
