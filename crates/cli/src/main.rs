//! MARSSx86 timing-core CLI.
//!
//! Thin wrapper: parse the configuration surface with `clap`, construct a
//! `Machine`, run it to a stop condition, then print or persist stats.

use std::fs;
use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

use marss_core::config::Config;
use marss_core::machine::Machine;

#[derive(Parser, Debug)]
#[command(
    name = "marss",
    author,
    version,
    about = "MARSSx86 cycle-accurate microarchitectural timing core",
    long_about = "Runs the timing core standalone against a JSON configuration, \
                   driving cores, caches, and the coherence directory until a \
                   stop condition is met."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the timing core to a stop condition.
    Run {
        /// JSON configuration file. Omit to use built-in defaults.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Stop after this many cycles (overrides `stop.stopcycle` in config).
        #[arg(long)]
        cycles: Option<u64>,

        /// Stats sections to print (`summary`, `branch`, `cache`, `directory`).
        /// Omit for all sections.
        #[arg(long)]
        stats: Vec<String>,

        /// Write the binary stats container to this path after the run.
        #[arg(long)]
        stats_out: Option<PathBuf>,
    },
    /// Print the effective configuration (defaults merged with `--config`) as JSON.
    PrintConfig {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Some(Commands::Run { config, cycles, stats, stats_out }) => {
            cmd_run(config, cycles, &stats, stats_out);
        }
        Some(Commands::PrintConfig { config }) => cmd_print_config(config),
        None => {
            eprintln!("marss: pass a subcommand");
            eprintln!();
            eprintln!("  marss run [--config <file>] [--cycles N]   Run the timing core");
            eprintln!("  marss print-config [--config <file>]       Show effective configuration");
            eprintln!();
            eprintln!("  marss --help  for full options");
            process::exit(1);
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Config {
    let Some(path) = path else { return Config::default() };
    let text = fs::read_to_string(&path).unwrap_or_else(|e| {
        eprintln!("error reading config {}: {e}", path.display());
        process::exit(1);
    });
    serde_json::from_str(&text).unwrap_or_else(|e| {
        eprintln!("error parsing config {}: {e}", path.display());
        process::exit(1);
    })
}

fn cmd_run(config_path: Option<PathBuf>, cycles: Option<u64>, sections: &[String], stats_out: Option<PathBuf>) {
    let config = load_config(config_path);
    tracing::info!(
        cores = config.system.num_cores,
        kind = ?config.system.core_kind,
        "starting run"
    );

    let mut machine = Machine::new(&config);
    // No concrete x86 `Decoder`/`Emulator` ships in this crate (see
    // `decoder.rs`'s doc comment); until one is wired in via
    // `Machine::core_decoder_mut`/`start_core`, every core's fetch stays
    // idle and a run only exercises cycle bookkeeping.
    let target_cycles = cycles.or(config.stop.stopcycle).unwrap_or(100_000);
    machine.run_cycles(target_cycles);

    machine.stats.print_sections(sections);

    if let Some(path) = stats_out {
        let file = fs::File::create(&path).unwrap_or_else(|e| {
            eprintln!("error creating stats file {}: {e}", path.display());
            process::exit(1);
        });
        if let Err(e) = machine.stats.write_binary(file) {
            eprintln!("error writing stats file {}: {e}", path.display());
            process::exit(1);
        }
    }
}

fn cmd_print_config(config_path: Option<PathBuf>) {
    let config = load_config(config_path);
    match serde_json::to_string_pretty(&ConfigView::from(&config)) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("error serializing configuration: {e}");
            process::exit(1);
        }
    }
}

/// `Config` derives `Deserialize` but not `Serialize` (it is only ever read
/// from JSON, never written), so `print-config` reports the handful of
/// top-level knobs operators actually ask to confirm rather than round-
/// tripping the whole tree.
#[derive(serde::Serialize)]
struct ConfigView {
    num_cores: usize,
    core_kind: String,
    rob_size: usize,
    l1d_sets: usize,
    l1d_ways: usize,
}

impl From<&Config> for ConfigView {
    fn from(c: &Config) -> Self {
        Self {
            num_cores: c.system.num_cores,
            core_kind: format!("{:?}", c.system.core_kind),
            rob_size: c.ooo.rob_size,
            l1d_sets: c.cache.l1d.sets,
            l1d_ways: c.cache.l1d.ways,
        }
    }
}
