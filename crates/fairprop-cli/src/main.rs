mod batch;
mod bench;
mod display;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use fairprop_engine::{Engine, EngineConfig, EngineError, InferenceRequest};
use tracing_subscriber::EnvFilter;

/// FairProp Inspector - fair-housing compliance check for property listings
#[derive(Parser)]
#[command(name = "fairprop")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Property description to inspect
    text: Option<String>,

    /// Property description to inspect (alternative to the positional text)
    #[arg(long, conflicts_with = "text")]
    check: Option<String>,

    /// Model artifact directory
    #[arg(long, env = "FAIRPROP_MODEL", default_value = "artifacts/model", global = true)]
    model: PathBuf,

    /// Engine configuration file (JSON)
    #[arg(long, env = "FAIRPROP_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Emit machine-readable JSON instead of the human report
    #[arg(long, global = true)]
    json: bool,

    /// Per-request deadline in milliseconds
    #[arg(long, default_value_t = 5_000, global = true)]
    timeout_ms: u64,

    /// Log verbosity (-v info, -vv debug); RUST_LOG overrides
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Audit a portfolio of listings (`[{"id": ..., "description": ...}]`)
    Batch {
        /// JSON file of listings
        input: PathBuf,

        /// Write per-listing results and the summary report here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Measure latency over the built-in sample listings
    Bench {
        /// Timed single-request runs
        #[arg(long, default_value_t = 100)]
        runs: usize,

        /// Untimed warm-up runs
        #[arg(long, default_value_t = 5)]
        warmup: usize,

        /// Write the benchmark report here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(exit_code(&e))
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if cli.command.is_none() && cli.text.is_none() && cli.check.is_none() {
        anyhow::bail!("no listing text given; pass it as an argument or with --check");
    }
    let config = load_config(cli.config.as_deref())?;
    let timeout = Duration::from_millis(cli.timeout_ms);
    let engine = Engine::load(&cli.model, config)
        .with_context(|| format!("loading model from {}", cli.model.display()))?;

    match cli.command {
        Some(Command::Batch { input, output }) => {
            let listings = batch::read_listings(&input)?;
            eprintln!("Processing {} listings...", listings.len());
            let audit = batch::run_audit(&engine, listings, timeout).await;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&audit)?);
            } else {
                display::print_audit(&audit);
            }
            if let Some(path) = output {
                batch::save(&path, &audit)?;
                eprintln!("Results saved to {}", path.display());
            }
        }
        Some(Command::Bench {
            runs,
            warmup,
            output,
        }) => {
            let report = bench::run(&engine, runs, warmup, timeout).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                display::print_bench(&report);
            }
            if let Some(path) = output {
                std::fs::write(&path, serde_json::to_string_pretty(&report)?)
                    .with_context(|| format!("writing {}", path.display()))?;
                eprintln!("Results saved to {}", path.display());
            }
        }
        None => {
            let text = cli.text.or(cli.check).unwrap_or_default();
            let request = InferenceRequest::new(text.as_str()).with_deadline(timeout);
            let prediction = engine.classify_with(request).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&prediction)?);
            } else {
                display::print_prediction(&text, &prediction);
            }
        }
    }

    engine.shutdown().await;
    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path).map_err(EngineError::from)?),
        None => Ok(EngineConfig::default()),
    }
}

/// Engine failures keep their kind's exit status; anything else is 1.
fn exit_code(e: &anyhow::Error) -> u8 {
    e.chain()
        .find_map(|cause| cause.downcast_ref::<EngineError>())
        .map_or(1, |e| e.kind().exit_code())
}
