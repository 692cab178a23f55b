mod pipeline;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ng_core::Config;

#[derive(Parser)]
#[command(name = "ng", about = "NeuroGraph signal router")]
struct Cli {
    /// TOML configuration file (defaults to $NG_CONFIG, then built-in defaults)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Route JSON-lines signals from a file or stdin
    Run {
        /// Input file; stdin when omitted
        file: Option<PathBuf>,

        /// Routing worker threads
        #[arg(long, default_value_t = 1)]
        workers: usize,

        /// Print matching events as NAME=FILTER_JSON (repeatable)
        #[arg(long = "subscribe", value_name = "NAME=FILTER_JSON")]
        subscriptions: Vec<String>,
    },

    /// Emit synthetic signals and report throughput
    Bench {
        /// Total signals to emit
        #[arg(long, default_value_t = 100_000)]
        events: usize,

        /// Distinct signal vectors to cycle through
        #[arg(long, default_value_t = 1_000)]
        distinct: usize,

        /// Emitting threads
        #[arg(long, default_value_t = 4)]
        workers: usize,
    },

    /// Print the effective configuration
    Config,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn load_config(cli: &Cli) -> Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("NG_CONFIG").ok().map(PathBuf::from));

    let config = match path {
        Some(path) => read_config(&path)?,
        None => Config::default(),
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: Config =
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))?;
    tracing::info!("loaded configuration from {}", path.display());
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = load_config(&cli)?;

    match &cli.command {
        Commands::Run {
            file,
            workers,
            subscriptions,
        } => pipeline::cmd_run(config, file.as_deref(), *workers, subscriptions).await,
        Commands::Bench {
            events,
            distinct,
            workers,
        } => pipeline::cmd_bench(config, *events, *distinct, *workers).await,
        Commands::Config => cmd_config(&config),
    }
}

fn cmd_config(config: &Config) -> Result<()> {
    let text = toml::to_string_pretty(config).context("failed to serialize configuration")?;
    print!("{text}");
    Ok(())
}
