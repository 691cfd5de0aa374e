//! swiftdl CLI - Command-line downloader
//!
//! Drives the concurrent download engine: single transfers, batches from a
//! file, and artifact fetches through the caching optimizer.

mod commands;
mod output;
mod progress;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use swiftdl_core::DownloadEngine;
use swiftdl_types::ArtifactKind;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// swiftdl - Concurrent Downloader
#[derive(Parser)]
#[command(name = "swiftdl")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(long, env = "SWIFTDL_CONFIG")]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, default_value = "human")]
    output: OutputFormat,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Human,
    Json,
    Table,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a single URL
    Get {
        /// URL to download
        url: String,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Priority (>5 high, 1-5 normal, <=0 low)
        #[arg(short, long)]
        priority: Option<i32>,

        /// Retries after the first attempt
        #[arg(short, long)]
        retries: Option<u32>,

        /// Per-attempt timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,

        /// Extra request header as `name:value`
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,
    },

    /// Download every URL listed in a file
    Batch {
        /// File with one `url [destination]` per line
        file: PathBuf,

        /// Directory downloads are written into
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,

        /// Priority for every entry
        #[arg(short, long)]
        priority: Option<i32>,
    },

    /// Fetch an artifact through the caching optimizer
    Artifact {
        /// URL to fetch
        url: String,

        /// Artifact class
        #[arg(short, long, default_value = "binary")]
        kind: ArtifactKind,

        /// Directory to store the artifact in
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Show engine configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,

    /// Print the configuration file location
    Path,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config_path = cli
        .config
        .clone()
        .or_else(swiftdl_core::config::default_config_path);
    let config = swiftdl_core::config::load_or_default(config_path.as_deref()).await?;
    tracing::debug!("Using config {:?}", config_path);

    let command = match cli.command {
        Commands::Config { action } => {
            return commands::config_action(&config, config_path.as_deref(), action, cli.output);
        }
        Commands::Completions { shell } => {
            use clap::CommandFactory;
            clap_complete::generate(shell, &mut Cli::command(), "swiftdl", &mut std::io::stdout());
            return Ok(());
        }
        command => command,
    };

    let engine = DownloadEngine::new(config)?;
    engine.start().await?;

    let outcome = match command {
        Commands::Get {
            url,
            output,
            priority,
            retries,
            timeout,
            headers,
        } => {
            let options = commands::transfer_options(priority, retries, timeout, &headers)?;
            commands::get(&engine, &url, output, options, cli.output).await
        }

        Commands::Batch {
            file,
            dir,
            priority,
        } => {
            let options = commands::transfer_options(priority, None, None, &[])?;
            commands::batch(&engine, &file, &dir, options, cli.output).await
        }

        Commands::Artifact { url, kind, dir } => {
            commands::artifact(&engine, &url, kind, dir, cli.output).await
        }

        Commands::Config { .. } | Commands::Completions { .. } => Ok(()),
    };

    let metrics = engine.metrics();
    engine.shutdown().await;
    output::print_metrics(&metrics, cli.output)?;

    outcome
}
