//! labfeed CLI: serve the experiment dashboard API and record experiment data.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// labfeed: live experiment dashboard backend
#[derive(Parser, Debug)]
#[command(name = "labfeed", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (holds labfeed.toml and relative store paths)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API, the push channel and the dashboard files
    Serve {
        /// Host to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Directory of static front-end files
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },
    /// Create the store and its collections
    Init,
    /// Record experiment data
    Record {
        #[command(subcommand)]
        action: RecordAction,
    },
    /// Follow the change feed and print dashboard updates
    Watch,
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug)]
enum RecordAction {
    /// Record a new experiment and print its id
    Experiment {
        /// Experiment metadata as a JSON object
        #[arg(long)]
        meta: Option<String>,
    },
    /// Record a transformation of an experiment
    Transformation {
        #[arg(short, long)]
        experiment: String,
        #[arg(long)]
        version_name: String,
        /// Transformation payload as JSON
        #[arg(long)]
        data: Option<String>,
    },
    /// Record a test run of an experiment
    Test {
        #[arg(short, long)]
        experiment: String,
        #[arg(long = "version", value_name = "VERSION")]
        run_version: String,
        /// Test data as JSON, e.g. {"results":[{"correct":true}]}
        #[arg(long)]
        data: Option<String>,
    },
    /// Record analytics for an experiment
    Analytics {
        #[arg(short, long)]
        experiment: String,
        /// Analytics payload as JSON
        #[arg(long)]
        data: Option<String>,
    },
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default labfeed.toml into the workspace
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "labfeed", "labfeed")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "labfeed.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    commands::handle_command(cli.command, &workspace, cli.config.as_deref()).await
}
