use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;
mod config;

use config::CliConfig;

#[derive(Parser, Debug)]
#[command(name = "cascade")]
#[command(about = "Run the release process as a resumable step graph", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "cascade.toml", env = "CASCADE_CONFIG")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the release steps in dependency order
    Plan {
        /// Platform to build; repeat for several. Replaces the configured list
        #[arg(long = "platform")]
        platforms: Vec<String>,
    },

    /// Run (or resume) a release against the dry-run service
    Run {
        /// Version being released, e.g. 1.22.3
        #[arg(long)]
        version: String,

        /// Progress file; re-running with the same file resumes the release
        #[arg(short, long, env = "CASCADE_PROGRESS")]
        progress: Option<PathBuf>,

        /// Platform to build; repeat for several. Replaces the configured list
        #[arg(long = "platform")]
        platforms: Vec<String>,

        /// Make builds for this platform fail
        #[arg(long)]
        fail_platform: Option<String>,
    },

    /// Print a progress file
    Status {
        #[arg(short, long, env = "CASCADE_PROGRESS")]
        progress: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade=info".into()),
        )
        .with_target(false);
    if args.json_logs {
        builder.json().init();
    } else {
        builder.init();
    }

    let mut config = CliConfig::load(&args.config)?;

    match args.command {
        Command::Plan { platforms } => {
            config.override_platforms(platforms);
            commands::plan(&config)
        }
        Command::Run {
            version,
            progress,
            platforms,
            fail_platform,
        } => {
            config.override_platforms(platforms);
            let progress =
                progress.unwrap_or_else(|| PathBuf::from(format!("release-{}.json", version)));
            commands::run(&config, &version, &progress, fail_platform).await
        }
        Command::Status { progress } => commands::status(&progress).await,
    }
}
