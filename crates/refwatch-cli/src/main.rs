//! refwatch CLI tool.

use clap::{Parser, Subcommand};
use refwatch_config::DEFAULT_CONFIG_PATH;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "refwatch")]
#[command(about = "Repository synchronization and build admission", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "REFWATCH_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file
    Validate,
    /// Run one synchronization pass
    Sync {
        /// Only synchronize the repository with this URL
        #[arg(long)]
        repository: Option<String>,
    },
    /// Show the merge request behind a `refs/pull/<n>` branch
    MergeRequest {
        /// Repository URL
        repository: String,
        /// Merge request number
        number: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if cli.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Validate => {
            commands::validate(&cli.config)?;
        }
        Commands::Sync { repository } => {
            commands::sync::run(&cli.config, repository.as_deref()).await?;
        }
        Commands::MergeRequest { repository, number } => {
            commands::merge_request::show(&cli.config, &repository, number).await?;
        }
    }

    Ok(())
}
