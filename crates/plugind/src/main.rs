mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use plugind::config::DEFAULT_CONFIG_FILE;

// ============================================================================
// CLI Types
// ============================================================================

/// plugind - supervise plugin processes and multiplex sessions over their stdio
#[derive(Parser, Debug)]
#[command(version = plugind::build_info::VERSION, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the configured plugins and supervise them until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Validate the configuration and list the plugins it declares
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },
}

// ============================================================================
// Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> std::process::ExitCode {
    init_tracing();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => commands::run::run(&config).await,
        Commands::Check { config } => commands::check::run(&config).await,
    }
}

// ============================================================================
// Initialization
// ============================================================================

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
