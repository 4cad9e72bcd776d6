// ABOUTME: coven-ops CLI entry point.
// ABOUTME: Provides init and run subcommands for the service supervisor daemon.

use clap::{Parser, Subcommand};
use coven_ops::{run, run_init, RunOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "coven-ops")]
#[command(about = "Supervisor for local dashboard services")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter coven-ops configuration
    Init,
    /// Run the supervisor daemon
    Run {
        /// Path to configuration file
        #[arg(long, env = "COVEN_OPS_CONFIG")]
        config: Option<PathBuf>,
        /// Do not start the services listed under autostart
        #[arg(long)]
        no_autostart: bool,
        /// Log to ~/.config/coven/coven-ops/coven-ops.log instead of stderr
        #[arg(long)]
        log_file: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present (ignore errors if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => run_init(),
        Commands::Run {
            config: config_path,
            no_autostart,
            log_file,
        } => {
            if log_file {
                coven_log::init_file("coven-ops");
            } else {
                coven_log::init();
            }
            run(RunOptions {
                config_path,
                no_autostart,
            })
            .await
        }
    }
}
