// SPDX-FileCopyrightText: 2026 Cauce Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cauce - concurrent conversational-message dispatcher.
//!
//! Binary entry point: parses the CLI and runs the serve loop.

#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod serve;
mod shutdown;

/// Cauce - message dispatcher between chat transports and an AI agent.
#[derive(Parser, Debug)]
#[command(name = "cauce", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the dispatcher: webhooks, worker pool, follow-up scheduler.
    Serve {
        /// Path to a TOML config file; defaults to the standard hierarchy.
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config } => {
            let config = match config {
                Some(path) => cauce_config::load_config_from_path(&path),
                None => cauce_config::load_config(),
            };
            let config = match config {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("error: invalid configuration: {e}");
                    std::process::exit(1);
                }
            };
            if let Err(e) = serve::run_serve(config).await {
                eprintln!("error: {e}");
                std::process::exit(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #[test]
    #[cfg(not(target_env = "msvc"))]
    fn jemalloc_is_active() {
        // Verify jemalloc is the global allocator by advancing the epoch.
        // Only jemalloc supports this; the system allocator would fail.
        use tikv_jemalloc_ctl::{epoch, stats};
        epoch::advance().unwrap();
        let allocated = stats::allocated::read().unwrap();
        assert!(allocated > 0, "jemalloc should report non-zero allocation");
    }
}
