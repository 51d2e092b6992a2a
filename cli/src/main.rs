// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Hearth Node Agent CLI
//!
//! The `hearth` binary runs the node agent that hosts game servers on this
//! machine.
//!
//! ## Commands
//!
//! - `hearth serve` - Run the agent in the foreground
//! - `hearth config show|validate|generate` - Configuration management
//! - `hearth blueprint import <FILE>...` - Load blueprints into the local store

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use hearth_agent::commands::{self, BlueprintCommand, ConfigCommand};
use hearth_agent::daemon;

/// Hearth node agent - host and operate game servers
#[derive(Parser)]
#[command(name = "hearth")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(
        short,
        long,
        global = true,
        env = "HEARTH_CONFIG_PATH",
        value_name = "FILE"
    )]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the node agent in the foreground
    #[command(name = "serve")]
    Serve,

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Blueprint store management
    #[command(name = "blueprint")]
    Blueprint {
        #[command(subcommand)]
        command: BlueprintCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match &cli.log_level {
        Some(level) => level.clone(),
        None => commands::configured_log_level(cli.config.clone()),
    };
    init_logging(&level)?;

    match cli.command {
        Commands::Serve => daemon::serve(cli.config).await,
        Commands::Config { command } => commands::config::handle_command(command, cli.config).await,
        Commands::Blueprint { command } => {
            commands::blueprint::handle_command(command, cli.config).await
        }
    }
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();

    Ok(())
}
