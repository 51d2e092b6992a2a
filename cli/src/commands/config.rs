// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use hearth_core::domain::node_config::NodeConfigManifest;

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration file with every default written out
    Generate {
        /// Output path (default: ./hearth-config.yaml)
        #[arg(short, long, default_value = "./hearth-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths } => show(config_override, paths).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool) -> Result<()> {
    let config = NodeConfigManifest::load_or_default(config_override.clone())
        .context("Failed to load configuration")?;
    let spec = &config.spec;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. HEARTH_CONFIG_PATH: {}",
            std::env::var("HEARTH_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./hearth-config.yaml");
        println!("  4. ~/.hearth/config.yaml");
        println!("  5. /etc/hearth/config.yaml");
        println!();
    }

    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node Identity:".bold());
    println!("  ID: {}", spec.node.id);
    if let Some(region) = &spec.node.region {
        println!("  Region: {}", region);
    }
    println!();

    println!("{}", "Container Engine:".bold());
    println!(
        "  Socket: {}",
        spec.docker.socket_path.as_deref().unwrap_or("(local default)")
    );
    if let Some(mode) = &spec.docker.network_mode {
        println!("  Network mode: {}", mode);
    }
    println!();

    println!("{}", "Storage:".bold());
    println!("  Database: {}", spec.database.url);
    println!();

    println!("{}", "API:".bold());
    println!("  Listen: {}:{}", spec.api.bind_address, spec.api.port);
    println!(
        "  Backend token: {}",
        if spec.api.backend_token.is_some() { "set" } else { "(not set)" }
    );
    if spec.api.insecure_open_access {
        println!("  {}", "Insecure open access: on".yellow());
    }
    println!();

    println!("{}", "Lifecycle:".bold());
    println!("  Lock timeout: {:?}", spec.lifecycle.lock_timeout);
    println!("  Stop timeout: {:?}", spec.lifecycle.stop_timeout);
    println!("  Install timeout: {:?}", spec.lifecycle.install_timeout);
    println!("  Data mount: {}", spec.lifecycle.data_mount);
    println!(
        "  Retry: {} attempts, backoff {:?} up to {:?}",
        spec.lifecycle.retry.max_attempts,
        spec.lifecycle.retry.initial_backoff,
        spec.lifecycle.retry.max_backoff
    );
    println!();

    println!("{}", "Streaming:".bold());
    println!("  Console replay: {} lines", spec.console.log_tail_lines);
    println!("  Storage walk every {:?}", spec.telemetry.storage_sample_interval);
    println!();

    println!("{}", "Observability:".bold());
    println!("  Log level: {}", spec.observability.log_level);
    match spec.observability.metrics_port {
        Some(port) => println!("  Metrics: :{}/metrics", port),
        None => println!("  Metrics: {}", "(disabled)".dimmed()),
    }
    println!();

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = NodeConfigManifest::load_or_default(config_path)
        .context("Failed to load configuration")?;

    config
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists; pass --force to overwrite",
            output.display()
        );
    }

    NodeConfigManifest::default()
        .to_yaml_file(&output)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{}",
        format!("✓ Configuration generated: {}", output.display()).green()
    );

    Ok(())
}
