// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::{Path, PathBuf};

use fleet_core::domain::node_config::{FleetConfigManifest, CONFIG_PATH_ENV};

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the resolved manifest as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate a configuration manifest with every default spelled out
    Generate {
        /// Output path
        #[arg(short, long, default_value = "./fleet-config.yaml")]
        output: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(
    command: ConfigCommand,
    config_override: Option<PathBuf>,
) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate { output, force } => generate(&output, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let manifest = FleetConfigManifest::load_or_default(config_override.as_deref())
        .context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        match &config_override {
            Some(path) => println!("  1. --config flag: {}", path.display()),
            None => println!("  1. --config flag: {}", "(not set)".dimmed()),
        }
        println!(
            "  2. {}: {}",
            CONFIG_PATH_ENV,
            std::env::var(CONFIG_PATH_ENV)
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./fleet-config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", manifest.to_yaml_string()?);
        return Ok(());
    }

    let config = &manifest.spec;
    println!("{}", "Current configuration:".bold());
    println!();

    println!("{}", "Node:".bold());
    println!("  ID: {}", config.node.id);
    println!("  Bind: {}", config.node.bind_address);
    println!(
        "  Ports: datagram {}, stream {}",
        config.node.datagram_port, config.node.stream_port
    );
    println!();

    println!("{}", "Record Store:".bold());
    if config.store.temporary {
        println!("  Path: {}", "(temporary)".dimmed());
    } else {
        println!("  Path: {}", config.store.path.display());
    }
    println!("  Sweep interval: {:?}", config.store.sweep_interval);
    println!("  Max value size: {} bytes", config.store.max_value_bytes);
    let mut ttls: Vec<_> = config.store.partition_ttls.iter().collect();
    ttls.sort_by(|a, b| a.0.cmp(b.0));
    for (partition, ttl) in ttls {
        println!("  TTL {}: {:?}", partition, ttl.clone().into_inner());
    }
    println!();

    println!("{}", "Sync:".bold());
    println!("  Transport preference: {:?}", config.sync.transport_preference);
    println!(
        "  Retry: {} attempts, {:?} .. {:?}",
        config.sync.retry_attempts, config.sync.retry_delay, config.sync.max_retry_delay
    );
    println!("  Interval: {:?}", config.sync.sync_interval);
    println!("  Peers ({} max):", config.sync.max_peers);
    if config.sync.peers.is_empty() {
        println!("    {}", "(none)".dimmed());
    }
    for peer in &config.sync.peers {
        let stream_port = peer.stream_port.unwrap_or_else(|| peer.port.wrapping_add(1));
        println!("    - {}:{} (stream {})", peer.address, peer.port, stream_port);
    }
    println!();

    println!("{}", "Agent Pool:".bold());
    println!("  Max agents: {}", config.fleet.max_agents);
    println!("  Task queue capacity: {}", config.fleet.task_queue_capacity);
    println!();

    if let Some(observability) = &config.observability {
        println!("{}", "Observability:".bold());
        println!("  Log level: {}", observability.log_level);
        match observability.metrics_port {
            Some(port) => println!("  Metrics port: {}", port),
            None => println!("  Metrics port: {}", "(disabled)".dimmed()),
        }
        println!();
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let manifest = FleetConfigManifest::load_or_default(config_path.as_deref())
        .context("Failed to load configuration")?;

    manifest
        .validate()
        .context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: &Path, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!(
            "{} already exists (pass --force to overwrite)",
            output.display()
        );
    }

    let sample = FleetConfigManifest::default().to_yaml_string()?;
    std::fs::write(output, sample)
        .with_context(|| format!("Failed to write config to {:?}", output))?;

    println!(
        "{} {}",
        "✓ Generated configuration:".green(),
        output.display()
    );
    println!("  Edit it, then run: fleet --config {} run", output.display());

    Ok(())
}
