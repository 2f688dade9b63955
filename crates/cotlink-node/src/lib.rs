// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoTLink node services.
//!
//! Three init-supervised processes share one configuration file:
//!
//! - `cotlink-lqm` - link-quality monitor, writes `node_status`
//! - `cotlink-overlay` - peer discovery plus the reliable overlay sender,
//!   sharing one overlay transport handle
//! - `cotlink-bridge` - multicast packet bridge
//!
//! This library holds what the binaries share: the TOML configuration, the
//! tracing setup, the quit flag wired to SIGINT, and the `gen-config` /
//! `validate` maintenance subcommands.

pub mod config;

pub use config::{ConfigError, NodeConfig};

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;
use tracing_subscriber::EnvFilter;

/// Initialize tracing. Core-library `log` records are captured through the
/// default `tracing-log` bridge.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

/// Process-wide quit flag, set by Ctrl-C / SIGTERM via the ctrlc handler.
pub fn install_quit_flag() -> Result<Arc<AtomicBool>> {
    let quit = Arc::new(AtomicBool::new(false));
    let handler_quit = quit.clone();
    ctrlc::set_handler(move || {
        handler_quit.store(true, Ordering::Relaxed);
    })
    .context("install signal handler")?;
    Ok(quit)
}

/// Maintenance subcommands shared by all three binaries.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate a commented example configuration file
    GenConfig {
        /// Output file path
        #[arg(short, long, default_value = "cotlink.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file
    Validate,
}

/// Run a maintenance subcommand against `config_path`.
pub fn run_command(command: Commands, config_path: &Path) -> Result<()> {
    match command {
        Commands::GenConfig { output } => {
            let example = NodeConfig::example();
            let toml_str =
                toml::to_string_pretty(&example).context("serialize example config")?;
            let content = format!(
                "# CoTLink node configuration\n# Generated by gen-config; every field is optional.\n\n{toml_str}"
            );
            std::fs::write(&output, content)
                .with_context(|| format!("write {}", output.display()))?;
            println!("Generated configuration file: {}", output.display());
            Ok(())
        }
        Commands::Validate => match NodeConfig::from_file(config_path) {
            Ok(config) => {
                println!("Configuration valid!");
                println!();
                println!("Hostname:  {}", config.hostname());
                println!("Data dir:  {}", config.data_dir.display());
                println!(
                    "Upstream:  {}",
                    config.bridge.upstream.join(", ")
                );
                println!(
                    "Downstream: {}",
                    config.bridge.downstream.join(", ")
                );
                println!("Overlay:   {}", config.overlay.bind);
                Ok(())
            }
            Err(e) => {
                eprintln!("Configuration invalid: {e}");
                std::process::exit(1);
            }
        },
    }
}
