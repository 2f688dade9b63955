// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoTLink link-quality monitor.
//!
//! Samples the mesh originator table once per second, classifies every
//! remote node FAST or SLOW with hysteresis, and publishes `node_status`
//! for the bridge and the overlay sender.
//!
//! # Usage
//!
//! ```bash
//! # Run with the deployment config
//! cotlink-lqm --config /etc/cotlink/config.toml
//!
//! # Point at a different originator table (testing)
//! cotlink-lqm --originators /tmp/originators
//!
//! # Generate a starter config
//! cotlink-lqm gen-config --output cotlink.toml
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cotlink::{BatmanOriginators, HostnameMap, LinkMonitor};
use cotlink_node::{install_quit_flag, run_command, Commands, NodeConfig};

/// CoTLink link-quality monitor
#[derive(Parser, Debug)]
#[command(name = "cotlink-lqm")]
#[command(about = "CoTLink link-quality monitor - classifies mesh peers FAST/SLOW")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cotlink/config.toml")]
    config: PathBuf,

    /// Override the originator table location
    #[arg(long)]
    originators: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    cotlink_node::init_tracing(&args.log_level);

    if let Some(command) = args.command {
        return run_command(command, &args.config);
    }

    let config = NodeConfig::from_file(&args.config)
        .with_context(|| format!("load {}", args.config.display()))?;
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("create {}", config.data_dir.display()))?;

    let hosts = HostnameMap::load(&config.lqm.hosts_file)
        .with_context(|| format!("load hostname map {}", config.lqm.hosts_file.display()))?;
    let originators = args
        .originators
        .unwrap_or_else(|| config.lqm.originators_path.clone());

    info!(
        "cotlink-lqm v{} - {} node(s), telemetry {}",
        cotlink::VERSION,
        hosts.len(),
        originators.display()
    );

    let quit = install_quit_flag()?;
    let mut monitor = LinkMonitor::new(
        config.lqm_config(),
        hosts,
        &config.hostname(),
        Box::new(BatmanOriginators::new(originators)),
        config.status_path(),
    );
    monitor.run(quit);

    info!("shutdown complete");
    Ok(())
}
