// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoTLink packet bridge.
//!
//! Listens on the upstream multicast groups, stages accepted traffic into
//! the spool for the overlay daemon, and re-emits overlay-received traffic
//! on the downstream groups.
//!
//! # Usage
//!
//! ```bash
//! cotlink-bridge --config /etc/cotlink/config.toml
//!
//! # Validate a config without starting
//! cotlink-bridge validate --config /etc/cotlink/config.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cotlink::{PacketBridge, RecentFingerprintRing, Spool};
use cotlink_node::{install_quit_flag, run_command, Commands, NodeConfig};

/// CoTLink packet bridge
#[derive(Parser, Debug)]
#[command(name = "cotlink-bridge")]
#[command(about = "CoTLink packet bridge - multicast in and out of the overlay spool")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cotlink/config.toml")]
    config: PathBuf,

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

    let bridge_config = config.bridge_config()?;
    let spool = Arc::new(Spool::open(config.spool_dir()).context("open spool")?);
    let codec = Arc::new(config.codec()?);

    info!(
        "cotlink-bridge v{} - {} upstream group(s), {} downstream group(s)",
        cotlink::VERSION,
        bridge_config.upstream.len(),
        bridge_config.downstream.len()
    );

    let bridge = Arc::new(
        PacketBridge::new(
            bridge_config,
            spool,
            codec,
            RecentFingerprintRing::with_defaults(),
        )
        .context("create bridge")?,
    );

    let quit = install_quit_flag()?;
    let handles = bridge.start(quit).context("start bridge threads")?;
    for handle in handles {
        if handle.join().is_err() {
            tracing::warn!("bridge thread panicked during shutdown");
        }
    }

    let stats = bridge.stats();
    info!(
        "shutdown complete - {} staged, {} forwarded",
        stats.ingress_accepted, stats.egress_forwarded
    );
    Ok(())
}
