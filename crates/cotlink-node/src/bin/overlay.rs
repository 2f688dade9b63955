// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! CoTLink overlay daemon: peer discovery plus the reliable sender.
//!
//! The two components share one overlay transport handle: discovery owns
//! the announce side and the peer table, the sender owns the spool drain,
//! delivery tracking, retries, and pacing.
//!
//! # Usage
//!
//! ```bash
//! cotlink-overlay --config /etc/cotlink/config.toml
//!
//! # Lab run on an explicit bind/peer pair
//! cotlink-overlay --bind 0.0.0.0:48200 --announce-target 10.30.0.255:48200
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cotlink::overlay::udp::UdpOverlay;
use cotlink::overlay::{dest_hex, OverlayTransport};
use cotlink::{OverlaySender, PeerDiscovery, Spool};
use cotlink_node::{install_quit_flag, run_command, Commands, NodeConfig};

/// CoTLink overlay daemon
#[derive(Parser, Debug)]
#[command(name = "cotlink-overlay")]
#[command(about = "CoTLink overlay daemon - peer discovery and reliable spool delivery")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/cotlink/config.toml")]
    config: PathBuf,

    /// Override the overlay bind address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Additional announce targets (can repeat)
    #[arg(long = "announce-target")]
    announce_targets: Vec<SocketAddr>,

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

    let mut overlay_config = config.overlay_config();
    if let Some(bind) = args.bind {
        overlay_config.bind = bind;
    }
    overlay_config
        .announce_targets
        .extend(args.announce_targets);

    let transport = Arc::new(UdpOverlay::new(overlay_config).context("bind overlay transport")?);
    let hostname = config.hostname();
    info!(
        "cotlink-overlay v{} - '{}' at {} (destination {})",
        cotlink::VERSION,
        hostname,
        transport.local_addr().context("overlay local addr")?,
        dest_hex(&transport.local_destination())
    );

    let spool = Arc::new(Spool::open(config.spool_dir()).context("open spool")?);
    let discovery = PeerDiscovery::new(
        config.discovery_config(),
        hostname,
        transport.clone(),
        config.peers_path(),
    )
    .context("start peer discovery")?;
    let mut sender = OverlaySender::new(
        config.sender_config(),
        spool,
        transport.clone(),
        config.status_path(),
        config.peers_path(),
    );

    let quit = install_quit_flag()?;
    let announce_thread = discovery
        .start(quit.clone())
        .context("start announce thread")?;
    sender.run(quit);

    if announce_thread.join().is_err() {
        tracing::warn!("announce thread panicked during shutdown");
    }
    transport.clear_handlers();
    transport.shutdown();
    info!("shutdown complete");
    Ok(())
}
