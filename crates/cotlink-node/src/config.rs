// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Node configuration.
//!
//! One TOML file drives all three services. Every field has a deployment
//! default, so an empty file is a valid configuration for a standard
//! BATMAN-adv node layout.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use cotlink::overlay::udp::UdpOverlayConfig;
use cotlink::{BridgeConfig, DictCodec, DiscoveryConfig, LqmConfig, SenderConfig};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's hostname; announced to peers. Defaults to /etc/hostname.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,

    /// Runtime state directory (spool and the two JSON feeds).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub lqm: LqmSection,

    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub codec: CodecSection,

    #[serde(default)]
    pub bridge: BridgeSection,

    #[serde(default)]
    pub sender: SenderSection,

    #[serde(default)]
    pub overlay: OverlaySection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hostname: None,
            data_dir: default_data_dir(),
            lqm: LqmSection::default(),
            discovery: DiscoverySection::default(),
            codec: CodecSection::default(),
            bridge: BridgeSection::default(),
            sender: SenderSection::default(),
            overlay: OverlaySection::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/cotlink")
}

/// Link monitor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LqmSection {
    /// BATMAN-adv originator table location.
    #[serde(default = "default_originators_path")]
    pub originators_path: PathBuf,

    /// Static MAC -> {hostname, ip} map for the deployment.
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Seconds-without-OGM before a sample counts as a failure.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Consecutive failures before FAST -> SLOW.
    #[serde(default = "default_failure_count")]
    pub failure_count: u32,

    /// Consecutive good samples before SLOW -> FAST.
    #[serde(default = "default_recovery_count")]
    pub recovery_count: u32,
}

fn default_originators_path() -> PathBuf {
    PathBuf::from(cotlink::lqm::telemetry::DEFAULT_ORIGINATORS_PATH)
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/cotlink/hosts.json")
}

fn default_failure_threshold() -> f64 {
    3.0
}

fn default_failure_count() -> u32 {
    3
}

fn default_recovery_count() -> u32 {
    10
}

impl Default for LqmSection {
    fn default() -> Self {
        Self {
            originators_path: default_originators_path(),
            hosts_file: default_hosts_file(),
            failure_threshold: default_failure_threshold(),
            failure_count: default_failure_count(),
            recovery_count: default_recovery_count(),
        }
    }
}

/// Discovery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverySection {
    #[serde(default = "default_announce_interval")]
    pub announce_interval_secs: u64,

    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,
}

fn default_announce_interval() -> u64 {
    60
}

fn default_peer_timeout() -> u64 {
    300
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            announce_interval_secs: default_announce_interval(),
            peer_timeout_secs: default_peer_timeout(),
        }
    }
}

/// Codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecSection {
    /// Optional dictionary blob; unset uses the built-in CoT dictionary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dictionary_file: Option<PathBuf>,

    #[serde(default = "default_codec_level")]
    pub level: u32,

    /// Hard cap on compressed payload size (radio packet budget).
    #[serde(default = "default_codec_max_bytes")]
    pub max_bytes: usize,
}

fn default_codec_level() -> u32 {
    cotlink::codec::DEFAULT_LEVEL
}

fn default_codec_max_bytes() -> usize {
    cotlink::codec::DEFAULT_MAX_BYTES
}

impl Default for CodecSection {
    fn default() -> Self {
        Self {
            dictionary_file: None,
            level: default_codec_level(),
            max_bytes: default_codec_max_bytes(),
        }
    }
}

/// Bridge settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSection {
    /// IPv4 address of the bridge interface.
    #[serde(default = "default_interface")]
    pub interface: Ipv4Addr,

    /// Upstream multicast group:port entries (application -> bridge).
    #[serde(default = "default_upstream")]
    pub upstream: Vec<String>,

    /// Downstream multicast group:port entries (bridge -> application).
    /// Ports must differ from upstream.
    #[serde(default = "default_downstream")]
    pub downstream: Vec<String>,
}

fn default_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_upstream() -> Vec<String> {
    vec!["224.10.10.1:17012".into(), "239.2.3.1:6969".into()]
}

fn default_downstream() -> Vec<String> {
    vec!["224.10.10.1:17013".into(), "239.2.3.1:6971".into()]
}

impl Default for BridgeSection {
    fn default() -> Self {
        Self {
            interface: default_interface(),
            upstream: default_upstream(),
            downstream: default_downstream(),
        }
    }
}

/// Sender settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderSection {
    #[serde(default = "default_send_spacing")]
    pub send_spacing_secs: f64,

    #[serde(default = "default_retry_initial")]
    pub retry_initial_delay_secs: f64,

    #[serde(default = "default_retry_factor")]
    pub retry_backoff_factor: f64,

    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_secs: f64,

    #[serde(default = "default_retry_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_jitter")]
    pub retry_jitter: f64,
}

fn default_send_spacing() -> f64 {
    2.0
}

fn default_retry_initial() -> f64 {
    25.0
}

fn default_retry_factor() -> f64 {
    2.0
}

fn default_retry_max_delay() -> f64 {
    120.0
}

fn default_retry_attempts() -> u32 {
    5
}

fn default_retry_jitter() -> f64 {
    0.1
}

impl Default for SenderSection {
    fn default() -> Self {
        Self {
            send_spacing_secs: default_send_spacing(),
            retry_initial_delay_secs: default_retry_initial(),
            retry_backoff_factor: default_retry_factor(),
            retry_max_delay_secs: default_retry_max_delay(),
            retry_max_attempts: default_retry_attempts(),
            retry_jitter: default_retry_jitter(),
        }
    }
}

/// Overlay (development UDP transport) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlaySection {
    #[serde(default = "default_overlay_bind")]
    pub bind: SocketAddr,

    /// Unicast peers or a broadcast address announces are sent to.
    #[serde(default)]
    pub announce_targets: Vec<SocketAddr>,

    #[serde(default = "default_packet_timeout")]
    pub packet_timeout_secs: u64,
}

fn default_overlay_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 48200))
}

fn default_packet_timeout() -> u64 {
    300
}

impl Default for OverlaySection {
    fn default() -> Self {
        Self {
            bind: default_overlay_bind(),
            announce_targets: Vec::new(),
            packet_timeout_secs: default_packet_timeout(),
        }
    }
}

impl NodeConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.bridge_config()?
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.sender.retry_backoff_factor < 1.0 {
            return Err(ConfigError::Invalid(
                "sender.retry_backoff_factor must be >= 1.0".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.sender.retry_jitter) {
            return Err(ConfigError::Invalid(
                "sender.retry_jitter must be in [0, 1)".into(),
            ));
        }
        Ok(())
    }

    /// Announced hostname: configured value, else /etc/hostname, else a
    /// fixed fallback.
    pub fn hostname(&self) -> String {
        if let Some(hostname) = &self.hostname {
            return hostname.clone();
        }
        std::fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "cotlink-node".to_string())
    }

    /// Spool root under the data directory.
    pub fn spool_dir(&self) -> PathBuf {
        self.data_dir.join("spool")
    }

    /// Location of the `node_status` feed.
    pub fn status_path(&self) -> PathBuf {
        self.data_dir.join(cotlink::state::NODE_STATUS_FILE)
    }

    /// Location of the `peer_discovery` feed.
    pub fn peers_path(&self) -> PathBuf {
        self.data_dir.join(cotlink::state::PEER_DISCOVERY_FILE)
    }

    /// Monitor config for the core crate.
    pub fn lqm_config(&self) -> LqmConfig {
        LqmConfig {
            interval: Duration::from_secs(1),
            failure_threshold: self.lqm.failure_threshold,
            failure_count: self.lqm.failure_count,
            recovery_count: self.lqm.recovery_count,
        }
    }

    /// Discovery config for the core crate.
    pub fn discovery_config(&self) -> DiscoveryConfig {
        DiscoveryConfig {
            announce_interval: Duration::from_secs(self.discovery.announce_interval_secs),
            peer_timeout: Duration::from_secs(self.discovery.peer_timeout_secs),
            ..DiscoveryConfig::default()
        }
    }

    /// Sender config for the core crate.
    pub fn sender_config(&self) -> SenderConfig {
        SenderConfig {
            send_spacing: Duration::from_secs_f64(self.sender.send_spacing_secs),
            retry_initial_delay: Duration::from_secs_f64(self.sender.retry_initial_delay_secs),
            retry_backoff_factor: self.sender.retry_backoff_factor,
            retry_max_delay: Duration::from_secs_f64(self.sender.retry_max_delay_secs),
            retry_max_attempts: self.sender.retry_max_attempts,
            retry_jitter: self.sender.retry_jitter,
            ..SenderConfig::default()
        }
    }

    /// Bridge config for the core crate.
    pub fn bridge_config(&self) -> Result<BridgeConfig, ConfigError> {
        Ok(BridgeConfig {
            interface: self.bridge.interface,
            upstream: parse_group_list(&self.bridge.upstream)?,
            downstream: parse_group_list(&self.bridge.downstream)?,
            status_path: self.status_path(),
            peers_path: self.peers_path(),
            ..BridgeConfig::default()
        })
    }

    /// Build the codec, loading the dictionary file if one is configured.
    pub fn codec(&self) -> Result<DictCodec, ConfigError> {
        match &self.codec.dictionary_file {
            Some(path) => {
                DictCodec::from_dictionary_file(path, self.codec.level, self.codec.max_bytes)
                    .map_err(|e| ConfigError::Invalid(e.to_string()))
            }
            None => Ok(DictCodec::new(
                cotlink::codec::DEFAULT_DICTIONARY.to_vec(),
                self.codec.level,
                self.codec.max_bytes,
            )),
        }
    }

    /// Overlay transport config.
    pub fn overlay_config(&self) -> UdpOverlayConfig {
        UdpOverlayConfig {
            bind: self.overlay.bind,
            announce_targets: self.overlay.announce_targets.clone(),
            packet_timeout: Duration::from_secs(self.overlay.packet_timeout_secs),
        }
    }

    /// Example configuration for `gen-config`.
    pub fn example() -> Self {
        Self {
            hostname: Some("rover-1".into()),
            overlay: OverlaySection {
                announce_targets: vec![SocketAddr::from(([10, 30, 0, 255], 48200))],
                ..OverlaySection::default()
            },
            ..Self::default()
        }
    }
}

fn parse_group_list(entries: &[String]) -> Result<Vec<SocketAddrV4>, ConfigError> {
    entries
        .iter()
        .map(|entry| {
            entry.parse::<SocketAddrV4>().map_err(|_| {
                ConfigError::Invalid(format!("'{entry}' is not an IPv4 group:port"))
            })
        })
        .collect()
}
