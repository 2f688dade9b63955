// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! The two JSON control feeds: `node_status` and `peer_discovery`.
//!
//! Each file has exactly one writer (the link monitor and the discovery
//! service respectively) and any number of readers. Writers replace the file
//! atomically (temp + rename); readers keep the last successfully parsed
//! document and fall back to it when a read races a replace or the file is
//! briefly malformed. A parse failure never overwrites anything.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::overlay::DestinationHash;
use crate::util::Throttle;

/// Default file name for the link monitor's output.
pub const NODE_STATUS_FILE: &str = "node_status.json";

/// Default file name for the discovery service's output.
pub const PEER_DISCOVERY_FILE: &str = "peer_discovery.json";

/// State-file failure.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("state file encode: {0}")]
    Json(#[from] serde_json::Error),
}

/// Link-quality classification of one remote mesh node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    /// Mesh path usable; the overlay is idle for this node.
    #[serde(rename = "FAST")]
    Fast,
    /// Mesh path degraded; traffic falls back to the overlay.
    #[serde(rename = "SLOW")]
    Slow,
}

/// One remote node in `node_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeEntry {
    pub hostname: String,
    pub ip: String,
    /// Seconds since the last originator message was heard.
    pub last_seen: f64,
    pub mode: LinkMode,
    pub failure_count: u32,
    pub good_count: u32,
    /// Mesh-reported throughput, carried through opaquely.
    pub throughput: Option<f64>,
    /// Mesh-reported next hop MAC, carried through opaquely.
    pub nexthop: Option<String>,
}

/// The `node_status` document, keyed by node MAC. Never contains self.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatusDoc {
    pub timestamp: u64,
    pub nodes: BTreeMap<String, NodeEntry>,
}

impl NodeStatusDoc {
    /// Hostnames currently classified SLOW, sorted.
    pub fn slow_hostnames(&self) -> Vec<String> {
        self.nodes
            .values()
            .filter(|n| n.mode == LinkMode::Slow)
            .map(|n| n.hostname.clone())
            .collect()
    }

    /// True if any remote node is SLOW.
    pub fn any_slow(&self) -> bool {
        self.nodes.values().any(|n| n.mode == LinkMode::Slow)
    }
}

/// One discovered peer in `peer_discovery`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerEntry {
    /// Hex encoding of the destination fingerprint exactly as the overlay
    /// library delivered it in the announce. Never derived locally.
    pub destination_hash: String,
    /// Unix seconds of the most recent announce.
    pub last_seen: u64,
}

impl PeerEntry {
    /// Decode the fingerprint back to wire form.
    pub fn destination(&self) -> Option<DestinationHash> {
        let bytes = hex::decode(&self.destination_hash).ok()?;
        bytes.try_into().ok()
    }
}

/// The `peer_discovery` document, keyed by hostname. Never contains self.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerTableDoc {
    pub timestamp: u64,
    pub peers: BTreeMap<String, PeerEntry>,
}

impl PeerTableDoc {
    /// Look up a peer's current destination fingerprint.
    pub fn destination_of(&self, hostname: &str) -> Option<DestinationHash> {
        self.peers.get(hostname).and_then(PeerEntry::destination)
    }
}

/// Serialize `doc` and replace `path` atomically.
pub fn write_atomic<T: Serialize>(path: &Path, doc: &T) -> Result<(), StateError> {
    let bytes = serde_json::to_vec_pretty(doc)?;
    let tmp = tmp_path(path);
    fs::write(&tmp, &bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Parse a state file once, without caching. Absent or malformed yields None.
pub fn read_opt<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Reader that tolerates stale or torn state files by holding on to the most
/// recent successfully parsed document.
#[derive(Debug)]
pub struct CachedReader<T> {
    path: PathBuf,
    cached: Option<T>,
    warn_throttle: Throttle,
}

impl<T: DeserializeOwned> CachedReader<T> {
    /// Create a reader for `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            cached: None,
            warn_throttle: Throttle::new(Duration::from_secs(60)),
        }
    }

    /// Re-read the file, falling back to the cached document on any failure.
    /// Returns None only before the first successful parse.
    pub fn read(&mut self) -> Option<&T> {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(doc) => self.cached = Some(doc),
                Err(e) => {
                    if self.warn_throttle.allow() {
                        log::warn!(
                            "[STATE] {} unparsable, keeping previous ({})",
                            self.path.display(),
                            e
                        );
                    }
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                if self.warn_throttle.allow() {
                    log::warn!("[STATE] {} unreadable ({})", self.path.display(), e);
                }
            }
        }
        self.cached.as_ref()
    }

    /// Path being watched.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
