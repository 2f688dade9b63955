// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Link-quality monitor.
//!
//! Samples mesh originator telemetry once per second and classifies every
//! remote node FAST or SLOW with hysteresis, so a single dropped originator
//! message does not flap traffic onto the overlay radio. The full
//! classification map is written to `node_status` on every tick; the bridge
//! and the sender gate on it.
//!
//! Hysteresis: FAST -> SLOW only after `failure_count` consecutive bad
//! samples, SLOW -> FAST only after `recovery_count` consecutive good ones.
//! Any oscillation therefore costs at least `failure_count + recovery_count`
//! contradictory samples.

pub mod telemetry;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{self, LinkMode, NodeEntry, NodeStatusDoc};
use crate::util::{sleep_with_quit, unix_now_secs, Throttle};
use telemetry::TelemetrySource;

/// Sentinel age for nodes never heard from; large but JSON-representable.
const UNHEARD_SECONDS: f64 = 1e6;

/// Monitor tuning.
#[derive(Debug, Clone)]
pub struct LqmConfig {
    /// Sampling cadence.
    pub interval: Duration,
    /// A sample counts as a failure when the node was last heard more than
    /// this many seconds ago.
    pub failure_threshold: f64,
    /// Consecutive failures before FAST -> SLOW.
    pub failure_count: u32,
    /// Consecutive good samples before SLOW -> FAST.
    pub recovery_count: u32,
}

impl Default for LqmConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            failure_threshold: 3.0,
            failure_count: 3,
            recovery_count: 10,
        }
    }
}

/// Monitor failure.
#[derive(Debug, Error)]
pub enum LqmError {
    #[error("hostname map: {0}")]
    Io(#[from] std::io::Error),

    #[error("hostname map parse: {0}")]
    Json(#[from] serde_json::Error),
}

/// One row of the static hostname map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostEntry {
    pub hostname: String,
    pub ip: String,
}

/// Static MAC -> host mapping for the mesh deployment. Shipped as a JSON
/// object keyed by MAC; the monitor only ever reports nodes listed here.
#[derive(Debug, Clone, Default)]
pub struct HostnameMap {
    entries: BTreeMap<String, HostEntry>,
}

impl HostnameMap {
    /// Load the map from a JSON file.
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self, LqmError> {
        let bytes = std::fs::read(path)?;
        let entries: BTreeMap<String, HostEntry> = serde_json::from_slice(&bytes)?;
        Ok(Self::from_entries(entries))
    }

    /// Build a map from in-memory entries; MACs are lowercased.
    pub fn from_entries(entries: impl IntoIterator<Item = (String, HostEntry)>) -> Self {
        Self {
            entries: entries
                .into_iter()
                .map(|(mac, host)| (mac.to_lowercase(), host))
                .collect(),
        }
    }

    /// Drop the local node's own row.
    pub fn without_host(mut self, hostname: &str) -> Self {
        self.entries.retain(|_, host| host.hostname != hostname);
        self
    }

    /// Number of nodes in the map.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the map has no nodes.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The link-quality monitor. One per node, running at 1 Hz.
pub struct LinkMonitor {
    config: LqmConfig,
    source: Box<dyn TelemetrySource>,
    status_path: PathBuf,
    nodes: BTreeMap<String, NodeEntry>,
    source_throttle: Throttle,
    write_throttle: Throttle,
}

impl LinkMonitor {
    /// Build a monitor for the remote nodes of `hosts` (self excluded).
    ///
    /// If a readable `node_status` exists at `status_path`, classification
    /// state survives the restart; otherwise every node starts FAST.
    pub fn new(
        config: LqmConfig,
        hosts: HostnameMap,
        local_hostname: &str,
        source: Box<dyn TelemetrySource>,
        status_path: impl Into<PathBuf>,
    ) -> Self {
        let status_path = status_path.into();
        let mut nodes: BTreeMap<String, NodeEntry> = hosts
            .without_host(local_hostname)
            .entries
            .into_iter()
            .map(|(mac, host)| {
                (
                    mac,
                    NodeEntry {
                        hostname: host.hostname,
                        ip: host.ip,
                        last_seen: UNHEARD_SECONDS,
                        mode: LinkMode::Fast,
                        failure_count: 0,
                        good_count: 0,
                        throughput: None,
                        nexthop: None,
                    },
                )
            })
            .collect();

        if let Some(previous) = state::read_opt::<NodeStatusDoc>(&status_path) {
            for (mac, prev) in previous.nodes {
                if let Some(entry) = nodes.get_mut(&mac) {
                    entry.mode = prev.mode;
                    entry.failure_count = prev.failure_count;
                    entry.good_count = prev.good_count;
                    entry.last_seen = prev.last_seen;
                }
            }
            log::info!(
                "[LQM] restored classification state from {}",
                status_path.display()
            );
        }

        Self {
            config,
            source,
            status_path,
            nodes,
            source_throttle: Throttle::new(Duration::from_secs(60)),
            write_throttle: Throttle::new(Duration::from_secs(60)),
        }
    }

    /// Classify one sample. Returns the new mode on a transition.
    fn apply_sample(entry: &mut NodeEntry, seconds_since: f64, config: &LqmConfig) -> Option<LinkMode> {
        if seconds_since > config.failure_threshold {
            entry.failure_count += 1;
            entry.good_count = 0;
        } else {
            entry.good_count += 1;
            entry.failure_count = 0;
        }

        match entry.mode {
            LinkMode::Fast if entry.failure_count >= config.failure_count => {
                entry.mode = LinkMode::Slow;
                Some(LinkMode::Slow)
            }
            LinkMode::Slow if entry.good_count >= config.recovery_count => {
                entry.mode = LinkMode::Fast;
                Some(LinkMode::Fast)
            }
            _ => None,
        }
    }

    /// One monitor cycle: sample, classify, publish. Never fails; transient
    /// errors are logged (rate-limited) and retried next tick.
    pub fn tick(&mut self) {
        let samples = match self.source.sample() {
            Ok(samples) => Some(samples),
            Err(e) => {
                if self.source_throttle.allow() {
                    log::warn!("[LQM] {e}; treating all nodes as unheard");
                }
                None
            }
        };

        let interval_secs = self.config.interval.as_secs_f64();
        for (mac, entry) in &mut self.nodes {
            let seconds_since = match samples.as_deref() {
                // Source gone entirely: every node counts as unheard now,
                // not merely one interval older.
                None => UNHEARD_SECONDS,
                Some(samples) => match samples.iter().find(|sample| &sample.mac == mac) {
                    Some(sample) => {
                        entry.throughput = sample.throughput;
                        entry.nexthop = sample.nexthop.clone();
                        sample.last_seen
                    }
                    // Absent from an otherwise healthy table: keeps aging.
                    None => (entry.last_seen + interval_secs).min(UNHEARD_SECONDS),
                },
            };
            entry.last_seen = seconds_since;

            if let Some(mode) = Self::apply_sample(entry, seconds_since, &self.config) {
                log::info!(
                    "[LQM] {} ({mac}) -> {mode:?} after {} contradictory sample(s)",
                    entry.hostname,
                    match mode {
                        LinkMode::Slow => entry.failure_count,
                        LinkMode::Fast => entry.good_count,
                    }
                );
            }
        }

        let doc = NodeStatusDoc {
            timestamp: unix_now_secs(),
            nodes: self.nodes.clone(),
        };
        if let Err(e) = state::write_atomic(&self.status_path, &doc) {
            if self.write_throttle.allow() {
                log::warn!("[LQM] node_status write failed: {e}");
            }
        }
    }

    /// Run until `quit` is set.
    pub fn run(&mut self, quit: Arc<AtomicBool>) {
        log::info!(
            "[LQM] monitoring {} remote node(s) -> {}",
            self.nodes.len(),
            self.status_path.display()
        );
        while !quit.load(Ordering::Relaxed) {
            self.tick();
            sleep_with_quit(self.config.interval, &quit);
        }
        log::info!("[LQM] stopped");
    }

    /// Current classification map (for tests and diagnostics).
    pub fn nodes(&self) -> &BTreeMap<String, NodeEntry> {
        &self.nodes
    }
}
