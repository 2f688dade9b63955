// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Peer discovery over the overlay.
//!
//! Owns this node's overlay identity and inbound destination. Announces the
//! local hostname periodically, tracks every peer that announces back, and
//! publishes the table to `peer_discovery` for the sender to consume.
//!
//! The destination fingerprint persisted for a peer is the exact byte string
//! the overlay library handed to the announce callback. It cannot be derived
//! from the peer's public key; reconstructing it locally would break
//! routing.
//!
//! Peer state is volatile: the table is cleared at startup and entries
//! expire `peer_timeout` after their last announce. Hearing a new
//! hostname triggers one responsive announce after a short random delay, so
//! two nodes discover each other within seconds of radio contact instead of
//! waiting out a full announce interval (the delay spreads responses apart
//! when many nodes hear the same newcomer).

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;

use crate::overlay::{dest_hex, Announce, DestinationHash, OverlayTransport};
use crate::state::{self, PeerEntry, PeerTableDoc, StateError};
use crate::util::{sleep_with_quit, unix_now_secs, Throttle, XorShift64};

/// Discovery tuning.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Cadence of periodic announces.
    pub announce_interval: Duration,
    /// Peers unheard for longer than this are dropped.
    pub peer_timeout: Duration,
    /// Bounds of the uniform random delay before a responsive announce.
    pub respond_delay: (Duration, Duration),
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(300),
            respond_delay: (Duration::from_millis(500), Duration::from_millis(1500)),
        }
    }
}

/// Discovery startup failure.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("peer table: {0}")]
    State(#[from] StateError),
}

/// One tracked peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Fingerprint exactly as announced; replaced wholesale on re-announce.
    pub destination: DestinationHash,
    /// Unix seconds of the latest announce.
    pub last_seen: u64,
}

/// Discovery counters.
#[derive(Debug, Default, Clone)]
pub struct DiscoveryStats {
    pub announces_sent: u64,
    pub responsive_announces: u64,
    pub peers_added: u64,
    pub peers_refreshed: u64,
    pub peers_expired: u64,
    pub announces_ignored: u64,
}

struct PdsInner {
    config: DiscoveryConfig,
    hostname: String,
    transport: Arc<dyn OverlayTransport>,
    peers_path: PathBuf,
    /// Peer map and its file write share this lock.
    peers: Mutex<BTreeMap<String, Peer>>,
    /// Earliest due responsive announce, if one is scheduled.
    respond_at: Mutex<Option<Instant>>,
    rng: Mutex<XorShift64>,
    stats: Mutex<DiscoveryStats>,
    persist_throttle: Mutex<Throttle>,
}

impl PdsInner {
    fn handle_announce(&self, announce: Announce) {
        if announce.destination == self.transport.local_destination() {
            return;
        }

        let hostname = match std::str::from_utf8(&announce.app_data) {
            Ok(s) => s.trim().to_string(),
            Err(_) => {
                log::debug!(
                    "[PDS] discarding announce from {} with non-text app data",
                    dest_hex(&announce.destination)
                );
                self.stats.lock().announces_ignored += 1;
                return;
            }
        };
        if hostname.is_empty() || hostname == self.hostname {
            self.stats.lock().announces_ignored += 1;
            return;
        }

        let mut peers = self.peers.lock();
        match peers.get_mut(&hostname) {
            Some(peer) => {
                if peer.destination != announce.destination {
                    log::info!(
                        "[PDS] {hostname} re-announced with new destination {} (peer restart)",
                        dest_hex(&announce.destination)
                    );
                    peer.destination = announce.destination;
                }
                peer.last_seen = unix_now_secs();
                self.stats.lock().peers_refreshed += 1;
            }
            None => {
                log::info!(
                    "[PDS] discovered {hostname} at {}",
                    dest_hex(&announce.destination)
                );
                peers.insert(
                    hostname,
                    Peer {
                        destination: announce.destination,
                        last_seen: unix_now_secs(),
                    },
                );
                self.stats.lock().peers_added += 1;
                self.schedule_responsive_announce();
            }
        }
        self.persist_locked(&peers);
    }

    /// Arm (or keep) a responsive announce within the configured window.
    fn schedule_responsive_announce(&self) {
        let (lo, hi) = self.config.respond_delay;
        let delay = self
            .rng
            .lock()
            .range_f64(lo.as_secs_f64(), hi.as_secs_f64().max(lo.as_secs_f64()));
        let due = Instant::now() + Duration::from_secs_f64(delay);
        let mut slot = self.respond_at.lock();
        match *slot {
            Some(existing) if existing <= due => {}
            _ => *slot = Some(due),
        }
    }

    /// Write the table under the peer lock; write-temp + rename on disk.
    fn persist_locked(&self, peers: &BTreeMap<String, Peer>) {
        let doc = PeerTableDoc {
            timestamp: unix_now_secs(),
            peers: peers
                .iter()
                .map(|(hostname, peer)| {
                    (
                        hostname.clone(),
                        PeerEntry {
                            destination_hash: dest_hex(&peer.destination),
                            last_seen: peer.last_seen,
                        },
                    )
                })
                .collect(),
        };
        if let Err(e) = state::write_atomic(&self.peers_path, &doc) {
            if self.persist_throttle.lock().allow() {
                log::warn!("[PDS] peer table write failed: {e}");
            }
        }
    }

    fn announce_hostname(&self, responsive: bool) {
        if let Err(e) = self.transport.announce(self.hostname.as_bytes()) {
            log::warn!("[PDS] announce failed: {e}");
            return;
        }
        let mut stats = self.stats.lock();
        stats.announces_sent += 1;
        if responsive {
            stats.responsive_announces += 1;
        }
    }

    /// Drop peers unheard past the timeout; re-persist when anything left.
    fn expire_peers(&self) {
        let timeout = self.config.peer_timeout.as_secs();
        let now = unix_now_secs();
        let mut peers = self.peers.lock();
        let before = peers.len();
        peers.retain(|hostname, peer| {
            let keep = now.saturating_sub(peer.last_seen) <= timeout;
            if !keep {
                log::info!("[PDS] expiring {hostname} (silent for over {timeout}s)");
            }
            keep
        });
        let expired = before - peers.len();
        if expired > 0 {
            self.stats.lock().peers_expired += expired as u64;
            self.persist_locked(&peers);
        }
    }

    /// One scheduler step; runs at a much finer grain than the announce
    /// interval so responsive announces land inside their window.
    fn poll(&self, next_announce: &mut Instant) {
        let now = Instant::now();
        if now >= *next_announce {
            self.announce_hostname(false);
            *next_announce = now + self.config.announce_interval;
        }
        let due = {
            let mut slot = self.respond_at.lock();
            match *slot {
                Some(at) if now >= at => {
                    *slot = None;
                    true
                }
                _ => false,
            }
        };
        if due {
            self.announce_hostname(true);
        }
        self.expire_peers();
    }
}

/// The peer discovery service.
pub struct PeerDiscovery {
    inner: Arc<PdsInner>,
}

impl PeerDiscovery {
    /// Create the service: clears any persisted peer state, writes an empty
    /// table, and registers the announce handler on `transport`.
    pub fn new(
        config: DiscoveryConfig,
        hostname: impl Into<String>,
        transport: Arc<dyn OverlayTransport>,
        peers_path: impl Into<PathBuf>,
    ) -> Result<Self, DiscoveryError> {
        let peers_path = peers_path.into();
        // Fingerprints do not survive peer restarts, so neither does the table.
        state::write_atomic(
            &peers_path,
            &PeerTableDoc {
                timestamp: unix_now_secs(),
                peers: BTreeMap::new(),
            },
        )?;

        let inner = Arc::new(PdsInner {
            config,
            hostname: hostname.into(),
            transport: transport.clone(),
            peers_path,
            peers: Mutex::new(BTreeMap::new()),
            respond_at: Mutex::new(None),
            rng: Mutex::new(XorShift64::from_clock()),
            stats: Mutex::new(DiscoveryStats::default()),
            persist_throttle: Mutex::new(Throttle::new(Duration::from_secs(60))),
        });

        let handler = inner.clone();
        transport.set_announce_handler(Box::new(move |announce| {
            handler.handle_announce(announce);
        }));

        Ok(Self { inner })
    }

    /// Spawn the announce/maintenance thread. The first announce goes out
    /// immediately.
    pub fn start(&self, quit: Arc<AtomicBool>) -> std::io::Result<JoinHandle<()>> {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("pds-announce".into())
            .spawn(move || {
                log::info!(
                    "[PDS] announcing '{}' every {:?} from {}",
                    inner.hostname,
                    inner.config.announce_interval,
                    dest_hex(&inner.transport.local_destination())
                );
                let mut next_announce = Instant::now();
                while !quit.load(Ordering::Relaxed) {
                    inner.poll(&mut next_announce);
                    sleep_with_quit(Duration::from_millis(250), &quit);
                }
                log::info!("[PDS] stopped");
            })?;
        Ok(handle)
    }

    /// Snapshot of the current peer map.
    pub fn peers(&self) -> BTreeMap<String, Peer> {
        self.inner.peers.lock().clone()
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> DiscoveryStats {
        self.inner.stats.lock().clone()
    }

    /// One scheduler step, exposed for tests and for single-threaded hosts.
    pub fn poll(&self, next_announce: &mut Instant) {
        self.inner.poll(next_announce);
    }

    /// Run an expiry pass now.
    pub fn expire_peers(&self) {
        self.inner.expire_peers();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::loopback::LoopbackHub;
    use crate::state::read_opt;
    use tempfile::tempdir;

    fn quick_config() -> DiscoveryConfig {
        DiscoveryConfig {
            announce_interval: Duration::from_secs(60),
            peer_timeout: Duration::from_secs(300),
            respond_delay: (Duration::from_millis(1), Duration::from_millis(1)),
        }
    }

    #[test]
    fn test_startup_clears_persisted_peers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let stale = PeerTableDoc {
            timestamp: 1,
            peers: [(
                "ghost".to_string(),
                PeerEntry {
                    destination_hash: "00".repeat(16),
                    last_seen: 1,
                },
            )]
            .into_iter()
            .collect(),
        };
        state::write_atomic(&path, &stale).unwrap();

        let hub = LoopbackHub::new();
        let transport = Arc::new(hub.endpoint("alpha"));
        let _pds =
            PeerDiscovery::new(quick_config(), "alpha-host", transport, &path).unwrap();

        let doc: PeerTableDoc = read_opt(&path).unwrap();
        assert!(doc.peers.is_empty());
    }

    #[test]
    fn test_announce_upserts_peer_with_exact_fingerprint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let bravo = hub.endpoint("bravo");

        let pds = PeerDiscovery::new(quick_config(), "alpha-host", alpha, &path).unwrap();
        bravo.announce(b"bravo-host").unwrap();

        let peers = pds.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers["bravo-host"].destination, bravo.local_destination());

        // Persisted table carries the same exact fingerprint in hex.
        let doc: PeerTableDoc = read_opt(&path).unwrap();
        assert_eq!(
            doc.peers["bravo-host"].destination(),
            Some(bravo.local_destination())
        );
    }

    #[test]
    fn test_own_announce_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let pds =
            PeerDiscovery::new(quick_config(), "alpha-host", alpha.clone(), &path).unwrap();

        // The loopback hub echoes announces back to the sender.
        alpha.announce(b"alpha-host").unwrap();
        assert!(pds.peers().is_empty());
    }

    #[test]
    fn test_malformed_app_data_discarded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let bravo = hub.endpoint("bravo");
        let pds = PeerDiscovery::new(quick_config(), "alpha-host", alpha, &path).unwrap();

        bravo.announce(b"").unwrap();
        bravo.announce(&[0xFF, 0xFE, 0x80]).unwrap();
        assert!(pds.peers().is_empty());
        assert_eq!(pds.stats().announces_ignored, 2);
    }

    #[test]
    fn test_new_peer_triggers_responsive_announce() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let bravo = hub.endpoint("bravo");

        let heard_by_bravo = Arc::new(Mutex::new(Vec::new()));
        let sink = heard_by_bravo.clone();
        bravo.set_announce_handler(Box::new(move |ann| sink.lock().push(ann.app_data)));

        let pds = PeerDiscovery::new(quick_config(), "alpha-host", alpha, &path).unwrap();
        bravo.announce(b"bravo-host").unwrap();

        // The responsive announce is due ~1ms out; far-future periodic timer.
        std::thread::sleep(Duration::from_millis(30));
        let mut next_announce = Instant::now() + Duration::from_secs(60);
        pds.poll(&mut next_announce);

        assert_eq!(*heard_by_bravo.lock(), vec![b"alpha-host".to_vec()]);
        assert_eq!(pds.stats().responsive_announces, 1);

        // A repeat announce from a known peer must not re-arm it.
        bravo.announce(b"bravo-host").unwrap();
        std::thread::sleep(Duration::from_millis(30));
        pds.poll(&mut next_announce);
        assert_eq!(heard_by_bravo.lock().len(), 1);
    }

    #[test]
    fn test_restart_replaces_fingerprint() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let bravo_old = hub.endpoint("bravo-before");
        let bravo_new = hub.endpoint("bravo-after");
        let pds = PeerDiscovery::new(quick_config(), "alpha-host", alpha, &path).unwrap();

        bravo_old.announce(b"bravo-host").unwrap();
        assert_eq!(
            pds.peers()["bravo-host"].destination,
            bravo_old.local_destination()
        );

        bravo_new.announce(b"bravo-host").unwrap();
        let peers = pds.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(
            peers["bravo-host"].destination,
            bravo_new.local_destination()
        );
        assert_eq!(pds.stats().peers_refreshed, 1);
    }

    #[test]
    fn test_expiry_removes_and_repersists() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let bravo = hub.endpoint("bravo");
        let mut config = quick_config();
        config.peer_timeout = Duration::from_secs(0);
        let pds = PeerDiscovery::new(config, "alpha-host", alpha, &path).unwrap();

        bravo.announce(b"bravo-host").unwrap();
        assert_eq!(pds.peers().len(), 1);

        std::thread::sleep(Duration::from_millis(1100));
        pds.expire_peers();
        assert!(pds.peers().is_empty());
        let doc: PeerTableDoc = read_opt(&path).unwrap();
        assert!(doc.peers.is_empty());
        assert_eq!(pds.stats().peers_expired, 1);
    }

    #[test]
    fn test_periodic_announce_counts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("peer_discovery.json");
        let hub = LoopbackHub::new();
        let alpha = Arc::new(hub.endpoint("alpha"));
        let pds = PeerDiscovery::new(quick_config(), "alpha-host", alpha, &path).unwrap();

        let mut next_announce = Instant::now();
        pds.poll(&mut next_announce);
        assert_eq!(pds.stats().announces_sent, 1);
        // Next one is a full interval out.
        pds.poll(&mut next_announce);
        assert_eq!(pds.stats().announces_sent, 1);
    }
}
