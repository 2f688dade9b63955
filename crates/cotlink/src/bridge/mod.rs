// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Packet bridge: local multicast in and out of the spool.
//!
//! Ingress binds one receive socket per upstream multicast group/port on the
//! bridge interface and stages accepted datagrams into `pending/`:
//! local-source check, dedup, fallback gate (at least one SLOW and
//! discovered peer), compress, atomic spool write - in that order. Egress
//! drains `incoming/` at up to 10 Hz, decompresses, dedups, and re-emits on
//! the downstream groups with multicast loopback disabled.
//!
//! Upstream and downstream MUST use distinct ports; sharing a port would
//! feed the bridge its own output. Config validation enforces this.
//!
//! When every remote node is FAST the overlay has no work: the bridge purges
//! all three spool stages and stages nothing new until a node goes SLOW
//! again.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::codec::DictCodec;
use crate::dedup::{fingerprint, Observation, RecentFingerprintRing};
use crate::spool::{Spool, Stage};
use crate::state::{CachedReader, NodeStatusDoc, PeerTableDoc};
use crate::util::{sleep_with_quit, Throttle};

/// Largest datagram the ingress sockets accept.
const MAX_DATAGRAM: usize = 65_535;

/// Bridge failure.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("bridge config: {0}")]
    Config(String),

    #[error("bridge I/O: {0}")]
    Io(#[from] io::Error),
}

/// Bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// IPv4 address of the local bridge interface to join groups on.
    pub interface: Ipv4Addr,
    /// Groups/ports the local application transmits on.
    pub upstream: Vec<SocketAddrV4>,
    /// Groups/ports the bridge re-emits received traffic on.
    pub downstream: Vec<SocketAddrV4>,
    /// Path of the link monitor's `node_status` file.
    pub status_path: PathBuf,
    /// Path of the discovery service's `peer_discovery` file.
    pub peers_path: PathBuf,
    /// Egress poll cadence for `incoming/`.
    pub incoming_poll: Duration,
    /// Ingress socket read timeout (shutdown latency bound).
    pub read_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            interface: Ipv4Addr::UNSPECIFIED,
            upstream: vec![
                SocketAddrV4::new(Ipv4Addr::new(224, 10, 10, 1), 17012),
                SocketAddrV4::new(Ipv4Addr::new(239, 2, 3, 1), 6969),
            ],
            downstream: vec![
                SocketAddrV4::new(Ipv4Addr::new(224, 10, 10, 1), 17013),
                SocketAddrV4::new(Ipv4Addr::new(239, 2, 3, 1), 6971),
            ],
            status_path: PathBuf::from("node_status.json"),
            peers_path: PathBuf::from("peer_discovery.json"),
            incoming_poll: Duration::from_millis(100),
            read_timeout: Duration::from_millis(100),
        }
    }
}

impl BridgeConfig {
    /// Reject configurations that would loop traffic back into the bridge.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.upstream.is_empty() {
            return Err(BridgeError::Config("no upstream groups configured".into()));
        }
        if self.downstream.is_empty() {
            return Err(BridgeError::Config("no downstream groups configured".into()));
        }
        for addr in self.upstream.iter().chain(&self.downstream) {
            if !addr.ip().is_multicast() {
                return Err(BridgeError::Config(format!("{addr} is not multicast")));
            }
        }
        let upstream_ports: HashSet<u16> = self.upstream.iter().map(|a| a.port()).collect();
        for addr in &self.downstream {
            if upstream_ports.contains(&addr.port()) {
                return Err(BridgeError::Config(format!(
                    "downstream port {} is also an upstream port; distinct ports are required",
                    addr.port()
                )));
            }
        }
        Ok(())
    }
}

/// Bridge counters.
#[derive(Debug, Default, Clone)]
pub struct BridgeStats {
    pub ingress_accepted: u64,
    pub ingress_dropped_remote: u64,
    pub ingress_dropped_duplicate: u64,
    pub ingress_dropped_quiescent: u64,
    pub ingress_dropped_codec: u64,
    pub ingress_dropped_spool: u64,
    pub egress_forwarded: u64,
    pub egress_dropped_duplicate: u64,
    pub egress_dropped_codec: u64,
    pub purged_files: u64,
}

/// What happened to one ingress datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngressOutcome {
    /// Compressed and staged into `pending/`.
    Staged,
    /// Source address is not locally attached.
    DroppedRemote,
    /// Payload seen within the dedup window.
    DroppedDuplicate,
    /// No SLOW, discovered peer; the overlay has no work.
    DroppedQuiescent,
    /// Compression failed or exceeded the size cap.
    DroppedCodec,
    /// Spool write failed.
    DroppedSpool,
}

/// Reader pair answering the two gating questions of the bridge.
pub struct FallbackGate {
    status: CachedReader<NodeStatusDoc>,
    peers: CachedReader<PeerTableDoc>,
}

impl FallbackGate {
    /// Create a gate over the two state files.
    pub fn new(status_path: impl Into<PathBuf>, peers_path: impl Into<PathBuf>) -> Self {
        Self {
            status: CachedReader::new(status_path),
            peers: CachedReader::new(peers_path),
        }
    }

    /// True when at least one node is SLOW and present in the peer table.
    pub fn fallback_active(&mut self) -> bool {
        let discovered: HashSet<String> = self
            .peers
            .read()
            .map(|doc| doc.peers.keys().cloned().collect())
            .unwrap_or_default();
        self.status
            .read()
            .map(|doc| {
                doc.nodes
                    .values()
                    .any(|n| n.mode == crate::state::LinkMode::Slow
                        && discovered.contains(&n.hostname))
            })
            .unwrap_or(false)
    }

    /// True when the status file is readable and reports no SLOW node.
    /// Unknown state is NOT quiescence; purging must be deliberate.
    pub fn all_fast(&mut self) -> bool {
        self.status.read().map(|doc| !doc.any_slow()).unwrap_or(false)
    }
}

/// The packet bridge.
pub struct PacketBridge {
    config: BridgeConfig,
    spool: Arc<Spool>,
    codec: Arc<DictCodec>,
    ring: Mutex<RecentFingerprintRing>,
    local_addrs: HashSet<IpAddr>,
    stats: Mutex<BridgeStats>,
    codec_throttle: Mutex<Throttle>,
    io_throttle: Mutex<Throttle>,
}

impl PacketBridge {
    /// Build the bridge. Local addresses are enumerated once and cached; the
    /// source classifier compares against this set.
    pub fn new(
        config: BridgeConfig,
        spool: Arc<Spool>,
        codec: Arc<DictCodec>,
        ring: RecentFingerprintRing,
    ) -> Result<Self, BridgeError> {
        config.validate()?;

        let mut local_addrs: HashSet<IpAddr> = HashSet::new();
        local_addrs.insert(IpAddr::V4(Ipv4Addr::LOCALHOST));
        match local_ip_address::list_afinet_netifas() {
            Ok(interfaces) => {
                for (name, ip) in interfaces {
                    log::debug!("[PB] local interface {name}: {ip}");
                    local_addrs.insert(ip);
                }
            }
            Err(e) => {
                log::warn!("[PB] interface enumeration failed ({e}); only loopback counts as local");
            }
        }

        Ok(Self {
            config,
            spool,
            codec,
            ring: Mutex::new(ring),
            local_addrs,
            stats: Mutex::new(BridgeStats::default()),
            codec_throttle: Mutex::new(Throttle::new(Duration::from_secs(60))),
            io_throttle: Mutex::new(Throttle::new(Duration::from_secs(60))),
        })
    }

    /// Spawn one ingress thread per upstream socket and the egress thread.
    pub fn start(
        self: &Arc<Self>,
        quit: Arc<AtomicBool>,
    ) -> Result<Vec<JoinHandle<()>>, BridgeError> {
        let mut handles = Vec::new();

        for upstream in self.config.upstream.clone() {
            let socket = bind_multicast_listener(
                *upstream.ip(),
                upstream.port(),
                self.config.interface,
                self.config.read_timeout,
            )?;
            log::info!("[PB] listening on {upstream} via {}", self.config.interface);
            let bridge = self.clone();
            let thread_quit = quit.clone();
            handles.push(
                std::thread::Builder::new()
                    .name(format!("pb-ingress-{}", upstream.port()))
                    .spawn(move || bridge.ingress_loop(&socket, &thread_quit))?,
            );
        }

        let tx_socket = bind_downstream_sender(self.config.interface)?;
        let bridge = self.clone();
        let thread_quit = quit;
        handles.push(
            std::thread::Builder::new()
                .name("pb-egress".into())
                .spawn(move || bridge.egress_loop(&tx_socket, &thread_quit))?,
        );

        Ok(handles)
    }

    fn ingress_loop(&self, socket: &UdpSocket, quit: &AtomicBool) {
        let mut gate = FallbackGate::new(&self.config.status_path, &self.config.peers_path);
        let mut buf = [0u8; MAX_DATAGRAM];
        while !quit.load(Ordering::Relaxed) {
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    self.ingress_packet(&buf[..len], src.ip(), &mut gate);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    if self.io_throttle.lock().allow() {
                        log::warn!("[PB] ingress receive error: {e}");
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
        }
    }

    /// Classify and stage one upstream datagram.
    pub fn ingress_packet(
        &self,
        payload: &[u8],
        src: IpAddr,
        gate: &mut FallbackGate,
    ) -> IngressOutcome {
        if !self.local_addrs.contains(&src) {
            self.stats.lock().ingress_dropped_remote += 1;
            return IngressOutcome::DroppedRemote;
        }

        let fp = fingerprint(payload);
        if self.ring.lock().observe(fp) == Observation::WasSeen {
            self.stats.lock().ingress_dropped_duplicate += 1;
            return IngressOutcome::DroppedDuplicate;
        }

        if !gate.fallback_active() {
            self.stats.lock().ingress_dropped_quiescent += 1;
            return IngressOutcome::DroppedQuiescent;
        }

        let compressed = match self.codec.compress(payload) {
            Ok(bytes) => bytes,
            // SizeExceeded is expected for oversized events; either way the
            // payload is dropped, counted, and occasionally logged.
            Err(e) => {
                if self.codec_throttle.lock().allow() {
                    log::warn!("[PB] dropping payload: {e}");
                }
                self.stats.lock().ingress_dropped_codec += 1;
                return IngressOutcome::DroppedCodec;
            }
        };

        match self.spool.write(Stage::Pending, &compressed) {
            Ok(path) => {
                log::debug!(
                    "[PB] staged {} ({} -> {} bytes)",
                    path.display(),
                    payload.len(),
                    compressed.len()
                );
                self.stats.lock().ingress_accepted += 1;
                IngressOutcome::Staged
            }
            Err(e) => {
                if self.io_throttle.lock().allow() {
                    log::warn!("[PB] pending write failed: {e}");
                }
                self.stats.lock().ingress_dropped_spool += 1;
                IngressOutcome::DroppedSpool
            }
        }
    }

    fn egress_loop(&self, tx_socket: &UdpSocket, quit: &AtomicBool) {
        let mut gate = FallbackGate::new(&self.config.status_path, &self.config.peers_path);
        if let Err(e) = self.spool.recover(Stage::Incoming) {
            log::warn!("[PB] incoming recovery failed: {e}");
        }
        let downstream = self.config.downstream.clone();
        while !quit.load(Ordering::Relaxed) {
            self.drain_incoming(&mut gate, &mut |payload| {
                for addr in &downstream {
                    if let Err(e) = tx_socket.send_to(payload, SocketAddr::V4(*addr)) {
                        if self.io_throttle.lock().allow() {
                            log::warn!("[PB] downstream send to {addr} failed: {e}");
                        }
                    }
                }
            });
            sleep_with_quit(self.config.incoming_poll, quit);
        }
    }

    /// One egress pass: quiescence purge, then oldest-first drain of
    /// `incoming/` through `emit`.
    pub fn drain_incoming<F: FnMut(&[u8])>(&self, gate: &mut FallbackGate, emit: &mut F) {
        if gate.all_fast() {
            match self.spool.purge_all() {
                Ok(0) => {}
                Ok(purged) => {
                    self.stats.lock().purged_files += purged as u64;
                    log::info!("[PB] all nodes FAST; purged {purged} spooled file(s)");
                }
                Err(e) => {
                    if self.io_throttle.lock().allow() {
                        log::warn!("[PB] quiescence purge failed: {e}");
                    }
                }
            }
            return;
        }

        let files = match self.spool.list(Stage::Incoming) {
            Ok(files) => files,
            Err(e) => {
                if self.io_throttle.lock().allow() {
                    log::warn!("[PB] incoming list failed: {e}");
                }
                return;
            }
        };

        for path in files {
            // Claim by rename; unlink only after processing so a crash in
            // between resurfaces the file (dedup absorbs the replay).
            let claimed = match self.spool.claim(&path) {
                Ok(claimed) => claimed,
                Err(e) => {
                    if self.io_throttle.lock().allow() {
                        log::warn!("[PB] claim {} failed: {e}", path.display());
                    }
                    continue;
                }
            };
            let bytes = match std::fs::read(&claimed) {
                Ok(bytes) => bytes,
                Err(e) => {
                    if self.io_throttle.lock().allow() {
                        log::warn!("[PB] read {} failed: {e}", claimed.display());
                    }
                    let _ = self.spool.remove(&claimed);
                    continue;
                }
            };

            match self.codec.decompress(&bytes) {
                Ok(payload) => {
                    if self.ring.lock().observe(fingerprint(&payload)) == Observation::WasSeen {
                        self.stats.lock().egress_dropped_duplicate += 1;
                    } else {
                        emit(&payload);
                        self.stats.lock().egress_forwarded += 1;
                    }
                }
                Err(e) => {
                    if self.codec_throttle.lock().allow() {
                        log::warn!("[PB] discarding undecodable {}: {e}", claimed.display());
                    }
                    self.stats.lock().egress_dropped_codec += 1;
                }
            }
            let _ = self.spool.remove(&claimed);
        }
    }

    /// Snapshot the counters.
    pub fn stats(&self) -> BridgeStats {
        self.stats.lock().clone()
    }
}

/// Receive socket joined to one multicast group on `iface`.
fn bind_multicast_listener(
    group: Ipv4Addr,
    port: u16,
    iface: Ipv4Addr,
    read_timeout: Duration,
) -> io::Result<UdpSocket> {
    let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    raw.set_reuse_address(true)?;
    raw.bind(&SocketAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).into())?;
    let socket: UdpSocket = raw.into();
    socket.join_multicast_v4(&group, &iface)?;
    socket.set_read_timeout(Some(read_timeout))?;
    Ok(socket)
}

/// Transmit socket for the downstream groups. Loopback is disabled so the
/// bridge never hears its own output.
fn bind_downstream_sender(iface: Ipv4Addr) -> io::Result<UdpSocket> {
    let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    raw.bind(&SocketAddr::from(SocketAddrV4::new(iface, 0)).into())?;
    raw.set_multicast_if_v4(&iface)?;
    raw.set_multicast_loop_v4(false)?;
    raw.set_multicast_ttl_v4(1)?;
    Ok(raw.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{self, LinkMode, NodeEntry, PeerEntry};
    use std::collections::BTreeMap;
    use tempfile::{tempdir, TempDir};

    struct Rig {
        dir: TempDir,
        spool: Arc<Spool>,
        codec: Arc<DictCodec>,
        bridge: PacketBridge,
    }

    fn rig() -> Rig {
        rig_with_codec(DictCodec::with_defaults())
    }

    fn rig_with_codec(codec: DictCodec) -> Rig {
        let dir = tempdir().unwrap();
        let spool = Arc::new(Spool::open(dir.path().join("spool")).unwrap());
        let codec = Arc::new(codec);
        let config = BridgeConfig {
            status_path: dir.path().join("node_status.json"),
            peers_path: dir.path().join("peer_discovery.json"),
            ..BridgeConfig::default()
        };
        let bridge = PacketBridge::new(
            config,
            spool.clone(),
            codec.clone(),
            RecentFingerprintRing::with_defaults(),
        )
        .unwrap();
        Rig {
            dir,
            spool,
            codec,
            bridge,
        }
    }

    fn gate(rig: &Rig) -> FallbackGate {
        FallbackGate::new(
            rig.dir.path().join("node_status.json"),
            rig.dir.path().join("peer_discovery.json"),
        )
    }

    fn publish_state(rig: &Rig, mode: LinkMode, discovered: bool) {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            "aa:bb:cc:dd:ee:02".to_string(),
            NodeEntry {
                hostname: "rover-2".to_string(),
                ip: "10.20.0.2".to_string(),
                last_seen: 10.0,
                mode,
                failure_count: 0,
                good_count: 0,
                throughput: None,
                nexthop: None,
            },
        );
        state::write_atomic(
            &rig.dir.path().join("node_status.json"),
            &NodeStatusDoc {
                timestamp: 1,
                nodes,
            },
        )
        .unwrap();

        let mut peers = BTreeMap::new();
        if discovered {
            peers.insert(
                "rover-2".to_string(),
                PeerEntry {
                    destination_hash: "ab".repeat(16),
                    last_seen: 1,
                },
            );
        }
        state::write_atomic(
            &rig.dir.path().join("peer_discovery.json"),
            &PeerTableDoc {
                timestamp: 1,
                peers,
            },
        )
        .unwrap();
    }

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    #[test]
    fn test_config_rejects_shared_ports() {
        let config = BridgeConfig {
            downstream: vec![SocketAddrV4::new(Ipv4Addr::new(224, 10, 10, 1), 17012)],
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_config_rejects_non_multicast_group() {
        let config = BridgeConfig {
            upstream: vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 17012)],
            ..BridgeConfig::default()
        };
        assert!(matches!(config.validate(), Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_config_defaults_valid() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn test_ingress_drops_remote_source() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);
        let outcome = rig.bridge.ingress_packet(
            b"<event/>",
            IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
            &mut gate,
        );
        assert_eq!(outcome, IngressOutcome::DroppedRemote);
        assert!(rig.spool.is_empty(Stage::Pending).unwrap());
    }

    #[test]
    fn test_ingress_stages_when_fallback_active() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);
        let outcome = rig.bridge.ingress_packet(b"<event/>", LOCAL, &mut gate);
        assert_eq!(outcome, IngressOutcome::Staged);
        let files = rig.spool.list(Stage::Pending).unwrap();
        assert_eq!(files.len(), 1);
        // Spooled bytes are the compressed form.
        let compressed = std::fs::read(&files[0]).unwrap();
        assert_eq!(rig.codec.decompress(&compressed).unwrap(), b"<event/>");
    }

    #[test]
    fn test_ingress_dedups_identical_payloads() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);
        assert_eq!(
            rig.bridge.ingress_packet(b"<event/>", LOCAL, &mut gate),
            IngressOutcome::Staged
        );
        assert_eq!(
            rig.bridge.ingress_packet(b"<event/>", LOCAL, &mut gate),
            IngressOutcome::DroppedDuplicate
        );
        assert_eq!(rig.spool.len(Stage::Pending).unwrap(), 1);
        assert_eq!(rig.bridge.stats().ingress_dropped_duplicate, 1);
    }

    #[test]
    fn test_ingress_quiescent_without_slow_peer() {
        let rig = rig();
        let mut gate = gate(&rig);

        // No state files at all.
        assert_eq!(
            rig.bridge.ingress_packet(b"<a/>", LOCAL, &mut gate),
            IngressOutcome::DroppedQuiescent
        );
        // All FAST.
        publish_state(&rig, LinkMode::Fast, true);
        assert_eq!(
            rig.bridge.ingress_packet(b"<b/>", LOCAL, &mut gate),
            IngressOutcome::DroppedQuiescent
        );
        // SLOW but not discovered on the overlay.
        publish_state(&rig, LinkMode::Slow, false);
        assert_eq!(
            rig.bridge.ingress_packet(b"<c/>", LOCAL, &mut gate),
            IngressOutcome::DroppedQuiescent
        );
        assert!(rig.spool.is_empty(Stage::Pending).unwrap());
    }

    #[test]
    fn test_ingress_drops_oversized_payload() {
        let rig = rig_with_codec(DictCodec::new(
            crate::codec::DEFAULT_DICTIONARY.to_vec(),
            9,
            48,
        ));
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);
        let noise: Vec<u8> = (0u32..4096)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 11) as u8)
            .collect();
        assert_eq!(
            rig.bridge.ingress_packet(&noise, LOCAL, &mut gate),
            IngressOutcome::DroppedCodec
        );
        assert_eq!(rig.bridge.stats().ingress_dropped_codec, 1);
    }

    #[test]
    fn test_egress_emits_and_cleans_up() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);

        let compressed = rig.codec.compress(b"<event a=\"1\"/>").unwrap();
        rig.spool.write(Stage::Incoming, &compressed).unwrap();

        let mut emitted = Vec::new();
        rig.bridge
            .drain_incoming(&mut gate, &mut |p| emitted.push(p.to_vec()));
        assert_eq!(emitted, vec![b"<event a=\"1\"/>".to_vec()]);
        assert!(rig.spool.is_empty(Stage::Incoming).unwrap());
        assert_eq!(rig.bridge.stats().egress_forwarded, 1);
    }

    #[test]
    fn test_egress_replay_after_crash_emits_once() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);

        let compressed = rig.codec.compress(b"<event/>").unwrap();
        rig.spool.write(Stage::Incoming, &compressed).unwrap();
        let mut emitted = 0;
        rig.bridge.drain_incoming(&mut gate, &mut |_| emitted += 1);
        // The same payload resurfaces, as after a crash between the claim
        // rename and the unlink.
        rig.spool.write(Stage::Incoming, &compressed).unwrap();
        rig.bridge.drain_incoming(&mut gate, &mut |_| emitted += 1);

        assert_eq!(emitted, 1);
        assert_eq!(rig.bridge.stats().egress_dropped_duplicate, 1);
        assert!(rig.spool.is_empty(Stage::Incoming).unwrap());
    }

    #[test]
    fn test_egress_discards_undecodable_file() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Slow, true);

        rig.spool
            .write(Stage::Incoming, &[0xDE, 0xAD, 0xBE, 0xEF])
            .unwrap();
        let mut emitted = 0;
        rig.bridge.drain_incoming(&mut gate, &mut |_| emitted += 1);
        assert_eq!(emitted, 0);
        assert!(rig.spool.is_empty(Stage::Incoming).unwrap());
        assert_eq!(rig.bridge.stats().egress_dropped_codec, 1);
    }

    #[test]
    fn test_quiescence_purges_all_stages() {
        let rig = rig();
        let mut gate = gate(&rig);
        publish_state(&rig, LinkMode::Fast, true);

        rig.spool.write(Stage::Pending, b"1").unwrap();
        rig.spool.write(Stage::SentBuffer, b"2").unwrap();
        rig.spool.write(Stage::Incoming, b"3").unwrap();

        let mut emitted = 0;
        rig.bridge.drain_incoming(&mut gate, &mut |_| emitted += 1);
        assert_eq!(emitted, 0);
        for stage in Stage::ALL {
            assert!(rig.spool.is_empty(stage).unwrap());
        }
        assert_eq!(rig.bridge.stats().purged_files, 3);
    }

    #[test]
    fn test_unknown_state_does_not_purge() {
        let rig = rig();
        let mut gate = gate(&rig);
        // No node_status file: neither quiescent nor active.
        rig.spool.write(Stage::Pending, b"1").unwrap();
        let mut emitted = 0;
        rig.bridge.drain_incoming(&mut gate, &mut |_| emitted += 1);
        assert_eq!(rig.spool.len(Stage::Pending).unwrap(), 1);
    }
}
