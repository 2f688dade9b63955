// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Development overlay transport over plain UDP.
//!
//! Carries the three overlay primitives (announce, data-with-receipt,
//! receipt) in a one-byte-type wire format so the daemons can run in a lab
//! without the production overlay stack. Routing is learned from announces;
//! static routes can be added for point-to-point setups.
//!
//! ```text
//! ANNOUNCE = 0x01 | dest(16) | identity(32) | app_data
//! DATA     = 0x02 | dest(16) | src(16) | packet_id(8 BE) | payload
//! RECEIPT  = 0x03 | packet_id(8 BE)
//! ```
//!
//! Receipts are processed eagerly here, so `recall_identity` is a plain
//! lookup; the pump semantics documented on the trait still hold.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use super::{
    dest_hex, invoke_guarded, Announce, AnnounceHandler, DeliveryEvent, DeliveryHandler,
    DestinationHash, Identity, OverlayError, OverlayTransport, PacketHandler, PacketId, APP_NAME,
    ASPECT,
};
use crate::util::XorShift64;

const TYPE_ANNOUNCE: u8 = 0x01;
const TYPE_DATA: u8 = 0x02;
const TYPE_RECEIPT: u8 = 0x03;

const RX_TIMEOUT: Duration = Duration::from_millis(250);

/// Default receipt timeout, matching the radio path's expiry.
pub const DEFAULT_PACKET_TIMEOUT: Duration = Duration::from_secs(300);

/// UDP overlay configuration.
#[derive(Debug, Clone)]
pub struct UdpOverlayConfig {
    /// Local bind address.
    pub bind: SocketAddr,
    /// Where announces are sent (unicast peers or a broadcast address).
    pub announce_targets: Vec<SocketAddr>,
    /// How long to wait for a receipt before reporting a timeout.
    pub packet_timeout: Duration,
}

impl Default for UdpOverlayConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 48200)),
            announce_targets: Vec::new(),
            packet_timeout: DEFAULT_PACKET_TIMEOUT,
        }
    }
}

struct UdpInner {
    socket: UdpSocket,
    destination: DestinationHash,
    identity: Identity,
    packet_timeout: Duration,
    announce_targets: Mutex<Vec<SocketAddr>>,
    announce_handler: Mutex<Option<AnnounceHandler>>,
    delivery_handler: Mutex<Option<DeliveryHandler>>,
    packet_handler: Mutex<Option<PacketHandler>>,
    /// Destination fingerprint -> socket address, learned from announces.
    routes: Mutex<HashMap<DestinationHash, SocketAddr>>,
    /// Destination fingerprint -> identity, learned from announces.
    identities: Mutex<HashMap<DestinationHash, Identity>>,
    /// Sends awaiting a receipt: packet id -> (destination, sent at).
    outstanding: Mutex<HashMap<u64, (DestinationHash, Instant)>>,
    next_packet: AtomicU64,
    quit: AtomicBool,
}

impl UdpInner {
    fn fire_delivery(&self, event: DeliveryEvent) {
        let guard = self.delivery_handler.lock();
        if let Some(handler) = guard.as_ref() {
            invoke_guarded("delivery", handler.as_ref(), event);
        }
    }
}

/// UDP-backed [`OverlayTransport`].
pub struct UdpOverlay {
    inner: Arc<UdpInner>,
    rx: Mutex<Option<JoinHandle<()>>>,
}

impl UdpOverlay {
    /// Bind the socket, derive a fresh identity, and start the RX thread.
    pub fn new(config: UdpOverlayConfig) -> io::Result<Self> {
        let raw = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        raw.set_reuse_address(true)?;
        raw.set_broadcast(true)?;
        raw.bind(&config.bind.into())?;
        let socket: UdpSocket = raw.into();
        socket.set_read_timeout(Some(RX_TIMEOUT))?;

        // Fresh opaque identity per process; the destination fingerprint is
        // the hash of identity and application name, as the overlay does it.
        let mut rng = XorShift64::from_clock();
        let mut ident = [0u8; 32];
        for chunk in ident.chunks_mut(8) {
            chunk.copy_from_slice(&rng.next_u64().to_be_bytes()[..chunk.len()]);
        }
        let mut hasher = Md5::new();
        hasher.update(ident);
        hasher.update(format!("{APP_NAME}.{ASPECT}").as_bytes());
        let destination: [u8; 16] = hasher.finalize().into();

        let inner = Arc::new(UdpInner {
            socket,
            destination,
            identity: Identity(ident),
            packet_timeout: config.packet_timeout,
            announce_targets: Mutex::new(config.announce_targets),
            announce_handler: Mutex::new(None),
            delivery_handler: Mutex::new(None),
            packet_handler: Mutex::new(None),
            routes: Mutex::new(HashMap::new()),
            identities: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
            next_packet: AtomicU64::new(1),
            quit: AtomicBool::new(false),
        });

        let rx_inner = inner.clone();
        let rx_socket = inner.socket.try_clone()?;
        let handle = std::thread::Builder::new()
            .name("ovn-udp-rx".into())
            .spawn(move || rx_loop(&rx_inner, &rx_socket))?;

        Ok(Self {
            inner,
            rx: Mutex::new(Some(handle)),
        })
    }

    /// Bound local address (useful with port 0).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Add an announce target after construction.
    pub fn add_announce_target(&self, addr: SocketAddr) {
        self.inner.announce_targets.lock().push(addr);
    }

    /// Install a static route for point-to-point labs without announces.
    pub fn add_peer_route(&self, dest: DestinationHash, addr: SocketAddr) {
        self.inner.routes.lock().insert(dest, addr);
    }

    /// Stop the RX thread. Safe to call more than once.
    pub fn shutdown(&self) {
        self.inner.quit.store(true, Ordering::Relaxed);
        if let Some(handle) = self.rx.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for UdpOverlay {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn rx_loop(inner: &UdpInner, socket: &UdpSocket) {
    let mut buf = [0u8; 65535];
    while !inner.quit.load(Ordering::Relaxed) {
        sweep_outstanding(inner);
        match socket.recv_from(&mut buf) {
            Ok((len, from)) => handle_datagram(inner, socket, &buf[..len], from),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                log::warn!("[OVN] udp receive error: {e}");
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

fn sweep_outstanding(inner: &UdpInner) {
    let mut expired = Vec::new();
    {
        let mut outstanding = inner.outstanding.lock();
        outstanding.retain(|id, (_, sent_at)| {
            if sent_at.elapsed() >= inner.packet_timeout {
                expired.push(*id);
                false
            } else {
                true
            }
        });
    }
    for id in expired {
        inner.fire_delivery(DeliveryEvent::Timeout {
            packet: PacketId(id),
        });
    }
}

fn handle_datagram(inner: &UdpInner, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
    match datagram.first() {
        Some(&TYPE_ANNOUNCE) if datagram.len() >= 1 + 16 + 32 => {
            let mut dest = [0u8; 16];
            dest.copy_from_slice(&datagram[1..17]);
            if dest == inner.destination {
                return;
            }
            let mut ident = [0u8; 32];
            ident.copy_from_slice(&datagram[17..49]);
            let app_data = datagram[49..].to_vec();

            inner.routes.lock().insert(dest, from);
            inner.identities.lock().insert(dest, Identity(ident));

            let guard = inner.announce_handler.lock();
            if let Some(handler) = guard.as_ref() {
                invoke_guarded(
                    "announce",
                    handler.as_ref(),
                    Announce {
                        destination: dest,
                        identity: Identity(ident),
                        app_data,
                    },
                );
            }
        }
        Some(&TYPE_DATA) if datagram.len() >= 1 + 16 + 16 + 8 => {
            let mut dest = [0u8; 16];
            dest.copy_from_slice(&datagram[1..17]);
            if dest != inner.destination {
                return;
            }
            let mut src = [0u8; 16];
            src.copy_from_slice(&datagram[17..33]);
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&datagram[33..41]);
            let payload = datagram[41..].to_vec();

            inner.routes.lock().insert(src, from);

            // Receipt first, then hand the payload up.
            let mut receipt = Vec::with_capacity(9);
            receipt.push(TYPE_RECEIPT);
            receipt.extend_from_slice(&id_bytes);
            if let Err(e) = socket.send_to(&receipt, from) {
                log::warn!("[OVN] receipt send to {from} failed: {e}");
            }

            let guard = inner.packet_handler.lock();
            if let Some(handler) = guard.as_ref() {
                invoke_guarded("packet", handler.as_ref(), payload);
            }
        }
        Some(&TYPE_RECEIPT) if datagram.len() >= 1 + 8 => {
            let mut id_bytes = [0u8; 8];
            id_bytes.copy_from_slice(&datagram[1..9]);
            let id = u64::from_be_bytes(id_bytes);
            let entry = inner.outstanding.lock().remove(&id);
            if let Some((_, sent_at)) = entry {
                inner.fire_delivery(DeliveryEvent::Delivered {
                    packet: PacketId(id),
                    rtt: sent_at.elapsed(),
                });
            }
        }
        _ => log::debug!("[OVN] ignoring malformed datagram from {from}"),
    }
}

impl OverlayTransport for UdpOverlay {
    fn local_destination(&self) -> DestinationHash {
        self.inner.destination
    }

    fn announce(&self, app_data: &[u8]) -> Result<(), OverlayError> {
        let mut frame = Vec::with_capacity(1 + 16 + 32 + app_data.len());
        frame.push(TYPE_ANNOUNCE);
        frame.extend_from_slice(&self.inner.destination);
        frame.extend_from_slice(&self.inner.identity.0);
        frame.extend_from_slice(app_data);

        let targets = self.inner.announce_targets.lock().clone();
        for target in targets {
            if let Err(e) = self.inner.socket.send_to(&frame, target) {
                log::warn!("[OVN] announce to {target} failed: {e}");
            }
        }
        Ok(())
    }

    fn set_announce_handler(&self, handler: AnnounceHandler) {
        *self.inner.announce_handler.lock() = Some(handler);
    }

    fn send_with_receipt(
        &self,
        dest: DestinationHash,
        payload: &[u8],
    ) -> Result<PacketId, OverlayError> {
        let addr = self
            .inner
            .routes
            .lock()
            .get(&dest)
            .copied()
            .ok_or_else(|| OverlayError::UnknownDestination(dest_hex(&dest)))?;

        let id = self.inner.next_packet.fetch_add(1, Ordering::Relaxed);
        let mut frame = Vec::with_capacity(1 + 16 + 16 + 8 + payload.len());
        frame.push(TYPE_DATA);
        frame.extend_from_slice(&dest);
        frame.extend_from_slice(&self.inner.destination);
        frame.extend_from_slice(&id.to_be_bytes());
        frame.extend_from_slice(payload);

        self.inner
            .socket
            .send_to(&frame, addr)
            .map_err(|e| OverlayError::Send(e.to_string()))?;
        self.inner
            .outstanding
            .lock()
            .insert(id, (dest, Instant::now()));
        Ok(PacketId(id))
    }

    fn set_delivery_handler(&self, handler: DeliveryHandler) {
        *self.inner.delivery_handler.lock() = Some(handler);
    }

    fn set_packet_handler(&self, handler: PacketHandler) {
        *self.inner.packet_handler.lock() = Some(handler);
    }

    fn recall_identity(&self, dest: DestinationHash) -> Option<Identity> {
        self.inner.identities.lock().get(&dest).copied()
    }

    fn clear_handlers(&self) {
        *self.inner.announce_handler.lock() = None;
        *self.inner.delivery_handler.lock() = None;
        *self.inner.packet_handler.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost_overlay(timeout: Duration) -> UdpOverlay {
        UdpOverlay::new(UdpOverlayConfig {
            bind: "127.0.0.1:0".parse().unwrap(),
            announce_targets: Vec::new(),
            packet_timeout: timeout,
        })
        .unwrap()
    }

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    #[test]
    fn test_announce_learns_route_and_identity() {
        let alpha = localhost_overlay(DEFAULT_PACKET_TIMEOUT);
        let bravo = localhost_overlay(DEFAULT_PACKET_TIMEOUT);
        alpha.add_announce_target(bravo.local_addr().unwrap());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bravo.set_announce_handler(Box::new(move |ann| sink.lock().push(ann)));

        alpha.announce(b"alpha-host").unwrap();
        assert!(wait_until(Duration::from_secs(2), || !seen.lock().is_empty()));

        let announces = seen.lock();
        assert_eq!(announces[0].destination, alpha.local_destination());
        assert_eq!(announces[0].app_data, b"alpha-host");
        assert_eq!(
            bravo.recall_identity(alpha.local_destination()),
            Some(announces[0].identity)
        );
    }

    #[test]
    fn test_data_roundtrip_with_receipt() {
        let alpha = localhost_overlay(DEFAULT_PACKET_TIMEOUT);
        let bravo = localhost_overlay(DEFAULT_PACKET_TIMEOUT);
        alpha.add_peer_route(bravo.local_destination(), bravo.local_addr().unwrap());

        let payloads = Arc::new(Mutex::new(Vec::new()));
        let sink = payloads.clone();
        bravo.set_packet_handler(Box::new(move |p| sink.lock().push(p)));

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = delivered.clone();
        alpha.set_delivery_handler(Box::new(move |e| sink.lock().push(e)));

        let id = alpha
            .send_with_receipt(bravo.local_destination(), b"payload")
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            !delivered.lock().is_empty()
        }));
        assert_eq!(payloads.lock()[0], b"payload");
        assert!(matches!(
            delivered.lock()[0],
            DeliveryEvent::Delivered { packet, .. } if packet == id
        ));
    }

    #[test]
    fn test_unanswered_send_times_out() {
        let alpha = localhost_overlay(Duration::from_millis(200));
        // Route to a socket nobody is reading receipts from.
        let sink_socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest: DestinationHash = [7u8; 16];
        alpha.add_peer_route(dest, sink_socket.local_addr().unwrap());

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        alpha.set_delivery_handler(Box::new(move |e| sink.lock().push(e)));

        alpha.send_with_receipt(dest, b"void").unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            !events.lock().is_empty()
        }));
        assert!(matches!(events.lock()[0], DeliveryEvent::Timeout { .. }));
    }

    #[test]
    fn test_send_to_unknown_destination_errors() {
        let alpha = localhost_overlay(DEFAULT_PACKET_TIMEOUT);
        assert!(matches!(
            alpha.send_with_receipt([9u8; 16], b"x"),
            Err(OverlayError::UnknownDestination(_))
        ));
    }
}
