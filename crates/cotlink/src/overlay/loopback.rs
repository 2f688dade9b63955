// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! In-memory overlay hub for tests.
//!
//! All endpoints attached to one hub hear each other's announces (including
//! their own, as on a real broadcast medium) and can exchange packets with
//! receipts. Impairments are configurable per destination:
//!
//! - **lossy**: sends to the destination vanish and the sender gets an
//!   immediate timeout event (a compressed version of radio expiry).
//! - **muted**: data is delivered but no receipt ever comes back.
//!
//! With `manual_receipt_pump` the hub holds receipts until the sender calls
//! `recall_identity` for that peer, reproducing the production library's
//! receipt-pump behaviour for tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use md5::{Digest, Md5};
use parking_lot::Mutex;

use super::{
    dest_hex, invoke_guarded, Announce, AnnounceHandler, DeliveryEvent, DeliveryHandler,
    DestinationHash, Identity, OverlayError, OverlayTransport, PacketHandler, PacketId,
};

struct EndpointInner {
    destination: DestinationHash,
    identity: Identity,
    announce_handler: Mutex<Option<AnnounceHandler>>,
    delivery_handler: Mutex<Option<DeliveryHandler>>,
    packet_handler: Mutex<Option<PacketHandler>>,
    /// Arrival log for assertions: (when, payload).
    arrivals: Mutex<Vec<(Instant, Vec<u8>)>>,
    /// Held receipts per destination (manual pump mode).
    pending_receipts: Mutex<HashMap<DestinationHash, Vec<(PacketId, Instant)>>>,
}

struct HubInner {
    endpoints: Mutex<BTreeMap<DestinationHash, Arc<EndpointInner>>>,
    lossy: Mutex<HashSet<DestinationHash>>,
    muted: Mutex<HashSet<DestinationHash>>,
    manual_receipt_pump: bool,
    next_packet: AtomicU64,
}

/// Hub connecting loopback endpoints.
#[derive(Clone)]
pub struct LoopbackHub {
    inner: Arc<HubInner>,
}

impl LoopbackHub {
    /// Hub with immediate receipts.
    pub fn new() -> Self {
        Self::with_pump_mode(false)
    }

    /// Hub that holds receipts until `recall_identity` is called.
    pub fn with_manual_receipt_pump() -> Self {
        Self::with_pump_mode(true)
    }

    fn with_pump_mode(manual_receipt_pump: bool) -> Self {
        Self {
            inner: Arc::new(HubInner {
                endpoints: Mutex::new(BTreeMap::new()),
                lossy: Mutex::new(HashSet::new()),
                muted: Mutex::new(HashSet::new()),
                manual_receipt_pump,
                next_packet: AtomicU64::new(1),
            }),
        }
    }

    /// Attach a new endpoint; `name` seeds a deterministic identity.
    pub fn endpoint(&self, name: &str) -> LoopbackOverlay {
        let destination: [u8; 16] = Md5::digest(format!("dest:{name}").as_bytes()).into();
        let mut ident = [0u8; 32];
        let lo: [u8; 16] = Md5::digest(format!("ident0:{name}").as_bytes()).into();
        let hi: [u8; 16] = Md5::digest(format!("ident1:{name}").as_bytes()).into();
        ident[..16].copy_from_slice(&lo);
        ident[16..].copy_from_slice(&hi);

        let endpoint = Arc::new(EndpointInner {
            destination,
            identity: Identity(ident),
            announce_handler: Mutex::new(None),
            delivery_handler: Mutex::new(None),
            packet_handler: Mutex::new(None),
            arrivals: Mutex::new(Vec::new()),
            pending_receipts: Mutex::new(HashMap::new()),
        });
        self.inner
            .endpoints
            .lock()
            .insert(destination, endpoint.clone());
        LoopbackOverlay {
            hub: self.inner.clone(),
            me: endpoint,
        }
    }

    /// Detach an endpoint; later sends to it fail synchronously.
    pub fn remove_endpoint(&self, dest: DestinationHash) {
        self.inner.endpoints.lock().remove(&dest);
    }

    /// Make sends toward `dest` vanish (sender sees a timeout event).
    pub fn set_lossy(&self, dest: DestinationHash, lossy: bool) {
        let mut set = self.inner.lossy.lock();
        if lossy {
            set.insert(dest);
        } else {
            set.remove(&dest);
        }
    }

    /// Deliver data to `dest` but suppress its receipts entirely.
    pub fn set_muted(&self, dest: DestinationHash, muted: bool) {
        let mut set = self.inner.muted.lock();
        if muted {
            set.insert(dest);
        } else {
            set.remove(&dest);
        }
    }
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

/// One endpoint attached to a [`LoopbackHub`].
#[derive(Clone)]
pub struct LoopbackOverlay {
    hub: Arc<HubInner>,
    me: Arc<EndpointInner>,
}

impl LoopbackOverlay {
    /// Arrival log (when, payload) for assertions.
    pub fn arrivals(&self) -> Vec<(Instant, Vec<u8>)> {
        self.me.arrivals.lock().clone()
    }

    /// Number of packets this endpoint has received.
    pub fn arrival_count(&self) -> usize {
        self.me.arrivals.lock().len()
    }

    /// This endpoint's identity.
    pub fn identity(&self) -> Identity {
        self.me.identity
    }

    fn fire_delivery(&self, event: DeliveryEvent) {
        let guard = self.me.delivery_handler.lock();
        if let Some(handler) = guard.as_ref() {
            invoke_guarded("delivery", handler.as_ref(), event);
        }
    }
}

impl OverlayTransport for LoopbackOverlay {
    fn local_destination(&self) -> DestinationHash {
        self.me.destination
    }

    fn announce(&self, app_data: &[u8]) -> Result<(), OverlayError> {
        // Broadcast: every endpoint hears it, the sender included.
        let listeners: Vec<Arc<EndpointInner>> =
            self.hub.endpoints.lock().values().cloned().collect();
        for listener in listeners {
            let guard = listener.announce_handler.lock();
            if let Some(handler) = guard.as_ref() {
                invoke_guarded(
                    "announce",
                    handler.as_ref(),
                    Announce {
                        destination: self.me.destination,
                        identity: self.me.identity,
                        app_data: app_data.to_vec(),
                    },
                );
            }
        }
        Ok(())
    }

    fn set_announce_handler(&self, handler: AnnounceHandler) {
        *self.me.announce_handler.lock() = Some(handler);
    }

    fn send_with_receipt(
        &self,
        dest: DestinationHash,
        payload: &[u8],
    ) -> Result<PacketId, OverlayError> {
        let packet = PacketId(self.hub.next_packet.fetch_add(1, Ordering::Relaxed));
        let target = self.hub.endpoints.lock().get(&dest).cloned();
        let Some(target) = target else {
            return Err(OverlayError::UnknownDestination(dest_hex(&dest)));
        };

        if self.hub.lossy.lock().contains(&dest) {
            self.fire_delivery(DeliveryEvent::Timeout { packet });
            return Ok(packet);
        }

        let sent_at = Instant::now();
        target.arrivals.lock().push((sent_at, payload.to_vec()));
        {
            let guard = target.packet_handler.lock();
            if let Some(handler) = guard.as_ref() {
                invoke_guarded("packet", handler.as_ref(), payload.to_vec());
            }
        }

        if self.hub.muted.lock().contains(&dest) {
            return Ok(packet);
        }

        if self.hub.manual_receipt_pump {
            self.me
                .pending_receipts
                .lock()
                .entry(dest)
                .or_default()
                .push((packet, sent_at));
        } else {
            self.fire_delivery(DeliveryEvent::Delivered {
                packet,
                rtt: sent_at.elapsed(),
            });
        }
        Ok(packet)
    }

    fn set_delivery_handler(&self, handler: DeliveryHandler) {
        *self.me.delivery_handler.lock() = Some(handler);
    }

    fn set_packet_handler(&self, handler: PacketHandler) {
        *self.me.packet_handler.lock() = Some(handler);
    }

    fn recall_identity(&self, dest: DestinationHash) -> Option<Identity> {
        let target = self.hub.endpoints.lock().get(&dest).cloned()?;
        let held = self.me.pending_receipts.lock().remove(&dest);
        for (packet, sent_at) in held.unwrap_or_default() {
            self.fire_delivery(DeliveryEvent::Delivered {
                packet,
                rtt: sent_at.elapsed(),
            });
        }
        Some(target.identity)
    }

    fn clear_handlers(&self) {
        *self.me.announce_handler.lock() = None;
        *self.me.delivery_handler.lock() = None;
        *self.me.packet_handler.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_announce_heard_by_all_including_self() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");

        let heard = Arc::new(Mutex::new(Vec::new()));
        let sink = heard.clone();
        bravo.set_announce_handler(Box::new(move |ann| {
            sink.lock().push((ann.destination, ann.app_data));
        }));
        let self_heard = Arc::new(AtomicUsize::new(0));
        let counter = self_heard.clone();
        alpha.set_announce_handler(Box::new(move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        }));

        alpha.announce(b"alpha-host").unwrap();

        let heard = heard.lock();
        assert_eq!(heard.len(), 1);
        assert_eq!(heard[0].0, alpha.local_destination());
        assert_eq!(heard[0].1, b"alpha-host");
        assert_eq!(self_heard.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_send_delivers_and_receipts_immediately() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        alpha.set_delivery_handler(Box::new(move |event| sink.lock().push(event)));

        let id = alpha
            .send_with_receipt(bravo.local_destination(), b"data")
            .unwrap();
        assert_eq!(bravo.arrival_count(), 1);
        let events = events.lock();
        assert!(matches!(
            events[0],
            DeliveryEvent::Delivered { packet, .. } if packet == id
        ));
    }

    #[test]
    fn test_manual_pump_holds_receipts_until_recall() {
        let hub = LoopbackHub::with_manual_receipt_pump();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        alpha.set_delivery_handler(Box::new(move |event| sink.lock().push(event)));

        alpha
            .send_with_receipt(bravo.local_destination(), b"data")
            .unwrap();
        assert!(events.lock().is_empty(), "receipt leaked without a pump");

        alpha.recall_identity(bravo.local_destination()).unwrap();
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn test_lossy_destination_times_out() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");
        hub.set_lossy(bravo.local_destination(), true);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        alpha.set_delivery_handler(Box::new(move |event| sink.lock().push(event)));

        alpha
            .send_with_receipt(bravo.local_destination(), b"data")
            .unwrap();
        assert_eq!(bravo.arrival_count(), 0);
        assert!(matches!(events.lock()[0], DeliveryEvent::Timeout { .. }));
    }

    #[test]
    fn test_muted_destination_receives_silently() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");
        hub.set_muted(bravo.local_destination(), true);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        alpha.set_delivery_handler(Box::new(move |event| sink.lock().push(event)));

        alpha
            .send_with_receipt(bravo.local_destination(), b"data")
            .unwrap();
        assert_eq!(bravo.arrival_count(), 1);
        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_unknown_destination_is_synchronous_error() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let gone = hub.endpoint("gone");
        let dest = gone.local_destination();
        hub.remove_endpoint(dest);

        assert!(matches!(
            alpha.send_with_receipt(dest, b"data"),
            Err(OverlayError::UnknownDestination(_))
        ));
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");
        bravo.set_packet_handler(Box::new(|_| panic!("handler bug")));

        alpha
            .send_with_receipt(bravo.local_destination(), b"data")
            .unwrap();
        // The hub survives and keeps working.
        alpha
            .send_with_receipt(bravo.local_destination(), b"again")
            .unwrap();
        assert_eq!(bravo.arrival_count(), 2);
    }

    #[test]
    fn test_recall_identity_returns_peer_identity() {
        let hub = LoopbackHub::new();
        let alpha = hub.endpoint("alpha");
        let bravo = hub.endpoint("bravo");
        assert_eq!(
            alpha.recall_identity(bravo.local_destination()),
            Some(bravo.identity())
        );
        assert_eq!(alpha.recall_identity([0u8; 16]), None);
    }
}
