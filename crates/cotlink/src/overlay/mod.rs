// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Overlay-transport abstraction.
//!
//! The cryptographic overlay (identity, announce, packet-with-receipt) is an
//! external library; this module pins down the capability set the subsystem
//! consumes from it, so the discovery service and the sender are written
//! against a trait instead of a vendor API.
//!
//! Two implementations ship here:
//! - [`loopback::LoopbackHub`] - in-memory hub for tests, with configurable
//!   receipt behaviour (including the receipt-pump quirk, see below).
//! - [`udp::UdpOverlay`] - a development transport carrying the same
//!   primitives over plain UDP for lab deployments.
//!
//! # Destination fingerprints are opaque
//!
//! A [`DestinationHash`] names a reachable endpoint and is produced only by
//! the overlay library. It is NOT derivable from an identity's public key;
//! persist and compare it byte-for-byte as announced, never reconstruct it.
//!
//! # The receipt pump
//!
//! The production overlay library only processes pending delivery receipts
//! for a peer when the client touches its per-peer API. The sender therefore
//! calls [`OverlayTransport::recall_identity`] periodically for peers with
//! outstanding receipts; implementations are free to treat it as a pure
//! lookup.
//!
//! # Handler rules
//!
//! Handlers run on the transport's threads. They must be quick, must not
//! re-enter the transport, and any panic is contained at the dispatch
//! boundary and logged.

pub mod loopback;
pub mod udp;

use std::time::Duration;

use thiserror::Error;

/// Application name used in announce filtering.
pub const APP_NAME: &str = "atak";

/// Aspect under the application name.
pub const ASPECT: &str = "cot";

/// Opaque destination fingerprint, exactly as produced by the overlay.
pub type DestinationHash = [u8; 16];

/// Opaque overlay identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity(pub [u8; 32]);

/// Token identifying one packet-with-receipt send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketId(pub u64);

/// Hex form of a destination fingerprint, for logs and the peer table.
pub fn dest_hex(dest: &DestinationHash) -> String {
    hex::encode(dest)
}

/// A received announce.
#[derive(Debug, Clone)]
pub struct Announce {
    /// The announcing endpoint's destination fingerprint.
    pub destination: DestinationHash,
    /// The announcing endpoint's identity.
    pub identity: Identity,
    /// Opaque application data (this subsystem carries the hostname).
    pub app_data: Vec<u8>,
}

/// Receipt outcome for a tracked send.
#[derive(Debug, Clone, Copy)]
pub enum DeliveryEvent {
    /// The peer confirmed delivery.
    Delivered { packet: PacketId, rtt: Duration },
    /// The overlay gave up waiting for a receipt.
    Timeout { packet: PacketId },
}

/// Announce callback.
pub type AnnounceHandler = Box<dyn Fn(Announce) + Send + Sync>;
/// Delivery/timeout callback.
pub type DeliveryHandler = Box<dyn Fn(DeliveryEvent) + Send + Sync>;
/// Inbound payload callback.
pub type PacketHandler = Box<dyn Fn(Vec<u8>) + Send + Sync>;

/// Overlay failure modes.
#[derive(Debug, Error)]
pub enum OverlayError {
    /// The transport rejected the send; the caller treats this as an
    /// implicit timeout for the attempt.
    #[error("overlay send failed: {0}")]
    Send(String),

    /// No route to the destination fingerprint.
    #[error("unknown overlay destination {0}")]
    UnknownDestination(String),

    #[error("overlay I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// Capability set consumed from the overlay library.
pub trait OverlayTransport: Send + Sync {
    /// This node's inbound destination fingerprint.
    fn local_destination(&self) -> DestinationHash;

    /// Broadcast an announce carrying `app_data`.
    fn announce(&self, app_data: &[u8]) -> Result<(), OverlayError>;

    /// Install the announce callback (replaces any previous one).
    fn set_announce_handler(&self, handler: AnnounceHandler);

    /// Send `payload` to `dest`, requesting a delivery receipt.
    fn send_with_receipt(
        &self,
        dest: DestinationHash,
        payload: &[u8],
    ) -> Result<PacketId, OverlayError>;

    /// Install the delivery/timeout callback (replaces any previous one).
    fn set_delivery_handler(&self, handler: DeliveryHandler);

    /// Install the inbound-payload callback (replaces any previous one).
    fn set_packet_handler(&self, handler: PacketHandler);

    /// Look up a peer identity. Doubles as the receipt pump: transports that
    /// queue receipts flush those for `dest` to the delivery handler here.
    fn recall_identity(&self, dest: DestinationHash) -> Option<Identity>;

    /// Deregister all callbacks; called once at shutdown.
    fn clear_handlers(&self);
}

/// Run a handler with panic containment. A handler panic loses that one
/// event and nothing else.
pub(crate) fn invoke_guarded<T, F>(label: &str, handler: &F, arg: T)
where
    F: Fn(T) + ?Sized,
{
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(arg)));
    if outcome.is_err() {
        log::error!("[OVN] {label} handler panicked; event dropped");
    }
}
