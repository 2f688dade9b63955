// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # CoTLink - CoT-over-overlay fallback transport
//!
//! Bridges a multicast tactical-data (CoT) application onto a low-bandwidth
//! cryptographic overlay whenever the high-bandwidth WiFi mesh degrades.
//! The mesh is always preferred; the overlay radio path is strictly a
//! fallback, engaged per peer by link-quality classification.
//!
//! ## Pipeline
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |  ATAK / CoT application (multicast)                                |
//! +--------------------------------------------------------------------+
//!        | upstream groups                      ^ downstream groups
//!        v                                      |
//! +-------------------+    incoming/     +-------------------+
//! |  PacketBridge     |<-----------------|  OverlaySender    |
//! |  dedup + codec    |----------------->|  pacing, receipts,|
//! +-------------------+    pending/      |  bounded retries  |
//!        ^      ^          sent_buffer/  +-------------------+
//!        |      |                               |        ^
//!   node_status |                        OverlayTransport |
//!        |  peer_discovery                      v         |
//! +-------------+  +---------------+    +--------------------+
//! | LinkMonitor |  | PeerDiscovery |--->|  overlay library   |
//! | (hysteresis)|  | (announces)   |    |  (radio path)      |
//! +-------------+  +---------------+    +--------------------+
//! ```
//!
//! The three-directory [`spool`] is the only hand-off between the bridge and
//! the sender; [`state`] holds the two JSON control feeds (`node_status`,
//! `peer_discovery`) that gate what the sender transmits. No other mutable
//! state crosses component boundaries.
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`LinkMonitor`] | Classifies mesh peers FAST/SLOW with hysteresis |
//! | [`PeerDiscovery`] | Announces identity, tracks overlay peers |
//! | [`PacketBridge`] | Multicast ingress/egress, compression, dedup |
//! | [`OverlaySender`] | Reliable paced delivery to SLOW peers |
//! | [`DictCodec`] | Dictionary deflate under the radio size cap |
//! | [`Spool`] | Three-stage on-disk queue with atomic moves |
//! | [`OverlayTransport`](overlay::OverlayTransport) | Capability trait over the overlay library |
//!
//! ## Processes
//!
//! Deployments run three supervised processes from the `cotlink-node` crate:
//! the link monitor, the overlay daemon (discovery + sender, one transport
//! handle), and the packet bridge.

/// Multicast ingress/egress and spool staging.
pub mod bridge;
/// Dictionary-assisted payload compression.
pub mod codec;
/// Recent-payload fingerprint ring.
pub mod dedup;
/// Peer discovery over the overlay.
pub mod discovery;
/// Link-quality monitoring with hysteresis.
pub mod lqm;
/// Overlay-transport abstraction and implementations.
pub mod overlay;
/// Reliable overlay sender.
pub mod sender;
/// Three-stage on-disk spool.
pub mod spool;
/// Shared JSON control feeds.
pub mod state;
/// Clock, throttling, and PRNG helpers.
pub mod util;

pub use bridge::{
    BridgeConfig, BridgeError, BridgeStats, FallbackGate, IngressOutcome, PacketBridge,
};
pub use codec::{CodecError, CodecStats, DictCodec};
pub use dedup::{fingerprint, Fingerprint, Observation, RecentFingerprintRing};
pub use discovery::{DiscoveryConfig, DiscoveryError, DiscoveryStats, PeerDiscovery};
pub use lqm::{
    telemetry::{BatmanOriginators, OriginatorSample, TelemetryError, TelemetrySource},
    HostEntry, HostnameMap, LinkMonitor, LqmConfig, LqmError,
};
pub use sender::{OverlaySender, SenderConfig, SenderStats};
pub use spool::{Spool, SpoolError, Stage};
pub use state::{
    CachedReader, LinkMode, NodeEntry, NodeStatusDoc, PeerEntry, PeerTableDoc, StateError,
};

/// CoTLink version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
