// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Recent-payload fingerprint ring.
//!
//! A fixed-capacity FIFO set of 128-bit payload hashes. Both bridge
//! directions consult it, so a payload that went out over the overlay is not
//! re-forwarded when its copy comes back in, and vice versa. Fingerprints
//! are taken over the full uncompressed payload.

use std::num::NonZeroUsize;

use lru::LruCache;
use md5::{Digest, Md5};

/// Default ring capacity.
pub const DEFAULT_CAPACITY: usize = 1000;

/// 128-bit payload fingerprint.
pub type Fingerprint = u128;

/// Compute the fingerprint of an uncompressed payload.
pub fn fingerprint(payload: &[u8]) -> Fingerprint {
    let digest: [u8; 16] = Md5::digest(payload).into();
    u128::from_be_bytes(digest)
}

/// Outcome of offering a fingerprint to the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First sighting inside the window; the fingerprint was recorded.
    WasNew,
    /// Duplicate within the window; the ring is unchanged.
    WasSeen,
}

/// FIFO set of the most recent `capacity` fingerprints.
///
/// Backed by an `LruCache` used insert/peek-only: entries are never promoted,
/// so least-recently-used equals first-inserted and eviction is exactly FIFO.
#[derive(Debug)]
pub struct RecentFingerprintRing {
    ring: LruCache<Fingerprint, ()>,
}

impl RecentFingerprintRing {
    /// Create a ring holding at most `capacity` fingerprints.
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            ring: LruCache::new(capacity),
        }
    }

    /// Create a ring with the default capacity.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }

    /// Offer a fingerprint: record it if unseen, report a duplicate otherwise.
    pub fn observe(&mut self, fp: Fingerprint) -> Observation {
        if self.ring.peek(&fp).is_some() {
            Observation::WasSeen
        } else {
            self.ring.put(fp, ());
            Observation::WasNew
        }
    }

    /// Number of fingerprints currently held.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// True if no fingerprints are held.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.ring.cap().get()
    }
}
