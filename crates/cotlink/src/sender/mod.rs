// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliable overlay sender.
//!
//! Drains the `pending/` spool to every SLOW, discovered peer with delivery
//! confirmation, bounded exponential-backoff retries, and radio pacing, then
//! retires files from `sent_buffer/` once every target is delivered or out
//! of retries.
//!
//! # Loop shape
//!
//! One thread at ~1 Hz. Each tick, in order: apply queued delivery events,
//! first-send pass (oldest file first, targets in sorted hostname order, one
//! paced send per target, then `pending/` -> `sent_buffer/`), retry pass,
//! receipt prompts, another event drain, cleanup pass. Overlay callbacks
//! never touch the delivery table directly; they enqueue onto a bounded
//! channel the tick consumes, so the table stays single-threaded.
//!
//! # Pacing
//!
//! The radio needs `send_spacing` of quiet between any two transmissions.
//! The gate is checked at tick start (skip the send phases entirely when
//! closed) and waited on between per-target sends inside a pass.
//!
//! # Receipt prompts
//!
//! The overlay library only processes a peer's pending receipts when its
//! per-peer API is touched. For every sent-but-unconfirmed target the tick
//! calls `recall_identity`, at most once per five seconds per peer. Without
//! this, receipts arrive in late bursts and apparent RTTs run to minutes;
//! with it they settle near the radio round trip.
//!
//! # Retry schedule
//!
//! `min(initial * factor^count, max_delay) * (1 + U[-jitter, +jitter])`
//! after each attempt, five attempts max with the defaults: gaps of roughly
//! 25, 50, 100, 120, 120 seconds.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, Receiver};
use parking_lot::Mutex;

use crate::overlay::{DeliveryEvent, DestinationHash, OverlayTransport, PacketId};
use crate::spool::{Spool, Stage};
use crate::state::{CachedReader, NodeStatusDoc, PeerTableDoc};
use crate::util::{sleep_with_quit, Throttle, XorShift64};

/// Queue depth for delivery events between overlay threads and the tick.
const EVENT_QUEUE_DEPTH: usize = 1024;

/// Sender tuning. Defaults match the radio deployment profile.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Main loop cadence.
    pub tick_interval: Duration,
    /// Minimum quiet time between any two overlay transmissions.
    pub send_spacing: Duration,
    /// First retry delay.
    pub retry_initial_delay: Duration,
    /// Backoff multiplier per attempt.
    pub retry_backoff_factor: f64,
    /// Ceiling on the backoff delay.
    pub retry_max_delay: Duration,
    /// Retries per (file, peer) before giving up.
    pub retry_max_attempts: u32,
    /// Uniform jitter applied to each backoff delay (fraction).
    pub retry_jitter: f64,
    /// Minimum spacing of receipt prompts per peer.
    pub receipt_prompt_interval: Duration,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            send_spacing: Duration::from_secs(2),
            retry_initial_delay: Duration::from_secs(25),
            retry_backoff_factor: 2.0,
            retry_max_delay: Duration::from_secs(120),
            retry_max_attempts: 5,
            retry_jitter: 0.1,
            receipt_prompt_interval: Duration::from_secs(5),
        }
    }
}

/// Per-(file, peer) delivery state.
#[derive(Debug, Clone)]
struct TargetState {
    delivered: bool,
    retry_count: u32,
    sent_at: Option<Instant>,
    next_eligible_at: Instant,
}

/// Delivery record for one `sent_buffer/` file.
#[derive(Debug, Default)]
struct FileRecord {
    /// Hostname -> state; BTreeMap keeps the documented sorted send order.
    targets: std::collections::BTreeMap<String, TargetState>,
}

impl FileRecord {
    /// Termination predicate: everything delivered or out of retries.
    fn finished(&self, max_attempts: u32) -> bool {
        self.targets
            .values()
            .all(|t| t.delivered || t.retry_count >= max_attempts)
    }

    fn fully_delivered(&self) -> bool {
        !self.targets.is_empty() && self.targets.values().all(|t| t.delivered)
    }
}

/// Sender counters.
#[derive(Debug, Default, Clone)]
pub struct SenderStats {
    pub first_sends: u64,
    pub retries: u64,
    pub send_errors: u64,
    pub delivered: u64,
    pub timeouts: u64,
    pub receipt_prompts: u64,
    pub completed_files: u64,
    pub exhausted_files: u64,
    /// Most recent confirmed round-trip time.
    pub last_rtt: Option<Duration>,
}

/// The reliable overlay sender.
pub struct OverlaySender {
    config: SenderConfig,
    spool: Arc<Spool>,
    transport: Arc<dyn OverlayTransport>,
    status: CachedReader<NodeStatusDoc>,
    peers: CachedReader<PeerTableDoc>,
    records: HashMap<String, FileRecord>,
    /// Packet id -> (file name, hostname). Entries live as long as their
    /// record so a late delivery after a timeout still lands.
    packet_index: HashMap<PacketId, (String, String)>,
    events: Receiver<DeliveryEvent>,
    #[cfg(test)]
    events_tx: crossbeam::channel::Sender<DeliveryEvent>,
    last_send: Option<Instant>,
    /// Last receipt prompt per hostname.
    prompts: HashMap<String, Instant>,
    rng: XorShift64,
    stats: SenderStats,
    io_throttle: Throttle,
}

impl OverlaySender {
    /// Create the sender and register its overlay callbacks: delivery events
    /// feed the tick's queue, received packets land raw in `incoming/`.
    pub fn new(
        config: SenderConfig,
        spool: Arc<Spool>,
        transport: Arc<dyn OverlayTransport>,
        status_path: impl Into<PathBuf>,
        peers_path: impl Into<PathBuf>,
    ) -> Self {
        let (tx, rx) = bounded::<DeliveryEvent>(EVENT_QUEUE_DEPTH);

        let overflow_throttle = Arc::new(Mutex::new(Throttle::new(Duration::from_secs(60))));
        let delivery_tx = tx.clone();
        let throttle = overflow_throttle.clone();
        transport.set_delivery_handler(Box::new(move |event| {
            if delivery_tx.try_send(event).is_err() && throttle.lock().allow() {
                log::warn!("[ROS] delivery event queue full; event dropped");
            }
        }));

        let incoming_spool = spool.clone();
        let incoming_throttle = overflow_throttle;
        transport.set_packet_handler(Box::new(move |payload| {
            // Raw bytes only; decompression is the bridge's job.
            if let Err(e) = incoming_spool.write(Stage::Incoming, &payload) {
                if incoming_throttle.lock().allow() {
                    log::warn!("[ROS] incoming spool write failed: {e}");
                }
            }
        }));

        Self {
            config,
            spool,
            transport,
            status: CachedReader::new(status_path),
            peers: CachedReader::new(peers_path),
            records: HashMap::new(),
            packet_index: HashMap::new(),
            events: rx,
            #[cfg(test)]
            events_tx: tx,
            last_send: None,
            prompts: HashMap::new(),
            rng: XorShift64::from_clock(),
            stats: SenderStats::default(),
            io_throttle: Throttle::new(Duration::from_secs(60)),
        }
    }

    /// Run the 1 Hz loop until `quit` is set.
    pub fn run(&mut self, quit: Arc<AtomicBool>) {
        log::info!(
            "[ROS] draining {} (spacing {:?}, {} attempts max)",
            self.spool.dir(Stage::Pending).display(),
            self.config.send_spacing,
            self.config.retry_max_attempts
        );
        while !quit.load(Ordering::Relaxed) {
            self.tick(&quit);
            sleep_with_quit(self.config.tick_interval, &quit);
        }
        log::info!("[ROS] stopped");
    }

    /// One cycle of the main loop.
    pub fn tick(&mut self, quit: &AtomicBool) {
        self.drain_events();

        let (target_set, destinations) = self.gating_state();

        // Pacing gate at tick granularity: a closed gate skips send work.
        if self.gate_open() {
            self.first_send_pass(&target_set, &destinations, quit);
            self.retry_pass(&target_set, &destinations, quit);
        }

        self.receipt_prompt_pass(&destinations);
        // Prompts may have flushed receipts synchronously; take them now so
        // finished files are retired this tick.
        self.drain_events();
        self.cleanup_pass();
    }

    /// Snapshot counters.
    pub fn stats(&self) -> SenderStats {
        self.stats.clone()
    }

    /// Apply queued delivery/timeout events to the table.
    fn drain_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            match event {
                DeliveryEvent::Delivered { packet, rtt } => {
                    let Some((file, hostname)) = self.packet_index.get(&packet) else {
                        continue;
                    };
                    if let Some(target) = self
                        .records
                        .get_mut(file)
                        .and_then(|r| r.targets.get_mut(hostname))
                    {
                        if !target.delivered {
                            target.delivered = true;
                            self.stats.delivered += 1;
                            self.stats.last_rtt = Some(rtt);
                            log::debug!("[ROS] {hostname} confirmed {file} (rtt {rtt:?})");
                        }
                    }
                }
                // A timeout leaves delivered=false; the retry pass decides
                // what happens next. The packet stays indexed so a receipt
                // arriving after the timeout still flips the record.
                DeliveryEvent::Timeout { .. } => self.stats.timeouts += 1,
            }
        }
    }

    /// Current target set (SLOW and discovered, sorted) plus the destination
    /// fingerprints of every discovered peer.
    fn gating_state(&mut self) -> (BTreeSet<String>, HashMap<String, DestinationHash>) {
        let slow: BTreeSet<String> = self
            .status
            .read()
            .map(|doc| doc.slow_hostnames().into_iter().collect())
            .unwrap_or_default();

        let mut destinations = HashMap::new();
        if let Some(doc) = self.peers.read() {
            for (hostname, entry) in &doc.peers {
                if let Some(dest) = entry.destination() {
                    destinations.insert(hostname.clone(), dest);
                }
            }
        }

        let target_set = slow
            .into_iter()
            .filter(|hostname| destinations.contains_key(hostname))
            .collect();
        (target_set, destinations)
    }

    fn gate_open(&self) -> bool {
        self.last_send
            .map_or(true, |t| t.elapsed() >= self.config.send_spacing)
    }

    /// Block until the pacing gate opens; false if `quit` fired first.
    fn pace_wait(last_send: &Option<Instant>, spacing: Duration, quit: &AtomicBool) -> bool {
        loop {
            if quit.load(Ordering::Relaxed) {
                return false;
            }
            let Some(last) = last_send else { return true };
            let elapsed = last.elapsed();
            if elapsed >= spacing {
                return true;
            }
            std::thread::sleep((spacing - elapsed).min(Duration::from_millis(25)));
        }
    }

    /// Send every pending file to every target once, then move it to
    /// `sent_buffer/`. An empty target set leaves pending untouched.
    fn first_send_pass(
        &mut self,
        target_set: &BTreeSet<String>,
        destinations: &HashMap<String, DestinationHash>,
        quit: &AtomicBool,
    ) {
        if target_set.is_empty() {
            return;
        }
        let files = match self.spool.list(Stage::Pending) {
            Ok(files) => files,
            Err(e) => {
                if self.io_throttle.allow() {
                    log::warn!("[ROS] pending list failed: {e}");
                }
                return;
            }
        };

        for path in files {
            let name = file_name_of(&path);
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    if self.io_throttle.allow() {
                        log::warn!("[ROS] read {name} failed: {e}");
                    }
                    continue;
                }
            };

            let mut record = FileRecord::default();
            for hostname in target_set {
                if !Self::pace_wait(&self.last_send, self.config.send_spacing, quit) {
                    return;
                }
                let Some(dest) = destinations.get(hostname) else {
                    continue;
                };
                let now = Instant::now();
                let mut state = TargetState {
                    delivered: false,
                    retry_count: 0,
                    sent_at: Some(now),
                    next_eligible_at: now + self.backoff_delay(0),
                };
                match self.transport.send_with_receipt(*dest, &bytes) {
                    Ok(packet) => {
                        self.last_send = Some(Instant::now());
                        self.stats.first_sends += 1;
                        self.packet_index
                            .insert(packet, (name.clone(), hostname.clone()));
                        log::debug!("[ROS] sent {name} to {hostname} ({} bytes)", bytes.len());
                    }
                    Err(e) => {
                        // Counts as the attempt; the schedule advances as if
                        // the receipt had timed out.
                        self.stats.send_errors += 1;
                        state.next_eligible_at = now + self.backoff_delay(0);
                        if self.io_throttle.allow() {
                            log::warn!("[ROS] send {name} to {hostname} failed: {e}");
                        }
                    }
                }
                record.targets.insert(hostname.clone(), state);
            }

            match self.spool.promote(&path, Stage::SentBuffer) {
                Ok(_) => {
                    self.records.insert(name, record);
                }
                Err(e) => {
                    // File stays pending and will be re-sent next tick;
                    // receiver-side dedup absorbs the duplicates.
                    if self.io_throttle.allow() {
                        log::warn!("[ROS] promote {name} failed: {e}");
                    }
                }
            }
        }
    }

    /// Re-send to undelivered targets whose backoff timer has expired.
    fn retry_pass(
        &mut self,
        target_set: &BTreeSet<String>,
        destinations: &HashMap<String, DestinationHash>,
        quit: &AtomicBool,
    ) {
        let files = match self.spool.list(Stage::SentBuffer) {
            Ok(files) => files,
            Err(e) => {
                if self.io_throttle.allow() {
                    log::warn!("[ROS] sent_buffer list failed: {e}");
                }
                return;
            }
        };

        for path in files {
            let name = file_name_of(&path);

            // A file with no record was inherited from a previous process
            // life; rebuild its record against the current target set (it
            // was already sent at least once, so re-sends are duplicates the
            // receiver-side dedup suppresses).
            if !self.records.contains_key(&name) {
                let mut record = FileRecord::default();
                let now = Instant::now();
                for hostname in target_set {
                    record.targets.insert(
                        hostname.clone(),
                        TargetState {
                            delivered: false,
                            retry_count: 0,
                            sent_at: None,
                            next_eligible_at: now,
                        },
                    );
                }
                log::debug!("[ROS] rebuilt delivery record for inherited {name}");
                self.records.insert(name.clone(), record);
            }

            let mut bytes: Option<Vec<u8>> = None;
            let hostnames: Vec<String> = match self.records.get(&name) {
                Some(record) => record.targets.keys().cloned().collect(),
                None => continue,
            };
            for hostname in hostnames {
                let eligible = {
                    let Some(target) = self
                        .records
                        .get(&name)
                        .and_then(|r| r.targets.get(&hostname))
                    else {
                        continue;
                    };
                    !target.delivered
                        && target.retry_count < self.config.retry_max_attempts
                        && target_set.contains(&hostname)
                        && target.next_eligible_at <= Instant::now()
                };
                if !eligible {
                    continue;
                }
                let Some(dest) = destinations.get(&hostname).copied() else {
                    continue;
                };

                if bytes.is_none() {
                    match std::fs::read(&path) {
                        Ok(read) => bytes = Some(read),
                        Err(e) => {
                            if self.io_throttle.allow() {
                                log::warn!("[ROS] read {name} failed: {e}");
                            }
                            break;
                        }
                    }
                }
                let Some(payload) = bytes.as_deref() else { break };

                if !Self::pace_wait(&self.last_send, self.config.send_spacing, quit) {
                    return;
                }
                // Destination resolved from the live peer table, so a peer
                // that restarted with a new fingerprint gets the retry at
                // its new address.
                let now = Instant::now();
                let outcome = self.transport.send_with_receipt(dest, payload);
                let attempt_count;
                {
                    let Some(target) = self
                        .records
                        .get_mut(&name)
                        .and_then(|r| r.targets.get_mut(&hostname))
                    else {
                        continue;
                    };
                    target.retry_count += 1;
                    target.sent_at = Some(now);
                    attempt_count = target.retry_count;
                }
                let delay = self.backoff_delay(attempt_count);
                if let Some(target) = self
                    .records
                    .get_mut(&name)
                    .and_then(|r| r.targets.get_mut(&hostname))
                {
                    target.next_eligible_at = now + delay;
                }

                match outcome {
                    Ok(packet) => {
                        self.last_send = Some(Instant::now());
                        self.stats.retries += 1;
                        self.packet_index
                            .insert(packet, (name.clone(), hostname.clone()));
                        log::debug!(
                            "[ROS] retry {attempt_count}/{} of {name} to {hostname}",
                            self.config.retry_max_attempts
                        );
                    }
                    Err(e) => {
                        self.stats.send_errors += 1;
                        if self.io_throttle.allow() {
                            log::warn!("[ROS] retry of {name} to {hostname} failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// Touch the per-peer overlay API for every sent-but-unconfirmed target
    /// so the library processes pending receipts. At most once per
    /// `receipt_prompt_interval` per peer.
    fn receipt_prompt_pass(&mut self, destinations: &HashMap<String, DestinationHash>) {
        let mut due_hosts: BTreeSet<&String> = BTreeSet::new();
        for record in self.records.values() {
            for (hostname, target) in &record.targets {
                if target.delivered || target.sent_at.is_none() {
                    continue;
                }
                let prompted_recently = self
                    .prompts
                    .get(hostname)
                    .map_or(false, |t| t.elapsed() < self.config.receipt_prompt_interval);
                if !prompted_recently {
                    due_hosts.insert(hostname);
                }
            }
        }

        let due: Vec<String> = due_hosts.into_iter().cloned().collect();
        for hostname in due {
            let Some(dest) = destinations.get(&hostname) else {
                continue;
            };
            let _ = self.transport.recall_identity(*dest);
            self.prompts.insert(hostname.clone(), Instant::now());
            self.stats.receipt_prompts += 1;
        }
    }

    /// Retire finished files and drop state for files that vanished
    /// (e.g. purged by the bridge during quiescence).
    fn cleanup_pass(&mut self) {
        let files = match self.spool.list(Stage::SentBuffer) {
            Ok(files) => files,
            Err(e) => {
                if self.io_throttle.allow() {
                    log::warn!("[ROS] sent_buffer list failed: {e}");
                }
                return;
            }
        };

        let mut present: BTreeSet<String> = BTreeSet::new();
        for path in &files {
            present.insert(file_name_of(path));
        }

        for path in files {
            let name = file_name_of(&path);
            let finished = self
                .records
                .get(&name)
                .map(|r| (r.finished(self.config.retry_max_attempts), r.fully_delivered()));
            let Some((finished, fully_delivered)) = finished else {
                continue;
            };
            if !finished {
                continue;
            }
            match self.spool.remove(&path) {
                Ok(()) => {
                    if fully_delivered {
                        self.stats.completed_files += 1;
                        log::info!("[ROS] {name} delivered to all targets");
                    } else {
                        self.stats.exhausted_files += 1;
                        log::warn!("[ROS] {name} dropped after exhausting retries");
                    }
                    present.remove(&name);
                    self.records.remove(&name);
                }
                Err(e) => {
                    if self.io_throttle.allow() {
                        log::warn!("[ROS] remove {name} failed: {e}");
                    }
                }
            }
        }

        // Records whose file disappeared underneath us have nothing left to
        // track; prune them and their packet index entries.
        self.records.retain(|name, _| present.contains(name));
        let records = &self.records;
        self.packet_index
            .retain(|_, (file, _)| records.contains_key(file));
    }

    /// Backoff delay after `attempt_count` attempts, jittered.
    fn backoff_delay(&mut self, attempt_count: u32) -> Duration {
        backoff_delay(&self.config, &mut self.rng, attempt_count)
    }
}

/// `min(initial * factor^count, max) * (1 + U[-jitter, +jitter])`.
fn backoff_delay(config: &SenderConfig, rng: &mut XorShift64, attempt_count: u32) -> Duration {
    let base = config.retry_initial_delay.as_secs_f64()
        * config.retry_backoff_factor.powi(attempt_count as i32);
    let capped = base.min(config.retry_max_delay.as_secs_f64());
    let jitter = if config.retry_jitter > 0.0 {
        1.0 + rng.range_f64(-config.retry_jitter, config.retry_jitter)
    } else {
        1.0
    };
    Duration::from_secs_f64((capped * jitter).max(0.0))
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
