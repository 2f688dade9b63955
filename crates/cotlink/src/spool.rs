// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! On-disk spool shared between the packet bridge and the overlay sender.
//!
//! The spool IS the inter-process queue. A payload lives in exactly one of
//! three stage directories; its filename encodes a millisecond timestamp plus
//! a per-process sequence, so a lexicographic sort of names is oldest-first.
//! Every write goes to a dot-tmp file first and is renamed into place, and
//! every stage move is a rename within the same filesystem. Rename atomicity
//! is the only durability and ordering mechanism; nothing else may be relied
//! on.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

use crate::util::unix_now_millis;

/// Extension for spooled payloads.
pub const SPOOL_EXT: &str = "pkt";

/// Extension while a file is claimed for processing.
const CLAIM_EXT: &str = "claim";

/// Spool failure; always transient from the caller's point of view.
#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("spool I/O: {0}")]
    Io(#[from] std::io::Error),
}

/// The three lifecycle stages, encoded as directory membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Compressed payloads awaiting their first overlay send.
    Pending,
    /// Sent at least once; awaiting delivery confirmation or retry.
    SentBuffer,
    /// Received from the overlay; awaiting local multicast delivery.
    Incoming,
}

impl Stage {
    /// All stages, in pipeline order.
    pub const ALL: [Stage; 3] = [Stage::Pending, Stage::SentBuffer, Stage::Incoming];

    fn dir_name(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::SentBuffer => "sent_buffer",
            Stage::Incoming => "incoming",
        }
    }
}

/// Handle to the three-directory spool.
#[derive(Debug)]
pub struct Spool {
    root: PathBuf,
    seq: AtomicU64,
}

impl Spool {
    /// Open (and create if needed) a spool rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, SpoolError> {
        let root = root.into();
        for stage in Stage::ALL {
            fs::create_dir_all(root.join(stage.dir_name()))?;
        }
        Ok(Self {
            root,
            seq: AtomicU64::new(0),
        })
    }

    /// Directory of a stage.
    pub fn dir(&self, stage: Stage) -> PathBuf {
        self.root.join(stage.dir_name())
    }

    /// Next spool filename: zero-padded millisecond timestamp plus sequence,
    /// so string order equals arrival order even within one millisecond.
    fn next_name(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) % 1_000_000;
        format!("{:013}-{:06}.{}", unix_now_millis(), seq, SPOOL_EXT)
    }

    /// Atomically write `bytes` as a new file in `stage`.
    pub fn write(&self, stage: Stage, bytes: &[u8]) -> Result<PathBuf, SpoolError> {
        let dir = self.dir(stage);
        let name = self.next_name();
        let tmp = dir.join(format!(".{name}.tmp"));
        let dest = dir.join(&name);
        fs::write(&tmp, bytes)?;
        if let Err(e) = fs::rename(&tmp, &dest) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(dest)
    }

    /// List the stage's payload files, oldest first.
    pub fn list(&self, stage: Stage) -> Result<Vec<PathBuf>, SpoolError> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.dir(stage))?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().map(|e| e == SPOOL_EXT).unwrap_or(false))
            .collect();
        files.sort();
        Ok(files)
    }

    /// Move a file to another stage, keeping its name (and thus its age).
    pub fn promote(&self, path: &Path, to: Stage) -> Result<PathBuf, SpoolError> {
        let name = path
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no file name"))?;
        let dest = self.dir(to).join(name);
        fs::rename(path, &dest)?;
        Ok(dest)
    }

    /// Claim a file for processing by renaming it to a scratch name in the
    /// same directory. The caller unlinks the returned path after successful
    /// processing; a crash in between leaves the claim file for `recover`.
    pub fn claim(&self, path: &Path) -> Result<PathBuf, SpoolError> {
        let mut claimed = path.as_os_str().to_owned();
        claimed.push(".");
        claimed.push(CLAIM_EXT);
        let claimed = PathBuf::from(claimed);
        fs::rename(path, &claimed)?;
        Ok(claimed)
    }

    /// Return files orphaned by a crash mid-claim to their stage. Call once
    /// at startup, before the first drain pass; the stage is single-consumer.
    pub fn recover(&self, stage: Stage) -> Result<usize, SpoolError> {
        let mut recovered = 0;
        for entry in fs::read_dir(self.dir(stage))? {
            let path = entry?.path();
            if path.extension().map(|e| e == CLAIM_EXT).unwrap_or(false) {
                let original = path.with_extension("");
                fs::rename(&path, &original)?;
                recovered += 1;
            }
        }
        if recovered > 0 {
            log::info!(
                "[SPOOL] recovered {} claimed file(s) in {}",
                recovered,
                stage.dir_name()
            );
        }
        Ok(recovered)
    }

    /// Delete a file; a racing delete is not an error.
    pub fn remove(&self, path: &Path) -> Result<(), SpoolError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every file (payload, claim, or stale tmp) in a stage.
    pub fn purge(&self, stage: Stage) -> Result<usize, SpoolError> {
        let mut removed = 0;
        for entry in fs::read_dir(self.dir(stage))? {
            let path = entry?.path();
            if path.is_file() {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    /// Purge all three stages, reporting how many files went away.
    pub fn purge_all(&self) -> Result<usize, SpoolError> {
        let mut removed = 0;
        for stage in Stage::ALL {
            removed += self.purge(stage)?;
        }
        Ok(removed)
    }

    /// Count of payload files in a stage.
    pub fn len(&self, stage: Stage) -> Result<usize, SpoolError> {
        Ok(self.list(stage)?.len())
    }

    /// True if the stage holds no payload files.
    pub fn is_empty(&self, stage: Stage) -> Result<bool, SpoolError> {
        Ok(self.len(stage)? == 0)
    }
}
