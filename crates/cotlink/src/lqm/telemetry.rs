// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Mesh telemetry sources for the link monitor.
//!
//! The monitor only needs one thing from the mesh layer: how long ago each
//! originator was last heard. That is abstracted as [`TelemetrySource`] so
//! the mesh daemon can be swapped; the current implementation reads the
//! BATMAN-adv originator table (`batctl o` output or the kernel debugfs
//! file), tolerating both the TQ and the throughput table layouts.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::Throttle;

/// One originator row: a remote mesh node as the mesh layer sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct OriginatorSample {
    /// Node MAC, lowercased.
    pub mac: String,
    /// Seconds since the last originator message.
    pub last_seen: f64,
    /// Link metric from the table (TQ or Mbit/s), carried opaquely.
    pub throughput: Option<f64>,
    /// Best next hop toward the node, if listed.
    pub nexthop: Option<String>,
}

/// Telemetry failure. The monitor treats an unavailable source as
/// "every node unheard", it never gives up.
#[derive(Debug, Clone, Error)]
pub enum TelemetryError {
    #[error("telemetry source unavailable: {0}")]
    Unavailable(String),
}

/// Source of originator samples, polled once per monitor tick.
pub trait TelemetrySource: Send {
    /// Take one sample of all currently known originators.
    fn sample(&mut self) -> Result<Vec<OriginatorSample>, TelemetryError>;
}

/// BATMAN-adv originator-table reader.
#[derive(Debug)]
pub struct BatmanOriginators {
    path: PathBuf,
    warn_throttle: Throttle,
}

/// Default kernel location of the originator table.
pub const DEFAULT_ORIGINATORS_PATH: &str = "/sys/kernel/debug/batman_adv/bat0/originators";

impl BatmanOriginators {
    /// Read the originator table from `path` on every sample.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            warn_throttle: Throttle::new(Duration::from_secs(60)),
        }
    }
}

impl TelemetrySource for BatmanOriginators {
    fn sample(&mut self) -> Result<Vec<OriginatorSample>, TelemetryError> {
        let text = std::fs::read_to_string(&self.path)
            .map_err(|e| TelemetryError::Unavailable(format!("{}: {e}", self.path.display())))?;
        let (samples, skipped) = parse_originators(&text);
        if skipped > 0 && self.warn_throttle.allow() {
            log::warn!(
                "[LQM] skipped {skipped} unparsable originator line(s) in {}",
                self.path.display()
            );
        }
        Ok(samples)
    }
}

/// Parse an originator table. Returns the samples and the count of lines
/// that looked like data but could not be parsed.
pub fn parse_originators(text: &str) -> (Vec<OriginatorSample>, usize) {
    let mut samples: Vec<OriginatorSample> = Vec::new();
    let mut skipped = 0;

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty()
            || line.starts_with('[')
            || line.starts_with("Originator")
            || line.starts_with("No batman")
        {
            continue;
        }

        let starred = line.starts_with('*');
        let line = line.trim_start_matches('*').trim_start();

        let mut tokens = line.split_whitespace();
        let Some(mac) = tokens.next().filter(|t| is_mac(t)) else {
            skipped += 1;
            continue;
        };
        let Some(last_seen) = tokens.next().and_then(parse_last_seen) else {
            skipped += 1;
            continue;
        };

        // Metric sits in parentheses; layout varies between table versions.
        let throughput = line
            .split_once('(')
            .and_then(|(_, rest)| rest.split_once(')'))
            .and_then(|(metric, _)| metric.trim().trim_start_matches('#').trim().parse().ok());

        let nexthop = line
            .split_once(')')
            .map(|(_, rest)| rest)
            .and_then(|rest| rest.split_whitespace().find(|t| is_mac(t)))
            .map(str::to_lowercase);

        let sample = OriginatorSample {
            mac: mac.to_lowercase(),
            last_seen,
            throughput,
            nexthop,
        };

        // Multi-interface tables repeat originators; the starred row is the
        // selected path and wins.
        match samples.iter_mut().find(|s| s.mac == sample.mac) {
            Some(existing) if starred => *existing = sample,
            Some(_) => {}
            None => samples.push(sample),
        }
    }

    (samples, skipped)
}

fn parse_last_seen(token: &str) -> Option<f64> {
    token.strip_suffix('s')?.parse().ok()
}

fn is_mac(token: &str) -> bool {
    let bytes = token.as_bytes();
    bytes.len() == 17
        && bytes.chunks(3).all(|chunk| {
            chunk[0].is_ascii_hexdigit()
                && chunk[1].is_ascii_hexdigit()
                && (chunk.len() == 2 || chunk[2] == b':')
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TABLE_TQ: &str = "\
[B.A.T.M.A.N. adv 2022.3, MainIF/MAC: wlan0/aa:bb:cc:dd:ee:01 (bat0/aa:bb:cc:dd:ee:01 BATMAN_IV)]
   Originator        last-seen (#/255) Nexthop           [outgoingIF]
 * aa:bb:cc:dd:ee:02    0.790s   (255) aa:bb:cc:dd:ee:02 [     wlan0]
 * aa:bb:cc:dd:ee:03    4.310s   ( 86) aa:bb:cc:dd:ee:02 [     wlan0]
";

    const TABLE_THROUGHPUT: &str = "\
[B.A.T.M.A.N. adv 2023.1, MainIF/MAC: wlan0/aa:bb:cc:dd:ee:01 (bat0/aa:bb:cc:dd:ee:01 BATMAN_V)]
   Originator        last-seen ( throughput)  Nexthop           [outgoingIF]
 * AA:BB:CC:DD:EE:02    0.330s   (       10.0) aa:bb:cc:dd:ee:02 [     wlan0]
";

    #[test]
    fn test_parse_tq_table() {
        let (samples, skipped) = parse_originators(TABLE_TQ);
        assert_eq!(skipped, 0);
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].mac, "aa:bb:cc:dd:ee:02");
        assert!((samples[0].last_seen - 0.79).abs() < 1e-9);
        assert_eq!(samples[0].throughput, Some(255.0));
        assert_eq!(samples[0].nexthop.as_deref(), Some("aa:bb:cc:dd:ee:02"));
        assert!((samples[1].last_seen - 4.31).abs() < 1e-9);
    }

    #[test]
    fn test_parse_throughput_table_lowercases_mac() {
        let (samples, skipped) = parse_originators(TABLE_THROUGHPUT);
        assert_eq!(skipped, 0);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].mac, "aa:bb:cc:dd:ee:02");
        assert_eq!(samples[0].throughput, Some(10.0));
    }

    #[test]
    fn test_starred_row_wins_over_alternate_path() {
        let table = "\
   aa:bb:cc:dd:ee:02    9.990s   ( 12) aa:bb:cc:dd:ee:09 [     wlan1]
 * aa:bb:cc:dd:ee:02    0.150s   (200) aa:bb:cc:dd:ee:02 [     wlan0]
";
        let (samples, _) = parse_originators(table);
        assert_eq!(samples.len(), 1);
        assert!((samples[0].last_seen - 0.15).abs() < 1e-9);
        assert_eq!(samples[0].throughput, Some(200.0));
    }

    #[test]
    fn test_garbage_lines_counted_not_fatal() {
        let table = "\
 * aa:bb:cc:dd:ee:02    0.790s   (255) aa:bb:cc:dd:ee:02 [     wlan0]
 * this is not an originator row
 * aa:bb:cc:dd:ee:03    broken   (255) aa:bb:cc:dd:ee:02 [     wlan0]
";
        let (samples, skipped) = parse_originators(table);
        assert_eq!(samples.len(), 1);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_empty_table_is_empty_not_error() {
        let (samples, skipped) = parse_originators("");
        assert!(samples.is_empty());
        assert_eq!(skipped, 0);
    }

    #[test]
    fn test_missing_file_is_unavailable() {
        let mut source = BatmanOriginators::new("/nonexistent/originators");
        assert!(matches!(
            source.sample(),
            Err(TelemetryError::Unavailable(_))
        ));
    }

    #[test]
    fn test_source_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("originators");
        std::fs::write(&path, TABLE_TQ).unwrap();
        let mut source = BatmanOriginators::new(&path);
        assert_eq!(source.sample().unwrap().len(), 2);
    }
}
