// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Dictionary-assisted payload compression.
//!
//! CoT events are small, highly repetitive XML documents, so a preset deflate
//! dictionary buys a large ratio win on payloads that are individually too
//! short for the encoder to build its own history. The dictionary is loaded
//! once and owned by the codec; both directions must use the same blob.
//!
//! # Contract
//!
//! - `compress` returns bytes only if the result fits `max_bytes`
//!   (default 350, the single-packet budget of the overlay radio path);
//!   otherwise `CodecError::SizeExceeded`.
//! - `decompress` inverts `compress` exactly or fails with
//!   `CodecError::DecompressFailed`.
//! - Failures are per-payload; the codec stays usable.

use std::path::Path;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use parking_lot::Mutex;
use thiserror::Error;

/// Hard cap on compressed output size (bytes).
pub const DEFAULT_MAX_BYTES: usize = 350;

/// Default deflate level. Payloads are tiny; spend CPU for ratio.
pub const DEFAULT_LEVEL: u32 = 9;

/// Ceiling on decompressed output, to stop corrupt or hostile payloads from
/// ballooning. Multicast datagrams are at most 64 KiB before compression.
const MAX_DECOMPRESSED: usize = 1 << 20;

/// Preset dictionary trained on CoT event traffic. Most frequent fragments
/// last, per the deflate dictionary convention.
pub const DEFAULT_DICTIONARY: &[u8] = concat!(
    r#"<takv device=" platform="ATAK" os=" version="/>"#,
    r#"<track speed=" course="/><status battery="/>"#,
    r#"<precisionlocation geopointsrc="GPS" altsrc="GPS"/>"#,
    r#"<__group name="Cyan" role="Team Member"/>"#,
    r#"<contact callsign=" endpoint="*:-1:stcp"/>"#,
    r#"<detail>"#,
    r#"</detail></event>"#,
    r#"le="9999999.0" ce="9999999.0" hae="#,
    r#"<point lat=" lon=" hae=" ce=" le="/>"#,
    r#"uid="ANDROID-"#,
    r#" how="m-g" type="a-f-G-U-C""#,
    r#".000000Z" stale=" start=" time="#,
    r#"<event version="2.0" "#,
    r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
)
.as_bytes();

/// Codec failure modes. All are per-payload and non-fatal.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Compressed output would not fit the radio packet budget.
    #[error("compressed size {size} exceeds cap {max}")]
    SizeExceeded { size: usize, max: usize },

    /// The deflate encoder rejected the payload.
    #[error("compression failed: {0}")]
    CompressFailed(String),

    /// The payload is not a valid deflate stream for this dictionary.
    #[error("decompression failed: {0}")]
    DecompressFailed(String),

    /// Dictionary file could not be read.
    #[error("dictionary load failed: {0}")]
    DictionaryLoad(#[from] std::io::Error),
}

/// Codec counters.
#[derive(Debug, Default, Clone)]
pub struct CodecStats {
    /// Payloads compressed successfully.
    pub compressed: u64,
    /// Payloads rejected by the size cap.
    pub size_exceeded: u64,
    /// Encoder failures.
    pub compress_failed: u64,
    /// Payloads decompressed successfully.
    pub decompressed: u64,
    /// Decoder failures.
    pub decompress_failed: u64,
    /// Total bytes in (compress direction).
    pub bytes_in: u64,
    /// Total bytes out (compress direction).
    pub bytes_out: u64,
}

impl CodecStats {
    /// Overall ratio, 1.0 = no savings.
    pub fn ratio(&self) -> f64 {
        if self.bytes_in == 0 {
            1.0
        } else {
            self.bytes_out as f64 / self.bytes_in as f64
        }
    }
}

/// Dictionary deflate codec. Cheap to share behind an `Arc`.
pub struct DictCodec {
    dict: Vec<u8>,
    level: u32,
    max_bytes: usize,
    stats: Mutex<CodecStats>,
}

impl std::fmt::Debug for DictCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DictCodec")
            .field("dict_len", &self.dict.len())
            .field("level", &self.level)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

impl DictCodec {
    /// Create a codec with an explicit dictionary.
    pub fn new(dict: Vec<u8>, level: u32, max_bytes: usize) -> Self {
        Self {
            dict,
            level,
            max_bytes,
            stats: Mutex::new(CodecStats::default()),
        }
    }

    /// Create a codec with the built-in CoT dictionary and defaults.
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_DICTIONARY.to_vec(), DEFAULT_LEVEL, DEFAULT_MAX_BYTES)
    }

    /// Load the dictionary from a file (shipped as an opaque blob).
    pub fn from_dictionary_file(
        path: impl AsRef<Path>,
        level: u32,
        max_bytes: usize,
    ) -> Result<Self, CodecError> {
        let dict = std::fs::read(path)?;
        Ok(Self::new(dict, level, max_bytes))
    }

    /// Compressed-size cap in effect.
    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Compress `payload`; returns the bytes iff they fit `max_bytes`.
    pub fn compress(&self, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut enc = Compress::new(Compression::new(self.level), false);
        enc.set_dictionary(&self.dict)
            .map_err(|e| CodecError::CompressFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(payload.len() + 64);
        loop {
            let consumed = enc.total_in() as usize;
            let status = enc
                .compress_vec(&payload[consumed..], &mut out, FlushCompress::Finish)
                .map_err(|e| {
                    self.stats.lock().compress_failed += 1;
                    CodecError::CompressFailed(e.to_string())
                })?;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => out.reserve(256),
            }
        }

        if out.len() > self.max_bytes {
            let mut stats = self.stats.lock();
            stats.size_exceeded += 1;
            return Err(CodecError::SizeExceeded {
                size: out.len(),
                max: self.max_bytes,
            });
        }

        let mut stats = self.stats.lock();
        stats.compressed += 1;
        stats.bytes_in += payload.len() as u64;
        stats.bytes_out += out.len() as u64;
        Ok(out)
    }

    /// Decompress bytes produced by `compress` with the same dictionary.
    pub fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>, CodecError> {
        let mut dec = Decompress::new(false);
        dec.set_dictionary(&self.dict)
            .map_err(|e| CodecError::DecompressFailed(e.to_string()))?;

        let mut out = Vec::with_capacity(bytes.len() * 4 + 256);
        loop {
            let in_before = dec.total_in() as usize;
            let out_before = out.len();
            let status = dec
                .decompress_vec(&bytes[in_before..], &mut out, FlushDecompress::Finish)
                .map_err(|e| {
                    self.stats.lock().decompress_failed += 1;
                    CodecError::DecompressFailed(e.to_string())
                })?;
            match status {
                Status::StreamEnd => break,
                Status::Ok | Status::BufError => {
                    if out.len() > MAX_DECOMPRESSED {
                        self.stats.lock().decompress_failed += 1;
                        return Err(CodecError::DecompressFailed(
                            "decompressed payload exceeds sanity limit".into(),
                        ));
                    }
                    if dec.total_in() as usize == in_before && out.len() == out_before {
                        // No forward progress: truncated stream.
                        self.stats.lock().decompress_failed += 1;
                        return Err(CodecError::DecompressFailed(
                            "truncated deflate stream".into(),
                        ));
                    }
                    out.reserve(1024);
                }
            }
        }

        self.stats.lock().decompressed += 1;
        Ok(out)
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CodecStats {
        self.stats.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_EVENT: &str = concat!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#,
        r#"<event version="2.0" uid="ANDROID-352a7e40" type="a-f-G-U-C" "#,
        r#"time="2025-11-02T18:31:07.000000Z" start="2025-11-02T18:31:07.000000Z" "#,
        r#"stale="2025-11-02T18:37:22.000000Z" how="m-g">"#,
        r#"<point lat="34.052235" lon="-118.243683" hae="89.2" ce="4.9" le="9999999.0"/>"#,
        r#"<detail><contact callsign="VIPER 3" endpoint="*:-1:stcp"/>"#,
        r#"<__group name="Cyan" role="Team Member"/>"#,
        r#"<takv device="SAMSUNG SM-G781U" platform="ATAK" os="30" version="4.10.0"/>"#,
        r#"<track speed="1.2" course="213.4"/><status battery="77"/>"#,
        r#"<precisionlocation geopointsrc="GPS" altsrc="GPS"/></detail></event>"#,
    );

    #[test]
    fn test_roundtrip_cot_event() {
        let codec = DictCodec::with_defaults();
        let compressed = codec.compress(SAMPLE_EVENT.as_bytes()).unwrap();
        assert!(compressed.len() <= DEFAULT_MAX_BYTES);
        let restored = codec.decompress(&compressed).unwrap();
        assert_eq!(restored, SAMPLE_EVENT.as_bytes());
    }

    #[test]
    fn test_dictionary_beats_payload_size() {
        let codec = DictCodec::with_defaults();
        let compressed = codec.compress(SAMPLE_EVENT.as_bytes()).unwrap();
        assert!(
            compressed.len() < SAMPLE_EVENT.len() / 2,
            "dictionary compression too weak: {} -> {}",
            SAMPLE_EVENT.len(),
            compressed.len()
        );
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        let codec = DictCodec::with_defaults();
        let compressed = codec.compress(&[]).unwrap();
        assert_eq!(codec.decompress(&compressed).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_size_cap_rejects_incompressible() {
        let codec = DictCodec::new(DEFAULT_DICTIONARY.to_vec(), DEFAULT_LEVEL, 64);
        // Pseudo-random bytes do not compress below the tiny cap.
        let noise: Vec<u8> = (0u32..4096)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        match codec.compress(&noise) {
            Err(CodecError::SizeExceeded { size, max }) => {
                assert!(size > max);
                assert_eq!(max, 64);
            }
            other => panic!("expected SizeExceeded, got {:?}", other.map(|v| v.len())),
        }
        assert_eq!(codec.stats().size_exceeded, 1);
    }

    #[test]
    fn test_decompress_garbage_fails() {
        let codec = DictCodec::with_defaults();
        assert!(codec.decompress(&[0xDE, 0xAD, 0xBE, 0xEF, 0xFF]).is_err());
        assert!(codec.stats().decompress_failed >= 1);
    }

    #[test]
    fn test_decompress_truncated_fails() {
        let codec = DictCodec::with_defaults();
        let compressed = codec.compress(SAMPLE_EVENT.as_bytes()).unwrap();
        let truncated = &compressed[..compressed.len() / 2];
        assert!(codec.decompress(truncated).is_err());
    }

    #[test]
    fn test_inputs_not_mutated_and_codec_reusable() {
        let codec = DictCodec::with_defaults();
        let payload = SAMPLE_EVENT.as_bytes().to_vec();
        let c1 = codec.compress(&payload).unwrap();
        let c2 = codec.compress(&payload).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(payload, SAMPLE_EVENT.as_bytes());
        assert_eq!(codec.stats().compressed, 2);
    }

    #[test]
    fn test_stats_ratio() {
        let codec = DictCodec::with_defaults();
        let _ = codec.compress(SAMPLE_EVENT.as_bytes()).unwrap();
        let stats = codec.stats();
        assert!(stats.ratio() < 1.0);
        assert_eq!(stats.bytes_in, SAMPLE_EVENT.len() as u64);
    }
}
