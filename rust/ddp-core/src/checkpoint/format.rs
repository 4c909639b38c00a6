// rust/ddp-core/src/checkpoint/format.rs

//! Checkpoint artifact layout.
//!
//! ```text
//! +------------------------+
//! | header length (u32 LE) |
//! +------------------------+
//! | Header (bincode)       |  <- CheckpointHeader
//! +------------------------+
//! | Compressed payload     |  <- bincode(Checkpoint), compressed per header
//! +------------------------+
//! ```
//!
//! Artifacts are named `<job_id>_epoch_<epoch:05>.ckpt`, one per epoch.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hasher;
use std::str::FromStr;

use twox_hash::XxHash64;

use crate::error::{Result, RuntimeError};

/// Extension shared by every artifact.
pub const ARTIFACT_SUFFIX: &str = ".ckpt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointHeader {
    /// Magic bytes ("DDPC")
    pub magic: [u8; 4],
    pub version: u32,
    /// "none", "lz4" or "zstd"
    pub compression: String,
    pub uncompressed_size: u64,
    /// XxHash64 of the uncompressed payload
    pub checksum: u64,
    pub job_id: String,
    pub epoch: u64,
    pub metadata: HashMap<String, String>,
}

impl CheckpointHeader {
    pub const MAGIC: [u8; 4] = *b"DDPC";
    pub const VERSION: u32 = 1;

    pub fn validate(&self) -> Result<()> {
        if self.magic != Self::MAGIC {
            return Err(RuntimeError::checkpoint_io(format!(
                "invalid magic bytes: expected {:?}, got {:?}",
                Self::MAGIC,
                self.magic
            )));
        }
        if self.version != Self::VERSION {
            return Err(RuntimeError::checkpoint_io(format!(
                "unsupported version: expected {}, got {}",
                Self::VERSION,
                self.version
            )));
        }
        Ok(())
    }
}

/// Payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    /// Parses a configured algorithm name, applying `level` to zstd.
    pub fn from_config(name: &str, level: i32) -> Result<Self> {
        match name.parse()? {
            Compression::Zstd { .. } => Ok(Compression::Zstd { level }),
            other => Ok(other),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Lz4 => "lz4",
            Compression::Zstd { .. } => "zstd",
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
            Compression::Zstd { level } => zstd::encode_all(data, *level)
                .map_err(|e| RuntimeError::checkpoint_io_with_source("zstd compression failed", e)),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            Compression::None => Ok(data.to_vec()),
            Compression::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| RuntimeError::checkpoint_io_with_source("lz4 decompression failed", e)),
            Compression::Zstd { .. } => zstd::decode_all(data)
                .map_err(|e| RuntimeError::checkpoint_io_with_source("zstd decompression failed", e)),
        }
    }
}

impl FromStr for Compression {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Compression::None),
            "lz4" => Ok(Compression::Lz4),
            "zstd" => Ok(Compression::Zstd { level: 3 }),
            other => Err(RuntimeError::checkpoint_io(format!(
                "unknown compression algorithm: {other}"
            ))),
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub fn checksum(data: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    hasher.finish()
}

/// File name of the artifact for `epoch` of `job_id`.
pub fn artifact_name(job_id: &str, epoch: u64) -> String {
    format!("{job_id}_epoch_{epoch:05}{ARTIFACT_SUFFIX}")
}

/// Epoch encoded in an artifact name belonging to `job_id`, if any.
pub fn parse_artifact_epoch(job_id: &str, file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix(job_id)?
        .strip_prefix("_epoch_")?
        .strip_suffix(ARTIFACT_SUFFIX)?
        .parse()
        .ok()
}

/// Wraps an encoded payload in a header and compresses it.
pub fn seal(
    payload: &[u8],
    compression: Compression,
    job_id: &str,
    epoch: u64,
    metadata: HashMap<String, String>,
) -> Result<Vec<u8>> {
    let header = CheckpointHeader {
        magic: CheckpointHeader::MAGIC,
        version: CheckpointHeader::VERSION,
        compression: compression.name().to_string(),
        uncompressed_size: payload.len() as u64,
        checksum: checksum(payload),
        job_id: job_id.to_string(),
        epoch,
        metadata,
    };
    let header_bytes = bincode::serialize(&header)
        .map_err(|e| RuntimeError::checkpoint_io(format!("failed to serialize header: {e}")))?;
    let compressed = compression.compress(payload)?;

    let mut bytes = Vec::with_capacity(4 + header_bytes.len() + compressed.len());
    bytes.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&header_bytes);
    bytes.extend_from_slice(&compressed);
    Ok(bytes)
}

/// Parses and validates the header at the start of `bytes`.
///
/// Returns the header and the offset of the compressed payload.
pub fn parse_header(bytes: &[u8]) -> Result<(CheckpointHeader, usize)> {
    let len_bytes: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| RuntimeError::checkpoint_io("checkpoint artifact too small"))?;
    let header_len = u32::from_le_bytes(len_bytes) as usize;

    let header_bytes = bytes
        .get(4..4 + header_len)
        .ok_or_else(|| RuntimeError::checkpoint_io("checkpoint artifact truncated: header incomplete"))?;
    let header: CheckpointHeader = bincode::deserialize(header_bytes)
        .map_err(|e| RuntimeError::checkpoint_io(format!("failed to deserialize header: {e}")))?;
    header.validate()?;

    Ok((header, 4 + header_len))
}

/// Inverse of [`seal`]: validates header, size and checksum.
pub fn unseal(bytes: &[u8]) -> Result<(CheckpointHeader, Vec<u8>)> {
    let (header, offset) = parse_header(bytes)?;
    let compression: Compression = header.compression.parse()?;
    let payload = compression.decompress(&bytes[offset..])?;

    if payload.len() as u64 != header.uncompressed_size {
        return Err(RuntimeError::checkpoint_io(format!(
            "size mismatch: expected {}, got {}",
            header.uncompressed_size,
            payload.len()
        )));
    }
    let computed = checksum(&payload);
    if computed != header.checksum {
        return Err(RuntimeError::checkpoint_io(format!(
            "checksum mismatch: expected {}, got {computed}",
            header.checksum
        )));
    }

    Ok((header, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload() -> Vec<u8> {
        (0..4096u32).flat_map(|i| (i % 17).to_le_bytes()).collect()
    }

    #[test]
    fn test_seal_unseal_every_compression() {
        for compression in [Compression::None, Compression::Lz4, Compression::Zstd { level: 3 }] {
            let mut metadata = HashMap::new();
            metadata.insert("host".to_string(), "node-a".to_string());

            let bytes = seal(&payload(), compression, "job", 4, metadata).unwrap();
            let (header, data) = unseal(&bytes).unwrap();

            assert_eq!(data, payload());
            assert_eq!(header.compression, compression.name());
            assert_eq!(header.job_id, "job");
            assert_eq!(header.epoch, 4);
            assert_eq!(header.metadata.get("host").map(String::as_str), Some("node-a"));
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_payload() {
        let plain = seal(&payload(), Compression::None, "j", 0, HashMap::new()).unwrap();
        let lz4 = seal(&payload(), Compression::Lz4, "j", 0, HashMap::new()).unwrap();
        assert!(lz4.len() < plain.len());
    }

    #[test]
    fn test_corrupted_payload_fails_checksum() {
        let mut bytes = seal(&payload(), Compression::None, "j", 0, HashMap::new()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let err = unseal(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_bad_magic_and_truncation() {
        assert!(parse_header(&[1, 2]).is_err());

        let bytes = seal(b"abc", Compression::None, "j", 0, HashMap::new()).unwrap();
        assert!(parse_header(&bytes[..6]).is_err());

        let (mut header, _) = parse_header(&bytes).unwrap();
        header.magic = *b"XXXX";
        assert!(header.validate().is_err());
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(artifact_name("job-7", 3), "job-7_epoch_00003.ckpt");
        assert_eq!(parse_artifact_epoch("job-7", "job-7_epoch_00003.ckpt"), Some(3));
        assert_eq!(parse_artifact_epoch("job-7", "job-70_epoch_00003.ckpt"), None);
        assert_eq!(parse_artifact_epoch("job-7", ".job-7_epoch_00003.ckpt.tmp"), None);
        assert_eq!(parse_artifact_epoch("job-7", "job-7_epoch_123456.ckpt"), Some(123_456));
    }

    #[test]
    fn test_compression_from_config() {
        assert_eq!(
            Compression::from_config("zstd", 9).unwrap(),
            Compression::Zstd { level: 9 }
        );
        assert_eq!(Compression::from_config("lz4", 9).unwrap(), Compression::Lz4);
        assert!(Compression::from_config("gzip", 1).is_err());
    }
}
