//! Payload compression.

use std::io::{Read, Write};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgorithm {
    Gzip,
}

/// Compression metadata attached to a sync message.
///
/// When `enabled`, the message payload is a base64 string of the
/// compressed canonical JSON, and the checksum covers the compressed bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    pub original_size: usize,
    pub compressed_size: usize,
}

pub(crate) fn gzip(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(bytes)
        .map_err(|e| SyncError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Serialization(e.to_string()))
}

pub(crate) fn gunzip(bytes: &[u8]) -> Result<Vec<u8>, SyncError> {
    let mut out = Vec::new();
    GzDecoder::new(bytes)
        .read_to_end(&mut out)
        .map_err(|e| SyncError::Decompress(e.to_string()))?;
    Ok(out)
}

pub(crate) fn encode_b64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub(crate) fn decode_b64(s: &str) -> Result<Vec<u8>, SyncError> {
    STANDARD
        .decode(s)
        .map_err(|e| SyncError::Decompress(format!("invalid base64: {e}")))
}
