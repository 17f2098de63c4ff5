//! Payload compression.
//!
//! Payloads larger than the configured threshold are compressed before they
//! reach the transport; the scheme used is announced in the
//! `content-encoding` header so the receiver knows how to undo it.
//! Whatever the scheme, `decode(encode(x)) == x`.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};

/// Header naming the scheme a payload was compressed with.
pub const CONTENT_ENCODING: &str = "content-encoding";

/// The built-in schemes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionScheme {
    /// Never compress.
    None,
    /// LZ4 block format with the uncompressed size prepended.
    #[default]
    Lz4,
}

/// Errors that can occur while undoing compression.
#[derive(Debug, thiserror::Error)]
pub enum CompressionError {
    #[error("corrupt compressed payload: {0}")]
    Corrupt(String),

    #[error("unknown content encoding `{0}`")]
    UnknownEncoding(String),
}

/// A symmetric payload transform.
pub trait Compressor: Send + Sync + 'static {
    /// Name placed in the `content-encoding` header.
    fn encoding(&self) -> &'static str;

    fn compress(&self, data: &[u8]) -> Vec<u8>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// LZ4 via `lz4_flex`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn encoding(&self) -> &'static str {
        "lz4"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        compress_prepend_size(data)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        decompress_size_prepended(data).map_err(|e| CompressionError::Corrupt(e.to_string()))
    }
}

/// Pass-through transform, used when compression is switched off.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityCompressor;

impl Compressor for IdentityCompressor {
    fn encoding(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> Vec<u8> {
        data.to_vec()
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }
}

/// Result of [`PayloadCompression::encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    /// `Some(name)` when `bytes` is compressed.
    pub encoding: Option<&'static str>,
}

/// A compressor plus the size threshold above which it is applied.
pub struct PayloadCompression {
    compressor: Box<dyn Compressor>,
    threshold: usize,
}

impl PayloadCompression {
    pub fn new(scheme: CompressionScheme, threshold: usize) -> Self {
        match scheme {
            CompressionScheme::None => Self::with_compressor(IdentityCompressor, usize::MAX),
            CompressionScheme::Lz4 => Self::with_compressor(Lz4Compressor, threshold),
        }
    }

    /// Plugs in a custom scheme.
    pub fn with_compressor(compressor: impl Compressor, threshold: usize) -> Self {
        Self {
            compressor: Box::new(compressor),
            threshold,
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Compresses `payload` if it is larger than the threshold and the
    /// result is actually smaller. Otherwise returns it untouched.
    pub fn encode(&self, payload: &[u8]) -> EncodedPayload {
        if payload.len() > self.threshold {
            let compressed = self.compressor.compress(payload);
            if compressed.len() < payload.len() {
                return EncodedPayload {
                    bytes: compressed,
                    encoding: Some(self.compressor.encoding()),
                };
            }
        }
        EncodedPayload {
            bytes: payload.to_vec(),
            encoding: None,
        }
    }

    /// Undoes [`encode`](Self::encode) given the advertised encoding.
    pub fn decode(
        &self,
        bytes: &[u8],
        encoding: Option<&str>,
    ) -> Result<Vec<u8>, CompressionError> {
        match encoding {
            None => Ok(bytes.to_vec()),
            Some(name) if name == self.compressor.encoding() => self.compressor.decompress(bytes),
            Some(other) => Err(CompressionError::UnknownEncoding(other.to_string())),
        }
    }
}

impl std::fmt::Debug for PayloadCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadCompression")
            .field("encoding", &self.compressor.encoding())
            .field("threshold", &self.threshold)
            .finish()
    }
}
