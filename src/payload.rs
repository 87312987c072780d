//! Payload codec
//!
//! Event and snapshot payloads are UTF-8 JSON serialized exactly once into
//! a byte buffer that is shared by the aggregate event row and the outbox
//! row. Large payloads may be DEFLATE-compressed when that pays off.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::store::StoreError;

/// Payloads below this size are never compressed
pub const COMPRESSION_THRESHOLD_BYTES: usize = 2048;

/// Compression is kept only when it shrinks the payload by at least this ratio
pub const MIN_COMPRESSION_SAVING: f64 = 0.10;

/// One encoded payload buffer, shared by the event row and the outbox row
#[derive(Debug, Clone)]
pub struct PayloadBuf {
    /// Stored bytes (raw UTF-8 JSON, or DEFLATE of it)
    pub bytes: Vec<u8>,
    /// Whether `bytes` is DEFLATE-compressed
    pub is_compressed: bool,
    /// Exact uncompressed UTF-8 byte length of the JSON
    pub uncompressed_bytes: i64,
}

/// Encode a JSON payload string into its stored form.
///
/// When `allow_compression` is set, payloads of at least
/// [`COMPRESSION_THRESHOLD_BYTES`] are deflated and the compressed form is
/// kept only if it is at least [`MIN_COMPRESSION_SAVING`] smaller.
pub fn encode(json: &str, allow_compression: bool) -> Result<PayloadBuf, StoreError> {
    let raw = json.as_bytes();
    let uncompressed_bytes = raw.len() as i64;

    if allow_compression && raw.len() >= COMPRESSION_THRESHOLD_BYTES {
        let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;

        let saving = 1.0 - compressed.len() as f64 / raw.len() as f64;
        if saving >= MIN_COMPRESSION_SAVING {
            return Ok(PayloadBuf {
                bytes: compressed,
                is_compressed: true,
                uncompressed_bytes,
            });
        }
    }

    Ok(PayloadBuf {
        bytes: raw.to_vec(),
        is_compressed: false,
        uncompressed_bytes,
    })
}

/// Decode stored payload bytes back into the JSON string
pub fn decode(bytes: &[u8], is_compressed: bool) -> Result<String, StoreError> {
    let raw = if is_compressed {
        let mut decoder = DeflateDecoder::new(bytes);
        let mut out = Vec::with_capacity(bytes.len() * 4);
        decoder.read_to_end(&mut out)?;
        out
    } else {
        bytes.to_vec()
    };

    String::from_utf8(raw).map_err(|e| {
        StoreError::Payload(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("payload is not valid UTF-8: {e}"),
        ))
    })
}
