//! Codec trait and implementations for message bodies.
//!
//! A codec is a stateless pair of functions turning a typed value into bytes
//! and back. It is chosen per publish or subscribe call rather than stored on
//! the queue, so the same queue name may carry JSON from one publisher and be
//! read as JSON by every subscriber.
//!
//! - [`JsonCodec`] is human-inspectable and cross-language friendly.
//! - [`BinaryCodec`] is compact but only valid between processes sharing the
//!   same Rust type. Every frame carries a fingerprint of the producing type
//!   and a digest of the value's named contents. A payload written for another
//!   type, or for another layout of the same type, fails to decode instead of
//!   being misread.

use crate::error::{DecodeError, EncodeError};
use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};

#[cfg(test)]
#[path = "codec_tests.rs"]
mod tests;

/// MIME type stamped on JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// MIME type stamped on binary messages
pub const BINARY_CONTENT_TYPE: &str = "application/x-bincode";

/// Leading bytes of every binary frame
const BINARY_MAGIC: &[u8; 4] = b"PBN2";

/// Length of the type fingerprint following the magic
const FINGERPRINT_LEN: usize = 8;

/// Length of the content digest following the fingerprint
const DIGEST_LEN: usize = 8;

const BINARY_HEADER_LEN: usize = BINARY_MAGIC.len() + FINGERPRINT_LEN + DIGEST_LEN;

/// Upper bound on the bincode payload, guards against hostile length prefixes
const MAX_BINARY_PAYLOAD: u64 = 16 * 1024 * 1024;

/// Encodes values to message bodies and decodes them back.
pub trait Codec: Send + Sync + 'static {
    /// MIME type recorded in the message properties
    fn content_type(&self) -> &'static str;

    /// Serialize a value into bytes.
    ///
    /// # Errors
    /// Returns [`EncodeError`] when the value cannot be represented in this
    /// format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError>;

    /// Deserialize bytes back into a value.
    ///
    /// `T: Serialize` lets codecs without a self-describing wire format verify
    /// the decoded value against what the producer wrote.
    ///
    /// # Errors
    /// Returns [`DecodeError`] for truncated, malformed or schema-incompatible
    /// bytes. Never panics.
    fn decode<T: Serialize + DeserializeOwned>(&self, data: &[u8]) -> Result<T, DecodeError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn content_type(&self) -> &'static str {
        JSON_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: Serialize + DeserializeOwned>(&self, data: &[u8]) -> Result<T, DecodeError> {
        Ok(serde_json::from_slice(data)?)
    }
}

// ---------------------------------------------------------------------------
// BinaryCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] backed by `bincode`.
///
/// Frame layout: `PBN2` magic, 8-byte fingerprint of the Rust type name,
/// 8-byte content digest, then the bincode body. Trailing bytes after the body
/// are rejected.
///
/// bincode is not self-describing: two builds of a type with reordered or
/// retyped fields can read each other's bytes without error. The content
/// digest hashes the value rendered with field names, so a body decoded
/// through the wrong layout no longer matches it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BinaryCodec;

impl BinaryCodec {
    fn options() -> impl Options {
        bincode::DefaultOptions::new()
            .with_limit(MAX_BINARY_PAYLOAD)
            .reject_trailing_bytes()
    }

    /// Fingerprint identifying the type a frame was produced for
    fn fingerprint<T>() -> [u8; FINGERPRINT_LEN] {
        let digest = Sha256::digest(std::any::type_name::<T>().as_bytes());
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);
        fingerprint
    }

    /// Digest of the value keyed by field name, independent of field order
    fn content_digest<T: Serialize>(value: &T) -> Result<[u8; DIGEST_LEN], serde_json::Error> {
        // `Value` objects sort their keys, so map iteration order does not leak in
        let canonical = serde_json::to_vec(&serde_json::to_value(value)?)?;
        let digest = Sha256::digest(&canonical);
        let mut content = [0u8; DIGEST_LEN];
        content.copy_from_slice(&digest[..DIGEST_LEN]);
        Ok(content)
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

impl Codec for BinaryCodec {
    fn content_type(&self) -> &'static str {
        BINARY_CONTENT_TYPE
    }

    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, EncodeError> {
        let body = Self::options().serialize(value)?;

        let mut frame = Vec::with_capacity(BINARY_HEADER_LEN + body.len());
        frame.extend_from_slice(BINARY_MAGIC);
        frame.extend_from_slice(&Self::fingerprint::<T>());
        frame.extend_from_slice(&Self::content_digest(value)?);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    fn decode<T: Serialize + DeserializeOwned>(&self, data: &[u8]) -> Result<T, DecodeError> {
        if data.len() < BINARY_HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: BINARY_HEADER_LEN,
                actual: data.len(),
            });
        }

        let (magic, rest) = data.split_at(BINARY_MAGIC.len());
        if magic != BINARY_MAGIC.as_slice() {
            return Err(DecodeError::BadMagic);
        }

        let (found, rest) = rest.split_at(FINGERPRINT_LEN);
        let expected = Self::fingerprint::<T>();
        if found != expected.as_slice() {
            return Err(DecodeError::SchemaMismatch {
                expected: to_hex(&expected),
                found: to_hex(found),
            });
        }

        let (written, body) = rest.split_at(DIGEST_LEN);
        let value: T = Self::options().deserialize(body)?;

        let read = Self::content_digest(&value)?;
        if written != read.as_slice() {
            return Err(DecodeError::LayoutMismatch {
                written: to_hex(written),
                read: to_hex(&read),
            });
        }

        Ok(value)
    }
}
