//! Pluggable key and payload codecs.
//!
//! The cache stores opaque bytes on disk and never interprets payload
//! content itself. Four function-typed slots make the byte-level codec
//! and the filename escaping swappable per instance:
//!
//! - [`Serializer`] / [`Deserializer`] convert a caller value to and from
//!   bytes, parameterized by the key.
//! - [`KeyEncoder`] / [`KeyDecoder`] convert a caller key to and from a
//!   filesystem-safe filename.
//!
//! The defaults archive `Vec<u8>` payloads verbatim and percent-encode
//! every character of the key except ASCII letters and digits, which
//! keeps `.`, `:`, `/` and `%` out of filenames.

use std::sync::Arc;

use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};

use crate::error::CacheError;

/// Converts a value to bytes for storage. Receives the cache key.
pub type Serializer<T> = Arc<dyn Fn(&T, &str) -> Result<Vec<u8>, CacheError> + Send + Sync>;

/// Converts stored bytes back to a value. Receives the cache key.
pub type Deserializer<T> = Arc<dyn Fn(&[u8], &str) -> Result<T, CacheError> + Send + Sync>;

/// Converts a caller key to a filesystem-safe filename.
pub type KeyEncoder = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Converts a filename back to the caller key.
pub type KeyDecoder = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Percent-encode a key into a filename.
///
/// Everything except ASCII alphanumerics is escaped, so the result never
/// contains path separators or hidden-file prefixes. The empty key maps
/// to the empty string.
pub fn encode_key(key: &str) -> String {
    utf8_percent_encode(key, NON_ALPHANUMERIC).to_string()
}

/// Reverse [`encode_key`]. Invalid UTF-8 after unescaping is replaced.
pub fn decode_key(file_name: &str) -> String {
    percent_decode_str(file_name)
        .decode_utf8_lossy()
        .into_owned()
}

/// Identity serializer for raw byte payloads.
pub fn default_serializer() -> Serializer<Vec<u8>> {
    Arc::new(|value: &Vec<u8>, _key: &str| Ok(value.clone()))
}

/// Identity deserializer for raw byte payloads.
pub fn default_deserializer() -> Deserializer<Vec<u8>> {
    Arc::new(|bytes: &[u8], _key: &str| Ok(bytes.to_vec()))
}

/// The default filename escaping as a codec slot.
pub fn default_key_encoder() -> KeyEncoder {
    Arc::new(|key: &str| encode_key(key))
}

/// The default filename unescaping as a codec slot.
pub fn default_key_decoder() -> KeyDecoder {
    Arc::new(|file_name: &str| decode_key(file_name))
}
