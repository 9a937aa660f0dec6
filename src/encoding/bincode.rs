//! Bincode encoding for values stored in the key/value engines: key
//! descriptors and engine metadata. The format is Rust-specific and only as
//! stable as the encoded structs themselves, which is fine for data this
//! crate both writes and reads.
//!
//! One pitfall is worth spelling out: `bincode::serialize` at the crate root
//! encodes integers fixed-width, while `bincode::DefaultOptions` encodes
//! them varint-style, and the two are not interchangeable. Descriptors are
//! small and mostly hold tiny sizes, so everything here goes through a
//! single shared `DefaultOptions` instance and nothing ever touches the
//! root-level functions.

use crate::error::Result;

use bincode::Options;

/// The shared encoding options, initialized on first use.
fn options() -> &'static bincode::DefaultOptions {
    static OPTIONS: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    OPTIONS.get_or_init(bincode::DefaultOptions::new)
}

/// Decodes a value from its stored bytes.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(options().deserialize(bytes)?)
}

/// Encodes a value for storage. Encoding a value we defined ourselves can
/// only fail on a bug, so this panics rather than returning an error.
pub fn serialize<T: serde::Serialize>(value: &T) -> Vec<u8> {
    options().serialize(value).expect("value must be serializable")
}
