//! Bincode is used to encode both storage values and network messages. It is
//! a Rust-specific encoding that depends on the data structures being stable,
//! which is sufficient here since all nodes run the same binary.
//!
//! This module wraps the bincode crate to always use DefaultOptions, with
//! variable-length rather than fixed-length integers. Confusingly, upstream
//! bincode::(de)serialize uses different options (fixed) than DefaultOptions.

use crate::error::{Error, Result};

use bincode::Options;

/// Returns the default Bincode options, initialized on first use.
fn bincode() -> &'static bincode::DefaultOptions {
    static BINCODE: std::sync::OnceLock<bincode::DefaultOptions> = std::sync::OnceLock::new();
    BINCODE.get_or_init(bincode::DefaultOptions::new)
}

/// Deserializes a value using Bincode.
pub fn deserialize<'de, T: serde::Deserialize<'de>>(bytes: &'de [u8]) -> Result<T> {
    Ok(bincode().deserialize(bytes)?)
}

/// Deserializes a value from a reader using Bincode.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(bincode().deserialize_from(reader)?)
}

/// Deserializes a value from a reader using Bincode, or returns None if the
/// reader is closed.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match bincode().deserialize_from(reader) {
        Ok(t) => Ok(Some(t)),
        Err(err) => match *err {
            bincode::ErrorKind::Io(err)
                if [std::io::ErrorKind::UnexpectedEof, std::io::ErrorKind::ConnectionReset]
                    .contains(&err.kind()) =>
            {
                Ok(None)
            }
            err => Err(Error::from(Box::new(err))),
        },
    }
}

/// Serializes a value using Bincode. Panics on failure, which only happens if
/// the value can't be represented in Bincode (i.e. a bug).
pub fn serialize<T: serde::Serialize>(value: &T) -> Vec<u8> {
    bincode().serialize(value).expect("value must be serializable")
}

/// Serializes a value into a writer using Bincode.
pub fn serialize_into<W: std::io::Write, T: serde::Serialize>(writer: W, value: &T) -> Result<()> {
    Ok(bincode().serialize_into(writer, value)?)
}
