//! Serde adapters and byte-level encodings shared across the crate.
//!
//! Big integers travel as base-64 encoded big-endian byte strings; raw
//! byte buffers (AEAD nonces, encrypted key shares) travel as hex.

use crate::Error;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use num_bigint::BigUint;

pub use hex_buffer_serde::{Hex, HexForm};

/// `#[serde(with = "biguint_b64")]` for [`BigUint`] fields.
pub mod biguint_b64 {
    use super::*;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &BigUint, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&BASE64.encode(value.to_bytes_be()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<BigUint, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = BASE64.decode(s).map_err(de::Error::custom)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }
}

/// `#[serde(with = "biguint_b64_vec")]` for `Vec<BigUint>` fields.
pub mod biguint_b64_vec {
    use super::*;
    use serde::ser::SerializeSeq;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(values: &[BigUint], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            seq.serialize_element(&BASE64.encode(value.to_bytes_be()))?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<BigUint>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings = Vec::<String>::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| {
                let bytes = BASE64.decode(s).map_err(de::Error::custom)?;
                Ok(BigUint::from_bytes_be(&bytes))
            })
            .collect()
    }
}

/// Serializes `value` as exactly `width` big-endian bytes, left-padded
/// with zeros. Used by the canonical verification-hash serialization,
/// where every component has a fixed width.
pub fn to_fixed_be_bytes(value: &BigUint, width: usize) -> Result<Vec<u8>, Error> {
    let bytes = value.to_bytes_be();
    if bytes.len() > width {
        return Err(Error::CiphertextOutOfRange);
    }
    let mut out = vec![0u8; width];
    out[width - bytes.len()..].copy_from_slice(&bytes);
    Ok(out)
}
