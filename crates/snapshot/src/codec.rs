//! Bincode helpers for values embedded in snapshot streams.

use bincode::config::{self, Config};
use bincode::serde::{decode_from_slice, encode_to_vec};
use common::{SmError, SmResult};
use serde::{de::DeserializeOwned, Serialize};

/// Largest length-prefixed value a stream may carry.
pub const MAX_VALUE_LEN: usize = crate::frame::MAX_FRAME_LEN as usize;

/// Serialize a value with the fixed-width little-endian legacy layout.
pub fn encode_value<T: Serialize>(value: &T) -> SmResult<Vec<u8>> {
    encode_to_vec(value, bincode_config()).map_err(|e| SmError::Codec(e.to_string()))
}

/// Deserialize a value written by [`encode_value`].
pub fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> SmResult<T> {
    let (value, _read) =
        decode_from_slice(bytes, bincode_config()).map_err(|e| SmError::Codec(e.to_string()))?;
    Ok(value)
}

fn bincode_config() -> impl Config {
    config::legacy()
}
