//! Thin helpers around [ciborium] so the rest of the crate never touches the
//! reader/writer plumbing directly.
use std::io::Cursor;

use serde::{de, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CborError {
    /// CBOR decoding failure.
    #[error("CBOR decoding failure: {0}")]
    DecodeFailed(String),
    /// CBOR encoding failure.
    #[error("CBOR encoding failure: {0}")]
    EncodeFailed(String),
    /// CBOR input had extra data.
    #[error("extraneous data")]
    ExtraneousData,
}

pub fn to_vec<T>(value: &T) -> Result<Vec<u8>, CborError>
where
    T: Serialize,
{
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CborError::EncodeFailed(e.to_string()))?;
    Ok(buf)
}

/// Decode exactly one CBOR data item from `slice`.
///
/// Trailing bytes after the item are rejected, as a second item would
/// otherwise be silently dropped from the wire.
pub fn from_slice<T>(slice: &[u8]) -> Result<T, CborError>
where
    T: de::DeserializeOwned,
{
    let mut cursor = Cursor::new(slice);
    let value = ciborium::from_reader(&mut cursor)
        .map_err(|e| CborError::DecodeFailed(e.to_string()))?;
    if (cursor.position() as usize) < slice.len() {
        return Err(CborError::ExtraneousData);
    }
    Ok(value)
}

#[cfg(test)]
mod test {
    use ciborium::Value;

    use super::*;

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = to_vec(&Value::Integer(1.into())).unwrap();
        bytes.push(0x01);
        assert!(matches!(
            from_slice::<Value>(&bytes),
            Err(CborError::ExtraneousData)
        ));
    }

    #[test]
    fn tagged_values_survive_a_roundtrip() {
        let tagged = Value::Tag(24, Box::new(Value::Bytes(vec![0xa0])));
        let bytes = to_vec(&tagged).unwrap();
        assert_eq!(bytes, vec![0xd8, 0x18, 0x41, 0xa0]);
        let decoded: Value = from_slice(&bytes).unwrap();
        assert_eq!(decoded, tagged);
    }
}
