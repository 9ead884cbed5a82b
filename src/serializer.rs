//! Message body serialization traits.
//!
//! The connection core is generic over the encoding of message bodies: it
//! frames and routes payloads without interpreting them. This module defines
//! the [`Serializer`] trait applications use to plug in custom formats. A
//! basic [`BincodeSerializer`] implementation is provided as the default.

use bincode::{config, decode_from_slice, encode_to_vec};

use crate::error::{CommError, CommResult, RetCode};

/// Serializer-agnostic encoding adapter used by [`Serializer`].
pub trait EncodeWith<S: ?Sized> {
    /// Encode `self` with `serializer`.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::SerializationError`] when encoding fails.
    fn encode_with(&self, serializer: &S) -> CommResult<Vec<u8>>;
}

/// Serializer-agnostic decoding adapter used by [`Serializer`].
pub trait DecodeWith<S: ?Sized>: Sized {
    /// Decode `Self` from `bytes` with `serializer`.
    ///
    /// # Errors
    ///
    /// Returns [`RetCode::DeserializationError`] when the bytes cannot be
    /// parsed into a value.
    fn decode_with(serializer: &S, bytes: &[u8]) -> CommResult<Self>;
}

/// Trait for serializing and deserializing message bodies.
///
/// Use concrete serializer types (for example [`BincodeSerializer`]) in API
/// bounds; the trait is not object-safe because its core methods are generic
/// over the value type.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Serialize `value` into a byte vector.
    ///
    /// # Errors
    ///
    /// Returns an error if the value cannot be serialized.
    fn serialize<M>(&self, value: &M) -> CommResult<Vec<u8>>
    where
        M: EncodeWith<Self>,
        Self: Sized,
    {
        value.encode_with(self)
    }

    /// Deserialize a message body from `bytes`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes cannot be parsed into a value.
    fn deserialize<M>(&self, bytes: &[u8]) -> CommResult<M>
    where
        M: DecodeWith<Self>,
        Self: Sized,
    {
        M::decode_with(self, bytes)
    }
}

/// Serializer using `bincode` with its standard configuration.
#[derive(Clone, Copy, Debug, Default)]
pub struct BincodeSerializer;

impl Serializer for BincodeSerializer {}

impl<M: bincode::Encode> EncodeWith<BincodeSerializer> for M {
    fn encode_with(&self, _serializer: &BincodeSerializer) -> CommResult<Vec<u8>> {
        encode_to_vec(self, config::standard())
            .map_err(|error| CommError::new(RetCode::SerializationError, error.to_string()))
    }
}

impl<M: bincode::Decode<()>> DecodeWith<BincodeSerializer> for M {
    fn decode_with(_serializer: &BincodeSerializer, bytes: &[u8]) -> CommResult<Self> {
        let (value, consumed) = decode_from_slice(bytes, config::standard())
            .map_err(|error| CommError::new(RetCode::DeserializationError, error.to_string()))?;
        if consumed != bytes.len() {
            return Err(CommError::new(
                RetCode::DeserializationError,
                format!("trailing bytes after body: {} of {}", consumed, bytes.len()),
            ));
        }
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bincode_roundtrip() {
        let serializer = BincodeSerializer;
        let bytes = serializer.serialize(&("ping".to_string(), 7u32)).expect("encode");
        let decoded: (String, u32) = serializer.deserialize(&bytes).expect("decode");
        assert_eq!(decoded, ("ping".to_string(), 7));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let serializer = BincodeSerializer;
        let mut bytes = serializer.serialize(&1u8).expect("encode");
        bytes.push(0xff);
        let err = serializer.deserialize::<u8>(&bytes).expect_err("must fail");
        assert_eq!(err.code, RetCode::DeserializationError);
    }
}
