/**
 * communication/codec.rs
 *
 * Message codecs. Payloads travel as JSON values so codecs can be
 * stacked (see the secured codec in the dialog module).
 */

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),

    #[error("failed to sign message: {0}")]
    Signing(String),

    #[error("invalid message signature {0}")]
    InvalidSignature(String),
}

/// Turns message values into wire bytes and back
pub trait Codec: Send + Sync {
    fn pack(&self, payload: &Value) -> Result<Vec<u8>, CodecError>;

    fn unpack(&self, data: &[u8]) -> Result<Value, CodecError>;
}

/// Plain compact JSON
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn pack(&self, payload: &Value) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unpack(&self, data: &[u8]) -> Result<Value, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
