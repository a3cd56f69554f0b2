/**
 * dialog/secured_codec.rs
 *
 * Codec decorator that signs outgoing payloads and verifies incoming ones
 * against a single expected peer identity.
 *
 * Wire envelope: {"payload": <inner codec JSON>, "signature": "<base64>"}
 * The signature covers the exact payload bytes as they appear on the wire.
 */

use crate::communication::{Codec, CodecError};
use crate::identity::{Identity, Signature, Signer, Verifier};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::Value;
use std::sync::Arc;

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    payload: &'a RawValue,
    signature: String,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    payload: Box<RawValue>,
    #[serde(default)]
    signature: String,
}

pub struct SecuredCodec {
    inner: Arc<dyn Codec>,
    signer: Arc<dyn Signer>,
    peer: Identity,
    verifier: Arc<dyn Verifier>,
}

impl SecuredCodec {
    pub fn new(
        inner: Arc<dyn Codec>,
        signer: Arc<dyn Signer>,
        peer: Identity,
        verifier: Arc<dyn Verifier>,
    ) -> Self {
        Self {
            inner,
            signer,
            peer,
            verifier,
        }
    }

    /// Identity every incoming payload must be signed by
    pub fn expected_peer(&self) -> &Identity {
        &self.peer
    }
}

impl Codec for SecuredCodec {
    fn pack(&self, payload: &Value) -> Result<Vec<u8>, CodecError> {
        let payload = self.inner.pack(payload)?;
        let signature = self
            .signer
            .sign(&payload)
            .map_err(|e| CodecError::Signing(e.to_string()))?;

        let payload = String::from_utf8(payload).map_err(|e| CodecError::Encode(e.to_string()))?;
        let payload = RawValue::from_string(payload).map_err(|e| CodecError::Encode(e.to_string()))?;

        serde_json::to_vec(&OutgoingEnvelope {
            payload: &payload,
            signature: signature.to_base64(),
        })
        .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn unpack(&self, data: &[u8]) -> Result<Value, CodecError> {
        let envelope: IncomingEnvelope =
            serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))?;

        if envelope.signature.is_empty() {
            return Err(CodecError::InvalidSignature("missing".to_string()));
        }
        let signature = Signature::from_base64(&envelope.signature)
            .map_err(|e| CodecError::InvalidSignature(e.to_string()))?;

        let payload = envelope.payload.get().as_bytes();
        if !self.verifier.verify(payload, &signature) {
            return Err(CodecError::InvalidSignature(format!("expected signer {}", self.peer)));
        }
        self.inner.unpack(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::communication::JsonCodec;
    use crate::identity::{FakeSigner, FakeVerifier, KeySigner, KeyVerifier};
    use serde_json::json;

    fn key_codec(local: &KeySigner, peer: &KeySigner) -> SecuredCodec {
        SecuredCodec::new(
            Arc::new(JsonCodec),
            Arc::new(local.clone()),
            peer.identity(),
            Arc::new(KeyVerifier::for_identity(&peer.identity())),
        )
    }

    #[test]
    fn pack_then_unpack_with_matching_peer_returns_payload() {
        let alice = KeySigner::random();
        let bob = KeySigner::random();
        let payload = json!({"peer_id": alice.identity(), "version": "v1"});

        let packed = key_codec(&alice, &bob).pack(&payload).unwrap();
        let unpacked = key_codec(&bob, &alice).unpack(&packed).unwrap();
        assert_eq!(unpacked, payload);
    }

    #[test]
    fn unpack_with_other_peer_fails() {
        let alice = KeySigner::random();
        let bob = KeySigner::random();
        let mallory = KeySigner::random();

        let packed = key_codec(&mallory, &bob).pack(&json!({"reason": 200})).unwrap();
        let result = key_codec(&bob, &alice).unpack(&packed);
        assert!(matches!(result, Err(CodecError::InvalidSignature(_))));
    }

    #[test]
    fn tampered_payload_fails() {
        let alice = KeySigner::random();
        let bob = KeySigner::random();

        let packed = key_codec(&alice, &bob).pack(&json!({"reason": 400})).unwrap();
        let tampered = String::from_utf8(packed).unwrap().replace("400", "200");
        let result = key_codec(&bob, &alice).unpack(tampered.as_bytes());
        assert!(matches!(result, Err(CodecError::InvalidSignature(_))));
    }

    #[test]
    fn envelope_matches_wire_format() {
        let codec = SecuredCodec::new(
            Arc::new(JsonCodec),
            Arc::new(FakeSigner::default()),
            Identity::from_address("0xaaa"),
            Arc::new(FakeVerifier),
        );
        let packed = codec
            .pack(&json!({"reason": 400, "reasonMessage": "Invalid Identity"}))
            .unwrap();
        assert_eq!(
            String::from_utf8(packed).unwrap(),
            r#"{"payload":{"reason":400,"reasonMessage":"Invalid Identity"},"signature":"c2lnbmVkeyJyZWFzb24iOjQwMCwicmVhc29uTWVzc2FnZSI6IkludmFsaWQgSWRlbnRpdHkifQ=="}"#
        );
    }

    #[test]
    fn missing_or_malformed_signature_fails() {
        let codec = SecuredCodec::new(
            Arc::new(JsonCodec),
            Arc::new(FakeSigner::default()),
            Identity::from_address("0xaaa"),
            Arc::new(FakeVerifier),
        );
        let missing = codec.unpack(br#"{"payload":{"peer_id":"0xaaa"}}"#);
        assert!(matches!(missing, Err(CodecError::InvalidSignature(_))));

        let malformed = codec.unpack(br#"{"payload":{"peer_id":"0xaaa"},"signature":"malformed"}"#);
        assert!(matches!(malformed, Err(CodecError::InvalidSignature(_))));
    }
}
