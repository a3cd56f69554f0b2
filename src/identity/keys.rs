/**
 * identity/keys.rs
 *
 * Ed25519 backed signer and verifier
 */

use super::{Identity, IdentityError, Signature, Signer, Verifier};
use ed25519_dalek::{Signer as _, SigningKey, Verifier as _, VerifyingKey};

/// Signer holding the node's Ed25519 identity key
#[derive(Clone)]
pub struct KeySigner {
    signing_key: SigningKey,
    identity: Identity,
}

impl KeySigner {
    pub fn new(signing_key: SigningKey) -> Self {
        let identity = identity_for_key(&signing_key.verifying_key());
        Self {
            signing_key,
            identity,
        }
    }

    /// Generate a throwaway identity
    pub fn random() -> Self {
        Self::new(SigningKey::from_bytes(&rand::random::<[u8; 32]>()))
    }

    /// Load a key from its 32 byte hex encoded secret
    pub fn from_hex(secret: &str) -> Result<Self, IdentityError> {
        let bytes = hex::decode(secret.trim_start_matches("0x"))
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        let key = SigningKey::try_from(bytes.as_slice())
            .map_err(|e| IdentityError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key))
    }
}

impl Signer for KeySigner {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, IdentityError> {
        let signature = self.signing_key.sign(message);
        Ok(Signature::from_bytes(signature.to_bytes().to_vec()))
    }
}

/// Derive the identity address of a verifying key
pub fn identity_for_key(key: &VerifyingKey) -> Identity {
    Identity::from_address(&format!("0x{}", hex::encode(key.as_bytes())))
}

/// Verifier bound to a single identity.
///
/// An identity that does not decode to a valid key rejects every signature.
pub struct KeyVerifier {
    key: Option<VerifyingKey>,
}

impl KeyVerifier {
    pub fn for_identity(identity: &Identity) -> Self {
        let key = hex::decode(identity.address.trim_start_matches("0x"))
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes.as_slice()).ok())
            .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok());
        Self { key }
    }
}

impl Verifier for KeyVerifier {
    fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Some(key) = &self.key else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature.as_bytes()) else {
            return false;
        };
        key.verify(message, &signature).is_ok()
    }
}
