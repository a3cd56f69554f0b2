/**
 * identity/mod.rs
 *
 * Peer identities, signatures and the signer/verifier capabilities
 * used by the secured dialog codec.
 */

mod fake;
mod keys;

pub use fake::{FakeSigner, FakeVerifier};
pub use keys::{KeySigner, KeyVerifier};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("invalid identity key: {0}")]
    InvalidKey(String),

    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
}

/// Stable peer identifier, a lowercase `0x` prefixed address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct Identity {
    pub address: String,
}

impl Identity {
    pub fn from_address(address: &str) -> Self {
        Self {
            address: address.to_lowercase(),
        }
    }
}

impl From<String> for Identity {
    fn from(address: String) -> Self {
        Self::from_address(&address)
    }
}

impl From<Identity> for String {
    fn from(identity: Identity) -> Self {
        identity.address
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Detached signature bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature(Vec<u8>);

impl Signature {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Decode from the base64 wire form
    pub fn from_base64(encoded: &str) -> Result<Self, IdentityError> {
        BASE64
            .decode(encoded)
            .map(Self)
            .map_err(|e| IdentityError::InvalidSignature(e.to_string()))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.0)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Signs outgoing payloads on behalf of the local identity
pub trait Signer: Send + Sync {
    fn identity(&self) -> Identity;

    fn sign(&self, message: &[u8]) -> Result<Signature, IdentityError>;
}

/// Checks a signature against one fixed peer identity
pub trait Verifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &Signature) -> bool;
}

/// Builds a verifier for a claimed identity.
///
/// The dialog waiter only learns who is calling from the request itself,
/// so it needs to construct verifiers on demand.
pub type VerifierFactory = Arc<dyn Fn(&Identity) -> Arc<dyn Verifier> + Send + Sync>;

/// Verifier factory backed by Ed25519 identity keys
pub fn key_verifier_factory() -> VerifierFactory {
    Arc::new(|identity: &Identity| Arc::new(KeyVerifier::for_identity(identity)) as Arc<dyn Verifier>)
}

/// Verifier factory producing fake verifiers, for tests and local demos
pub fn fake_verifier_factory() -> VerifierFactory {
    Arc::new(|_: &Identity| Arc::new(FakeVerifier) as Arc<dyn Verifier>)
}
