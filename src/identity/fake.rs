/**
 * identity/fake.rs
 *
 * Deterministic signer/verifier pair for tests and local demos.
 * A fake signature is the literal prefix `signed` followed by the message.
 */

use super::{Identity, IdentityError, Signature, Signer, Verifier};

const FAKE_PREFIX: &[u8] = b"signed";

#[derive(Debug, Clone)]
pub struct FakeSigner {
    identity: Identity,
}

impl FakeSigner {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

impl Default for FakeSigner {
    fn default() -> Self {
        Self::new(Identity::from_address("0x0000000000000000000000000000000000000000"))
    }
}

impl Signer for FakeSigner {
    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn sign(&self, message: &[u8]) -> Result<Signature, IdentityError> {
        let mut bytes = FAKE_PREFIX.to_vec();
        bytes.extend_from_slice(message);
        Ok(Signature::from_bytes(bytes))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FakeVerifier;

impl Verifier for FakeVerifier {
    fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let bytes = signature.as_bytes();
        bytes.len() == FAKE_PREFIX.len() + message.len()
            && bytes.starts_with(FAKE_PREFIX)
            && &bytes[FAKE_PREFIX.len()..] == message
    }
}
