//! Challenge-response authentication primitive.
//!
//! The device sends a fresh random challenge before anything else; the host
//! answers with `SHA-256(challenge || credential)`. Only digests cross the
//! wire, never the credential itself. One attempt per connection; a host
//! that fails must reconnect to try again.

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

/// Challenge length in bytes (128 bits of entropy).
pub const CHALLENGE_LEN: usize = 16;

/// Response length: one SHA-256 digest.
pub const RESPONSE_LEN: usize = 32;

/// A per-session nonce. Generated at connection accept, consumed exactly
/// once, discarded after verification.
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    pub fn generate() -> Self {
        let mut nonce = [0u8; CHALLENGE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        debug!(challenge = %hex::encode(nonce), "generated auth challenge");
        Self(nonce)
    }

    pub fn from_bytes(bytes: [u8; CHALLENGE_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }

    /// The digest the host must answer with for the given credential.
    pub fn expected_response(&self, credential: &str) -> [u8; RESPONSE_LEN] {
        respond(&self.0, credential)
    }

    /// Verify a response. Anything that is not the exact expected digest is
    /// a mismatch, including empty and truncated responses.
    pub fn verify(&self, response: &[u8], credential: &str) -> bool {
        let expected = self.expected_response(credential);
        response.len() == RESPONSE_LEN && ct_eq(response, &expected)
    }
}

/// Compute `SHA-256(challenge || credential)`.
pub fn respond(challenge: &[u8; CHALLENGE_LEN], credential: &str) -> [u8; RESPONSE_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(challenge);
    hasher.update(credential.as_bytes());
    hasher.finalize().into()
}

/// Constant-time equality over equal-length slices.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_response_verifies() {
        let challenge = Challenge::generate();
        let response = respond(challenge.as_bytes(), "hunter2");
        assert!(challenge.verify(&response, "hunter2"));
    }

    #[test]
    fn wrong_credential_rejected() {
        let challenge = Challenge::generate();
        let response = respond(challenge.as_bytes(), "wrong");
        assert!(!challenge.verify(&response, "hunter2"));
    }

    #[test]
    fn empty_and_truncated_responses_rejected() {
        let challenge = Challenge::generate();
        let response = challenge.expected_response("hunter2");
        assert!(!challenge.verify(&[], "hunter2"));
        assert!(!challenge.verify(&response[..RESPONSE_LEN - 1], "hunter2"));
        let mut long = response.to_vec();
        long.push(0);
        assert!(!challenge.verify(&long, "hunter2"));
    }

    #[test]
    fn single_bit_flip_rejected() {
        let challenge = Challenge::generate();
        let mut response = challenge.expected_response("hunter2");
        response[7] ^= 0x01;
        assert!(!challenge.verify(&response, "hunter2"));
    }

    #[test]
    fn challenges_are_unique() {
        let a = Challenge::generate();
        let b = Challenge::generate();
        assert_ne!(a.as_bytes(), b.as_bytes());
    }
}
