//! PKCE (Proof Key for Code Exchange) utilities for OAuth2
//!
//! Implements RFC 7636 for secure authorization code exchange.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Random bytes behind each code verifier (256 bits)
const VERIFIER_BYTES: usize = 32;

/// Random bytes behind the `state` nonce
const STATE_BYTES: usize = 16;

/// Generate a cryptographically random code verifier
///
/// 32 random bytes encoded as unpadded Base64URL, giving a 43 character
/// verifier inside the 43-128 range required by RFC 7636.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; VERIFIER_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a code challenge from the code verifier
///
/// Uses S256 method: BASE64URL(SHA256(code_verifier))
pub fn generate_code_challenge(verifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(verifier.as_bytes());
    let hash = hasher.finalize();
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate a random hex `state` nonce for CSRF protection
pub fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// PKCE pair containing both verifier and challenge
#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    /// Generate a new PKCE pair
    pub fn new() -> Self {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);
        Self { verifier, challenge }
    }
}

impl Default for PkcePair {
    fn default() -> Self {
        Self::new()
    }
}
