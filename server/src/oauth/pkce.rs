//! PKCE (RFC 7636) verifier and S256 challenge generation.
//!
//! The `state` parameter is produced by the same generator as the verifier but is an
//! independent draw.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::{rngs::OsRng, Rng as _};
use sha2::{Digest, Sha256};

/// RFC 7636 "unreserved" characters
pub const UNRESERVED: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-._~";

/// Length of generated verifiers and states. 64 draws from 66 symbols is ~386 bits.
pub const VERIFIER_LEN: usize = 64;

pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;

/// The only challenge method we send
pub const CHALLENGE_METHOD: &str = "S256";

/// A verifier and the challenge derived from it
#[derive(Clone)]
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

impl Pkce {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = derive_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

fn random_unreserved(len: usize) -> String {
    // OsRng panics if the OS random source is unavailable, which we treat as fatal
    let mut rng = OsRng;
    (0..len)
        .map(|_| UNRESERVED[rng.gen_range(0..UNRESERVED.len())] as char)
        .collect()
}

/// A fresh code verifier drawn uniformly from the unreserved set
pub fn generate_verifier() -> String {
    random_unreserved(VERIFIER_LEN)
}

/// A fresh anti-CSRF `state` value
pub fn generate_state() -> String {
    random_unreserved(VERIFIER_LEN)
}

/// `base64url_no_pad(SHA256(verifier))`
pub fn derive_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Whether `value` is a well-formed verifier: right length, unreserved characters only
pub fn is_valid_verifier(value: &str) -> bool {
    (MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&value.len())
        && value.bytes().all(|b| UNRESERVED.contains(&b))
}
