//! PKCE material for the authorization-code flow (RFC 7636, S256 only).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::{RngCore, rngs::OsRng};
use sha2::{Digest, Sha256};

/// New code verifier: 48 random bytes, base64url (64 chars, inside the
/// 43–128 range the RFC allows).
pub(crate) fn generate_verifier() -> String {
    let mut bytes = [0u8; 48];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// S256 challenge: `BASE64URL(SHA256(verifier))`.
pub(crate) fn challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Anti-forgery `state` parameter.
pub(crate) fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Nonce bound into the issued ID token.
pub(crate) fn generate_nonce() -> String {
    let mut bytes = [0u8; 16];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
