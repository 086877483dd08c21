// SPDX-License-Identifier: AGPL-3.0-or-later
//! Secret and identifier generation
//!
//! Everything here draws from the operating system CSPRNG. Values are handed
//! back to the caller; nothing is persisted.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};

/// Prefix of websocket paths
pub const WEBSOCKET_PREFIX: &str = "/assets";
/// Prefix of plain TCP (HTTP header) paths
pub const TCP_PREFIX: &str = "/user";
/// Prefix of HTTP-upgrade paths
pub const HTTPUPGRADE_PREFIX: &str = "/files";
/// Prefix of gRPC service names
pub const GRPC_PREFIX: &str = "api";

/// Size of the shadowsocks-2022 key in bytes
pub const STREAM_CIPHER_KEY_LEN: usize = 32;

/// An X25519 keypair for a reality inbound, both halves unpadded URL-safe base64
#[derive(Clone, PartialEq, Eq)]
pub struct RealityKeypair {
    /// Goes into the service document
    pub private_key: String,
    /// Goes into the audit store only
    pub public_key: String,
}

impl std::fmt::Debug for RealityKeypair {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("RealityKeypair")
            .field("private_key", &"<redacted>")
            .field("public_key", &self.public_key)
            .finish()
    }
}

impl RealityKeypair {
    /// Generate a fresh keypair from the OS CSPRNG
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self {
            private_key: URL_SAFE_NO_PAD.encode(secret.to_bytes()),
            public_key: URL_SAFE_NO_PAD.encode(public.as_bytes()),
        }
    }
}

/// Source of every random value the mutator needs
pub trait SecretSource {
    /// Random alphanumeric token
    fn token(&mut self) -> String;

    /// Base64 stream-cipher key
    fn stream_cipher_key(&mut self) -> String;

    /// Fresh reality keypair
    fn reality_keypair(&mut self) -> RealityKeypair;

    /// Token with a fixed routing prefix
    fn prefixed_token(&mut self, prefix: &str) -> String {
        format!("{}{}", prefix, self.token())
    }
}

/// Production source backed by `OsRng`
#[derive(Debug, Clone)]
pub struct OsSecretSource {
    token_length: usize,
}

impl OsSecretSource {
    /// Create a source producing tokens of `token_length` characters
    pub fn new(token_length: usize) -> Self {
        Self { token_length }
    }
}

impl Default for OsSecretSource {
    fn default() -> Self {
        Self::new(22)
    }
}

impl SecretSource for OsSecretSource {
    fn token(&mut self) -> String {
        random_token(self.token_length)
    }

    fn stream_cipher_key(&mut self) -> String {
        stream_cipher_key()
    }

    fn reality_keypair(&mut self) -> RealityKeypair {
        RealityKeypair::generate()
    }
}

/// Uniform string over `[A-Za-z0-9]` of the given length
pub fn random_token(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// 32 random bytes, standard base64 with padding
pub fn stream_cipher_key() -> String {
    let mut key = [0u8; STREAM_CIPHER_KEY_LEN];
    OsRng.fill_bytes(&mut key);
    STANDARD.encode(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_length_and_alphabet() {
        let token = random_token(22);
        assert_eq!(token.len(), 22);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));

        assert_eq!(random_token(64).len(), 64);
        assert!(random_token(0).is_empty());
    }

    #[test]
    fn test_tokens_differ() {
        assert_ne!(random_token(22), random_token(22));
    }

    #[test]
    fn test_stream_cipher_key_decodes_to_32_bytes() {
        let key = stream_cipher_key();
        assert_eq!(key.len(), 44);
        assert!(key.ends_with('='));
        let raw = STANDARD.decode(&key).unwrap();
        assert_eq!(raw.len(), STREAM_CIPHER_KEY_LEN);
    }

    #[test]
    fn test_reality_keypair_encoding() {
        let pair = RealityKeypair::generate();
        assert_eq!(pair.private_key.len(), 43);
        assert_eq!(pair.public_key.len(), 43);
        assert!(!pair.private_key.contains('='));
        assert!(!pair.private_key.contains('+') && !pair.private_key.contains('/'));
        assert_ne!(pair.private_key, pair.public_key);
    }

    #[test]
    fn test_public_key_derived_from_private() {
        let pair = RealityKeypair::generate();
        let raw: [u8; 32] = URL_SAFE_NO_PAD
            .decode(&pair.private_key)
            .unwrap()
            .try_into()
            .unwrap();
        let rebuilt = RealityKeypair::from_secret(StaticSecret::from(raw));
        assert_eq!(rebuilt, pair);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = RealityKeypair::generate();
        let rendered = format!("{:?}", pair);
        assert!(!rendered.contains(&pair.private_key));
        assert!(rendered.contains("redacted"));
    }

    #[test]
    fn test_prefixed_token() {
        let mut source = OsSecretSource::new(10);
        let path = source.prefixed_token(WEBSOCKET_PREFIX);
        assert!(path.starts_with("/assets"));
        assert_eq!(path.len(), "/assets".len() + 10);

        let service = source.prefixed_token(GRPC_PREFIX);
        assert!(service.starts_with("api"));
    }
}
