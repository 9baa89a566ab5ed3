//! Channel authorization for private session channels
//!
//! A connection may only subscribe to `private-session-*` after obtaining a
//! signature over `connection_id:channel`. The hub verifies the signature on
//! subscribe, so the signing secret never leaves the server.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Authorization configuration
#[derive(Debug, Clone)]
pub struct ChannelAuthorizer {
    secret: String,
}

impl ChannelAuthorizer {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Load the signing secret from CHANNEL_SECRET, or make up a per-process one
    pub fn from_env() -> Self {
        match std::env::var("CHANNEL_SECRET")
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        {
            Some(secret) => {
                tracing::info!("Channel authorization using configured secret");
                Self::new(secret)
            }
            None => {
                tracing::warn!(
                    "CHANNEL_SECRET not set - using a random secret, channel signatures won't survive a restart"
                );
                Self::random()
            }
        }
    }

    pub fn random() -> Self {
        let bytes: [u8; 32] = rand::rng().random();
        Self::new(hex::encode(bytes))
    }

    /// Produce the auth token for `connection_id` subscribing to `channel`
    pub fn sign(&self, connection_id: &str, channel: &str) -> String {
        format!("{}:{}", connection_id, self.digest(connection_id, channel))
    }

    /// Verify an auth token presented on subscribe
    pub fn verify(&self, connection_id: &str, channel: &str, token: &str) -> bool {
        let Some((token_connection, signature)) = token.split_once(':') else {
            return false;
        };
        if token_connection != connection_id {
            return false;
        }
        let expected = self.digest(connection_id, channel);
        constant_time_eq(expected.as_bytes(), signature.as_bytes())
    }

    fn digest(&self, connection_id: &str, channel: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.secret.as_bytes());
        hasher.update(b":");
        hasher.update(connection_id.as_bytes());
        hasher.update(b":");
        hasher.update(channel.as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
