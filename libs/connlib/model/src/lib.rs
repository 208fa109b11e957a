//! Shared types and behavior between all the other crates.
//!
//! This includes types provided by external crates, i.e. [boringtun] to make sure that
//! we are using the same version across our own crates.

#![cfg_attr(test, allow(clippy::unwrap_used))]

pub use boringtun::x25519::PublicKey;
pub use boringtun::x25519::StaticSecret;

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Identifies a peer across signaling, the agent's session map and the bridge's
/// channel map. The wire protocol carries this as a plain string (see `peerId` in the
/// signaling messages), so `PeerId` is a thin wrapper rather than a UUID — the id
/// space is whatever the signaling relay hands out.
#[derive(
    Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, derive_more::Display, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for PeerId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.to_owned()))
    }
}

impl From<PeerId> for String {
    fn from(value: PeerId) -> Self {
        value.0
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Encodes a [`PublicKey`] the way the wire protocol expects it: standard base64,
/// matching WireGuard's own `wg pubkey` convention.
pub fn encode_public_key(key: &PublicKey) -> String {
    base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key.as_bytes())
}

/// Inverse of [`encode_public_key`]. Returns `None` on malformed base64 or a decoded
/// length other than 32 bytes.
pub fn decode_public_key(s: &str) -> Option<PublicKey> {
    let bytes = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, s).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;

    Some(PublicKey::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrips_through_json() {
        let id = PeerId::new("alpha");
        let json = serde_json::to_string(&id).unwrap();

        assert_eq!(json, "\"alpha\"");
        assert_eq!(serde_json::from_str::<PeerId>(&json).unwrap(), id);
    }

    #[test]
    fn public_key_roundtrips_through_base64() {
        let secret = StaticSecret::from([7u8; 32]);
        let public = PublicKey::from(&secret);

        let encoded = encode_public_key(&public);
        let decoded = decode_public_key(&encoded).unwrap();

        assert_eq!(decoded.as_bytes(), public.as_bytes());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_public_key("not-base64!!").is_none());
        assert!(decode_public_key("aGVsbG8=").is_none());
    }
}
