//! The agent's runtime configuration: parsed, validated forms of the fields that
//! come off disk as [`net::AgentConfig`].

use connlib_model::PeerId;
use ipnet::IpNet;
use secrecy::{ExposeSecret as _, SecretString};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// Device identity and network settings for one run of the agent. Immutable once
/// `Agent::new` has consumed it (spec's `config` field on `Agent`).
#[derive(Clone)]
pub struct AgentConfig {
    pub private_key: boringtun::x25519::StaticSecret,
    pub local_name: PeerId,
    pub tunnel_address: IpNet,
    pub signaling_url: Url,
    pub signaling_token: SecretString,
    pub stun_servers: Vec<String>,
    /// Per-peer opt-in to the routes that peer advertises (§4.1.1).
    pub peer_routes: HashMap<String, Vec<IpNet>>,
    pub dial_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("private key must be 32 bytes of standard base64")]
    InvalidPrivateKey,
    #[error("signaling URL is not valid: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

impl AgentConfig {
    /// Builds a runtime config from the on-disk [`net::AgentConfig`] plus the
    /// bearer token used to authenticate with the signaling relay (kept out of
    /// `net::AgentConfig` since it is usually supplied by an external auth flow,
    /// not persisted alongside the device identity).
    pub fn from_persisted(cfg: &net::AgentConfig, signaling_token: SecretString) -> Result<Self, ConfigError> {
        let private_key = decode_private_key(cfg.private_key.expose_secret())
            .ok_or(ConfigError::InvalidPrivateKey)?;

        Ok(Self {
            private_key,
            local_name: PeerId::new(cfg.device_name.clone()),
            tunnel_address: cfg.tunnel_address,
            signaling_url: Url::parse(&cfg.signaling_url)?,
            signaling_token,
            stun_servers: cfg.stun_servers.clone(),
            peer_routes: cfg.peer_routes.clone(),
            dial_timeout: Duration::from_secs(10),
        })
    }
}

/// Decodes a WireGuard private key the same way [`connlib_model::decode_public_key`]
/// decodes a public one: standard base64, 32 raw bytes.
fn decode_private_key(s: &str) -> Option<boringtun::x25519::StaticSecret> {
    use base64::Engine as _;

    let bytes = base64::engine::general_purpose::STANDARD.decode(s).ok()?;
    let bytes: [u8; 32] = bytes.try_into().ok()?;

    Some(boringtun::x25519::StaticSecret::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_base64_private_key() {
        assert!(decode_private_key("not-base64!!").is_none());
    }

    #[test]
    fn rejects_wrong_length_private_key() {
        use base64::Engine as _;
        let short = base64::engine::general_purpose::STANDARD.encode([1u8; 16]);
        assert!(decode_private_key(&short).is_none());
    }

    #[test]
    fn accepts_32_byte_key() {
        use base64::Engine as _;
        let key = base64::engine::general_purpose::STANDARD.encode([7u8; 32]);
        assert!(decode_private_key(&key).is_some());
    }
}
