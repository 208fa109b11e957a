//! On-disk representation of an agent's identity and settings.

use crate::traits::ConfigPersister;
use async_trait::async_trait;
use ipnet::IpNet;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// A device's identity, network settings and per-peer route selections.
///
/// Split across two files on disk: [`FileConfigPersister::save_secrets`] writes
/// only `private_key` (mode `0600`), [`FileConfigPersister::save_config`] writes
/// the rest. Both accept the same struct so callers don't need to track which
/// field lives where.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub private_key: SecretString,
    pub device_name: String,
    pub tunnel_address: IpNet,
    pub signaling_url: String,
    #[serde(default)]
    pub stun_servers: Vec<String>,
    /// Per-peer opt-in to the routes that peer advertises (§4.1.1's acceptance
    /// filter). Absent entries accept no routes from that peer.
    #[serde(default)]
    pub peer_routes: HashMap<String, Vec<IpNet>>,
}

#[derive(Debug, Serialize)]
struct SecretsFile<'a> {
    private_key: &'a SecretString,
}

#[derive(Debug, Deserialize)]
struct SecretsFileOwned {
    private_key: SecretString,
}

#[derive(Debug, Serialize)]
struct ConfigFile<'a> {
    device_name: &'a str,
    tunnel_address: IpNet,
    signaling_url: &'a str,
    stun_servers: &'a [String],
    peer_routes: &'a HashMap<String, Vec<IpNet>>,
}

#[derive(Debug, Deserialize)]
struct ConfigFileOwned {
    device_name: String,
    tunnel_address: IpNet,
    signaling_url: String,
    #[serde(default)]
    stun_servers: Vec<String>,
    #[serde(default)]
    peer_routes: HashMap<String, Vec<IpNet>>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    #[error("failed to create parent directory {0}")]
    CreateDir(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to serialize config as TOML")]
    Serialize(#[from] toml::ser::Error),
    #[error("failed to parse {0} as TOML")]
    Parse(std::path::PathBuf, #[source] toml::de::Error),
    #[error("failed to read {0}")]
    Read(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to write {0}")]
    Write(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to set permissions on {0}")]
    SetPermissions(std::path::PathBuf, #[source] std::io::Error),
}

impl AgentConfig {
    /// Reads both halves of the on-disk representation back into one struct, the
    /// inverse of [`FileConfigPersister::save_secrets`] + [`FileConfigPersister::save_config`].
    ///
    /// Loading is squarely an ambient CLI concern (the binary has to construct an
    /// `AgentConfig` from *somewhere* before it can call `Agent::new`); it is not
    /// part of the core's `ConfigPersister` collaborator trait, which spec.md only
    /// asks to `save`.
    pub async fn load(config_path: &Path, secrets_path: &Path) -> Result<Self, ConfigFileError> {
        let config_contents = tokio::fs::read_to_string(config_path)
            .await
            .map_err(|e| ConfigFileError::Read(config_path.to_path_buf(), e))?;
        let config: ConfigFileOwned =
            toml::from_str(&config_contents).map_err(|e| ConfigFileError::Parse(config_path.to_path_buf(), e))?;

        let secrets_contents = tokio::fs::read_to_string(secrets_path)
            .await
            .map_err(|e| ConfigFileError::Read(secrets_path.to_path_buf(), e))?;
        let secrets: SecretsFileOwned =
            toml::from_str(&secrets_contents).map_err(|e| ConfigFileError::Parse(secrets_path.to_path_buf(), e))?;

        Ok(Self {
            private_key: secrets.private_key,
            device_name: config.device_name,
            tunnel_address: config.tunnel_address,
            signaling_url: config.signaling_url,
            stun_servers: config.stun_servers,
            peer_routes: config.peer_routes,
        })
    }
}

/// Writes `AgentConfig` to disk as TOML, using `tokio::fs` so callers on the
/// agent's async runtime never block on I/O.
pub struct FileConfigPersister;

impl FileConfigPersister {
    pub fn new() -> Self {
        Self
    }

    async fn write_atomic(path: &Path, contents: String, mode: u32) -> Result<(), ConfigFileError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ConfigFileError::CreateDir(parent.to_path_buf(), e))?;
        }

        tokio::fs::write(path, contents)
            .await
            .map_err(|e| ConfigFileError::Write(path.to_path_buf(), e))?;

        #[cfg(unix)]
        {
            let permissions = std::fs::Permissions::from_mode(mode);
            tokio::fs::set_permissions(path, permissions)
                .await
                .map_err(|e| ConfigFileError::SetPermissions(path.to_path_buf(), e))?;
        }

        Ok(())
    }
}

impl Default for FileConfigPersister {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigPersister for FileConfigPersister {
    /// Writes only the private key, mode `0600` — nothing else in `cfg` is secret.
    async fn save_secrets(&self, path: &Path, cfg: &AgentConfig) -> anyhow::Result<()> {
        let file = SecretsFile {
            private_key: &cfg.private_key,
        };
        let contents = toml::to_string_pretty(&file).map_err(ConfigFileError::from)?;
        Self::write_atomic(path, contents, 0o600).await?;
        Ok(())
    }

    /// Writes everything but the private key, mode `0644` (not secret, but not
    /// writable by other users either).
    async fn save_config(&self, path: &Path, cfg: &AgentConfig) -> anyhow::Result<()> {
        let file = ConfigFile {
            device_name: &cfg.device_name,
            tunnel_address: cfg.tunnel_address,
            signaling_url: &cfg.signaling_url,
            stun_servers: &cfg.stun_servers,
            peer_routes: &cfg.peer_routes,
        };
        let contents = toml::to_string_pretty(&file).map_err(ConfigFileError::from)?;
        Self::write_atomic(path, contents, 0o644).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret as _;

    fn sample_config() -> AgentConfig {
        AgentConfig {
            private_key: SecretString::from("test-private-key"),
            device_name: "laptop".to_owned(),
            tunnel_address: "100.64.0.1/32".parse().unwrap(),
            signaling_url: "wss://signal.example.com".to_owned(),
            stun_servers: vec!["stun:stun.example.com:3478".to_owned()],
            peer_routes: HashMap::from([(
                "peer-a".to_owned(),
                vec!["10.0.0.0/24".parse().unwrap()],
            )]),
        }
    }

    #[tokio::test]
    async fn save_secrets_writes_only_private_key_with_restricted_permissions() {
        let dir = tempdir();
        let path = dir.join("secrets.toml");
        let persister = FileConfigPersister::new();
        let cfg = sample_config();

        persister.save_secrets(&path, &cfg).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("test-private-key"));
        assert!(!written.contains("signal.example.com"));

        #[cfg(unix)]
        {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o600);
        }

        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn save_config_omits_private_key() {
        let dir = tempdir();
        let path = dir.join("config.toml");
        let persister = FileConfigPersister::new();
        let cfg = sample_config();

        persister.save_config(&path, &cfg).await.unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(!written.contains("test-private-key"));
        assert!(written.contains("signal.example.com"));

        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    fn tempdir() -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "net-config-test-{}",
            cfg_test_unique_suffix()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn cfg_test_unique_suffix() -> String {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!(
            "{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn private_key_exposed_for_wire_config() {
        let cfg = sample_config();
        assert_eq!(cfg.private_key.expose_secret(), "test-private-key");
    }

    #[tokio::test]
    async fn load_recombines_what_save_split_apart() {
        let dir = tempdir();
        let config_path = dir.join("config.toml");
        let secrets_path = dir.join("secrets.toml");
        let persister = FileConfigPersister::new();
        let cfg = sample_config();

        persister.save_config(&config_path, &cfg).await.unwrap();
        persister.save_secrets(&secrets_path, &cfg).await.unwrap();

        let loaded = AgentConfig::load(&config_path, &secrets_path).await.unwrap();

        assert_eq!(loaded.device_name, cfg.device_name);
        assert_eq!(loaded.tunnel_address, cfg.tunnel_address);
        assert_eq!(loaded.signaling_url, cfg.signaling_url);
        assert_eq!(loaded.stun_servers, cfg.stun_servers);
        assert_eq!(loaded.peer_routes, cfg.peer_routes);
        assert_eq!(loaded.private_key.expose_secret(), cfg.private_key.expose_secret());

        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }
}
