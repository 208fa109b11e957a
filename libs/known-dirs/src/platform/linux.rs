use super::super::NAMESPACE;
use std::path::PathBuf;

/// e.g. `/home/alice/.config/meshtun/config.toml`
///
/// Holds the non-secret `AgentConfig` (device name, tunnel address, signaling URL,
/// STUN servers, per-peer route selections).
pub fn config_dir() -> Option<PathBuf> {
    Some(dirs::config_local_dir()?.join(NAMESPACE))
}

/// e.g. `/home/alice/.local/share/meshtun`
///
/// Holds the private key and any other material that must not be world-readable.
/// Callers are responsible for creating files here with `0600` permissions.
pub fn data_dir() -> Option<PathBuf> {
    Some(dirs::data_local_dir()?.join(NAMESPACE))
}

/// e.g. `/run/user/1000/meshtun`
///
/// Scratch space for the running agent (nothing here survives a reboot).
pub fn runtime_dir() -> Option<PathBuf> {
    Some(dirs::runtime_dir()?.join(NAMESPACE))
}
