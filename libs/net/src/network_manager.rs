//! [`NetworkManager`](crate::NetworkManager) implementations.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "linux")]
pub use linux::LinuxNetworkManager;

#[derive(Debug, thiserror::Error)]
pub enum NetworkManagerError {
    #[error("interface {0} not found")]
    NoSuchInterface(String),
    #[error("failed to execute `resolvectl {0}`")]
    ResolvectlSpawn(String, #[source] std::io::Error),
    #[error("`resolvectl {0}` exited with a non-zero status")]
    ResolvectlNonZeroExit(String),
    #[error("failed to read {0}")]
    ProcFsRead(std::path::PathBuf, #[source] std::io::Error),
    #[error("failed to write {0}")]
    ProcFsWrite(std::path::PathBuf, #[source] std::io::Error),
}
