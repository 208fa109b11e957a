//! Platform-specific directory paths for meshtun's config, secrets and runtime state.

#[cfg(target_os = "linux")]
mod platform;

#[cfg(target_os = "linux")]
pub use platform::{config_dir, data_dir, runtime_dir};

pub(crate) const NAMESPACE: &str = "meshtun";
