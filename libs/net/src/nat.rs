//! Masquerade (source-NAT) rules, grounded on the same "shell out to a
//! well-known net-admin tool" idiom used for DNS control: `iptables` has no
//! maintained safe Rust binding in this ecosystem, so we drive it as a
//! subprocess the same way `resolvectl` is driven for DNS.

use crate::traits::NATManager;
use async_trait::async_trait;
use ipnet::IpNet;
use tokio::process::Command;

const COMMENT: &str = "meshtun-masquerade";

#[derive(Debug, thiserror::Error)]
pub enum NatError {
    #[error("failed to execute `iptables`")]
    Spawn(#[source] std::io::Error),
    #[error("`iptables {0}` exited with status {1}")]
    NonZeroExit(String, std::process::ExitStatus),
}

/// Installs/removes a single `POSTROUTING` `MASQUERADE` rule for the tunnel's
/// subnet, tagged with [`COMMENT`] so `cleanup`/`table_exists` only ever touch
/// rules this agent installed.
pub struct IpTablesNat;

impl IpTablesNat {
    pub fn new() -> Self {
        Self
    }

    async fn run(args: &[&str]) -> Result<std::process::Output, NatError> {
        let output = Command::new("iptables")
            .args(args)
            .output()
            .await
            .map_err(NatError::Spawn)?;
        Ok(output)
    }

    async fn rule_exists(tunnel_cidr: &str, out_iface: &str) -> Result<bool, NatError> {
        let output = Self::run(&[
            "-t",
            "nat",
            "-C",
            "POSTROUTING",
            "-s",
            tunnel_cidr,
            "-o",
            out_iface,
            "-m",
            "comment",
            "--comment",
            COMMENT,
            "-j",
            "MASQUERADE",
        ])
        .await?;
        Ok(output.status.success())
    }
}

impl Default for IpTablesNat {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NATManager for IpTablesNat {
    /// Idempotent: checks for the rule first via `-C` (iptables' native
    /// existence check) before appending it.
    async fn setup_masquerade(&self, tunnel_cidr: IpNet, out_iface: &str) -> anyhow::Result<()> {
        let cidr = tunnel_cidr.to_string();

        if Self::rule_exists(&cidr, out_iface).await? {
            return Ok(());
        }

        let output = Self::run(&[
            "-t",
            "nat",
            "-A",
            "POSTROUTING",
            "-s",
            &cidr,
            "-o",
            out_iface,
            "-m",
            "comment",
            "--comment",
            COMMENT,
            "-j",
            "MASQUERADE",
        ])
        .await?;

        if !output.status.success() {
            return Err(NatError::NonZeroExit("-A POSTROUTING".to_owned(), output.status).into());
        }

        tracing::info!(%tunnel_cidr, out_iface, "Installed masquerade rule");

        Ok(())
    }

    /// Removes every `POSTROUTING` rule tagged with [`COMMENT`]. Safe to call
    /// when no rule was ever installed.
    async fn cleanup(&self) -> anyhow::Result<()> {
        loop {
            let output = Self::run(&[
                "-t", "nat", "-D", "POSTROUTING", "-m", "comment", "--comment", COMMENT,
            ])
            .await?;

            if !output.status.success() {
                break;
            }
        }

        Ok(())
    }

    async fn table_exists(&self) -> anyhow::Result<bool> {
        let output = Self::run(&["-t", "nat", "-L", "POSTROUTING", "-n"]).await?;
        Ok(output.status.success())
    }
}
