//! Trait boundaries between the agent core and the host operating system.
//!
//! The core depends on these, never on `rtnetlink`/`iptables`/a filesystem path
//! directly, so it can be driven from tests without root privileges.

use anyhow::Result;
use async_trait::async_trait;
use ipnet::IpNet;
use std::net::IpAddr;

/// Address, link and route control for the tunnel interface, plus IP forwarding
/// and DNS handover.
#[async_trait]
pub trait NetworkManager: Send + Sync {
    async fn add_address(&self, iface: &str, cidr: IpNet) -> Result<()>;
    async fn set_link_up(&self, iface: &str) -> Result<()>;
    async fn add_route(&self, iface: &str, cidr: IpNet) -> Result<()>;
    async fn remove_route(&self, iface: &str, cidr: IpNet) -> Result<()>;
    async fn get_forwarding(&self, iface: &str) -> Result<bool>;
    async fn set_forwarding(&self, iface: &str, enabled: bool) -> Result<()>;
    async fn set_dns(&self, iface: &str, servers: &[IpAddr], search_domains: &[String]) -> Result<()>;
    async fn revert_dns(&self, iface: &str) -> Result<()>;
    async fn find_interface_for_subnet(&self, cidr: IpNet) -> Result<Option<String>>;
}

/// Masquerade (source-NAT) rules so traffic leaving the tunnel can reach the
/// wider network via the host's default route.
#[async_trait]
pub trait NATManager: Send + Sync {
    async fn setup_masquerade(&self, tunnel_cidr: IpNet, out_iface: &str) -> Result<()>;
    async fn cleanup(&self) -> Result<()>;
    async fn table_exists(&self) -> Result<bool>;
}

/// Rotates the signaling access token using a long-lived refresh token.
///
/// No Linux implementation ships in this crate: the signaling server this agent
/// talks to authenticates with a long-lived token supplied at startup, so token
/// rotation has no backing service to call yet. The trait is kept so the agent
/// core can be wired up against one without changing its dependency surface.
#[async_trait]
pub trait AuthRefresher: Send + Sync {
    async fn refresh(
        &self,
        ctx: &str,
        device_id: &str,
        refresh_token: &str,
        server_url: &str,
    ) -> Result<(String, String, u64)>;
}

/// Persists the device's identity and settings to disk.
#[async_trait]
pub trait ConfigPersister: Send + Sync {
    async fn save_secrets(&self, path: &std::path::Path, cfg: &crate::AgentConfig) -> Result<()>;
    async fn save_config(&self, path: &std::path::Path, cfg: &crate::AgentConfig) -> Result<()>;
}
