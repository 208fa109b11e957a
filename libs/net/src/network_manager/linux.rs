//! Linux implementation of [`NetworkManager`](crate::NetworkManager), built on
//! `rtnetlink` for addressing/routing, `resolvectl` for DNS handover and
//! `/proc/sys/net/ipv4/ip_forward` for forwarding.

use crate::network_manager::NetworkManagerError;
use crate::traits::NetworkManager;
use async_trait::async_trait;
use futures::TryStreamExt as _;
use ipnet::IpNet;
use netlink_packet_route::link::LinkAttribute;
use netlink_packet_route::route::{RouteAttribute, RouteProtocol, RouteScope};
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder, new_connection};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Drives interface addressing, routing, forwarding and DNS via `rtnetlink` and
/// `resolvectl`.
///
/// Holds its own netlink connection task for the lifetime of the manager; one
/// instance is shared (via `Arc`) across however many interfaces the agent
/// touches, matching the teacher's single-connection-per-process pattern.
pub struct LinuxNetworkManager {
    handle: Handle,
    _connection_task: tokio::task::JoinHandle<()>,
}

impl LinuxNetworkManager {
    /// Panics if called without a Tokio runtime, same as the netlink socket the
    /// teacher's tunnel device manager opens.
    pub fn new() -> anyhow::Result<Self> {
        let (connection, handle, _messages) = new_connection()?;

        Ok(Self {
            handle,
            _connection_task: tokio::spawn(connection),
        })
    }

    async fn link_index(&self, iface: &str) -> Result<u32, NetworkManagerError> {
        self.handle
            .link()
            .get()
            .match_name(iface.to_owned())
            .execute()
            .try_next()
            .await
            .map_err(|_| NetworkManagerError::NoSuchInterface(iface.to_owned()))?
            .map(|msg| msg.header.index)
            .ok_or_else(|| NetworkManagerError::NoSuchInterface(iface.to_owned()))
    }

    fn route_message(idx: u32, cidr: IpNet) -> netlink_packet_route::route::RouteMessage {
        match cidr {
            IpNet::V4(net) => RouteMessageBuilder::<Ipv4Addr>::new()
                .output_interface(idx)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .destination_prefix(net.network(), net.prefix_len())
                .build(),
            IpNet::V6(net) => RouteMessageBuilder::<Ipv6Addr>::new()
                .output_interface(idx)
                .protocol(RouteProtocol::Static)
                .scope(RouteScope::Universe)
                .destination_prefix(net.network(), net.prefix_len())
                .build(),
        }
    }

    async fn resolvectl(iface: &str, cmd: &str, params: &[String]) -> Result<(), NetworkManagerError> {
        let status = tokio::process::Command::new("resolvectl")
            .arg(cmd)
            .arg(iface)
            .args(params)
            .status()
            .await
            .map_err(|e| NetworkManagerError::ResolvectlSpawn(cmd.to_owned(), e))?;

        if !status.success() {
            return Err(NetworkManagerError::ResolvectlNonZeroExit(cmd.to_owned()));
        }

        Ok(())
    }
}

#[async_trait]
impl NetworkManager for LinuxNetworkManager {
    async fn add_address(&self, iface: &str, cidr: IpNet) -> anyhow::Result<()> {
        let idx = self.link_index(iface).await?;

        let result = match cidr {
            IpNet::V4(net) => {
                self.handle
                    .address()
                    .add(idx, net.addr().into(), net.prefix_len())
                    .execute()
                    .await
            }
            IpNet::V6(net) => {
                self.handle
                    .address()
                    .add(idx, net.addr().into(), net.prefix_len())
                    .execute()
                    .await
            }
        };

        match result {
            Ok(()) => Ok(()),
            Err(NetlinkError(err)) if err.raw_code() == -libc::EEXIST => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_link_up(&self, iface: &str) -> anyhow::Result<()> {
        let idx = self.link_index(iface).await?;

        self.handle
            .link()
            .set(LinkUnspec::new_with_index(idx).up().build())
            .execute()
            .await?;

        Ok(())
    }

    async fn add_route(&self, iface: &str, cidr: IpNet) -> anyhow::Result<()> {
        let idx = self.link_index(iface).await?;
        let message = Self::route_message(idx, cidr);

        match self.handle.route().add(message).execute().await {
            Ok(()) => {}
            Err(NetlinkError(err)) if err.raw_code() == -libc::EEXIST => {}
            Err(NetlinkError(err)) if err.raw_code() == -libc::EOPNOTSUPP => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    async fn remove_route(&self, iface: &str, cidr: IpNet) -> anyhow::Result<()> {
        let idx = self.link_index(iface).await?;
        let message = Self::route_message(idx, cidr);

        match self.handle.route().del(message).execute().await {
            Ok(()) => {}
            Err(NetlinkError(err)) if err.raw_code() == -libc::ENOENT => {}
            Err(NetlinkError(err)) if err.raw_code() == -libc::ESRCH => {}
            Err(err) => return Err(err.into()),
        }

        Ok(())
    }

    async fn get_forwarding(&self, iface: &str) -> anyhow::Result<bool> {
        let path = forwarding_path(iface);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| NetworkManagerError::ProcFsRead(path.clone(), e))?;

        Ok(contents.trim() == "1")
    }

    async fn set_forwarding(&self, iface: &str, enabled: bool) -> anyhow::Result<()> {
        let path = forwarding_path(iface);
        let value = if enabled { "1" } else { "0" };

        tokio::fs::write(&path, value)
            .await
            .map_err(|e| NetworkManagerError::ProcFsWrite(path, e))?;

        Ok(())
    }

    /// Configures `systemd-resolved` to use `servers` for lookups routed through
    /// `iface`, with `search_domains` (or the catch-all `~.` routing domain if
    /// none are given).
    async fn set_dns(&self, iface: &str, servers: &[IpAddr], search_domains: &[String]) -> anyhow::Result<()> {
        let dns_params: Vec<String> = servers.iter().map(ToString::to_string).collect();
        Self::resolvectl(iface, "dns", &dns_params).await?;

        let domain_params = if search_domains.is_empty() {
            vec!["~.".to_owned()]
        } else {
            search_domains.to_vec()
        };
        Self::resolvectl(iface, "domain", &domain_params).await?;

        tracing::info!(iface, ?servers, "Configured DNS sentinels via resolvectl");

        Ok(())
    }

    /// Resets `iface`'s `systemd-resolved` link configuration to empty, letting
    /// the global resolver fall back to whatever it was before.
    async fn revert_dns(&self, iface: &str) -> anyhow::Result<()> {
        Self::resolvectl(iface, "revert", &[]).await?;
        Ok(())
    }

    /// Looks for a connected route whose destination prefix contains `cidr`
    /// and returns the name of the interface it egresses through.
    async fn find_interface_for_subnet(&self, cidr: IpNet) -> anyhow::Result<Option<String>> {
        let routes = self
            .handle
            .route()
            .get(RouteMessageBuilder::<IpAddr>::new().build())
            .execute()
            .try_collect::<Vec<_>>()
            .await?;

        for route in routes {
            let Some(idx) = route.attributes.iter().find_map(|attr| match attr {
                RouteAttribute::Oif(idx) => Some(*idx),
                _ => None,
            }) else {
                continue;
            };

            let Some(route_net) = route_destination(&route) else {
                continue;
            };

            if !route_net.contains(&cidr.network()) {
                continue;
            }

            let Some(link) = self
                .handle
                .link()
                .get()
                .match_index(idx)
                .execute()
                .try_next()
                .await?
            else {
                continue;
            };

            let name = link.attributes.iter().find_map(|attr| match attr {
                LinkAttribute::IfName(name) => Some(name.clone()),
                _ => None,
            });

            if name.is_some() {
                return Ok(name);
            }
        }

        Ok(None)
    }
}

fn forwarding_path(iface: &str) -> std::path::PathBuf {
    Path::new("/proc/sys/net/ipv4/conf")
        .join(iface)
        .join("forwarding")
}

fn route_destination(route: &netlink_packet_route::route::RouteMessage) -> Option<IpNet> {
    let prefix_len = route.header.destination_prefix_length;

    route.attributes.iter().find_map(|attr| match attr {
        RouteAttribute::Destination(addr) => {
            let ip: IpAddr = addr_to_ip(addr)?;
            IpNet::new(ip, prefix_len).ok()
        }
        _ => None,
    })
}

fn addr_to_ip(addr: &netlink_packet_route::route::RouteAddress) -> Option<IpAddr> {
    use netlink_packet_route::route::RouteAddress;

    match addr {
        RouteAddress::Inet(ip) => Some(IpAddr::V4(*ip)),
        RouteAddress::Inet6(ip) => Some(IpAddr::V6(*ip)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwarding_path_is_per_interface() {
        assert_eq!(
            forwarding_path("tun-meshtun"),
            std::path::PathBuf::from("/proc/sys/net/ipv4/conf/tun-meshtun/forwarding")
        );
    }
}
