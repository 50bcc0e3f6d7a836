//! IPv4 addresses and subnets assigned to this host's interfaces.

use crate::utils::{EngineError, Result};
use ipnetwork::Ipv4Network;
use nix::ifaddrs::getifaddrs;
use std::net::{Ipv4Addr, SocketAddrV4};

/// One IPv4 address on one interface, with its subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddr {
    pub interface: String,
    pub network: Ipv4Network,
}

impl InterfaceAddr {
    pub fn ip(&self) -> Ipv4Addr {
        self.network.ip()
    }
}

/// Enumerate every IPv4 address configured on the host, loopback included.
pub fn interface_addrs() -> Result<Vec<InterfaceAddr>> {
    let addrs = getifaddrs().map_err(|e| EngineError::Io(e.into()))?;
    let mut out = Vec::new();

    for ifaddr in addrs {
        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let ip = *SocketAddrV4::from(*sin).ip();

        let network = ifaddr
            .netmask
            .as_ref()
            .and_then(|m| m.as_sockaddr_in())
            .and_then(|m| Ipv4Network::with_netmask(ip, *SocketAddrV4::from(*m).ip()).ok())
            .or_else(|| Ipv4Network::new(ip, 32).ok());

        if let Some(network) = network {
            out.push(InterfaceAddr {
                interface: ifaddr.interface_name.clone(),
                network,
            });
        }
    }

    Ok(out)
}

/// IPv4 addresses a port binding may name on this host.
pub fn ipv4_addrs() -> Result<Vec<Ipv4Addr>> {
    Ok(interface_addrs()?.iter().map(InterfaceAddr::ip).collect())
}

/// Subnets assigned to host interfaces.
pub fn ipv4_networks() -> Result<Vec<Ipv4Network>> {
    Ok(interface_addrs()?.into_iter().map(|a| a.network).collect())
}

/// First non-loopback IPv4 address of `interface`.
pub fn interface_ipv4(interface: &str) -> Result<Option<Ipv4Addr>> {
    Ok(primary_ipv4(&interface_addrs()?, interface))
}

pub fn primary_ipv4(addrs: &[InterfaceAddr], interface: &str) -> Option<Ipv4Addr> {
    addrs
        .iter()
        .filter(|a| a.interface == interface)
        .map(InterfaceAddr::ip)
        .find(|ip| !ip.is_loopback())
}

/// Whether an interface named `name` exists. A VLAN child such as `eth0.10`
/// counts when its parent exists, since the driver creates it on demand.
pub fn interface_exists(name: &str) -> bool {
    let base = name.split('.').next().unwrap_or(name);
    getifaddrs()
        .map(|mut addrs| addrs.any(|a| a.interface_name == name || a.interface_name == base))
        .unwrap_or(false)
}

/// Whether `addr` falls inside any of `networks`.
pub fn conflicts_with(addr: Ipv4Addr, networks: &[Ipv4Network]) -> bool {
    networks.iter().any(|n| n.contains(addr))
}
