use crate::config::RelayConfig;
use anyhow::{anyhow, Context};
use std::net::IpAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpNetwork {
    addr: IpAddr,
    prefix: u8,
}

impl IpNetwork {
    /// Parse `addr/prefix`; a bare address is a host route.
    pub fn parse(cidr: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = match cidr.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (cidr.trim(), None),
        };
        let addr: IpAddr = addr
            .parse()
            .with_context(|| format!("invalid network address in {cidr:?}"))?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p
                .parse::<u8>()
                .with_context(|| format!("invalid prefix length in {cidr:?}"))?,
            None => max,
        };
        if prefix > max {
            return Err(anyhow!("prefix length {prefix} too long in {cidr:?}"));
        }
        Ok(IpNetwork { addr, prefix })
    }

    pub fn contains(&self, ip: IpAddr) -> bool {
        let ip = match ip {
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
            v4 => v4,
        };
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - self.prefix as u32).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - self.prefix as u32).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Decides whether a connection carries outbound mail from local users.
#[derive(Debug, Clone)]
pub struct RelayPolicy {
    networks: Vec<IpNetwork>,
    sasl_authenticated: bool,
}

impl RelayPolicy {
    pub fn from_config(config: &RelayConfig) -> anyhow::Result<Self> {
        let networks = config
            .networks
            .iter()
            .map(|cidr| IpNetwork::parse(cidr))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(RelayPolicy {
            networks,
            sasl_authenticated: config.sasl_authenticated,
        })
    }

    pub fn is_relaying(&self, remote_ip: Option<IpAddr>, auth_authen: Option<&str>) -> bool {
        if self.sasl_authenticated && auth_authen.is_some_and(|login| !login.is_empty()) {
            return true;
        }
        remote_ip.is_some_and(|ip| self.networks.iter().any(|net| net.contains(ip)))
    }
}
