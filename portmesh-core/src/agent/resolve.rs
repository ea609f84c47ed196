//! Remote host resolution and local address discovery
//!
//! Only IPv4 is considered on both sides.

use async_trait::async_trait;
use portmesh_common::{Result, TunnelError};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};

#[async_trait]
pub trait Resolver: Send + Sync {
    /// IPv4 addresses of `host`, deduplicated, in resolver order
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>>;
}

/// Resolver backed by the system's name service
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = host.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }

        let resolution = |reason: String| TunnelError::Resolution {
            host: host.to_string(),
            reason,
        };
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| resolution(e.to_string()))?;

        let mut ips = Vec::new();
        for addr in addrs {
            if let IpAddr::V4(ip) = addr.ip() {
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
        }
        if ips.is_empty() {
            return Err(resolution("no IPv4 address".into()));
        }
        Ok(ips)
    }
}

/// Fixed host table
#[derive(Debug, Default, Clone)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<Ipv4Addr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, ips: Vec<Ipv4Addr>) -> Self {
        self.hosts.insert(host.into(), ips);
        self
    }
}

#[async_trait]
impl Resolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<Ipv4Addr>> {
        match self.hosts.get(host) {
            Some(ips) if !ips.is_empty() => Ok(ips.clone()),
            _ => Err(TunnelError::Resolution {
                host: host.to_string(),
                reason: "unknown host".into(),
            }),
        }
    }
}

/// Addresses that belong to this machine
pub trait LocalAddresses: Send + Sync {
    fn addresses(&self) -> Vec<Ipv4Addr>;
}

/// IPv4 addresses of the host's network interfaces
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl LocalAddresses for SystemInterfaces {
    #[cfg(unix)]
    fn addresses(&self) -> Vec<Ipv4Addr> {
        match nix::ifaddrs::getifaddrs() {
            Ok(interfaces) => {
                let mut ips = Vec::new();
                for ifaddr in interfaces {
                    if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
                        let ip = sin.ip();
                        if !ips.contains(&ip) {
                            ips.push(ip);
                        }
                    }
                }
                ips
            }
            Err(e) => {
                tracing::warn!("listing interface addresses failed: {}", e);
                Vec::new()
            }
        }
    }

    #[cfg(not(unix))]
    fn addresses(&self) -> Vec<Ipv4Addr> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone)]
pub struct FixedAddresses(pub Vec<Ipv4Addr>);

impl LocalAddresses for FixedAddresses {
    fn addresses(&self) -> Vec<Ipv4Addr> {
        self.0.clone()
    }
}
