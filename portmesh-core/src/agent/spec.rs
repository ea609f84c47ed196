//! Tunnel specification strings: `lhost:lport[@rhost[:rport]]`

use portmesh_common::{Result, TunnelError};
use regex::Regex;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static SPEC_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9\-.]*):([0-9]+|\*)(?:@([^:@]+)(?::([0-9]+))?)?$")
        .expect("tunnel spec pattern compiles")
});

/// A port in a spec: a number, or `*` for any port announced at runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSpec {
    Fixed(u16),
    Any,
}

impl PortSpec {
    pub fn fixed(self) -> Option<u16> {
        match self {
            PortSpec::Fixed(port) => Some(port),
            PortSpec::Any => None,
        }
    }
}

impl fmt::Display for PortSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortSpec::Fixed(port) => write!(f, "{port}"),
            PortSpec::Any => f.write_str("*"),
        }
    }
}

/// One local service to expose on a remote host
///
/// Immutable once parsed. The remote host may only be omitted for a
/// wildcard local port, in which case it defaults to the local host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelSpec {
    local_host: String,
    local_port: PortSpec,
    remote_host: String,
    remote_port: PortSpec,
}

impl TunnelSpec {
    pub fn parse(input: &str) -> Result<Self> {
        let malformed = || TunnelError::MalformedSpec(input.to_string());
        let caps = SPEC_PATTERN.captures(input).ok_or_else(malformed)?;

        let local_host = caps[1].to_string();
        let local_port = match &caps[2] {
            "*" => PortSpec::Any,
            digits => match digits.parse::<u16>() {
                Ok(0) | Err(_) => return Err(malformed()),
                Ok(port) => PortSpec::Fixed(port),
            },
        };

        let remote_host = match caps.get(3) {
            Some(host) => host.as_str().to_string(),
            None if local_port == PortSpec::Any => local_host.clone(),
            None => return Err(malformed()),
        };
        let remote_port = match caps.get(4) {
            Some(digits) => PortSpec::Fixed(digits.as_str().parse().map_err(|_| malformed())?),
            None => local_port,
        };

        Ok(Self {
            local_host,
            local_port,
            remote_host,
            remote_port,
        })
    }

    pub fn local_host(&self) -> &str {
        &self.local_host
    }

    pub fn local_port(&self) -> PortSpec {
        self.local_port
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn remote_port(&self) -> PortSpec {
        self.remote_port
    }

    /// Principal this spec authenticates as
    ///
    /// A wildcard spec is identified by its host alone so one registration
    /// covers every port detected for it.
    pub fn identity(&self) -> String {
        match self.local_port {
            PortSpec::Any => self.local_host.clone(),
            PortSpec::Fixed(port) => format!("{}.{}", self.local_host, port),
        }
    }

    pub fn matches_local_port(&self, port: u16) -> bool {
        match self.local_port {
            PortSpec::Any => true,
            PortSpec::Fixed(own) => own == port,
        }
    }

    /// Address the agent relays forwarded connections to
    pub fn local_target(&self, local_port: u16) -> String {
        format!("{}:{}", self.local_host, local_port)
    }
}

impl FromStr for TunnelSpec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for TunnelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.local_host, self.local_port, self.remote_host)?;
        match self.remote_port {
            PortSpec::Fixed(port) => write!(f, ":{port}"),
            PortSpec::Any => Ok(()),
        }
    }
}

/// Parse a statically configured list, failing on the first malformed entry
pub fn parse_specs<I, S>(items: I) -> Result<Vec<TunnelSpec>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    items
        .into_iter()
        .map(|item| TunnelSpec::parse(item.as_ref()))
        .collect()
}

/// One outbound tunnel: a spec at a concrete local port, to one resolved IP
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    /// `lhost.lport` with the concrete local port
    pub identity: String,
    pub ip: Ipv4Addr,
}

impl ConnectionKey {
    pub fn new(spec: &TunnelSpec, local_port: u16, ip: Ipv4Addr) -> Self {
        Self {
            identity: format!("{}.{}", spec.local_host, local_port),
            ip,
        }
    }
}

impl fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.identity, self.ip)
    }
}
