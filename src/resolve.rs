// resolve.rs - host specifications to target addresses, and source discovery

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use ipnet::{Ipv4AddrRange, Ipv4Net};
use log::debug;
use socket2::{Domain, Protocol, Socket, Type};

use crate::PingError;

/// Shortest prefix accepted in a CIDR specification. A /8 already expands to
/// 16,777,216 addresses.
pub const MIN_CIDR_PREFIX: u8 = 8;

/// Resolves a host specification to IPv4 addresses.
///
/// - `a.b.c.d` resolves to itself.
/// - `host` resolves to the first IPv4 address the system resolver returns.
/// - `a.b.c.d/n` and `host/n` expand to every address of the block in
///   ascending order, starting at the network address.
///
/// IPv6 results are never returned.
pub async fn resolve(spec: &str) -> Result<Vec<Ipv4Addr>, PingError> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(PingError::InvalidDestination(
            "empty host specification".to_string(),
        ));
    }

    match spec.split_once('/') {
        Some((host, prefix)) => {
            let base = resolve_host(host).await?;
            expand_cidr(&format!("{base}/{prefix}")).map_err(|e| match e {
                PingError::AddressCountMismatch {
                    expected, actual, ..
                } => PingError::AddressCountMismatch {
                    spec: spec.to_string(),
                    expected,
                    actual,
                },
                other => other,
            })
        }
        None => Ok(vec![resolve_host(spec).await?]),
    }
}

/// Resolves a single host name or IPv4 literal.
pub async fn resolve_host(host: &str) -> Result<Ipv4Addr, PingError> {
    if let Ok(addr) = host.parse::<Ipv4Addr>() {
        return Ok(addr);
    }
    if host.parse::<Ipv6Addr>().is_ok() {
        return Err(PingError::NoIpv4Address(host.to_string()));
    }

    let addrs = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|source| PingError::Resolve {
            spec: host.to_string(),
            source,
        })?;

    let found = addrs
        .filter_map(|addr| match addr.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .next()
        .ok_or_else(|| PingError::NoIpv4Address(host.to_string()))?;
    debug!("resolved {host} to {found}");
    Ok(found)
}

/// Expands a literal CIDR block such as `192.168.2.1/24` to all of its
/// addresses, network and broadcast included.
pub fn expand_cidr(spec: &str) -> Result<Vec<Ipv4Addr>, PingError> {
    let net: Ipv4Net = spec
        .parse()
        .map_err(|e| PingError::InvalidDestination(format!("{spec}: {e}")))?;
    if net.prefix_len() < MIN_CIDR_PREFIX {
        return Err(PingError::InvalidDestination(format!(
            "{spec}: prefix shorter than /{MIN_CIDR_PREFIX}"
        )));
    }

    let net = net.trunc();
    let addrs: Vec<Ipv4Addr> = Ipv4AddrRange::new(net.network(), net.broadcast()).collect();

    let expected = 1u64 << (32 - u32::from(net.prefix_len()));
    let actual = addrs.len() as u64;
    if actual != expected {
        return Err(PingError::AddressCountMismatch {
            spec: spec.to_string(),
            expected,
            actual,
        });
    }
    Ok(addrs)
}

/// Source of the local address used when a session has no explicit source.
pub trait SourceDiscovery: Send + Sync {
    fn discover(&self) -> Result<Ipv4Addr, PingError>;
}

/// Always reports the same address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedSource(pub Ipv4Addr);

impl SourceDiscovery for FixedSource {
    fn discover(&self) -> Result<Ipv4Addr, PingError> {
        Ok(self.0)
    }
}

/// Finds the address of the interface holding the default route.
///
/// Connects a UDP socket towards `probe` and reads back the local address
/// the kernel picked. Connecting a UDP socket sends nothing.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRouteDiscovery {
    probe: Ipv4Addr,
}

impl DefaultRouteDiscovery {
    pub fn new(probe: Ipv4Addr) -> Self {
        Self { probe }
    }
}

impl Default for DefaultRouteDiscovery {
    fn default() -> Self {
        Self::new(Ipv4Addr::new(1, 1, 1, 1))
    }
}

impl SourceDiscovery for DefaultRouteDiscovery {
    fn discover(&self) -> Result<Ipv4Addr, PingError> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(PingError::SourceDiscovery)?;
        socket
            .connect(&SocketAddr::new(IpAddr::V4(self.probe), 53).into())
            .map_err(PingError::SourceDiscovery)?;

        let local = socket
            .local_addr()
            .map_err(PingError::SourceDiscovery)?
            .as_socket_ipv4()
            .map(|addr| *addr.ip())
            .filter(|ip| !ip.is_unspecified())
            .ok_or_else(|| {
                PingError::SourceDiscovery(io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no IPv4 address on the default route",
                ))
            })?;
        debug!("discovered default source address {local}");
        Ok(local)
    }
}
