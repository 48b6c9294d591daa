// platform/socket.rs - raw ICMPv4 socket transport

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use super::{Transport, TransportOpener};
use crate::{icmp, PingError};

/// Raw ICMPv4 socket driven by Tokio.
///
/// Raw sockets need elevated privileges: root or `CAP_NET_RAW` on Linux.
/// The kernel delivers each received datagram with its IPv4 header, which is
/// removed before the ICMP message is handed to the caller.
pub struct RawSocketTransport {
    socket: UdpSocket,
    closed: CancellationToken,
}

impl RawSocketTransport {
    /// Opens a raw ICMP socket bound to `source`.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// - [`PingError::PermissionDenied`] without raw socket privileges
    /// - [`PingError::SocketUnavailable`] for any other failure, typically a
    ///   source address that is not assigned to a local interface
    pub fn open(source: Ipv4Addr, ttl: Option<u8>) -> Result<Self, PingError> {
        let socket = create_socket(source, ttl).map_err(PingError::from_open)?;
        debug!("opened raw ICMP socket on {source}");
        Ok(Self {
            socket,
            closed: CancellationToken::new(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl Transport for RawSocketTransport {
    async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "socket closed"));
        }
        let target = SocketAddr::new(IpAddr::V4(destination), 0);
        self.socket.send_to(packet, target).await?;
        trace!("sent {} bytes to {destination}", packet.len());
        Ok(())
    }

    async fn recv_from(&self, buffer_size: usize) -> Result<(Vec<u8>, Ipv4Addr), PingError> {
        let mut buf = vec![0u8; buffer_size];

        let (size, peer) = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(PingError::SocketClosed),
            received = self.socket.recv_from(&mut buf) => received.map_err(PingError::Receive)?,
        };

        let peer = match peer {
            SocketAddr::V4(addr) => *addr.ip(),
            SocketAddr::V6(addr) => {
                return Err(PingError::MalformedMessage(format!(
                    "unexpected IPv6 peer {addr} on an IPv4 socket"
                )))
            }
        };
        trace!("received {size} bytes from {peer}");

        let message = icmp::strip_ipv4_header(&buf[..size])?;
        Ok((message.to_vec(), peer))
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Opens [`RawSocketTransport`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketOpener;

impl TransportOpener for RawSocketOpener {
    fn open(&self, source: Ipv4Addr, ttl: Option<u8>) -> Result<Arc<dyn Transport>, PingError> {
        Ok(Arc::new(RawSocketTransport::open(source, ttl)?))
    }
}

fn create_socket(source: Ipv4Addr, ttl: Option<u8>) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))?;
    socket.set_nonblocking(true)?;

    if let Some(ttl) = ttl {
        socket.set_ttl_v4(u32::from(ttl))?;
    }

    socket.bind(&SocketAddr::new(IpAddr::V4(source), 0).into())?;

    UdpSocket::from_std(socket.into())
}
