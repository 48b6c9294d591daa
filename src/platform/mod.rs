// platform/mod.rs - transport seam and scoped ownership

mod socket;

pub use socket::{RawSocketOpener, RawSocketTransport};

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use log::debug;

use crate::PingError;

/// Datagram transport carrying ICMP messages for one session.
///
/// Implementations must allow `send_to` and `recv_from` to be called
/// concurrently from several tasks through a shared reference.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Writes one ICMP message to `destination`.
    async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> std::io::Result<()>;

    /// Waits for the next ICMP message (IP header already removed) and the
    /// address it came from.
    ///
    /// There is no timeout here; callers race this against their own timer.
    /// Once [`close`](Transport::close) has been called, pending and future
    /// calls return [`PingError::SocketClosed`].
    async fn recv_from(&self, buffer_size: usize) -> Result<(Vec<u8>, Ipv4Addr), PingError>;

    /// Releases the transport.
    fn close(&self);
}

/// Creates transports bound to a source address.
pub trait TransportOpener: Send + Sync {
    fn open(&self, source: Ipv4Addr, ttl: Option<u8>) -> Result<Arc<dyn Transport>, PingError>;
}

/// Scoped ownership of a session's transport.
///
/// Closes the transport exactly once, when the guard is dropped, whichever
/// way the session ends. Clones handed out through [`share`](Self::share)
/// stay valid memory-wise but observe `SocketClosed` afterwards.
pub struct TransportGuard {
    transport: Arc<dyn Transport>,
}

impl TransportGuard {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    pub fn share(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        debug!("releasing session transport");
        self.transport.close();
    }
}
