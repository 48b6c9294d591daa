//! Concurrent ICMP echo probing
//!
//! This crate sends a run of ICMPv4 echo requests ("pings") to one destination
//! over a raw socket and collects one outcome per probe: an echo reply, a
//! timeout, or the error that ended that probe.
//!
//! ## How a run works
//!
//! - The [`Pinger`] opens one raw ICMP socket bound to the source address and
//!   keeps it for the whole run. The socket is closed on every exit path.
//! - The sender emits `count` echo requests with sequence numbers `0..count`.
//! - The receiver waits for `count` outcomes concurrently. Every probe races
//!   its own timer, so a run where nothing answers takes about one timeout,
//!   not `count` of them.
//! - Results come back in completion order. Sort by [`EchoReply::sequence`] if
//!   send order matters.
//!
//! Raw sockets need `CAP_NET_RAW` (or root) on Linux.
//!
//! ## Basic Usage
//!
//! ```rust,no_run
//! use ping_session::Pinger;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ping_session::PingError> {
//!     let mut pinger = Pinger::builder()
//!         .destination("192.0.2.10".parse().unwrap())
//!         .count(4)
//!         .timeout(Duration::from_millis(500))
//!         .build()?;
//!
//!     for result in pinger.run().await? {
//!         match result {
//!             Ok(reply) => println!(
//!                 "reply from {}: seq={} time={:?}",
//!                 reply.peer(),
//!                 reply.sequence(),
//!                 reply.round_trip_time()
//!             ),
//!             Err(e) if e.is_timeout() => println!("timeout: {e}"),
//!             Err(e) => println!("error: {e}"),
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod error;
pub mod icmp;
pub mod pinger;
pub mod platform;
pub mod receiver;
pub mod resolve;
pub mod sender;

pub use error::{ErrorClass, PingError, TimeoutError};
pub use icmp::{IcmpMessage, MessageKind};
pub use pinger::{Correlation, Pinger, PingerBuilder, ProbeConfig, SessionState};
pub use platform::{RawSocketOpener, Transport, TransportGuard, TransportOpener};
pub use resolve::{resolve, DefaultRouteDiscovery, FixedSource, SourceDiscovery};

use std::net::Ipv4Addr;
use std::time::Duration;

/// Default number of probes per run.
pub const PING_DEFAULT_COUNT: u16 = 32;

/// Default per-probe timeout.
/// A probe that is not answered within this time is reported as timed out.
pub const PING_DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default length of the data payload in echo requests.
pub const PING_DEFAULT_PAYLOAD_LEN: usize = 32;

/// Largest payload an IPv4 echo request can carry (65535 minus the IPv4 and
/// ICMP headers).
pub const PING_MAX_PAYLOAD_LEN: usize = 65507;

/// Minimum receive buffer size, large enough for an Ethernet MTU sized datagram.
pub const PING_RECV_BUFFER_SIZE: usize = 1500;

/// Outcome of one probe: the reply, or why there is none.
pub type ProbeResult = Result<EchoReply, PingError>;

/// Echo reply received for one probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoReply {
    peer: Ipv4Addr,
    identifier: u16,
    sequence: u16,
    payload: Vec<u8>,
    round_trip_time: Option<Duration>,
}

impl EchoReply {
    pub fn new(
        peer: Ipv4Addr,
        identifier: u16,
        sequence: u16,
        payload: Vec<u8>,
        round_trip_time: Option<Duration>,
    ) -> Self {
        Self {
            peer,
            identifier,
            sequence,
            payload,
            round_trip_time,
        }
    }

    /// Address the reply came from.
    pub fn peer(&self) -> Ipv4Addr {
        self.peer
    }

    pub fn identifier(&self) -> u16 {
        self.identifier
    }

    /// Sequence of the request this reply answers.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Round trip time measured from the timestamp in the echoed payload.
    ///
    /// `None` when the payload was too short to carry a timestamp.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }
}
