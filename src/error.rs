// error.rs - error taxonomy for sessions, transports and resolution

use std::fmt;
use std::io;
use std::net::Ipv4Addr;

use thiserror::Error;

use crate::icmp::MessageKind;
use crate::pinger::ProbeConfig;

/// Broad category of a [`PingError`].
///
/// Callers usually want to tell "the host is unreachable or slow" apart from
/// "something is broken"; the class makes that distinction without matching
/// on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The session could not be configured.
    Configuration,
    /// Socket creation, send or receive failed.
    Transport,
    /// A datagram was received but was not the expected echo reply.
    Protocol,
    /// No reply arrived before the probe's timer fired.
    Timeout,
    /// A host specification could not be turned into addresses.
    Resolution,
}

#[derive(Error, Debug)]
pub enum PingError {
    #[error("invalid destination: {0}")]
    InvalidDestination(String),
    #[error("invalid source: {0}")]
    InvalidSource(String),
    #[error("invalid timeout: {0:?}")]
    InvalidTimeout(std::time::Duration),
    #[error("invalid payload length {0}: at most {max} bytes fit in an echo request", max = crate::PING_MAX_PAYLOAD_LEN)]
    InvalidPayloadLen(usize),

    #[error("permission denied opening raw ICMP socket: {0}")]
    PermissionDenied(#[source] io::Error),
    #[error("raw ICMP socket unavailable: {0}")]
    SocketUnavailable(#[source] io::Error),
    #[error("socket closed")]
    SocketClosed,
    #[error("failed to send echo request {sequence}: {source}")]
    SendFailed {
        sequence: u16,
        #[source]
        source: io::Error,
    },
    #[error("failed to receive: {0}")]
    Receive(#[source] io::Error),

    #[error("malformed ICMP message: {0}")]
    MalformedMessage(String),
    #[error("got {kind} from {peer}; want echo reply")]
    NotEchoReply { kind: MessageKind, peer: Ipv4Addr },

    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    #[error("failed to resolve {spec}: {source}")]
    Resolve {
        spec: String,
        #[source]
        source: io::Error,
    },
    #[error("no IPv4 addresses found for {0}")]
    NoIpv4Address(String),
    #[error("expected {expected} addresses in {spec}, got {actual}")]
    AddressCountMismatch {
        spec: String,
        expected: u64,
        actual: u64,
    },
    #[error("failed to discover default source address: {0}")]
    SourceDiscovery(#[source] io::Error),
}

impl PingError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidDestination(_)
            | Self::InvalidSource(_)
            | Self::InvalidTimeout(_)
            | Self::InvalidPayloadLen(_) => ErrorClass::Configuration,
            Self::PermissionDenied(_)
            | Self::SocketUnavailable(_)
            | Self::SocketClosed
            | Self::SendFailed { .. }
            | Self::Receive(_) => ErrorClass::Transport,
            Self::MalformedMessage(_) | Self::NotEchoReply { .. } => ErrorClass::Protocol,
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::Resolve { .. }
            | Self::NoIpv4Address(_)
            | Self::AddressCountMismatch { .. }
            | Self::SourceDiscovery(_) => ErrorClass::Resolution,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Maps a socket creation failure onto the transport taxonomy.
    pub(crate) fn from_open(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(e),
            _ => Self::SocketUnavailable(e),
        }
    }

    /// Copies a receive-side error so it can be handed to several pending probes.
    pub(crate) fn duplicate_receive(&self) -> Self {
        match self {
            Self::SocketClosed => Self::SocketClosed,
            Self::Receive(e) => Self::Receive(io::Error::new(e.kind(), e.to_string())),
            other => Self::Receive(io::Error::other(other.to_string())),
        }
    }
}

/// A probe whose timer fired before a reply was attributed to it.
#[derive(Debug, Clone)]
pub struct TimeoutError {
    config: ProbeConfig,
    timeout_ms: u64,
    sequence: Option<u16>,
}

impl TimeoutError {
    pub fn new(config: ProbeConfig, sequence: Option<u16>) -> Self {
        let timeout_ms = config.timeout().as_millis().try_into().unwrap_or(u64::MAX);
        Self {
            config,
            timeout_ms,
            sequence,
        }
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// Elapsed timeout in milliseconds.
    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Sequence of the probe that timed out. Only known when replies are
    /// correlated by sequence.
    pub fn sequence(&self) -> Option<u16> {
        self.sequence
    }
}

impl fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} timed out after {} milliseconds",
            self.config, self.timeout_ms
        )
    }
}

impl std::error::Error for TimeoutError {}
