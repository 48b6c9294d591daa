// icmp.rs - ICMPv4 echo message encoding and decoding

use core::fmt;
use std::net::Ipv4Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::{EchoReply, PingError};

/// Length of the fixed ICMP header (type, code, checksum, identifier, sequence).
pub const ICMP_HEADER_LEN: usize = 8;

const IPV4_MIN_HEADER_LEN: usize = 20;
const TIMESTAMP_LEN: usize = 8;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DESTINATION_UNREACHABLE: u8 = 3;
const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_TIME_EXCEEDED: u8 = 11;

/// Kind tag of a decoded ICMPv4 message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Type 0
    EchoReply,
    /// Type 3
    DestinationUnreachable,
    /// Type 8
    EchoRequest,
    /// Type 11
    TimeExceeded,
    /// Any other type, carrying its raw value.
    Other(u8),
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Self {
        match value {
            TYPE_ECHO_REPLY => Self::EchoReply,
            TYPE_DESTINATION_UNREACHABLE => Self::DestinationUnreachable,
            TYPE_ECHO_REQUEST => Self::EchoRequest,
            TYPE_TIME_EXCEEDED => Self::TimeExceeded,
            other => Self::Other(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::EchoReply => TYPE_ECHO_REPLY,
            Self::DestinationUnreachable => TYPE_DESTINATION_UNREACHABLE,
            Self::EchoRequest => TYPE_ECHO_REQUEST,
            Self::TimeExceeded => TYPE_TIME_EXCEEDED,
            Self::Other(value) => value,
        }
    }

    /// Error messages quote the header of the datagram that triggered them.
    fn quotes_original(self) -> bool {
        matches!(self, Self::DestinationUnreachable | Self::TimeExceeded)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EchoReply => write!(f, "echo reply"),
            Self::DestinationUnreachable => write!(f, "destination unreachable"),
            Self::EchoRequest => write!(f, "echo request"),
            Self::TimeExceeded => write!(f, "time exceeded"),
            Self::Other(value) => write!(f, "ICMP type {value}"),
        }
    }
}

/// A decoded ICMPv4 message.
///
/// For echo messages `identifier`, `sequence` and `payload` come straight from
/// the header and body. For destination-unreachable and time-exceeded they are
/// taken from the echo request quoted in the error body, when one is present.
#[derive(Clone, PartialEq, Eq)]
pub struct IcmpMessage {
    kind: MessageKind,
    code: u8,
    identifier: Option<u16>,
    sequence: Option<u16>,
    payload: Vec<u8>,
}

impl IcmpMessage {
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn code(&self) -> u8 {
        self.code
    }

    pub fn identifier(&self) -> Option<u16> {
        self.identifier
    }

    pub fn sequence(&self) -> Option<u16> {
        self.sequence
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Turns the message into an [`EchoReply`], or `NotEchoReply` for any other kind.
    pub fn into_echo_reply(self, peer: Ipv4Addr) -> Result<EchoReply, PingError> {
        match (self.kind, self.identifier, self.sequence) {
            (MessageKind::EchoReply, Some(identifier), Some(sequence)) => {
                let round_trip_time = elapsed_since_stamp(&self.payload);
                Ok(EchoReply::new(
                    peer,
                    identifier,
                    sequence,
                    self.payload,
                    round_trip_time,
                ))
            }
            (kind, _, _) => Err(PingError::NotEchoReply { kind, peer }),
        }
    }
}

impl fmt::Debug for IcmpMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IcmpMessage")
            .field("kind", &self.kind)
            .field("code", &self.code)
            .field("identifier", &self.identifier)
            .field("sequence", &self.sequence)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Builds an ICMPv4 echo request (type 8, code 0) with a valid checksum.
pub fn encode_echo_request(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut data = Vec::with_capacity(ICMP_HEADER_LEN + payload.len());

    data.push(TYPE_ECHO_REQUEST);
    data.push(0); // Code
    data.extend_from_slice(&[0, 0]); // Checksum placeholder
    data.extend_from_slice(&identifier.to_be_bytes());
    data.extend_from_slice(&sequence.to_be_bytes());
    data.extend_from_slice(payload);

    let sum = checksum(&data);
    data[2..4].copy_from_slice(&sum.to_be_bytes());
    data
}

/// Parses an ICMPv4 message (without IP header).
pub fn decode(data: &[u8]) -> Result<IcmpMessage, PingError> {
    if data.len() < ICMP_HEADER_LEN {
        return Err(PingError::MalformedMessage(format!(
            "{} bytes is shorter than the {ICMP_HEADER_LEN}-byte ICMP header",
            data.len()
        )));
    }
    if !verify_checksum(data) {
        return Err(PingError::MalformedMessage("checksum mismatch".to_string()));
    }

    let kind = MessageKind::from_u8(data[0]);
    let code = data[1];

    let message = match kind {
        MessageKind::EchoReply | MessageKind::EchoRequest => IcmpMessage {
            kind,
            code,
            identifier: Some(u16::from_be_bytes([data[4], data[5]])),
            sequence: Some(u16::from_be_bytes([data[6], data[7]])),
            payload: data[ICMP_HEADER_LEN..].to_vec(),
        },
        kind if kind.quotes_original() => {
            let quoted = quoted_echo_request(&data[ICMP_HEADER_LEN..]);
            IcmpMessage {
                kind,
                code,
                identifier: quoted.map(|(id, _)| id),
                sequence: quoted.map(|(_, seq)| seq),
                payload: data[ICMP_HEADER_LEN..].to_vec(),
            }
        }
        kind => IcmpMessage {
            kind,
            code,
            identifier: None,
            sequence: None,
            payload: data[ICMP_HEADER_LEN..].to_vec(),
        },
    };
    Ok(message)
}

/// Decodes an echo reply received from `peer`.
pub fn decode_echo_reply(data: &[u8], peer: Ipv4Addr) -> Result<EchoReply, PingError> {
    decode(data)?.into_echo_reply(peer)
}

/// Skips the IPv4 header that raw sockets deliver in front of the ICMP message.
pub fn strip_ipv4_header(datagram: &[u8]) -> Result<&[u8], PingError> {
    if datagram.len() < IPV4_MIN_HEADER_LEN || datagram[0] >> 4 != 4 {
        return Err(PingError::MalformedMessage(format!(
            "{} bytes is not an IPv4 datagram",
            datagram.len()
        )));
    }

    let header_len = usize::from(datagram[0] & 0x0F) * 4;
    if header_len < IPV4_MIN_HEADER_LEN || datagram.len() < header_len {
        return Err(PingError::MalformedMessage(format!(
            "IPv4 header length {header_len} exceeds datagram of {} bytes",
            datagram.len()
        )));
    }
    Ok(&datagram[header_len..])
}

// Error body: IP header of the original datagram followed by its first 8 bytes.
fn quoted_echo_request(body: &[u8]) -> Option<(u16, u16)> {
    let original = strip_ipv4_header(body).ok()?;
    if original.len() < ICMP_HEADER_LEN || original[0] != TYPE_ECHO_REQUEST {
        return None;
    }
    Some((
        u16::from_be_bytes([original[4], original[5]]),
        u16::from_be_bytes([original[6], original[7]]),
    ))
}

/// Internet checksum (RFC 1071) over `data`, with the checksum field itself
/// (bytes 2-3) treated as zero.
pub fn checksum(data: &[u8]) -> u16 {
    !fold(data, true)
}

/// Returns true if the one's complement sum over the whole message, checksum
/// field included, is all ones.
pub fn verify_checksum(data: &[u8]) -> bool {
    fold(data, false) == 0xFFFF
}

fn fold(data: &[u8], skip_checksum_field: bool) -> u16 {
    let mut sum = 0u32;

    for (i, chunk) in data.chunks(2).enumerate() {
        if skip_checksum_field && i == 1 {
            continue;
        }
        let word = match chunk {
            [hi, lo] => u16::from_be_bytes([*hi, *lo]),
            // Odd number of bytes, pad with zero
            [hi] => u16::from_be_bytes([*hi, 0]),
            _ => 0,
        };
        sum += u32::from(word);
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Builds a request payload of `len` bytes. The first eight carry the send
/// time in nanoseconds since the Unix epoch, the rest is zero padding.
pub fn stamp_payload(len: usize) -> Vec<u8> {
    let mut payload = vec![0u8; len];
    if len >= TIMESTAMP_LEN {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        payload[..TIMESTAMP_LEN].copy_from_slice(&now.to_be_bytes());
    }
    payload
}

/// Round trip time for a reply payload produced by [`stamp_payload`].
pub fn elapsed_since_stamp(payload: &[u8]) -> Option<Duration> {
    let stamp: [u8; TIMESTAMP_LEN] = payload.get(..TIMESTAMP_LEN)?.try_into().ok()?;
    let sent = u64::from_be_bytes(stamp);
    if sent == 0 {
        return None;
    }
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()?
        .as_nanos() as u64;
    Some(Duration::from_nanos(now.saturating_sub(sent)))
}
