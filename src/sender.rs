// sender.rs - emits the echo requests of a run

use log::{debug, trace};

use crate::icmp;
use crate::pinger::ProbeConfig;
use crate::platform::Transport;
use crate::PingError;

/// Sends `config.count()` echo requests to `config.destination()`, with
/// sequence numbers `0..count` in order.
///
/// Stops at the first failed send and returns that error; nothing is retried.
/// The transport is left open.
pub async fn send_all(
    transport: &dyn Transport,
    config: &ProbeConfig,
    identifier: u16,
) -> Result<u16, PingError> {
    let destination = config.destination();

    for sequence in 0..config.count() {
        let payload = icmp::stamp_payload(config.payload_len());
        let packet = icmp::encode_echo_request(identifier, sequence, &payload);

        transport
            .send_to(&packet, destination)
            .await
            .map_err(|source| PingError::SendFailed { sequence, source })?;
        trace!("echo request {identifier:#06x}/{sequence} sent to {destination}");
    }

    debug!("sent {} echo requests to {destination}", config.count());
    Ok(config.count())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::icmp::MessageKind;

    struct RecordingTransport {
        sent: Mutex<Vec<(Vec<u8>, Ipv4Addr)>>,
        fail_at: Option<usize>,
    }

    impl RecordingTransport {
        fn new(fail_at: Option<usize>) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_at,
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send_to(&self, packet: &[u8], destination: Ipv4Addr) -> io::Result<()> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_at == Some(sent.len()) {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            sent.push((packet.to_vec(), destination));
            Ok(())
        }

        async fn recv_from(&self, _buffer_size: usize) -> Result<(Vec<u8>, Ipv4Addr), PingError> {
            Err(PingError::SocketClosed)
        }

        fn close(&self) {}
    }

    fn config(count: u16) -> ProbeConfig {
        ProbeConfig::new(
            Ipv4Addr::new(192, 0, 2, 100),
            Ipv4Addr::new(192, 0, 2, 1),
            count,
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_sequences_in_order() {
        let transport = RecordingTransport::new(None);
        let sent = send_all(&transport, &config(4), 0xABCD).await.unwrap();
        assert_eq!(sent, 4);

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 4);
        for (expected, (packet, destination)) in sent.iter().enumerate() {
            let message = icmp::decode(packet).unwrap();
            assert_eq!(message.kind(), MessageKind::EchoRequest);
            assert_eq!(message.identifier(), Some(0xABCD));
            assert_eq!(message.sequence(), Some(expected as u16));
            assert_eq!(message.payload().len(), crate::PING_DEFAULT_PAYLOAD_LEN);
            assert_eq!(*destination, Ipv4Addr::new(192, 0, 2, 1));
        }
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let transport = RecordingTransport::new(Some(2));
        let err = send_all(&transport, &config(5), 1).await.unwrap_err();

        match err {
            PingError::SendFailed { sequence, source } => {
                assert_eq!(sequence, 2);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionRefused);
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(transport.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_zero_count_sends_nothing() {
        let transport = RecordingTransport::new(Some(0));
        assert_eq!(send_all(&transport, &config(0), 1).await.unwrap(), 0);
        assert!(transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_payload() {
        let transport = RecordingTransport::new(None);
        send_all(&transport, &config(1).with_payload_len(0), 9)
            .await
            .unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent[0].0.len(), icmp::ICMP_HEADER_LEN);
    }
}
