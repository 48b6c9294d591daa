// receiver.rs - concurrent collection of probe outcomes
//
// One task per expected reply, each racing its own timer. The coordinator
// waits for every task and records outcomes in the order they complete.

use std::collections::HashMap;
use std::io;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::channel::oneshot;
use log::{debug, trace, warn};
use tokio::task::JoinSet;
use tokio::time;

use crate::icmp::{self, MessageKind, ICMP_HEADER_LEN};
use crate::pinger::{Correlation, ProbeConfig};
use crate::platform::Transport;
use crate::{PingError, ProbeResult, TimeoutError, PING_RECV_BUFFER_SIZE};

/// Largest IPv4 header (IHL of 15 words).
const MAX_IPV4_HEADER_LEN: usize = 60;

type PendingSlots = Arc<Mutex<HashMap<u16, oneshot::Sender<ProbeResult>>>>;

/// Waits for `config.count()` outcomes and returns them in completion order.
///
/// `on_outcome` is called for each outcome as it completes. Per-probe failures
/// (timeouts, foreign ICMP messages, receive errors) become results; this
/// function itself never fails.
pub async fn receive_all(
    transport: Arc<dyn Transport>,
    config: &ProbeConfig,
    identifier: u16,
    on_outcome: impl FnMut(&ProbeResult),
) -> Vec<ProbeResult> {
    match config.correlation() {
        Correlation::Sequence => {
            let pending: PendingSlots = Arc::new(Mutex::new(HashMap::new()));
            let units = spawn_slot_units(config, &pending);
            let router = tokio::spawn(route_replies(
                transport,
                config.destination(),
                identifier,
                recv_buffer_size(config),
                pending,
            ));
            let results = collect(units, on_outcome).await;
            router.abort();
            results
        }
        Correlation::CompletionOrder => {
            let units = spawn_receive_units(transport, config);
            collect(units, on_outcome).await
        }
    }
}

async fn collect(
    mut units: JoinSet<ProbeResult>,
    mut on_outcome: impl FnMut(&ProbeResult),
) -> Vec<ProbeResult> {
    let mut results = Vec::with_capacity(units.len());

    while let Some(joined) = units.join_next().await {
        let result = joined.unwrap_or_else(|e| Err(PingError::Receive(io::Error::other(e))));
        on_outcome(&result);
        results.push(result);
    }

    let replies = results.iter().filter(|r| r.is_ok()).count();
    debug!("{replies}/{} probes answered", results.len());
    results
}

/// Receive buffer that holds a full echo reply for this run's payload.
fn recv_buffer_size(config: &ProbeConfig) -> usize {
    (MAX_IPV4_HEADER_LEN + ICMP_HEADER_LEN + config.payload_len()).max(PING_RECV_BUFFER_SIZE)
}

fn lock_slots(pending: &PendingSlots) -> MutexGuard<'_, HashMap<u16, oneshot::Sender<ProbeResult>>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Sequence correlation: every probe owns a slot that the router resolves.

fn spawn_slot_units(config: &ProbeConfig, pending: &PendingSlots) -> JoinSet<ProbeResult> {
    let mut units = JoinSet::new();
    let mut slots = lock_slots(pending);

    for sequence in 0..config.count() {
        let (tx, rx) = oneshot::channel();
        slots.insert(sequence, tx);
        units.spawn(await_slot(
            sequence,
            rx,
            Arc::clone(pending),
            config.clone(),
        ));
    }
    units
}

async fn await_slot(
    sequence: u16,
    mut reply_rx: oneshot::Receiver<ProbeResult>,
    pending: PendingSlots,
    config: ProbeConfig,
) -> ProbeResult {
    tokio::select! {
        result = &mut reply_rx => result.unwrap_or(Err(PingError::SocketClosed)),
        _ = time::sleep(config.timeout()) => {
            let slot = lock_slots(&pending).remove(&sequence);
            match slot {
                Some(_) => Err(TimeoutError::new(config, Some(sequence)).into()),
                // The router claimed the slot just as the timer fired.
                None => reply_rx.await.unwrap_or(Err(PingError::SocketClosed)),
            }
        }
    }
}

async fn route_replies(
    transport: Arc<dyn Transport>,
    destination: Ipv4Addr,
    identifier: u16,
    buffer_size: usize,
    pending: PendingSlots,
) {
    loop {
        let (data, peer) = match transport.recv_from(buffer_size).await {
            Ok(received) => received,
            Err(e) if is_fatal(&e) => {
                warn!("receive failed, failing outstanding probes: {e}");
                for (_, slot) in lock_slots(&pending).drain() {
                    let _ = slot.send(Err(e.duplicate_receive()));
                }
                return;
            }
            Err(e) => {
                trace!("ignoring datagram: {e}");
                continue;
            }
        };

        let message = match icmp::decode(&data) {
            Ok(message) => message,
            Err(e) => {
                trace!("ignoring datagram from {peer}: {e}");
                continue;
            }
        };

        // Identifier may be rewritten by some NAT implementations; such
        // replies are indistinguishable from foreign traffic and get dropped.
        let (Some(id), Some(sequence)) = (message.identifier(), message.sequence()) else {
            trace!("ignoring uncorrelated {} from {peer}", message.kind());
            continue;
        };
        if id != identifier || message.kind() == MessageKind::EchoRequest {
            continue;
        }
        // Error messages come from routers on the path; replies only from the target.
        if message.kind() == MessageKind::EchoReply && peer != destination {
            trace!("ignoring echo reply {id:#06x}/{sequence} from {peer}, expected {destination}");
            continue;
        }

        let Some(slot) = lock_slots(&pending).remove(&sequence) else {
            trace!("no pending probe for sequence {sequence} from {peer}");
            continue;
        };
        let _ = slot.send(message.into_echo_reply(peer));

        if lock_slots(&pending).is_empty() {
            return;
        }
    }
}

fn is_fatal(error: &PingError) -> bool {
    match error {
        PingError::SocketClosed => true,
        PingError::Receive(e) => matches!(
            e.kind(),
            io::ErrorKind::PermissionDenied
                | io::ErrorKind::AddrNotAvailable
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

// Completion order: every probe takes the next datagram, whatever it is.

fn spawn_receive_units(transport: Arc<dyn Transport>, config: &ProbeConfig) -> JoinSet<ProbeResult> {
    let mut units = JoinSet::new();
    let buffer_size = recv_buffer_size(config);

    for _ in 0..config.count() {
        let transport = Arc::clone(&transport);
        let config = config.clone();
        units.spawn(async move {
            let received = receive_one(transport.as_ref(), buffer_size);
            match time::timeout(config.timeout(), received).await {
                Ok(result) => result,
                Err(_) => Err(TimeoutError::new(config, None).into()),
            }
        });
    }
    units
}

async fn receive_one(transport: &dyn Transport, buffer_size: usize) -> ProbeResult {
    let (data, peer) = transport.recv_from(buffer_size).await?;
    icmp::decode_echo_reply(&data, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::{Duration, Instant};
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    const DESTINATION: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 1);

    /// Transport fed by the test through a channel.
    struct ScriptedTransport {
        inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, Ipv4Addr)>>,
        closed: CancellationToken,
    }

    impl ScriptedTransport {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<(Vec<u8>, Ipv4Addr)>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let transport = Arc::new(Self {
                inbound: tokio::sync::Mutex::new(rx),
                closed: CancellationToken::new(),
            });
            (transport, tx)
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn send_to(&self, _packet: &[u8], _destination: Ipv4Addr) -> io::Result<()> {
            Ok(())
        }

        // Datagrams longer than the buffer are cut short, as a socket would.
        async fn recv_from(&self, buffer_size: usize) -> Result<(Vec<u8>, Ipv4Addr), PingError> {
            let mut inbound = self.inbound.lock().await;
            let (mut data, peer) = tokio::select! {
                _ = self.closed.cancelled() => return Err(PingError::SocketClosed),
                next = inbound.recv() => next.ok_or(PingError::SocketClosed)?,
            };
            data.truncate(buffer_size);
            Ok((data, peer))
        }

        fn close(&self) {
            self.closed.cancel();
        }
    }

    fn echo_reply(identifier: u16, sequence: u16) -> Vec<u8> {
        echo_reply_with(identifier, sequence, &[])
    }

    fn echo_reply_with(identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
        let mut packet = icmp::encode_echo_request(identifier, sequence, payload);
        packet[0] = 0;
        packet[2..4].copy_from_slice(&[0, 0]);
        let sum = icmp::checksum(&packet);
        packet[2..4].copy_from_slice(&sum.to_be_bytes());
        packet
    }

    fn config(count: u16, correlation: Correlation) -> ProbeConfig {
        ProbeConfig::new(
            Ipv4Addr::new(192, 0, 2, 100),
            DESTINATION,
            count,
            Duration::from_millis(50),
        )
        .with_correlation(correlation)
    }

    #[tokio::test]
    async fn test_out_of_order_replies_matched_by_sequence() {
        let (transport, inbound) = ScriptedTransport::new();
        inbound.send((echo_reply(7, 2), DESTINATION)).unwrap();
        inbound.send((echo_reply(7, 0), DESTINATION)).unwrap();
        inbound.send((echo_reply(7, 1), DESTINATION)).unwrap();

        let results = receive_all(transport, &config(3, Correlation::Sequence), 7, |_| {}).await;

        let mut sequences: Vec<u16> = results
            .iter()
            .map(|r| r.as_ref().unwrap().sequence())
            .collect();
        sequences.sort_unstable();
        assert_eq!(sequences, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_foreign_traffic_ignored_with_sequence_correlation() {
        let (transport, inbound) = ScriptedTransport::new();
        // Foreign identifier, our own looped-back request, garbage, unknown sequence.
        inbound.send((echo_reply(99, 0), DESTINATION)).unwrap();
        inbound
            .send((icmp::encode_echo_request(7, 0, &[]), DESTINATION))
            .unwrap();
        inbound.send((vec![1, 2, 3], DESTINATION)).unwrap();
        inbound.send((echo_reply(7, 40), DESTINATION)).unwrap();
        inbound.send((echo_reply(7, 0), DESTINATION)).unwrap();

        let results = receive_all(transport, &config(2, Correlation::Sequence), 7, |_| {}).await;
        assert_eq!(results.len(), 2);

        // Completion order: the answered probe finishes before the timer of the other.
        let reply = results[0].as_ref().unwrap();
        assert_eq!(reply.sequence(), 0);
        assert_eq!(reply.identifier(), 7);
        match &results[1] {
            Err(PingError::Timeout(t)) => assert_eq!(t.sequence(), Some(1)),
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_completion_order_takes_whatever_arrives() {
        let (transport, inbound) = ScriptedTransport::new();
        inbound.send((echo_reply(99, 5), DESTINATION)).unwrap();
        inbound
            .send((icmp::encode_echo_request(7, 0, &[]), DESTINATION))
            .unwrap();

        let results =
            receive_all(transport, &config(3, Correlation::CompletionOrder), 7, |_| {}).await;
        assert_eq!(results.len(), 3);

        // The foreign reply is attributed to a slot first-come-first-served.
        let replies: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].identifier(), 99);

        assert!(results.iter().any(|r| matches!(
            r,
            Err(PingError::NotEchoReply {
                kind: MessageKind::EchoRequest,
                ..
            })
        )));
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(PingError::Timeout(t)) if t.sequence().is_none())));
    }

    #[tokio::test]
    async fn test_timeouts_run_concurrently() {
        for correlation in [Correlation::Sequence, Correlation::CompletionOrder] {
            let (transport, _inbound) = ScriptedTransport::new();
            let start = Instant::now();
            let results = receive_all(transport, &config(3, correlation), 7, |_| {}).await;
            let elapsed = start.elapsed();

            assert_eq!(results.len(), 3);
            assert!(results.iter().all(|r| matches!(r, Err(e) if e.is_timeout())));
            assert!(
                elapsed < Duration::from_millis(140),
                "{correlation:?}: timeouts took {elapsed:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_unreachable_resolves_quoted_probe() {
        let (transport, inbound) = ScriptedTransport::new();

        let original = icmp::encode_echo_request(7, 1, &[]);
        let mut message = vec![3, 1, 0, 0, 0, 0, 0, 0];
        let mut ip_header = vec![0u8; 20];
        ip_header[0] = 0x45;
        message.extend_from_slice(&ip_header);
        message.extend_from_slice(&original[..8]);
        let sum = icmp::checksum(&message);
        message[2..4].copy_from_slice(&sum.to_be_bytes());

        let router = Ipv4Addr::new(198, 51, 100, 1);
        inbound.send((message, router)).unwrap();
        inbound.send((echo_reply(7, 0), DESTINATION)).unwrap();

        let results = receive_all(transport, &config(2, Correlation::Sequence), 7, |_| {}).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(PingError::NotEchoReply {
                kind: MessageKind::DestinationUnreachable,
                peer,
            }) if *peer == router
        )));
        assert!(results.iter().any(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_closed_transport_fails_outstanding_probes() {
        let (transport, _inbound) = ScriptedTransport::new();
        transport.close();

        let config = ProbeConfig::new(
            Ipv4Addr::new(192, 0, 2, 100),
            DESTINATION,
            2,
            Duration::from_secs(5),
        );

        let start = Instant::now();
        let results = receive_all(transport, &config, 7, |_| {}).await;
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(results
            .iter()
            .all(|r| matches!(r, Err(PingError::SocketClosed))));
    }

    #[tokio::test]
    async fn test_outcomes_reported_as_they_complete() {
        let (transport, inbound) = ScriptedTransport::new();
        inbound.send((echo_reply(7, 0), DESTINATION)).unwrap();

        let mut seen = Vec::new();
        let results = receive_all(transport, &config(2, Correlation::Sequence), 7, |r| {
            seen.push(r.is_ok())
        })
        .await;

        assert_eq!(results.len(), 2);
        assert_eq!(seen, vec![true, false]);
    }

    #[tokio::test]
    async fn test_reply_from_other_host_ignored() {
        let (transport, inbound) = ScriptedTransport::new();
        let stranger = Ipv4Addr::new(203, 0, 113, 9);
        // Same identifier and sequence, but another session's target answered.
        inbound.send((echo_reply(7, 0), stranger)).unwrap();

        let results = receive_all(transport, &config(1, Correlation::Sequence), 7, |_| {}).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].as_ref().unwrap_err().is_timeout());
    }

    #[tokio::test]
    async fn test_reply_from_destination_after_stranger() {
        let (transport, inbound) = ScriptedTransport::new();
        inbound
            .send((echo_reply(7, 0), Ipv4Addr::new(203, 0, 113, 9)))
            .unwrap();
        inbound.send((echo_reply(7, 0), DESTINATION)).unwrap();

        let results = receive_all(transport, &config(1, Correlation::Sequence), 7, |_| {}).await;
        assert_eq!(results[0].as_ref().unwrap().peer(), DESTINATION);
    }

    #[tokio::test]
    async fn test_large_payload_received_whole() {
        let payload: Vec<u8> = (0..1600u32).map(|i| (i % 251) as u8 + 1).collect();
        for correlation in [Correlation::Sequence, Correlation::CompletionOrder] {
            let (transport, inbound) = ScriptedTransport::new();
            inbound
                .send((echo_reply_with(7, 0, &payload), DESTINATION))
                .unwrap();

            let config = config(1, correlation).with_payload_len(payload.len());
            let results = receive_all(transport, &config, 7, |_| {}).await;
            let reply = results[0].as_ref().unwrap();
            assert_eq!(reply.payload(), payload.as_slice(), "{correlation:?}");
        }
    }

    #[test]
    fn test_recv_buffer_covers_payload() {
        let small = config(1, Correlation::Sequence);
        assert_eq!(recv_buffer_size(&small), PING_RECV_BUFFER_SIZE);

        let large = small.with_payload_len(9000);
        assert_eq!(
            recv_buffer_size(&large),
            MAX_IPV4_HEADER_LEN + ICMP_HEADER_LEN + 9000
        );
    }
}
