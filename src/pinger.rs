// pinger.rs - probe session: configuration, state machine and the `run` entry point

use std::fmt;
use std::io::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::platform::{RawSocketOpener, TransportGuard, TransportOpener};
use crate::resolve::{DefaultRouteDiscovery, SourceDiscovery};
use crate::{
    receiver, sender, PingError, ProbeResult, PING_DEFAULT_COUNT, PING_DEFAULT_PAYLOAD_LEN,
    PING_DEFAULT_TIMEOUT, PING_MAX_PAYLOAD_LEN,
};

/// How replies are attributed to probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Correlation {
    /// Replies are matched to the pending probe with the same sequence number.
    /// Datagrams with a foreign identifier or an unknown sequence are ignored.
    #[default]
    Sequence,
    /// Every probe takes whichever datagram arrives next, whatever it is.
    /// Foreign ICMP traffic and out-of-order replies can land in the wrong slot.
    CompletionOrder,
}

/// Lifecycle of a [`Pinger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Sending,
    Awaiting,
    Completed,
    Failed,
}

/// Immutable snapshot of the settings for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeConfig {
    source: Ipv4Addr,
    destination: Ipv4Addr,
    count: u16,
    timeout: Duration,
    payload_len: usize,
    ttl: Option<u8>,
    correlation: Correlation,
}

impl ProbeConfig {
    pub fn new(source: Ipv4Addr, destination: Ipv4Addr, count: u16, timeout: Duration) -> Self {
        let source = if destination.is_loopback() {
            destination
        } else {
            source
        };
        Self {
            source,
            destination,
            count,
            timeout,
            payload_len: PING_DEFAULT_PAYLOAD_LEN,
            ttl: None,
            correlation: Correlation::default(),
        }
    }

    pub fn with_payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = payload_len;
        self
    }

    pub fn with_ttl(mut self, ttl: Option<u8>) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    pub fn with_count(mut self, count: u16) -> Self {
        self.count = count;
        self
    }

    pub fn source(&self) -> Ipv4Addr {
        self.source
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn ttl(&self) -> Option<u8> {
        self.ttl
    }

    pub fn correlation(&self) -> Correlation {
        self.correlation
    }
}

impl fmt::Display for ProbeConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pinger{{{}, {}, {}}}",
            self.source, self.destination, self.count
        )
    }
}

/// A ping session against one destination.
///
/// The source address, when not set explicitly, is obtained from the injected
/// [`SourceDiscovery`] at the start of each run. While the destination is a
/// loopback address the source is forced to that same address; the explicit
/// source, if any, applies again once the destination is not loopback.
///
/// `run` takes `&mut self`, so a session cannot be run concurrently with
/// itself; every run opens and releases its own transport.
pub struct Pinger {
    // Explicit source only; the loopback override is derived in `source()`.
    source: Option<Ipv4Addr>,
    destination: Option<Ipv4Addr>,
    count: u16,
    timeout: Duration,
    payload_len: usize,
    ttl: Option<u8>,
    correlation: Correlation,
    identifier: Option<u16>,
    output: Option<Box<dyn Write + Send>>,
    discovery: Arc<dyn SourceDiscovery>,
    opener: Arc<dyn TransportOpener>,
    state: SessionState,
}

impl Default for Pinger {
    fn default() -> Self {
        Self::new()
    }
}

impl Pinger {
    /// Creates an unconfigured session with default settings, a raw socket
    /// transport and default-route source discovery.
    pub fn new() -> Self {
        Self {
            source: None,
            destination: None,
            count: PING_DEFAULT_COUNT,
            timeout: PING_DEFAULT_TIMEOUT,
            payload_len: PING_DEFAULT_PAYLOAD_LEN,
            ttl: None,
            correlation: Correlation::default(),
            identifier: None,
            output: None,
            discovery: Arc::new(DefaultRouteDiscovery::default()),
            opener: Arc::new(RawSocketOpener),
            state: SessionState::Unconfigured,
        }
    }

    pub fn builder() -> PingerBuilder {
        PingerBuilder::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Source address a run would bind to, if known without discovery.
    pub fn source(&self) -> Option<Ipv4Addr> {
        match self.destination {
            Some(destination) if destination.is_loopback() => Some(destination),
            _ => self.source,
        }
    }

    pub fn destination(&self) -> Option<Ipv4Addr> {
        self.destination
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Sets the destination. A loopback destination also becomes the source
    /// for as long as it stays the destination.
    pub fn set_destination(&mut self, destination: Ipv4Addr) -> Result<Ipv4Addr, PingError> {
        if destination.is_unspecified() || destination.is_broadcast() {
            return Err(PingError::InvalidDestination(format!(
                "{destination} cannot be probed"
            )));
        }

        self.destination = Some(destination);
        self.transition(SessionState::Configured);
        Ok(destination)
    }

    /// Sets the source address.
    ///
    /// Fails if the destination is a loopback address and `source` differs
    /// from it.
    pub fn set_source(&mut self, source: Ipv4Addr) -> Result<Ipv4Addr, PingError> {
        if source.is_unspecified() || source.is_broadcast() {
            return Err(PingError::InvalidSource(format!(
                "{source} is not a usable source address"
            )));
        }
        if let Some(destination) = self.destination.filter(Ipv4Addr::is_loopback) {
            if source != destination {
                return Err(PingError::InvalidSource(format!(
                    "loopback destination {destination} requires source {destination}, got {source}"
                )));
            }
            // Already forced; not kept as an explicit source.
            return Ok(source);
        }

        self.source = Some(source);
        Ok(source)
    }

    pub fn set_count(&mut self, count: u16) -> u16 {
        self.count = count;
        count
    }

    pub fn set_payload_len(&mut self, payload_len: usize) -> Result<usize, PingError> {
        if payload_len > PING_MAX_PAYLOAD_LEN {
            return Err(PingError::InvalidPayloadLen(payload_len));
        }
        self.payload_len = payload_len;
        Ok(payload_len)
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> Result<Duration, PingError> {
        if timeout.is_zero() {
            return Err(PingError::InvalidTimeout(timeout));
        }
        self.timeout = timeout;
        Ok(timeout)
    }

    /// Snapshot of the settings a run would use, discovering the source
    /// address if none is set.
    pub fn probe_config(&self) -> Result<ProbeConfig, PingError> {
        let destination = self.destination.ok_or_else(|| {
            PingError::InvalidDestination("destination must be set before running".to_string())
        })?;
        let source = match self.source() {
            Some(source) => source,
            None => self.discovery.discover()?,
        };

        Ok(ProbeConfig::new(source, destination, self.count, self.timeout)
            .with_payload_len(self.payload_len)
            .with_ttl(self.ttl)
            .with_correlation(self.correlation))
    }

    /// Sends `count` echo requests and collects one result per probe, in
    /// completion order.
    ///
    /// # Errors
    ///
    /// Only when the run cannot proceed: no destination, source discovery
    /// failure, transport open failure, or a failed send. Timeouts and other
    /// per-probe failures are reported inside the returned results.
    pub async fn run(&mut self) -> Result<Vec<ProbeResult>, PingError> {
        let config = match self.probe_config() {
            Ok(config) => config,
            Err(e) => {
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };
        self.execute(config).await
    }

    /// Sends a single echo request and waits for its outcome.
    pub async fn ping_one(&mut self) -> ProbeResult {
        let config = match self.probe_config() {
            Ok(config) => config.with_count(1),
            Err(e) => {
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };
        let mut results = self.execute(config).await?;
        results.pop().unwrap_or(Err(PingError::SocketClosed))
    }

    async fn execute(&mut self, config: ProbeConfig) -> Result<Vec<ProbeResult>, PingError> {
        if config.count() == 0 {
            self.transition(SessionState::Completed);
            return Ok(Vec::new());
        }

        let identifier = self.identifier.unwrap_or_else(rand::random);
        debug!("{config}: starting run with identifier {identifier:#06x}");

        self.transition(SessionState::Sending);
        let guard = match self.opener.open(config.source(), config.ttl()) {
            Ok(transport) => TransportGuard::new(transport),
            Err(e) => {
                warn!("{config}: failed to open transport: {e}");
                self.transition(SessionState::Failed);
                return Err(e);
            }
        };

        if let Err(e) = sender::send_all(guard.transport(), &config, identifier).await {
            warn!("{config}: aborting run: {e}");
            self.transition(SessionState::Failed);
            return Err(e);
        }

        self.transition(SessionState::Awaiting);
        let output = &mut self.output;
        let results = receiver::receive_all(guard.share(), &config, identifier, |result| {
            if let Some(sink) = output.as_mut() {
                report(sink.as_mut(), result);
            }
        })
        .await;
        drop(guard);

        self.transition(SessionState::Completed);
        Ok(results)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!("session state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}

fn report(sink: &mut (dyn Write + Send), result: &ProbeResult) {
    let written = match result {
        Ok(reply) => writeln!(
            sink,
            "got response from {}: icmp_seq={} time={:?}",
            reply.peer(),
            reply.sequence(),
            reply.round_trip_time()
        ),
        Err(e) if e.is_timeout() => writeln!(sink, "got a timeout error {e}"),
        Err(e) => writeln!(sink, "got an error {e}"),
    };
    if let Err(e) = written {
        warn!("failed to write probe outcome: {e}");
    }
}

impl fmt::Display for Pinger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |addr: Option<Ipv4Addr>| addr.map_or_else(|| "<nil>".to_string(), |a| a.to_string());
        write!(
            f,
            "Pinger{{{}, {}, {}}}",
            show(self.source()),
            show(self.destination),
            self.count
        )
    }
}

/// Explicit options for a [`Pinger`].
///
/// Every option has a default; `build` validates the combination.
#[derive(Default)]
pub struct PingerBuilder {
    source: Option<Ipv4Addr>,
    destination: Option<Ipv4Addr>,
    count: Option<u16>,
    timeout: Option<Duration>,
    payload_len: Option<usize>,
    ttl: Option<u8>,
    correlation: Correlation,
    identifier: Option<u16>,
    output: Option<Box<dyn Write + Send>>,
    discovery: Option<Arc<dyn SourceDiscovery>>,
    opener: Option<Arc<dyn TransportOpener>>,
}

impl PingerBuilder {
    pub fn source(mut self, source: Ipv4Addr) -> Self {
        self.source = Some(source);
        self
    }

    pub fn destination(mut self, destination: Ipv4Addr) -> Self {
        self.destination = Some(destination);
        self
    }

    /// Number of probes per run. Defaults to [`PING_DEFAULT_COUNT`].
    pub fn count(mut self, count: u16) -> Self {
        self.count = Some(count);
        self
    }

    /// Per-probe timeout. Defaults to [`PING_DEFAULT_TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Echo request payload length. Defaults to [`PING_DEFAULT_PAYLOAD_LEN`];
    /// payloads shorter than 8 bytes carry no timestamp. `build` rejects more
    /// than [`PING_MAX_PAYLOAD_LEN`].
    pub fn payload_len(mut self, payload_len: usize) -> Self {
        self.payload_len = Some(payload_len);
        self
    }

    pub fn ttl(mut self, ttl: u8) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn correlation(mut self, correlation: Correlation) -> Self {
        self.correlation = correlation;
        self
    }

    /// Fixed echo identifier. A random one is drawn per run otherwise.
    pub fn identifier(mut self, identifier: u16) -> Self {
        self.identifier = Some(identifier);
        self
    }

    /// Sink receiving one line per probe outcome as it completes.
    pub fn output(mut self, output: impl Write + Send + 'static) -> Self {
        self.output = Some(Box::new(output));
        self
    }

    pub fn discovery(mut self, discovery: impl SourceDiscovery + 'static) -> Self {
        self.discovery = Some(Arc::new(discovery));
        self
    }

    pub fn opener(mut self, opener: impl TransportOpener + 'static) -> Self {
        self.opener = Some(Arc::new(opener));
        self
    }

    pub fn build(self) -> Result<Pinger, PingError> {
        let mut pinger = Pinger::new();

        if let Some(discovery) = self.discovery {
            pinger.discovery = discovery;
        }
        if let Some(opener) = self.opener {
            pinger.opener = opener;
        }
        if let Some(source) = self.source {
            pinger.set_source(source)?;
        }
        if let Some(destination) = self.destination {
            pinger.set_destination(destination)?;
        }
        if let Some(count) = self.count {
            pinger.set_count(count);
        }
        if let Some(timeout) = self.timeout {
            pinger.set_timeout(timeout)?;
        }
        if let Some(payload_len) = self.payload_len {
            pinger.set_payload_len(payload_len)?;
        }
        pinger.ttl = self.ttl;
        pinger.correlation = self.correlation;
        pinger.identifier = self.identifier;
        pinger.output = self.output;

        Ok(pinger)
    }
}
