// cli.rs - command line options, exit codes and result formatting

use std::ffi::OsString;
use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;

use crate::pinger::{Correlation, PingerBuilder};
use crate::{ProbeResult, PING_DEFAULT_COUNT, PING_DEFAULT_PAYLOAD_LEN, PING_MAX_PAYLOAD_LEN};

pub const USAGE: &str = "usage: ping-session [-c count] destination";

pub const EXIT_OK: u8 = 0;
/// Malformed arguments or an unresolvable destination.
pub const EXIT_USAGE_ERROR: u8 = 1;
/// A session could not run to completion.
pub const EXIT_RUN_ERROR: u8 = 2;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(
    name = "ping-session",
    version,
    about = "Send ICMP echo requests and report the replies",
    after_help = "EXAMPLES:
    ping-session 127.0.0.1
    ping-session -c 4 example.com
    ping-session -c 1 -W 200 192.168.2.0/28"
)]
pub struct Cli {
    #[arg(
        short = 'c',
        long,
        default_value_t = PING_DEFAULT_COUNT,
        help = "Number of echo requests to send to each destination"
    )]
    pub count: u16,

    #[arg(
        short = 'W',
        long = "timeout",
        default_value_t = 1000,
        value_parser = clap::value_parser!(u64).range(1..),
        help = "Time to wait for each reply, in milliseconds"
    )]
    pub timeout_ms: u64,

    #[arg(short = 'S', long, help = "Source address (discovered from the default route if omitted)")]
    pub source: Option<Ipv4Addr>,

    #[arg(
        short = 's',
        long = "size",
        default_value_t = PING_DEFAULT_PAYLOAD_LEN,
        value_parser = parse_payload_len,
        help = "Echo request payload size in bytes"
    )]
    pub payload_len: usize,

    #[arg(short = 't', long, help = "IP time to live of outgoing requests")]
    pub ttl: Option<u8>,

    #[arg(
        long,
        help = "Attribute replies to probes in arrival order instead of by sequence number"
    )]
    pub completion_order: bool,

    #[arg(
        short = 'v',
        long,
        action = clap::ArgAction::Count,
        help = "Increase log verbosity (-v debug, -vv trace)"
    )]
    pub verbose: u8,

    #[arg(help = "IPv4 address, host name or CIDR block (e.g. 10.0.0.0/30)")]
    pub destinations: Vec<String>,
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn correlation(&self) -> Correlation {
        if self.completion_order {
            Correlation::CompletionOrder
        } else {
            Correlation::Sequence
        }
    }

    /// Default `env_logger` filter when `RUST_LOG` is unset.
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    }

    /// Session options for one resolved destination.
    pub fn builder(&self, destination: Ipv4Addr) -> PingerBuilder {
        let mut builder = PingerBuilder::default()
            .destination(destination)
            .count(self.count)
            .timeout(self.timeout())
            .payload_len(self.payload_len)
            .correlation(self.correlation());
        if let Some(source) = self.source {
            builder = builder.source(source);
        }
        if let Some(ttl) = self.ttl {
            builder = builder.ttl(ttl);
        }
        builder
    }
}

fn parse_payload_len(value: &str) -> Result<usize, String> {
    let len: usize = value.parse().map_err(|e| format!("{e}"))?;
    if len > PING_MAX_PAYLOAD_LEN {
        return Err(format!("at most {PING_MAX_PAYLOAD_LEN} bytes"));
    }
    Ok(len)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    /// No destination given: print [`USAGE`] and exit successfully.
    Usage,
    Run(Cli),
}

pub fn parse_invocation<I, T>(args: I) -> Result<Invocation, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = Cli::try_parse_from(args)?;
    if cli.destinations.is_empty() {
        Ok(Invocation::Usage)
    } else {
        Ok(Invocation::Run(cli))
    }
}

/// Exit code for an argument parsing failure. Help and version requests
/// are not failures.
pub fn parse_error_exit_code(error: &clap::Error) -> u8 {
    match error.kind() {
        ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => EXIT_OK,
        _ => EXIT_USAGE_ERROR,
    }
}

/// One line describing a probe outcome.
pub fn describe(result: &ProbeResult) -> String {
    match result {
        Ok(reply) => match reply.round_trip_time() {
            Some(rtt) => format!(
                "reply from {}: icmp_seq={} bytes={} time={:.3} ms",
                reply.peer(),
                reply.sequence(),
                reply.payload().len(),
                rtt.as_secs_f64() * 1000.0
            ),
            None => format!(
                "reply from {}: icmp_seq={} bytes={}",
                reply.peer(),
                reply.sequence(),
                reply.payload().len()
            ),
        },
        Err(e) if e.is_timeout() => format!("timeout: {e}"),
        Err(e) => format!("error: {e}"),
    }
}

/// Aggregate outcome of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub destination: Ipv4Addr,
    pub transmitted: usize,
    pub received: usize,
    pub timeouts: usize,
    pub errors: usize,
}

impl Summary {
    pub fn new(destination: Ipv4Addr, results: &[ProbeResult]) -> Self {
        let received = results.iter().filter(|r| r.is_ok()).count();
        let timeouts = results
            .iter()
            .filter(|r| matches!(r, Err(e) if e.is_timeout()))
            .count();
        Self {
            destination,
            transmitted: results.len(),
            received,
            timeouts,
            errors: results.len() - received - timeouts,
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} transmitted, {} received, {} timed out, {} errors",
            self.destination, self.transmitted, self.received, self.timeouts, self.errors
        )
    }
}
