// demos/ping.rs - one probe per second against a single address

use std::net::Ipv4Addr;
use std::time::Duration;

use ping_session::{PingError, Pinger};
use tokio::time;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: ping <destination>");
        std::process::exit(1);
    }

    let destination: Ipv4Addr = match args[1].parse() {
        Ok(addr) => addr,
        Err(e) => {
            eprintln!("{}: {e}", args[1]);
            std::process::exit(1);
        }
    };
    if let Err(e) = ping(destination, 4).await {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }
}

/// One probe per second, each in its own short session.
async fn ping(destination: Ipv4Addr, times: usize) -> Result<(), PingError> {
    let mut pinger = Pinger::builder()
        .destination(destination)
        .timeout(Duration::from_millis(800))
        .build()?;

    let mut interval = time::interval(Duration::from_secs(1));

    for _ in 0..times {
        interval.tick().await;

        match pinger.ping_one().await {
            Ok(reply) => println!(
                "Reply from {}: seq = {}, time = {:?}",
                reply.peer(),
                reply.sequence(),
                reply.round_trip_time()
            ),
            Err(e) if e.is_timeout() => println!("Request timed out: {e}"),
            Err(e) => return Err(e),
        }
    }

    Ok(())
}
