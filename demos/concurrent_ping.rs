// demos/concurrent_ping.rs - concurrent sessions across an address block

use std::net::Ipv4Addr;
use std::time::Duration;

use ping_session::{resolve, PingError, Pinger, ProbeResult};
use tokio::task::JoinSet;

#[tokio::main]
async fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 2 {
        eprintln!("Usage: concurrent_ping <destination or CIDR block>");
        std::process::exit(1);
    }

    let targets = match resolve(&args[1]).await {
        Ok(targets) => targets,
        Err(e) => {
            eprintln!("{}: {e}", args[1]);
            std::process::exit(1);
        }
    };

    if let Err(e) = sweep(targets, 3).await {
        eprintln!("Error: {e}");
        std::process::exit(2);
    }
}

/// Runs one session per address, all at once, and prints which answered.
async fn sweep(targets: Vec<Ipv4Addr>, count: u16) -> Result<(), PingError> {
    let mut sessions = JoinSet::new();
    for destination in targets {
        let mut pinger = Pinger::builder()
            .destination(destination)
            .count(count)
            .timeout(Duration::from_millis(500))
            .build()?;
        sessions.spawn(async move { (destination, pinger.run().await) });
    }

    while let Some(joined) = sessions.join_next().await {
        let Ok((destination, outcome)) = joined else {
            continue;
        };
        let results: Vec<ProbeResult> = outcome?;
        let answered = results.iter().filter(|r| r.is_ok()).count();
        if answered > 0 {
            println!("{destination}: up ({answered}/{count} replies)");
        } else {
            println!("{destination}: no reply");
        }
    }

    Ok(())
}
