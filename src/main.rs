// main.rs - ping-session command line entry point

use std::net::Ipv4Addr;
use std::process::ExitCode;

use anyhow::{Context, Result};
use env_logger::Env;
use log::debug;
use ping_session::cli::{
    self, describe, parse_error_exit_code, Cli, Invocation, Summary, EXIT_OK, EXIT_RUN_ERROR,
    EXIT_USAGE_ERROR, USAGE,
};
use ping_session::resolve;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match cli::parse_invocation(std::env::args_os()) {
        Ok(Invocation::Run(cli)) => cli,
        Ok(Invocation::Usage) => {
            println!("{USAGE}");
            return ExitCode::from(EXIT_OK);
        }
        Err(e) => {
            let code = parse_error_exit_code(&e);
            // Help and version go to stdout, real errors to stderr.
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    env_logger::Builder::from_env(Env::default().default_filter_or(cli.log_filter())).init();

    let mut code = EXIT_OK;
    for spec in &cli.destinations {
        let targets = match resolve(spec).await {
            Ok(targets) => targets,
            Err(e) => {
                eprintln!("{spec}: {e}");
                return ExitCode::from(EXIT_USAGE_ERROR);
            }
        };
        debug!("{spec} resolved to {} address(es)", targets.len());

        for destination in targets {
            if let Err(e) = ping(&cli, destination).await {
                eprintln!("error: {e:#}");
                code = EXIT_RUN_ERROR;
            }
        }
    }

    ExitCode::from(code)
}

async fn ping(cli: &Cli, destination: Ipv4Addr) -> Result<()> {
    let mut pinger = cli
        .builder(destination)
        .build()
        .with_context(|| format!("invalid session for {destination}"))?;

    let results = pinger
        .run()
        .await
        .with_context(|| format!("ping {destination} failed"))?;

    for result in &results {
        match result {
            Ok(_) => println!("{}", describe(result)),
            Err(e) => {
                debug!("{pinger}: probe failed: {e:?}");
                eprintln!("{}", describe(result));
            }
        }
    }
    println!("{}", Summary::new(destination, &results));
    Ok(())
}
