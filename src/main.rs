use clap::{Parser, Subcommand};
use serde::Serialize;
use std::future::Future;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tollgate::config::TollgateConfig;
use tollgate::ratelimit::RateLimiter;

#[derive(Parser)]
#[command(name = "tollgate", version, about = "In-process tiered rate limiter")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// YAML configuration file; TOLLGATE__* environment variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run a burst of requests for one client and print every decision
    Simulate {
        /// Client identifier
        #[arg(long, default_value = "demo")]
        client: String,

        /// Tier name (free, premium, enterprise)
        #[arg(long, default_value = "free")]
        tier: String,

        /// Number of requests to send
        #[arg(long, default_value_t = 20)]
        requests: u32,

        /// Source address of the requests
        #[arg(long)]
        ip: Option<IpAddr>,

        /// Tokens consumed per request
        #[arg(long, default_value_t = 1)]
        weight: u32,

        /// Pause between requests in milliseconds
        #[arg(long, default_value_t = 0)]
        interval_ms: u64,
    },

    /// Validate the configuration and print the effective settings
    CheckConfig,
}

#[derive(Serialize)]
struct DecisionLine {
    request: u32,
    allowed: bool,
    retry_after: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let config = TollgateConfig::load(args.config.as_deref())?;

    match args.command {
        Command::CheckConfig => {
            print!("{}", serde_yaml::to_string(&config)?);
            Ok(())
        }
        Command::Simulate {
            client,
            tier,
            requests,
            ip,
            weight,
            interval_ms,
        } => {
            info!("Starting Tollgate simulation");
            info!("Version: {}", env!("CARGO_PKG_VERSION"));

            let limiter = RateLimiter::new(config)?;
            limiter.start();

            tokio::select! {
                _ = simulate(&limiter, &client, &tier, requests, ip, weight, interval_ms) => {}
                _ = shutdown_signal() => {}
            }

            limiter.stop().await;

            let status = limiter.get_rate_limit_status(&client, limiter.policy().resolve(&tier));
            println!("{}", serde_json::to_string_pretty(&status)?);

            info!("Tollgate simulation finished");
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn simulate(
    limiter: &RateLimiter,
    client: &str,
    tier: &str,
    requests: u32,
    ip: Option<IpAddr>,
    weight: u32,
    interval_ms: u64,
) {
    for request in 1..=requests {
        let decision = limiter.check_rate_limit_named(client, tier, weight, ip);
        let line = DecisionLine {
            request,
            allowed: decision.allowed,
            retry_after: decision.retry_after,
        };
        match serde_json::to_string(&line) {
            Ok(json) => println!("{}", json),
            Err(e) => error!(error = %e, "Failed to encode decision"),
        }

        if interval_ms > 0 && request < requests {
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = on_signal(signal::ctrl_c(), "ctrl_c");

    #[cfg(unix)]
    let terminate = on_signal(
        async {
            signal::unix::signal(signal::unix::SignalKind::terminate())?
                .recv()
                .await;
            Ok::<(), io::Error>(())
        },
        "SIGTERM",
    );

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, stopping simulation");
        }
        _ = terminate => {
            info!("Received SIGTERM, stopping simulation");
        }
    }
}

/// Resolve once `signal` fires.
///
/// A handler that cannot be installed is logged and never resolves, so the
/// run continues instead of shutting down.
async fn on_signal<F>(signal: F, name: &str)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = signal.await {
        error!(signal = name, error = %e, "Failed to install signal handler");
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_failed_handler_never_fires() {
        let failing = async { Err::<(), _>(io::Error::new(io::ErrorKind::Other, "unsupported")) };
        let result = tokio::time::timeout(Duration::from_secs(5), on_signal(failing, "test")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_delivered_signal_resolves() {
        on_signal(async { Ok::<(), io::Error>(()) }, "test").await;
    }

    #[test]
    fn test_cli_parses_simulate() {
        let args = Args::try_parse_from([
            "tollgate", "--json-logs", "simulate", "--tier", "premium", "--requests", "3",
            "--ip", "1.2.3.4",
        ])
        .unwrap();
        assert!(args.json_logs);
        match args.command {
            Command::Simulate { tier, requests, ip, weight, .. } => {
                assert_eq!(tier, "premium");
                assert_eq!(requests, 3);
                assert_eq!(ip, Some("1.2.3.4".parse().unwrap()));
                assert_eq!(weight, 1);
            }
            Command::CheckConfig => panic!("expected simulate"),
        }
    }
}
