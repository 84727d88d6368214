//! Load balancer binary.
//!
//! ```text
//!     Client ──▶ listener ──▶ HTTP server / TCP proxy ──▶ Dispatcher ──▶ Backend
//!                                                          │
//!                         Policy ◀── Registry snapshot ◀───┤
//!                                       ▲                  │
//!                         Health prober ┘   Circuit breakers + metrics
//! ```

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

use loadbalancer::config::{load_config, BalancerConfig, FrontendMode};
use loadbalancer::lifecycle::Application;
use loadbalancer::observability::init_logging;
use loadbalancer::Strategy;

#[derive(Parser, Debug)]
#[command(name = "loadbalancer", version, about = "Load-balancing request dispatcher")]
struct Args {
    /// TOML configuration file. Watched for changes while running.
    #[arg(short, long, env = "LB_CONFIG")]
    config: Option<PathBuf>,

    /// Listener port, overriding the configured bind address's port.
    #[arg(short, long, env = "LB_PORT")]
    port: Option<u16>,

    /// Selection strategy (roundrobin, leastconn, weighted, random, hash).
    #[arg(short, long)]
    strategy: Option<Strategy>,

    /// Front-end protocol: http or tcp.
    #[arg(short, long, value_parser = parse_mode)]
    mode: Option<FrontendMode>,
}

fn parse_mode(value: &str) -> Result<FrontendMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "http" => Ok(FrontendMode::Http),
        "tcp" => Ok(FrontendMode::Tcp),
        other => Err(format!("unknown mode '{}' (expected http or tcp)", other)),
    }
}

fn apply_overrides(config: &mut BalancerConfig, args: &Args) {
    if let Some(port) = args.port {
        match config.listener.bind_address.parse::<SocketAddr>() {
            Ok(mut addr) => {
                addr.set_port(port);
                config.listener.bind_address = addr.to_string();
            }
            Err(_) => config.listener.bind_address = format!("0.0.0.0:{}", port),
        }
    }
    if let Some(strategy) = args.strategy {
        config.strategy = strategy;
    }
    if let Some(mode) = args.mode {
        config.listener.mode = mode;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => BalancerConfig::default(),
    };
    apply_overrides(&mut config, &args);
    init_logging(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "loadbalancer starting");
    if config.backends.is_empty() {
        tracing::warn!("No backends configured; requests fail until one is added");
    }

    let app = Application::build(config, args.config.clone()).await?;
    app.run_until_signal().await?;

    tracing::info!("Shutdown complete");
    Ok(())
}
