//! Party Server
//!
//! Hosts listen-together parties over WebSocket, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Environment: BIND_ADDR, PORT, CATALOG_URL, HOST_LEAVE_POLICY

mod config;
mod dashboard;
mod metrics;
mod network;

use std::sync::Arc;

use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.iter().any(|a| a == "--no-dashboard");

    let config = config::ServerConfig::from_env();

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(config, metrics).await
    } else {
        network::run_with_logging(config, metrics).await
    }
}
