//! Failure-injecting webhook receiver for local testing.
//!
//! Rejects the first `FAIL_FIRST_N` attempts of every event, optionally
//! stalls a share of requests past the dispatcher's HTTP timeout, and
//! verifies every signature it accepts. Point tasks at
//! `http://localhost:3001/webhook` to watch retries and dead-lettering.

use std::sync::Arc;

use anyhow::{Context, Result};
use herald_testing::{ReceiverConfig, ReceiverSimulator};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = ReceiverConfig::load()?;
    let addr = config.bind_addr()?;
    info!(
        addr = %addr,
        fail_first_n = config.fail_first_n,
        timeout_rate = config.timeout_rate,
        timeout_delay_ms = config.timeout_delay_ms,
        "starting mock receiver"
    );

    let simulator = Arc::new(ReceiverSimulator::new(config)?);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind mock receiver to {addr}"))?;

    simulator
        .serve(listener, herald_api::shutdown_signal())
        .await
        .context("Mock receiver failed")?;

    info!("mock receiver stopped");
    Ok(())
}

/// Initializes tracing with environment-based configuration.
fn init_tracing() {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,herald_testing=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_line_number(true))
        .init();
}
