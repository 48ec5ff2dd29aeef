//! Fan-out throughput measurement: many subscribers on one channel, one concurrent
//! publisher.
//!
//! ```sh
//! RUST_LOG=info cargo run --release --example throughput --features tracing
//! ```
//!
//! Environment:
//! - `CHANPUB_URL` server base URL or full endpoint (default `ws://localhost:8000`)
//! - `CHANPUB_SECRET` HMAC secret shared with the server (default `secret`)
//! - `CHANPUB_CHANNEL` (default `throughput`)
//! - `SUBSCRIBERS` (default 1000), `PUBLISHES` (default 5000)

use std::time::Duration;

use chanpub_client_sdk::auth::Hs256Issuer;
use chanpub_client_sdk::throughput::{self, ThroughputConfig};
use chanpub_client_sdk::websocket_endpoint;
use tracing::info;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => Ok(value.parse()?),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let url = websocket_endpoint(
        &std::env::var("CHANPUB_URL").unwrap_or_else(|_| "ws://localhost:8000".to_owned()),
    );
    let secret = std::env::var("CHANPUB_SECRET").unwrap_or_else(|_| "secret".to_owned());
    let channel = std::env::var("CHANPUB_CHANNEL").unwrap_or_else(|_| "throughput".to_owned());

    let config = ThroughputConfig::builder()
        .endpoint(url)
        .issuer(Hs256Issuer::new(secret))
        .channel(channel)
        .subscribers(env_or("SUBSCRIBERS", 1000)?)
        .publishes(env_or("PUBLISHES", 5000)?)
        .stagger(Duration::from_millis(10))
        .build();

    let report = throughput::run(config).await?;

    info!("Total clients {}", report.clients);
    info!("Total messages {}", report.total_messages);
    info!("Elapsed {:?}", report.elapsed);
    info!("Msg/sec {:.0}", report.messages_per_sec);
    Ok(())
}
