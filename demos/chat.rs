//! Minimal chat client: joins `chat:index`, prints what others say and publishes every
//! line typed on stdin.
//!
//! The token is signed locally for demo purposes only; real clients receive it from
//! their backend.
//!
//! ```sh
//! RUST_LOG=info cargo run --example chat --features tracing
//! ```
//!
//! Environment:
//! - `CHANPUB_URL` server base URL or full endpoint (default `ws://localhost:8000`)
//! - `CHANPUB_SECRET` HMAC secret shared with the server (default `secret`)
//! - `CHANPUB_USER` user id put in the token (default `49`)

use std::sync::Arc;

use chanpub_client_sdk::auth::Hs256Issuer;
use chanpub_client_sdk::client::{Client, ConnectionHandler, SubscriptionHandler};
use chanpub_client_sdk::events::{
    ConnectEvent, DisconnectEvent, ErrorEvent, JoinEvent, LeaveEvent, PublishEvent,
    SubscribeErrorEvent, SubscribeSuccessEvent, UnsubscribeEvent,
};
use chanpub_client_sdk::websocket_endpoint;
use chanpub_client_sdk::ws::Config;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tracing::{error, info, warn};

const CHANNEL: &str = "chat:index";

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    input: String,
}

struct EventHandler;

impl ConnectionHandler for EventHandler {
    fn on_connect(&self, event: &ConnectEvent) {
        info!(client_id = %event.client_id, "Connected to chat");
    }

    fn on_disconnect(&self, event: &DisconnectEvent) {
        info!(reason = %event.reason, reconnect = event.reconnect, "Disconnected from chat");
    }

    fn on_error(&self, event: &ErrorEvent) {
        error!(recoverable = event.recoverable, "{}", event.message);
    }
}

impl SubscriptionHandler for EventHandler {
    fn on_publish(&self, event: &PublishEvent) {
        match event.decode::<ChatMessage>() {
            Ok(message) => info!("Someone says: {}", message.input),
            Err(e) => warn!(error = %e, "Ignoring malformed chat message"),
        }
    }

    fn on_join(&self, event: &JoinEvent) {
        info!(user = %event.info.user, client = %event.info.client, "Someone joined");
    }

    fn on_leave(&self, event: &LeaveEvent) {
        info!(user = %event.info.user, client = %event.info.client, "Someone left");
    }

    fn on_subscribe_success(&self, event: &SubscribeSuccessEvent) {
        info!(
            channel = %event.channel,
            resubscribed = event.resubscribed,
            recovered = event.recovered,
            "Subscribed"
        );
    }

    fn on_subscribe_error(&self, event: &SubscribeErrorEvent) {
        error!(channel = %event.channel, code = event.code, "Subscribe failed: {}", event.message);
    }

    fn on_unsubscribe(&self, event: &UnsubscribeEvent) {
        info!(channel = %event.channel, reason = %event.reason, "Unsubscribed");
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
    let user = std::env::var("CHANPUB_USER").unwrap_or_else(|_| "49".to_owned());

    let token = Hs256Issuer::new(secret).issue(&user, None)?;
    let handler = Arc::new(EventHandler);

    info!(%url, "Connecting");
    let client = Client::connect(&url, token, Config::default(), Arc::clone(&handler) as _).await?;
    let subscription = client.subscribe(CHANNEL, handler).await?;
    info!("Print something and press ENTER to send");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(input) = line? else {
                    break;
                };
                if let Err(e) = subscription.publish(&ChatMessage { input }).await {
                    error!(error = %e, "Publish failed");
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
    Ok(())
}
