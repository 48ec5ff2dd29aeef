//! Publish/subscribe client.
//!
//! [`Client`] owns one connection to the server and the registry of channel
//! subscriptions made over it. Connection events go to a [`ConnectionHandler`], channel
//! events to the [`SubscriptionHandler`] of each [`Subscription`].
//!
//! # Example
//!
//! ```rust, no_run
//! use std::sync::Arc;
//!
//! use chanpub_client_sdk::auth::Token;
//! use chanpub_client_sdk::client::{Client, SubscriptionHandler};
//! use chanpub_client_sdk::events::PublishEvent;
//! use chanpub_client_sdk::ws::Config;
//!
//! struct Printer;
//!
//! impl SubscriptionHandler for Printer {
//!     fn on_publish(&self, event: &PublishEvent) {
//!         println!("{}: {}", event.channel, event.data);
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let token = Token::from(std::env::var("CHANPUB_TOKEN")?);
//!     let client = Client::connect(
//!         "ws://localhost:8000/connection/websocket",
//!         token,
//!         Config::default(),
//!         Arc::new(()),
//!     )
//!     .await?;
//!
//!     let subscription = client.subscribe("chat:index", Arc::new(Printer)).await?;
//!     subscription.publish(&serde_json::json!({ "input": "hello" })).await?;
//!
//!     client.close().await;
//!     Ok(())
//! }
//! ```

mod handler;
mod publish;
mod subscription;

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub use handler::{ConnectionHandler, SubscriptionHandler};
pub use publish::PublishAck;
pub use subscription::{Subscription, SubscriptionState};
use subscription::SubscriptionRegistry;

use crate::Result;
use crate::auth::TokenSource;
use crate::ws::{Config, ConnectionEvent, ConnectionManager, ConnectionState, PushRouter};

/// Client for one publish/subscribe connection.
///
/// Cheap to clone; clones share the connection. The connection is closed with
/// [`Client::close`] or once the last clone and [`Subscription`] are dropped.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connection: ConnectionManager,
    registry: Arc<SubscriptionRegistry>,
    /// Event dispatcher and reconnection handler, awaited on close
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.connection.shutdown();
    }
}

impl Client {
    /// Connect to `endpoint` and complete the handshake.
    ///
    /// `tokens` is asked for a credential on every connect attempt, including
    /// reconnects. `handler` receives connection events for the lifetime of the client;
    /// the first [`on_connect`](ConnectionHandler::on_connect) has been queued when this
    /// returns.
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::Auth`](crate::error::Kind::Auth) if the token is expired or
    /// refused by the server, [`Kind::Validation`](crate::error::Kind::Validation) for an
    /// endpoint that is not a `ws`/`wss` URL, and
    /// [`Kind::Transport`](crate::error::Kind::Transport) if the server cannot be
    /// reached.
    pub async fn connect<T: TokenSource>(
        endpoint: &str,
        tokens: T,
        config: Config,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(dispatch_events(events_rx, handler));

        let registry = Arc::new(SubscriptionRegistry::default());
        let router: Arc<dyn PushRouter> = Arc::clone(&registry) as Arc<dyn PushRouter>;
        let connection = ConnectionManager::connect(
            endpoint,
            config,
            Arc::new(tokens),
            router,
            events_tx,
        )
        .await?;
        let reconnection = registry.start_reconnection_handler(connection.clone());

        Ok(Self {
            inner: Arc::new(ClientInner {
                connection,
                registry,
                tasks: Mutex::new(vec![dispatcher, reconnection]),
            }),
        })
    }

    /// Subscribe to `channel`, waiting for the server to acknowledge.
    ///
    /// `handler` receives the channel's events in arrival order, starting with
    /// [`on_subscribe_success`](SubscriptionHandler::on_subscribe_success).
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::Subscribe`](crate::error::Kind::Subscribe) when the server
    /// refuses the channel (the source is a
    /// [`SubscribeRejected`](crate::error::SubscribeRejected) carrying the protocol code),
    /// when the channel is already subscribed on this client, or when the request cannot
    /// be completed.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<Subscription> {
        let slot = self
            .inner
            .registry
            .subscribe(&self.inner.connection, channel, handler)
            .await?;

        Ok(Subscription::new(slot, self.clone()))
    }

    /// Look up the subscription currently registered for `channel`.
    #[must_use]
    pub fn subscription(&self, channel: &str) -> Option<Subscription> {
        self.inner
            .registry
            .get(channel)
            .map(|slot| Subscription::new(slot, self.clone()))
    }

    /// Publish `payload` into `channel`, which need not be subscribed.
    ///
    /// # Errors
    ///
    /// See [`Subscription::publish`].
    pub async fn publish<T: Serialize + ?Sized>(
        &self,
        channel: &str,
        payload: &T,
    ) -> Result<PublishAck> {
        publish::send(&self.inner.connection, channel, payload).await
    }

    /// Close the connection.
    ///
    /// In-flight requests fail with [`WsError::Cancelled`](crate::ws::WsError::Cancelled),
    /// every subscription receives a final
    /// [`on_unsubscribe`](SubscriptionHandler::on_unsubscribe), and
    /// [`on_disconnect`](ConnectionHandler::on_disconnect) fires if the client was
    /// connected. All handler calls have completed when this returns.
    pub async fn close(&self) {
        self.inner.connection.close().await;
        self.inner.registry.close_all().await;

        let tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for task in tasks {
            if let Err(e) = task.await {
                #[cfg(feature = "tracing")]
                tracing::error!("Client task failed: {e:?}");
                #[cfg(not(feature = "tracing"))]
                let _ = &e;
            }
        }
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    /// Subscribe to connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection.state_receiver()
    }

    /// Server-assigned id of the current session, if connected.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.inner.connection.client_id()
    }

    /// Number of subscriptions that are active or waiting to be re-established.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.live_count()
    }

    pub(crate) fn connection(&self) -> &ConnectionManager {
        &self.inner.connection
    }

    pub(crate) fn registry(&self) -> &SubscriptionRegistry {
        &self.inner.registry
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("state", &self.connection_state())
            .field("client_id", &self.client_id())
            .finish_non_exhaustive()
    }
}

/// Forward connection events to `handler` until the connection task exits.
async fn dispatch_events(
    mut events_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
    handler: Arc<dyn ConnectionHandler>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            ConnectionEvent::Connected(event) => handler.on_connect(&event),
            ConnectionEvent::Disconnected(event) => handler.on_disconnect(&event),
            ConnectionEvent::Error(event) => handler.on_error(&event),
        }
    }
}
