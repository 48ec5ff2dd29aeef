//! Core WebSocket infrastructure.
//!
//! This module owns the single logical connection a client keeps to the server: the
//! connect handshake, heartbeat, reconnection with backoff, and correlation of command
//! replies. It knows nothing about subscriptions; channel pushes are handed to a
//! [`PushRouter`] supplied by the layer above.
//!
//! # Architecture
//!
//! - [`ConnectionManager`]: Connection handler with heartbeat and reconnection
//! - [`PushRouter`]: Trait receiving channel pushes in wire order
//! - [`ConnectionEvent`]: Lifecycle notifications for the owning client
//!
//! # Example
//!
//! ```ignore
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let connection =
//!     ConnectionManager::connect(endpoint, Config::default(), tokens, router, events_tx).await?;
//! let mut state = connection.state_receiver();
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod traits;

pub use config::{Config, ReconnectConfig};
pub use connection::{ConnectionEvent, ConnectionManager, ConnectionState};
#[expect(
    clippy::module_name_repetitions,
    reason = "WsError includes module name for clarity when used outside this module"
)]
pub use error::WsError;
pub use traits::*;
