#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;

const PING_EVERY: Duration = Duration::from_secs(5);
const PONG_WITHIN: Duration = Duration::from_secs(15);
const HANDSHAKE_WITHIN: Duration = Duration::from_secs(10);
const REPLY_WITHIN: Duration = Duration::from_secs(10);
const FIRST_RETRY_AFTER: Duration = Duration::from_secs(1);
const RETRY_CAP: Duration = Duration::from_secs(60);
const RETRY_GROWTH: f64 = 2.0;
const CLIENT_NAME: &str = "chanpub-rust";

/// Timeouts, heartbeat and reconnect policy of a client connection, plus the identity
/// it reports in the handshake.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// How often a `PING` text frame is sent
    #[builder(default = PING_EVERY)]
    pub heartbeat_interval: Duration,
    /// Silence after which the session is considered dead and torn down
    #[builder(default = PONG_WITHIN)]
    pub heartbeat_timeout: Duration,
    /// Bounds dialing plus the connect command round trip
    #[builder(default = HANDSHAKE_WITHIN)]
    pub connect_timeout: Duration,
    /// Bounds the round trip of subscribe, unsubscribe and publish
    #[builder(default = REPLY_WITHIN)]
    pub request_timeout: Duration,
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    #[builder(into, default = CLIENT_NAME.to_owned())]
    pub name: String,
    #[builder(into, default = env!("CARGO_PKG_VERSION").to_owned())]
    pub version: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// When and how often a lost session is re-established.
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct ReconnectConfig {
    /// Attempts per outage; `None` retries forever, `Some(0)` never reconnects
    pub max_attempts: Option<u32>,
    #[builder(default = FIRST_RETRY_AFTER)]
    pub initial_backoff: Duration,
    #[builder(default = RETRY_CAP)]
    pub max_backoff: Duration,
    #[builder(default = RETRY_GROWTH)]
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl From<ReconnectConfig> for ExponentialBackoff {
    fn from(config: ReconnectConfig) -> Self {
        // Attempts are counted by the connection loop, not by elapsed time
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            .with_max_elapsed_time(None)
            .build()
    }
}
