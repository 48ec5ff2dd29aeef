//! Fan-out throughput harness.
//!
//! Connects a number of subscriber clients to one channel, publishes into it
//! concurrently from a separate client, and measures how long it takes until every
//! subscriber has received every publication.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bon::Builder;
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

use crate::Result;
use crate::auth::Hs256Issuer;
use crate::client::{Client, Subscription, SubscriptionHandler};
use crate::error::{Error, Kind};
use crate::events::PublishEvent;
use crate::ws::{Config, WsError};

/// Counts deliveries and signals once a target is reached.
///
/// Completion is broadcast exactly once, by whichever delivery first reaches the target,
/// no matter how many deliveries race past it.
#[derive(Debug)]
pub struct DeliveryCounter {
    target: u64,
    delivered: AtomicU64,
    completed: AtomicBool,
    done_tx: watch::Sender<bool>,
}

impl DeliveryCounter {
    #[must_use]
    pub fn new(target: u64) -> Self {
        let (done_tx, _) = watch::channel(target == 0);
        Self {
            target,
            delivered: AtomicU64::new(0),
            completed: AtomicBool::new(target == 0),
            done_tx,
        }
    }

    /// Record one delivery. Returns `true` for the single call that completed the target.
    pub fn record(&self) -> bool {
        let delivered = self.delivered.fetch_add(1, Ordering::AcqRel) + 1;
        if delivered < self.target {
            return false;
        }

        let completed = self
            .completed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if completed {
            self.done_tx.send_replace(true);
        }
        completed
    }

    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn target(&self) -> u64 {
        self.target
    }

    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// Wait until the target is reached.
    pub async fn wait(&self) {
        let mut done_rx = self.done_tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait
        _ = done_rx.wait_for(|done| *done).await;
    }
}

struct CountingHandler(Arc<DeliveryCounter>);

impl SubscriptionHandler for CountingHandler {
    fn on_publish(&self, _: &PublishEvent) {
        self.0.record();
    }
}

/// Parameters of a throughput run.
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct ThroughputConfig {
    #[builder(into)]
    pub endpoint: String,
    /// Signs a token for every client; subscriber `n` connects as user `n`
    pub issuer: Hs256Issuer,
    #[builder(into, default = "throughput")]
    pub channel: String,
    #[builder(default = 1000)]
    pub subscribers: u32,
    #[builder(default = 5000)]
    pub publishes: u32,
    /// Pause between starting two subscriber connections
    #[builder(default = Duration::from_millis(10))]
    pub stagger: Duration,
    #[builder(default = serde_json::json!({ "input": "1" }))]
    pub payload: Value,
    /// Upper bound on waiting for all deliveries once publishing is done
    #[builder(default = Duration::from_secs(60))]
    pub timeout: Duration,
    #[builder(default)]
    pub client: Config,
}

/// Outcome of a throughput run.
#[non_exhaustive]
#[derive(Clone, Copy, Debug)]
pub struct ThroughputReport {
    pub clients: u32,
    pub total_messages: u64,
    /// Time from the first publish until the last delivery
    pub elapsed: Duration,
    pub messages_per_sec: f64,
}

impl ThroughputReport {
    #[expect(
        clippy::cast_precision_loss,
        clippy::float_arithmetic,
        reason = "Rate is reported for humans; precision loss above 2^52 messages is irrelevant"
    )]
    fn new(clients: u32, total_messages: u64, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        let messages_per_sec = if secs > 0.0 {
            total_messages as f64 / secs
        } else {
            0.0
        };

        Self {
            clients,
            total_messages,
            elapsed,
            messages_per_sec,
        }
    }
}

/// Run the harness: connect `subscribers` clients, publish `publishes` messages and wait
/// until `subscribers * publishes` deliveries have been counted.
///
/// All clients are closed before this returns, on success and on error.
pub async fn run(config: ThroughputConfig) -> Result<ThroughputReport> {
    let total = u64::from(config.subscribers) * u64::from(config.publishes);
    let counter = Arc::new(DeliveryCounter::new(total));

    #[cfg(feature = "tracing")]
    tracing::info!(
        subscribers = config.subscribers,
        publishes = config.publishes,
        channel = %config.channel,
        "Starting throughput run"
    );

    let mut handles = Vec::new();
    for n in 0..config.subscribers {
        if n > 0 {
            sleep(config.stagger).await;
        }
        let config = config.clone();
        let counter = Arc::clone(&counter);
        handles.push(tokio::spawn(async move {
            let handler = Arc::new(CountingHandler(counter));
            connect_subscriber(&config, n, handler).await
        }));
    }

    let mut clients = Vec::with_capacity(handles.len() + 1);
    let mut failure = None;
    for handle in handles {
        match handle.await {
            Ok(Ok((client, _))) => clients.push(client),
            Ok(Err(e)) => failure = failure.or(Some(e)),
            Err(e) => failure = failure.or(Some(Error::with_source(Kind::Internal, e))),
        }
    }

    let result = match failure {
        Some(e) => Err(e),
        None => match connect_subscriber(&config, config.subscribers, Arc::new(())).await {
            Ok((publisher, subscription)) => {
                clients.push(publisher);
                publish_all(&config, &subscription, &counter).await
            }
            Err(e) => Err(e),
        },
    };

    join_all(clients.iter().map(Client::close)).await;

    let elapsed = result?;
    let report = ThroughputReport::new(config.subscribers, counter.delivered(), elapsed);

    #[cfg(feature = "tracing")]
    tracing::info!(
        clients = report.clients,
        total_messages = report.total_messages,
        elapsed = ?report.elapsed,
        messages_per_sec = report.messages_per_sec,
        "Throughput run finished"
    );

    Ok(report)
}

async fn connect_subscriber(
    config: &ThroughputConfig,
    n: u32,
    handler: Arc<dyn SubscriptionHandler>,
) -> Result<(Client, Subscription)> {
    let token = config.issuer.issue(&n.to_string(), None)?;
    let client =
        Client::connect(&config.endpoint, token, config.client.clone(), Arc::new(())).await?;

    match client.subscribe(&config.channel, handler).await {
        Ok(subscription) => Ok((client, subscription)),
        Err(e) => {
            client.close().await;
            Err(e)
        }
    }
}

/// Publish concurrently and wait for the counter, returning the elapsed time.
async fn publish_all(
    config: &ThroughputConfig,
    subscription: &Subscription,
    counter: &DeliveryCounter,
) -> Result<Duration> {
    let started = Instant::now();

    let publishes = (0..config.publishes).map(|_| {
        let subscription = subscription.clone();
        let payload = config.payload.clone();
        tokio::spawn(async move { subscription.publish(&payload).await })
    });
    for result in join_all(publishes).await {
        result.map_err(|e| Error::with_source(Kind::Internal, e))??;
    }

    timeout(config.timeout, counter.wait())
        .await
        .map_err(|_e| {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                delivered = counter.delivered(),
                target = counter.target(),
                "Timed out waiting for deliveries"
            );
            Error::from(WsError::Timeout)
        })?;

    Ok(started.elapsed())
}
