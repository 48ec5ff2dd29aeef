#![expect(
    clippy::module_name_repetitions,
    reason = "Subscription types deliberately include the module name for clarity"
)]

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use dashmap::{DashMap, Entry};
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Client;
use super::handler::SubscriptionHandler;
use super::publish::{self, PublishAck};
use crate::Result;
use crate::error::{Error, Kind, SubscribeRejected};
use crate::events::{
    JoinEvent, LeaveEvent, PublishEvent, SubscribeErrorEvent, SubscribeSuccessEvent,
    UnsubscribeEvent, UnsubscribeReason,
};
use crate::protocol::{ChannelEvent, Method, ProtocolError, Reply, codes};
use crate::ws::{ConnectionManager, ConnectionState, PushRouter, ReplyHook, ReplyResult, WsError};

/// Lifecycle of one channel subscription.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum SubscriptionState {
    /// Ended by the client, the server, or by closing the client
    Unsubscribed,
    /// Waiting for the server to acknowledge a subscribe, or for a reconnect
    Subscribing,
    /// Acknowledged; publications are delivered
    Subscribed,
    /// Rejected by the server and not retried
    Failed,
}

impl SubscriptionState {
    /// Whether the subscription still occupies its channel.
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Subscribing | Self::Subscribed)
    }
}

/// Item queued for a subscription's delivery task.
enum Delivery {
    Publish(PublishEvent),
    Join(JoinEvent),
    Leave(LeaveEvent),
    SubscribeSuccess(SubscribeSuccessEvent),
    SubscribeError(SubscribeErrorEvent),
    Unsubscribe(UnsubscribeEvent),
}

/// Sending half of a delivery queue and the task draining it.
struct Queue {
    tx: mpsc::UnboundedSender<Delivery>,
    task: JoinHandle<()>,
}

/// Registry entry for one channel.
pub(crate) struct Slot {
    channel: String,
    state: Mutex<SubscriptionState>,
    /// `since` of the session this subscription was last sent in
    session: Mutex<Option<Instant>>,
    /// Dropped when the subscription ends, which stops the delivery task
    queue: Mutex<Option<Queue>>,
}

impl Slot {
    fn new(channel: String, handler: Arc<dyn SubscriptionHandler>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(deliver(rx, handler));

        Arc::new(Self {
            channel,
            state: Mutex::new(SubscriptionState::Subscribing),
            session: Mutex::new(None),
            queue: Mutex::new(Some(Queue { tx, task })),
        })
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: SubscriptionState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    /// Move `from` to `to` atomically, returning whether the transition happened.
    fn transition(&self, from: SubscriptionState, to: SubscriptionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == from {
            *state = to;
            true
        } else {
            false
        }
    }

    fn enqueue(&self, delivery: Delivery) {
        if let Some(queue) = &*self.queue.lock().unwrap_or_else(PoisonError::into_inner) {
            _ = queue.tx.send(delivery);
        }
    }

    /// Mark the subscription as sent in the session that started at `since`. Returns
    /// `false` when it already was.
    fn claim_session(&self, since: Option<Instant>) -> bool {
        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        if *session == since {
            return false;
        }
        *session = since;
        true
    }

    fn subscribed(&self, resubscribed: bool, recovered: bool) {
        if !self.transition(SubscriptionState::Subscribing, SubscriptionState::Subscribed) {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %self.channel, resubscribed, "Subscribed");

        self.enqueue(Delivery::SubscribeSuccess(SubscribeSuccessEvent {
            channel: self.channel.clone(),
            resubscribed,
            recovered,
        }));
    }

    /// Report a server rejection. Terminal rejections fail the subscription and release
    /// its handler; others leave it waiting for the next reconnect.
    fn rejected(&self, error: &ProtocolError, terminal: bool) {
        #[cfg(feature = "tracing")]
        tracing::warn!(
            channel = %self.channel,
            code = error.code,
            terminal,
            "Subscription rejected"
        );

        // Fail before notifying so the handler observes the final state
        let failed =
            terminal && self.transition(SubscriptionState::Subscribing, SubscriptionState::Failed);
        self.enqueue(Delivery::SubscribeError(SubscribeErrorEvent {
            channel: self.channel.clone(),
            code: error.code,
            message: error.message.clone(),
        }));

        if failed {
            drop(self.take_queue());
        }
    }

    fn take_queue(&self) -> Option<Queue> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// End the subscription with a final unsubscribe event. Returns the delivery task
    /// so callers can wait for the handler to observe it, or `None` if the subscription
    /// had already ended.
    fn finish(&self, reason: UnsubscribeReason) -> Option<JoinHandle<()>> {
        let queue = self.take_queue()?;
        self.set_state(SubscriptionState::Unsubscribed);

        #[cfg(feature = "tracing")]
        tracing::debug!(channel = %self.channel, %reason, "Unsubscribed");

        _ = queue.tx.send(Delivery::Unsubscribe(UnsubscribeEvent {
            channel: self.channel.clone(),
            reason,
        }));
        Some(queue.task)
    }

    /// Drop the subscription without notifying its handler.
    fn discard(&self) {
        if self.take_queue().is_some() {
            self.set_state(SubscriptionState::Unsubscribed);
        }
    }

    fn reply_hook(self: &Arc<Self>, resubscribed: bool) -> ReplyHook {
        let slot = Arc::clone(self);
        Box::new(move |result: &ReplyResult| match result {
            Ok(Reply::Subscribe(reply)) => slot.subscribed(resubscribed, reply.recovered),
            Ok(_) => {}
            Err(e) => {
                let terminal = !resubscribed || rejection(&slot.channel, e).is_terminal();
                slot.rejected(e, terminal);
            }
        })
    }
}

/// Serve one subscription's queue until it is dropped.
async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    handler: Arc<dyn SubscriptionHandler>,
) {
    while let Some(delivery) = rx.recv().await {
        match delivery {
            Delivery::Publish(event) => handler.on_publish(&event),
            Delivery::Join(event) => handler.on_join(&event),
            Delivery::Leave(event) => handler.on_leave(&event),
            Delivery::SubscribeSuccess(event) => handler.on_subscribe_success(&event),
            Delivery::SubscribeError(event) => handler.on_subscribe_error(&event),
            Delivery::Unsubscribe(event) => {
                handler.on_unsubscribe(&event);
                break;
            }
        }
    }
}

fn rejection(channel: &str, error: &ProtocolError) -> SubscribeRejected {
    SubscribeRejected {
        channel: channel.to_owned(),
        code: error.code,
        reason: error.message.clone(),
    }
}

/// Tracks the subscriptions of one connection and routes channel pushes to them.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    slots: DashMap<String, Arc<Slot>>,
}

impl SubscriptionRegistry {
    /// Subscribe to `channel`, waiting for the server's answer.
    pub(crate) async fn subscribe(
        &self,
        connection: &ConnectionManager,
        channel: &str,
        handler: Arc<dyn SubscriptionHandler>,
    ) -> Result<Arc<Slot>> {
        if channel.is_empty() {
            return Err(Error::validation("channel name must not be empty"));
        }

        let slot = match self.slots.entry(channel.to_owned()) {
            Entry::Occupied(entry) if entry.get().state().is_live() => {
                return Err(SubscribeRejected {
                    channel: channel.to_owned(),
                    code: codes::ALREADY_SUBSCRIBED,
                    reason: "already subscribed".to_owned(),
                }
                .into());
            }
            Entry::Occupied(mut entry) => {
                let slot = Slot::new(channel.to_owned(), handler);
                entry.insert(Arc::clone(&slot));
                slot
            }
            Entry::Vacant(entry) => {
                let slot = Slot::new(channel.to_owned(), handler);
                entry.insert(Arc::clone(&slot));
                slot
            }
        };

        if let ConnectionState::Connected { since } = connection.state() {
            slot.claim_session(Some(since));
        }

        let hook = slot.reply_hook(false);
        match connection.request(Method::subscribe(channel), Some(hook)).await {
            Ok(Ok(Reply::Subscribe(_))) => Ok(slot),
            Ok(Ok(other)) => {
                self.discard(&slot);
                Err(Error::from(WsError::InvalidMessage(format!(
                    "unexpected reply to subscribe: {other:?}"
                )))
                .into_kind(Kind::Subscribe))
            }
            // The reply hook already failed the slot and notified the handler
            Ok(Err(e)) => Err(rejection(channel, &e).into()),
            Err(e) => {
                self.discard(&slot);
                Err(e.into_kind(Kind::Subscribe))
            }
        }
    }

    /// Leave `slot`'s channel. The handler has seen its final event when this returns.
    pub(crate) async fn unsubscribe(
        &self,
        connection: &ConnectionManager,
        slot: &Arc<Slot>,
    ) -> Result<()> {
        self.remove(slot);
        let Some(task) = slot.finish(UnsubscribeReason::Client) else {
            return Ok(());
        };

        let result = if connection.state().is_connected() {
            match connection
                .request(Method::unsubscribe(&slot.channel), None)
                .await
            {
                Ok(Ok(_)) => Ok(()),
                Ok(Err(e)) => Err(rejection(&slot.channel, &e).into()),
                // Without a session the server holds no subscription
                Err(e) if matches!(e.downcast_ref::<WsError>(), Some(WsError::NotConnected)) => {
                    Ok(())
                }
                Err(e) => Err(e.into_kind(Kind::Subscribe)),
            }
        } else {
            Ok(())
        };

        await_delivery(task).await;
        result
    }

    pub(crate) fn get(&self, channel: &str) -> Option<Arc<Slot>> {
        self.slots.get(channel).map(|slot| Arc::clone(slot.value()))
    }

    /// Number of subscriptions that are subscribed or waiting to be.
    pub(crate) fn live_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.state().is_live())
            .count()
    }

    fn remove(&self, slot: &Arc<Slot>) {
        self.slots
            .remove_if(&slot.channel, |_, current| Arc::ptr_eq(current, slot));
    }

    fn discard(&self, slot: &Arc<Slot>) {
        self.remove(slot);
        slot.discard();
    }

    /// End every subscription with [`UnsubscribeReason::Closed`] and wait for their
    /// handlers to observe it.
    pub(crate) async fn close_all(&self) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect();
        self.slots.clear();

        let tasks = slots
            .iter()
            .filter_map(|slot| slot.finish(UnsubscribeReason::Closed))
            .map(await_delivery);
        join_all(tasks).await;
    }

    /// Start the task that follows connection state: subscriptions are paused while the
    /// connection is down, re-sent once a new session is established, and closed when
    /// the connection closes for good.
    pub(crate) fn start_reconnection_handler(
        self: &Arc<Self>,
        connection: ConnectionManager,
    ) -> JoinHandle<()> {
        let this = Arc::clone(self);

        tokio::spawn(async move {
            let mut state_rx = connection.state_receiver();

            loop {
                // Wait for next state change
                if state_rx.changed().await.is_err() {
                    // Channel closed, connection manager is gone
                    break;
                }

                let state = *state_rx.borrow_and_update();

                match state {
                    ConnectionState::Connected { since } => {
                        this.resubscribe_all(&connection, since).await;
                    }
                    ConnectionState::Closed => break,
                    _ => this.pause_all(),
                }
            }

            this.close_all().await;
        })
    }

    fn pause_all(&self) {
        for slot in &self.slots {
            slot.transition(SubscriptionState::Subscribed, SubscriptionState::Subscribing);
        }
    }

    /// Re-send subscriptions that were made before the session that started at `since`.
    async fn resubscribe_all(&self, connection: &ConnectionManager, since: Instant) {
        let slots: Vec<Arc<Slot>> = self
            .slots
            .iter()
            .filter(|slot| slot.state().is_live() && slot.claim_session(Some(since)))
            .map(|slot| Arc::clone(slot.value()))
            .collect();

        if slots.is_empty() {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(count = slots.len(), "Re-subscribing after reconnect");

        let requests = slots.iter().map(|slot| {
            slot.transition(SubscriptionState::Subscribed, SubscriptionState::Subscribing);
            let hook = slot.reply_hook(true);
            async move {
                let result = connection
                    .request(Method::subscribe(&slot.channel), Some(hook))
                    .await;
                (slot, result)
            }
        });

        for (slot, result) in join_all(requests).await {
            match result {
                Ok(Ok(_)) => {}
                // A terminal rejection leaves the slot registered as Failed
                Ok(Err(e)) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = %slot.channel, error = %e, "Re-subscribe rejected");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
                Err(e) => {
                    // Retried on the next session
                    #[cfg(feature = "tracing")]
                    tracing::warn!(channel = %slot.channel, error = %e, "Failed to re-subscribe");
                    #[cfg(not(feature = "tracing"))]
                    let _ = &e;
                }
            }
        }
    }
}

impl PushRouter for SubscriptionRegistry {
    fn route(&self, channel: &str, event: ChannelEvent) {
        let Some(slot) = self.get(channel) else {
            #[cfg(feature = "tracing")]
            tracing::trace!(%channel, "Push for a channel without subscription");
            return;
        };

        let channel = channel.to_owned();
        let delivery = match event {
            ChannelEvent::Unsubscribe => {
                self.remove(&slot);
                drop(slot.finish(UnsubscribeReason::Server));
                return;
            }
            _ if slot.state() != SubscriptionState::Subscribed => return,
            ChannelEvent::Publication(publication) => {
                Delivery::Publish(PublishEvent::new(channel, publication))
            }
            ChannelEvent::Join(info) => Delivery::Join(JoinEvent { channel, info }),
            ChannelEvent::Leave(info) => Delivery::Leave(LeaveEvent { channel, info }),
        };
        slot.enqueue(delivery);
    }
}

async fn await_delivery(task: JoinHandle<()>) {
    if let Err(e) = task.await {
        #[cfg(feature = "tracing")]
        tracing::error!("Subscription handler failed: {e:?}");
        #[cfg(not(feature = "tracing"))]
        let _ = &e;
    }
}

/// Handle to one channel subscription.
///
/// Cheap to clone and safe to share across tasks; publishes need no external locking.
/// Events for the channel are delivered to the [`SubscriptionHandler`] given to
/// [`Client::subscribe`].
#[derive(Clone)]
pub struct Subscription {
    slot: Arc<Slot>,
    client: Client,
}

impl Subscription {
    pub(crate) const fn new(slot: Arc<Slot>, client: Client) -> Self {
        Self { slot, client }
    }

    #[must_use]
    pub fn channel(&self) -> &str {
        &self.slot.channel
    }

    #[must_use]
    pub fn state(&self) -> SubscriptionState {
        self.slot.state()
    }

    /// Publish `payload` into this subscription's channel and wait for the server's
    /// acknowledgement.
    ///
    /// # Errors
    ///
    /// Fails with [`Kind::Publish`] when the subscription is not
    /// [`SubscriptionState::Subscribed`], when the server refuses the publication, or on
    /// timeout, transport failure and cancellation.
    pub async fn publish<T: Serialize + ?Sized>(&self, payload: &T) -> Result<PublishAck> {
        let state = self.state();
        if state != SubscriptionState::Subscribed {
            return Err(Error::validation(format!(
                "cannot publish to {}: subscription is {state}",
                self.slot.channel
            ))
            .into_kind(Kind::Publish));
        }

        publish::send(self.client.connection(), &self.slot.channel, payload).await
    }

    /// Leave the channel.
    ///
    /// The handler receives [`on_unsubscribe`](SubscriptionHandler::on_unsubscribe) before
    /// this returns. Calling it on an ended subscription is a no-op.
    pub async fn unsubscribe(&self) -> Result<()> {
        self.client
            .registry()
            .unsubscribe(self.client.connection(), &self.slot)
            .await
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.slot.channel)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
