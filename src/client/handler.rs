//! Callback traits for connection and subscription events.
//!
//! Handlers are passed in when a client or subscription is created and kept behind an
//! [`Arc`](std::sync::Arc). Every method has a no-op default, so implementors only
//! override the events they care about. Callbacks run on background tasks owned by the
//! client and must not block.

use crate::events::{
    ConnectEvent, DisconnectEvent, ErrorEvent, JoinEvent, LeaveEvent, PublishEvent,
    SubscribeErrorEvent, SubscribeSuccessEvent, UnsubscribeEvent,
};

/// Receives lifecycle events of a [`Client`](super::Client) connection.
///
/// Events are delivered one at a time, in the order they happened.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// A connect handshake completed. Fired once per session, including sessions
    /// established by a reconnect.
    fn on_connect(&self, event: &ConnectEvent) {
        let _ = event;
    }

    /// The connection left the connected state.
    fn on_disconnect(&self, event: &DisconnectEvent) {
        let _ = event;
    }

    fn on_error(&self, event: &ErrorEvent) {
        let _ = event;
    }
}

/// Receives events of one [`Subscription`](super::Subscription), serialized in arrival
/// order.
pub trait SubscriptionHandler: Send + Sync + 'static {
    fn on_publish(&self, event: &PublishEvent) {
        let _ = event;
    }

    fn on_join(&self, event: &JoinEvent) {
        let _ = event;
    }

    fn on_leave(&self, event: &LeaveEvent) {
        let _ = event;
    }

    fn on_subscribe_success(&self, event: &SubscribeSuccessEvent) {
        let _ = event;
    }

    fn on_subscribe_error(&self, event: &SubscribeErrorEvent) {
        let _ = event;
    }

    /// The subscription ended. Nothing is delivered after this; a terminal
    /// `on_subscribe_error` ends a subscription without it.
    fn on_unsubscribe(&self, event: &UnsubscribeEvent) {
        let _ = event;
    }
}

/// Ignores every event.
impl ConnectionHandler for () {}

/// Ignores every event.
impl SubscriptionHandler for () {}
