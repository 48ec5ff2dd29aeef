//! Event contexts passed to [`crate::client::ConnectionHandler`] and
//! [`crate::client::SubscriptionHandler`] callbacks.

use serde_json::Value;

use crate::protocol::{ClientInfo, Publication};

/// A connect handshake completed; fired once per session.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ConnectEvent {
    /// Server-assigned id of the new session
    pub client_id: String,
    /// Server version reported in the handshake
    pub version: String,
}

/// The connection left the connected state.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct DisconnectEvent {
    /// Protocol disconnect code or WebSocket close code, when one was received
    pub code: Option<u32>,
    pub reason: String,
    /// Whether the client will try to reconnect
    pub reconnect: bool,
}

/// A steady-state error that did not surface as a returned `Err`.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct ErrorEvent {
    pub message: String,
    /// Whether the client keeps running (e.g. will retry) after this error
    pub recoverable: bool,
}

impl ErrorEvent {
    pub(crate) fn new<S: Into<String>>(message: S, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct PublishEvent {
    pub channel: String,
    pub data: Value,
    /// Publisher identity when the server attaches it
    pub info: Option<ClientInfo>,
    pub offset: Option<u64>,
}

impl PublishEvent {
    pub(crate) fn new(channel: String, publication: Publication) -> Self {
        Self {
            channel,
            data: publication.data,
            info: publication.info,
            offset: publication.offset,
        }
    }

    /// Deserialize the payload into an application type.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

/// Another client joined the channel.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct JoinEvent {
    pub channel: String,
    pub info: ClientInfo,
}

/// Another client left the channel.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct LeaveEvent {
    pub channel: String,
    pub info: ClientInfo,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct SubscribeSuccessEvent {
    pub channel: String,
    /// Set when the subscription was re-established after a reconnect
    pub resubscribed: bool,
    pub recovered: bool,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct SubscribeErrorEvent {
    pub channel: String,
    pub code: u32,
    pub message: String,
}

/// Why a subscription ended.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum UnsubscribeReason {
    /// [`crate::client::Subscription::unsubscribe`] was called
    Client,
    /// The server removed the subscription
    Server,
    /// The owning client was closed
    Closed,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub struct UnsubscribeEvent {
    pub channel: String,
    pub reason: UnsubscribeReason,
}
