use secrecy::{ExposeSecret as _, SecretString};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// A client command, correlated with its reply through `id`.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct Command {
    pub id: u32,
    #[serde(flatten)]
    pub method: Method,
}

impl Command {
    #[must_use]
    pub fn new(id: u32, method: Method) -> Self {
        Self { id, method }
    }
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Connect(ConnectRequest),
    Subscribe(SubscribeRequest),
    Unsubscribe(UnsubscribeRequest),
    Publish(PublishRequest),
}

impl Method {
    #[must_use]
    pub fn subscribe(channel: &str) -> Self {
        Self::Subscribe(SubscribeRequest {
            channel: channel.to_owned(),
        })
    }

    #[must_use]
    pub fn unsubscribe(channel: &str) -> Self {
        Self::Unsubscribe(UnsubscribeRequest {
            channel: channel.to_owned(),
        })
    }

    #[must_use]
    pub fn publish(channel: &str, data: Value) -> Self {
        Self::Publish(PublishRequest {
            channel: channel.to_owned(),
            data,
        })
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::Publish(_) => "publish",
        }
    }

    /// Channel this command targets, if it is a channel command.
    #[must_use]
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Connect(_) => None,
            Self::Subscribe(r) => Some(&r.channel),
            Self::Unsubscribe(r) => Some(&r.channel),
            Self::Publish(r) => Some(&r.channel),
        }
    }
}

/// Handshake sent as the first command on every new socket.
///
/// # Security
///
/// The token is exposed in plaintext when serialized. Prefer `wss://` endpoints.
#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct ConnectRequest {
    #[serde(serialize_with = "expose_secret")]
    pub token: SecretString,
    pub name: String,
    pub version: String,
}

impl ConnectRequest {
    #[must_use]
    pub fn new(token: SecretString, name: String, version: String) -> Self {
        Self {
            token,
            name,
            version,
        }
    }
}

fn expose_secret<S: Serializer>(secret: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct SubscribeRequest {
    pub channel: String,
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct UnsubscribeRequest {
    pub channel: String,
}

#[non_exhaustive]
#[derive(Clone, Debug, Serialize)]
pub struct PublishRequest {
    pub channel: String,
    pub data: Value,
}
