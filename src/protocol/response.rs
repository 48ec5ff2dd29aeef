use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::Result;
use crate::ws::WsError;

/// Raw inbound object before classification.
///
/// Exactly one of the optional fields is expected to be set; the reply `id` is `0`
/// for pushes.
#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(default)]
    id: u32,
    error: Option<ProtocolError>,
    connect: Option<ConnectResult>,
    subscribe: Option<SubscribeResult>,
    unsubscribe: Option<Value>,
    publish: Option<Value>,
    push: Option<Push>,
}

#[derive(Debug, Deserialize)]
struct Push {
    #[serde(default)]
    channel: String,
    #[serde(rename = "pub")]
    publication: Option<Publication>,
    join: Option<PresenceChange>,
    leave: Option<PresenceChange>,
    unsubscribe: Option<Value>,
    disconnect: Option<Disconnect>,
}

#[derive(Debug, Deserialize)]
struct PresenceChange {
    info: ClientInfo,
}

/// A classified message from the server.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum ServerMessage {
    /// Answer to a command previously sent with the same `id`.
    Reply {
        id: u32,
        result: std::result::Result<Reply, ProtocolError>,
    },
    /// Event scoped to one channel.
    Channel { channel: String, event: ChannelEvent },
    /// Server is terminating the session.
    Disconnect(Disconnect),
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum Reply {
    Connect(ConnectResult),
    Subscribe(SubscribeResult),
    Unsubscribe,
    Publish,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    Publication(Publication),
    Join(ClientInfo),
    Leave(ClientInfo),
    /// Server removed the client from the channel.
    Unsubscribe,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct ConnectResult {
    /// Server-assigned id of this session
    pub client: String,
    #[serde(default)]
    pub version: String,
    /// Whether the session expires and needs a fresh token
    #[serde(default)]
    pub expires: bool,
    /// Seconds until expiry when `expires` is set
    #[serde(default)]
    pub ttl: u32,
}

#[non_exhaustive]
#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubscribeResult {
    #[serde(default)]
    pub recoverable: bool,
    #[serde(default)]
    pub recovered: bool,
}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ProtocolError {
    pub code: u32,
    #[serde(default)]
    pub message: String,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for ProtocolError {}

#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct Disconnect {
    pub code: u32,
    #[serde(default)]
    pub reason: String,
    /// Whether the client is allowed to reconnect
    #[serde(default)]
    pub reconnect: bool,
}

/// Identity of the connection that caused an event.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ClientInfo {
    pub user: String,
    pub client: String,
}

/// A message published into a channel.
#[non_exhaustive]
#[derive(Clone, Debug, Deserialize)]
pub struct Publication {
    pub data: Value,
    /// Publisher identity when the server attaches it
    #[serde(default)]
    pub info: Option<ClientInfo>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl Publication {
    /// Deserialize the payload into an application type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(T::deserialize(&self.data)?)
    }
}

impl TryFrom<Frame> for ServerMessage {
    type Error = WsError;

    fn try_from(frame: Frame) -> std::result::Result<Self, Self::Error> {
        if let Some(push) = frame.push {
            return push.try_into();
        }

        if frame.id == 0 {
            return Err(WsError::InvalidMessage(
                "reply without id and without push".to_owned(),
            ));
        }

        let result = if let Some(error) = frame.error {
            Err(error)
        } else if let Some(connect) = frame.connect {
            Ok(Reply::Connect(connect))
        } else if let Some(subscribe) = frame.subscribe {
            Ok(Reply::Subscribe(subscribe))
        } else if frame.unsubscribe.is_some() {
            Ok(Reply::Unsubscribe)
        } else if frame.publish.is_some() {
            Ok(Reply::Publish)
        } else {
            return Err(WsError::InvalidMessage(format!(
                "reply {} carries no result",
                frame.id
            )));
        };

        Ok(Self::Reply {
            id: frame.id,
            result,
        })
    }
}

impl TryFrom<Push> for ServerMessage {
    type Error = WsError;

    fn try_from(push: Push) -> std::result::Result<Self, Self::Error> {
        if let Some(disconnect) = push.disconnect {
            return Ok(Self::Disconnect(disconnect));
        }

        let event = if let Some(publication) = push.publication {
            ChannelEvent::Publication(publication)
        } else if let Some(join) = push.join {
            ChannelEvent::Join(join.info)
        } else if let Some(leave) = push.leave {
            ChannelEvent::Leave(leave.info)
        } else if push.unsubscribe.is_some() {
            ChannelEvent::Unsubscribe
        } else {
            return Err(WsError::InvalidMessage(format!(
                "push for channel {:?} carries no event",
                push.channel
            )));
        };

        if push.channel.is_empty() {
            return Err(WsError::InvalidMessage(
                "channel push without channel".to_owned(),
            ));
        }

        Ok(Self::Channel {
            channel: push.channel,
            event,
        })
    }
}

/// Parse one WebSocket text frame into server messages.
///
/// A frame may contain several newline-delimited JSON objects; blank lines are skipped.
/// Each line is decoded on its own, so one bad line does not hide the others.
pub fn parse_frames(bytes: &[u8]) -> impl Iterator<Item = Result<ServerMessage>> + '_ {
    bytes
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| -> Result<ServerMessage> {
            let frame: Frame = serde_json::from_slice(line).map_err(WsError::Decode)?;
            Ok(ServerMessage::try_from(frame)?)
        })
}
