//! JSON wire protocol spoken over the WebSocket connection.
//!
//! Commands are sent as `{"id": <u32>, "<method>": {...}}`. The server answers with a
//! reply echoing the same `id`, or pushes channel events without an `id`. Several JSON
//! objects may be packed into one text frame, separated by newlines.

pub mod request;
pub mod response;

pub use request::{
    Command, ConnectRequest, Method, PublishRequest, SubscribeRequest, UnsubscribeRequest,
};
pub use response::{
    ChannelEvent, ClientInfo, ConnectResult, Disconnect, ProtocolError, Publication, Reply,
    ServerMessage, SubscribeResult, parse_frames,
};

/// Text frame sent by the client to keep the session alive.
pub const PING: &str = "PING";
/// Text frame the server answers a [`PING`] with.
pub const PONG: &str = "PONG";

/// Protocol error codes returned in `error` replies.
pub mod codes {
    pub const INTERNAL: u32 = 100;
    pub const UNAUTHORIZED: u32 = 101;
    pub const UNKNOWN_CHANNEL: u32 = 102;
    pub const PERMISSION_DENIED: u32 = 103;
    pub const METHOD_NOT_FOUND: u32 = 104;
    pub const ALREADY_SUBSCRIBED: u32 = 105;
    pub const LIMIT_EXCEEDED: u32 = 106;
    pub const BAD_REQUEST: u32 = 107;
    pub const NOT_AVAILABLE: u32 = 108;
    pub const TOKEN_EXPIRED: u32 = 109;
    pub const TOO_MANY_REQUESTS: u32 = 111;

    /// Codes that mean the credentials themselves were refused.
    #[must_use]
    pub const fn is_auth(code: u32) -> bool {
        matches!(code, UNAUTHORIZED | TOKEN_EXPIRED)
    }
}
