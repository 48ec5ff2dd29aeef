#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

use tokio_tungstenite::tungstenite;

use crate::error::{Error, Kind};
use crate::protocol::ProtocolError;

/// Failures of the socket or of the session running on it.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Dialing, reading or writing the socket failed
    Socket(tungstenite::Error),
    /// A frame was not valid protocol JSON
    Decode(serde_json::Error),
    /// Command reply carried an error that no caller translated
    Protocol(ProtocolError),
    /// The socket closed underneath the session
    Closed,
    /// No session is established right now
    NotConnected,
    /// Session ended by a server `disconnect` push
    Disconnected {
        code: u32,
        reason: String,
    },
    Timeout,
    /// The client was closed while the operation was in flight
    Cancelled,
    /// Frame or reply did not have the expected shape
    InvalidMessage(String),
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socket(e) => write!(f, "socket error: {e}"),
            Self::Decode(e) => write!(f, "undecodable frame: {e}"),
            Self::Protocol(e) => write!(f, "server replied with error: {e}"),
            Self::Closed => f.write_str("socket closed"),
            Self::NotConnected => f.write_str("no session established"),
            Self::Disconnected { code, reason } => {
                write!(f, "server ended the session ({code}): {reason}")
            }
            Self::Timeout => f.write_str("no reply in time"),
            Self::Cancelled => f.write_str("client closed"),
            Self::InvalidMessage(msg) => write!(f, "unexpected message: {msg}"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Socket(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::Protocol(e) => Some(e),
            _ => None,
        }
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Self {
        Error::with_source(Kind::Transport, e)
    }
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        WsError::Socket(e).into()
    }
}
