#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod auth;
pub mod client;
pub mod error;
pub mod events;
pub mod protocol;
pub mod throughput;
pub mod ws;

use crate::error::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Path of the WebSocket endpoint on a server, appended by [`websocket_endpoint`].
pub const WEBSOCKET_PATH: &str = "/connection/websocket";

/// Build the WebSocket endpoint for a server base URL such as `ws://localhost:8000`.
///
/// Trailing slashes on `base` are ignored and an endpoint that already ends with
/// [`WEBSOCKET_PATH`] is returned unchanged.
#[must_use]
pub fn websocket_endpoint(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.ends_with(WEBSOCKET_PATH) {
        base.to_owned()
    } else {
        format!("{base}{WEBSOCKET_PATH}")
    }
}
