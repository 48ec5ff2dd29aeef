//! Seams between the connection manager and the layers built on top of it.

use crate::protocol::{ChannelEvent, ProtocolError, Reply};

/// Outcome of a command as reported by the server.
pub type ReplyResult = Result<Reply, ProtocolError>;

/// Callback run on the connection's reader task when the reply for a command arrives,
/// before any later frame is processed.
///
/// This lets callers order their own bookkeeping with channel pushes that follow the
/// reply on the wire. It must not block.
pub type ReplyHook = Box<dyn FnOnce(&ReplyResult) + Send + Sync + 'static>;

/// Receives channel-scoped pushes from the connection's reader task.
///
/// Called synchronously, once per push, in wire order. Implementations must not block;
/// they are expected to hand events off to per-channel queues.
pub trait PushRouter: Send + Sync + 'static {
    fn route(&self, channel: &str, event: ChannelEvent);
}
