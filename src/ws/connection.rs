#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff as _;
use dashmap::DashMap;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::config::Config;
use super::error::WsError;
use super::traits::{PushRouter, ReplyHook, ReplyResult};
use crate::Result;
use crate::auth::{Token, TokenSource};
use crate::error::{AuthRejected, Error, Kind};
use crate::events::{ConnectEvent, DisconnectEvent, ErrorEvent};
use crate::protocol::{
    Command, ConnectRequest, ConnectResult, Disconnect, Method, PING, PONG, Reply, ServerMessage,
    codes, parse_frames,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the single logical connection a client holds.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ConnectionState {
    /// Between sessions, or before the first one
    Disconnected,
    /// First handshake in flight
    Connecting,
    Connected {
        /// When the current session was established
        since: Instant,
    },
    /// Waiting for, or running, a reconnect attempt
    Reconnecting {
        /// 1-based within the current outage
        attempt: u32,
    },
    /// Closed for good, either explicitly or because reconnecting is not allowed
    Closed,
}

impl ConnectionState {
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }

    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Lifecycle notifications emitted by the connection task, in order.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Connected(ConnectEvent),
    Disconnected(DisconnectEvent),
    Error(ErrorEvent),
}

/// A command awaiting its reply.
struct Pending {
    reply_tx: oneshot::Sender<ReplyResult>,
    on_reply: Option<ReplyHook>,
}

impl Pending {
    fn complete(self, result: ReplyResult) {
        if let Some(hook) = self.on_reply {
            hook(&result);
        }
        _ = self.reply_tx.send(result);
    }
}

/// A serialized command bound to the session it was issued in.
struct Outbound {
    session: Instant,
    id: u32,
    text: String,
}

/// Why a session stopped.
enum SessionEnd {
    Cancelled,
    Closed { code: Option<u32>, reason: String },
    Failed(Error),
    Disconnect(Disconnect),
    HeartbeatTimeout,
}

impl SessionEnd {
    fn allows_reconnect(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::Disconnect(disconnect) => disconnect.reconnect,
            Self::Closed { .. } | Self::Failed(_) | Self::HeartbeatTimeout => true,
        }
    }

    fn error_event(&self, recoverable: bool) -> Option<ErrorEvent> {
        match self {
            Self::Failed(e) => Some(ErrorEvent::new(e.to_string(), recoverable)),
            Self::HeartbeatTimeout => Some(ErrorEvent::new("heartbeat timeout", recoverable)),
            _ => None,
        }
    }

    fn into_event(self, reconnect: bool) -> DisconnectEvent {
        let (code, reason) = match self {
            Self::Cancelled => (None, "client closed".to_owned()),
            Self::Closed { code, reason } if reason.is_empty() => {
                (code, "connection closed".to_owned())
            }
            Self::Closed { code, reason } => (code, reason),
            Self::Failed(e) => (None, e.to_string()),
            Self::Disconnect(disconnect) => (Some(disconnect.code), disconnect.reason),
            Self::HeartbeatTimeout => (None, "heartbeat timeout".to_owned()),
        };

        DisconnectEvent {
            code,
            reason,
            reconnect,
        }
    }
}

/// Manages one logical connection: handshake, reconnection, heartbeat, and request/reply
/// correlation.
///
/// The connection task owns the socket. Commands are handed to it through an unbounded
/// queue, replies are matched back to their caller by `id`, and channel pushes are handed
/// to a [`PushRouter`] on the reader task in wire order. Lifecycle changes are reported
/// as [`ConnectionEvent`]s.
///
/// # Example
///
/// ```ignore
/// let (events_tx, events_rx) = mpsc::unbounded_channel();
/// let connection = ConnectionManager::connect(
///     "ws://localhost:8000/connection/websocket",
///     Config::default(),
///     Arc::new(token),
///     router,
///     events_tx,
/// )
/// .await?;
///
/// let reply = connection.request(Method::subscribe("chat:index"), None).await?;
/// ```
#[derive(Clone)]
pub struct ConnectionManager {
    state_rx: watch::Receiver<ConnectionState>,
    /// Sender channel for outgoing commands
    sender_tx: mpsc::UnboundedSender<Outbound>,
    /// Commands awaiting a reply, keyed by command id
    pending: Arc<DashMap<u32, Pending>>,
    next_id: Arc<AtomicU32>,
    client_id: Arc<RwLock<Option<String>>>,
    request_timeout: Duration,
    /// Cancelled when the connection is closed for good
    cancel: CancellationToken,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl ConnectionManager {
    /// Dial `endpoint`, complete the connect handshake and start the connection task.
    ///
    /// The first connect is awaited so that bad credentials surface here: an expired or
    /// refused token fails with [`Kind::Auth`] and no [`ConnectionEvent::Connected`] is
    /// emitted. Later disconnects are retried in the background according to
    /// [`Config::reconnect`].
    pub async fn connect(
        endpoint: &str,
        config: Config,
        tokens: Arc<dyn TokenSource>,
        router: Arc<dyn PushRouter>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> Result<Self> {
        let endpoint = validate_endpoint(endpoint)?;
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (sender_tx, sender_rx) = mpsc::unbounded_channel();
        let request_timeout = config.request_timeout;

        let task = ConnectionTask {
            endpoint,
            config,
            tokens,
            router,
            events,
            state_tx,
            pending: Arc::new(DashMap::new()),
            next_id: Arc::new(AtomicU32::new(1)),
            client_id: Arc::new(RwLock::new(None)),
            cancel: CancellationToken::new(),
        };

        let (ws_stream, session) = match task.establish().await {
            Ok(established) => established,
            Err(e) => {
                task.state_tx.send_replace(ConnectionState::Closed);
                return Err(e);
            }
        };
        let since = task.begin_session(session);

        let manager = Self {
            state_rx,
            sender_tx,
            pending: Arc::clone(&task.pending),
            next_id: Arc::clone(&task.next_id),
            client_id: Arc::clone(&task.client_id),
            request_timeout,
            cancel: task.cancel.clone(),
            task: Arc::new(Mutex::new(None)),
        };

        let handle = tokio::spawn(task.run(ws_stream, since, sender_rx));
        *manager.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);

        Ok(manager)
    }

    /// Send a command and wait for the server's reply.
    ///
    /// The outer `Result` carries transport failures ([`WsError::NotConnected`],
    /// [`WsError::Timeout`], [`WsError::Cancelled`], ...); the inner one is the server's
    /// answer. `on_reply`, if given, runs on the reader task before any frame that
    /// follows the reply is routed.
    pub async fn request(
        &self,
        method: Method,
        on_reply: Option<ReplyHook>,
    ) -> Result<ReplyResult> {
        if self.cancel.is_cancelled() {
            return Err(WsError::Cancelled.into());
        }
        let ConnectionState::Connected { since: session } = self.state() else {
            return Err(WsError::NotConnected.into());
        };

        let id = next_request_id(&self.next_id);
        #[cfg(feature = "tracing")]
        tracing::trace!(id, method = method.name(), channel = ?method.channel(), "Sending command");
        let text = serde_json::to_string(&Command::new(id, method))?;

        let (reply_tx, mut reply_rx) = oneshot::channel();
        self.pending.insert(id, Pending { reply_tx, on_reply });

        if self.sender_tx.send(Outbound { session, id, text }).is_err() {
            self.pending.remove(&id);
            return Err(WsError::Closed.into());
        }

        tokio::select! {
            biased;

            reply = &mut reply_rx => reply.map_err(|_e| self.closed_error().into()),
            () = self.cancel.cancelled() => {
                self.pending.remove(&id);
                Err(WsError::Cancelled.into())
            }
            () = sleep(self.request_timeout) => {
                if self.pending.remove(&id).is_some() {
                    Err(WsError::Timeout.into())
                } else {
                    // The reply is being delivered right now
                    reply_rx.await.map_err(|_e| self.closed_error().into())
                }
            }
        }
    }

    fn closed_error(&self) -> WsError {
        if self.cancel.is_cancelled() {
            WsError::Cancelled
        } else {
            WsError::Closed
        }
    }

    /// Close the connection, cancelling in-flight commands.
    ///
    /// Waits for the connection task to finish, so the final
    /// [`ConnectionEvent::Disconnected`] has been emitted when this returns. Calling it
    /// again is a no-op.
    pub async fn close(&self) {
        self.cancel.cancel();

        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            #[cfg(feature = "tracing")]
            tracing::error!("Connection task failed: {e:?}");
            #[cfg(not(feature = "tracing"))]
            let _ = &e;
        }
    }

    /// Stop the connection without waiting for the task to finish.
    pub(crate) fn shutdown(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Watch lifecycle transitions. A new `Connected { since }` value marks a new session.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Server-assigned id of the current session, if connected.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.client_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether [`Self::close`] was called or the connection gave up reconnecting.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// State owned by the background connection task.
struct ConnectionTask {
    endpoint: String,
    config: Config,
    tokens: Arc<dyn TokenSource>,
    router: Arc<dyn PushRouter>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    pending: Arc<DashMap<u32, Pending>>,
    next_id: Arc<AtomicU32>,
    client_id: Arc<RwLock<Option<String>>>,
    cancel: CancellationToken,
}

impl ConnectionTask {
    /// Run sessions until the client is closed or reconnecting is no longer allowed.
    async fn run(
        self,
        ws_stream: WsStream,
        since: Instant,
        mut sender_rx: mpsc::UnboundedReceiver<Outbound>,
    ) {
        let mut attempt = 0_u32;
        let mut backoff: ExponentialBackoff = self.config.reconnect.clone().into();
        let mut stream = Some((ws_stream, since));

        loop {
            if let Some((ws_stream, since)) = stream.take() {
                let end = self.handle_connection(ws_stream, since, &mut sender_rx).await;
                self.state_tx.send_replace(ConnectionState::Disconnected);
                self.end_session(&mut sender_rx);

                let reconnect = end.allows_reconnect()
                    && !self.cancel.is_cancelled()
                    && self.config.reconnect.max_attempts != Some(0);

                if let Some(error) = end.error_event(reconnect) {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %error.message, "Connection lost");
                    self.emit(ConnectionEvent::Error(error));
                }

                let event = end.into_event(reconnect);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    code = ?event.code,
                    reason = %event.reason,
                    reconnect,
                    "Disconnected"
                );
                self.emit(ConnectionEvent::Disconnected(event));

                if !reconnect {
                    break;
                }
            }

            if let Some(max) = self.config.reconnect.max_attempts
                && attempt >= max
            {
                self.emit(ConnectionEvent::Error(ErrorEvent::new(
                    format!("giving up after {attempt} reconnection attempts"),
                    false,
                )));
                break;
            }

            attempt = attempt.saturating_add(1);
            self.state_tx
                .send_replace(ConnectionState::Reconnecting { attempt });

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.reconnect.max_backoff);
            tokio::select! {
                () = self.cancel.cancelled() => break,
                () = sleep(delay) => {}
            }

            self.state_tx.send_replace(ConnectionState::Connecting);
            let result = tokio::select! {
                () = self.cancel.cancelled() => break,
                result = self.establish() => result,
            };

            match result {
                Ok((ws_stream, session)) => {
                    attempt = 0;
                    backoff.reset();
                    let since = self.begin_session(session);
                    stream = Some((ws_stream, since));
                }
                Err(e) if e.kind() == Kind::Auth => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %e, "Reconnect refused, giving up");
                    self.emit(ConnectionEvent::Error(ErrorEvent::new(e.to_string(), false)));
                    break;
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(attempt, error = %e, "Unable to reconnect");
                    self.emit(ConnectionEvent::Error(ErrorEvent::new(
                        format!("reconnect attempt {attempt} failed: {e}"),
                        true,
                    )));
                }
            }
        }

        self.end_session(&mut sender_rx);
        self.state_tx.send_replace(ConnectionState::Closed);
        self.cancel.cancel();
    }

    /// Fetch a token, dial the endpoint and complete the connect handshake, all within
    /// one `connect_timeout`.
    async fn establish(&self) -> Result<(WsStream, ConnectResult)> {
        let token = self.tokens.token().await?;
        token.ensure_fresh()?;

        timeout(self.config.connect_timeout, self.handshake(&token))
            .await
            .map_err(|_e| WsError::Timeout)?
    }

    async fn handshake(&self, token: &Token) -> Result<(WsStream, ConnectResult)> {
        let (mut ws_stream, _) = connect_async(self.endpoint.as_str()).await?;

        let id = next_request_id(&self.next_id);
        let command = Command::new(
            id,
            Method::Connect(ConnectRequest::new(
                token.secret().clone(),
                self.config.name.clone(),
                self.config.version.clone(),
            )),
        );
        ws_stream
            .send(Message::Text(serde_json::to_string(&command)?.into()))
            .await?;

        match await_reply(&mut ws_stream, id).await? {
            Ok(Reply::Connect(session)) => Ok((ws_stream, session)),
            Ok(other) => Err(WsError::InvalidMessage(format!(
                "unexpected handshake reply: {other:?}"
            ))
            .into()),
            Err(e) if codes::is_auth(e.code) => Err(AuthRejected {
                code: Some(e.code),
                reason: e.message,
            }
            .into()),
            Err(e) => Err(WsError::Protocol(e).into()),
        }
    }

    /// Publish the new session and return when it started.
    fn begin_session(&self, session: ConnectResult) -> Instant {
        *self
            .client_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(session.client.clone());
        let since = Instant::now();
        self.state_tx
            .send_replace(ConnectionState::Connected { since });

        #[cfg(feature = "tracing")]
        tracing::debug!(client = %session.client, endpoint = %self.endpoint, "Connected");

        self.emit(ConnectionEvent::Connected(ConnectEvent {
            client_id: session.client,
            version: session.version,
        }));
        since
    }

    /// Forget the finished session: in-flight commands observe a closed reply channel and
    /// commands queued for the old socket are discarded.
    fn end_session(&self, sender_rx: &mut mpsc::UnboundedReceiver<Outbound>) {
        *self
            .client_id
            .write()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.pending.clear();
        while sender_rx.try_recv().is_ok() {}
    }

    fn emit(&self, event: ConnectionEvent) {
        _ = self.events.send(event);
    }

    /// Pump the session that started at `since` until it ends, reporting how it ended.
    async fn handle_connection(
        &self,
        ws_stream: WsStream,
        since: Instant,
        sender_rx: &mut mpsc::UnboundedReceiver<Outbound>,
    ) -> SessionEnd {
        let (mut write, mut read) = ws_stream.split();

        let (pong_tx, pong_rx) = watch::channel(Instant::now());
        let (ping_tx, mut ping_rx) = mpsc::unbounded_channel();

        let heartbeat_interval = self.config.heartbeat_interval;
        let heartbeat_timeout = self.config.heartbeat_timeout;
        let mut heartbeat = tokio::spawn(async move {
            heartbeat_loop(ping_tx, heartbeat_interval, heartbeat_timeout, pong_rx).await;
        });

        let end = loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    _ = write.send(Message::Close(None)).await;
                    break SessionEnd::Cancelled;
                }

                // Heartbeat loop only returns once the server stopped answering
                _ = &mut heartbeat => break SessionEnd::HeartbeatTimeout,

                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) if text == PONG => {
                            _ = pong_tx.send(Instant::now());
                        }
                        Some(Ok(Message::Text(text))) => {
                            #[cfg(feature = "tracing")]
                            tracing::trace!(%text, "Frame received");

                            if let Some(end) = self.dispatch(text.as_bytes()) {
                                break end;
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            let code = frame.as_ref().map(|f| u32::from(u16::from(f.code)));
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            break SessionEnd::Closed { code, reason };
                        }
                        Some(Err(e)) => break SessionEnd::Failed(e.into()),
                        None => {
                            break SessionEnd::Closed {
                                code: None,
                                reason: "stream ended".to_owned(),
                            };
                        }
                        Some(Ok(_)) => {
                            // Ignore binary frames and protocol-level PING/PONG.
                        }
                    }
                }

                Some(outbound) = sender_rx.recv() => {
                    if let Some(text) = admit(&self.pending, since, outbound)
                        && let Err(e) = write.send(Message::Text(text.into())).await
                    {
                        break SessionEnd::Failed(e.into());
                    }
                }

                Some(()) = ping_rx.recv() => {
                    if let Err(e) = write.send(Message::Text(PING.into())).await {
                        break SessionEnd::Failed(e.into());
                    }
                }
            }
        };

        heartbeat.abort();
        end
    }

    /// Route every message of one text frame. Returns `Some` when the server ended the
    /// session.
    fn dispatch(&self, bytes: &[u8]) -> Option<SessionEnd> {
        for message in parse_frames(bytes) {
            let message = match message {
                Ok(message) => message,
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(error = %e, "Dropping undecodable message");
                    self.emit(ConnectionEvent::Error(ErrorEvent::new(e.to_string(), true)));
                    continue;
                }
            };

            match message {
                ServerMessage::Reply { id, result } => match self.pending.remove(&id) {
                    Some((_, pending)) => pending.complete(result),
                    None => {
                        #[cfg(feature = "tracing")]
                        tracing::debug!(id, "Reply for unknown or expired command");
                    }
                },
                ServerMessage::Channel { channel, event } => self.router.route(&channel, event),
                ServerMessage::Disconnect(disconnect) => {
                    return Some(SessionEnd::Disconnect(disconnect));
                }
            }
        }

        None
    }
}

/// Ask for a `PING` every `every` and wait up to `within` for the matching `PONG`.
///
/// Resolves only when the server missed a deadline or the session loop went away.
async fn heartbeat_loop(
    ping: mpsc::UnboundedSender<()>,
    every: Duration,
    within: Duration,
    mut pongs: watch::Receiver<Instant>,
) {
    let mut ticks = interval(every);

    loop {
        ticks.tick().await;

        // A PONG that arrived before this PING must not satisfy the wait below
        pongs.mark_unchanged();
        let asked = Instant::now();
        if ping.send(()).is_err() {
            return;
        }

        let answered = match timeout(within, pongs.changed()).await {
            Ok(Ok(())) => *pongs.borrow_and_update() >= asked,
            Ok(Err(_)) => return,
            Err(_) => false,
        };
        if !answered {
            #[cfg(feature = "tracing")]
            tracing::warn!(?within, "Server did not answer PING in time");
            return;
        }
    }
}

/// Read frames until the reply to command `id` arrives. Used during the handshake, before
/// the connection task owns the socket.
async fn await_reply(ws_stream: &mut WsStream, id: u32) -> Result<ReplyResult> {
    while let Some(msg) = ws_stream.next().await {
        match msg? {
            Message::Text(text) if text == PONG => {}
            Message::Text(text) => {
                for message in parse_frames(text.as_bytes()) {
                    match message {
                        Ok(ServerMessage::Reply {
                            id: reply_id,
                            result,
                        }) if reply_id == id => return Ok(result),
                        Ok(ServerMessage::Disconnect(disconnect)) => {
                            return Err(WsError::Disconnected {
                                code: disconnect.code,
                                reason: disconnect.reason,
                            }
                            .into());
                        }
                        Ok(_) => {}
                        Err(e) => {
                            #[cfg(feature = "tracing")]
                            tracing::debug!(error = %e, "Skipping undecodable handshake message");
                            #[cfg(not(feature = "tracing"))]
                            let _ = &e;
                        }
                    }
                }
            }
            Message::Close(_) => return Err(WsError::Closed.into()),
            _ => {}
        }
    }

    Err(WsError::Closed.into())
}

/// Pass through a command issued in the session that started at `session`. Commands left
/// over from an earlier session are dropped with their pending entry, so their caller
/// sees the connection as closed.
fn admit(pending: &DashMap<u32, Pending>, session: Instant, outbound: Outbound) -> Option<String> {
    if outbound.session == session {
        return Some(outbound.text);
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(id = outbound.id, "Dropping command issued in an earlier session");
    pending.remove(&outbound.id);
    None
}

/// Command ids are never `0`, which marks pushes on the wire.
fn next_request_id(counter: &AtomicU32) -> u32 {
    loop {
        let id = counter.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

fn validate_endpoint(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)?;
    match url.scheme() {
        "ws" | "wss" => Ok(endpoint.to_owned()),
        scheme => Err(Error::validation(format!(
            "unsupported endpoint scheme {scheme:?}, expected ws or wss"
        ))),
    }
}
