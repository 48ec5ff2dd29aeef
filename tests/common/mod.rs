#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    dead_code,
    reason = "Shared helpers; not every test binary uses every helper"
)]

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chanpub_client_sdk::auth::{ExposeSecret as _, Hs256Issuer, Token};
use chanpub_client_sdk::client::{ConnectionHandler, SubscriptionHandler};
use chanpub_client_sdk::events::{
    ConnectEvent, DisconnectEvent, ErrorEvent, JoinEvent, LeaveEvent, PublishEvent,
    SubscribeErrorEvent, SubscribeSuccessEvent, UnsubscribeEvent,
};
use chanpub_client_sdk::ws::{Config, ReconnectConfig};
use chrono::{TimeDelta, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt as _, StreamExt as _};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

pub const SECRET: &str = "mock-server-secret";

/// Channels with this prefix refuse subscriptions with `103 permission denied`.
pub const DENIED_PREFIX: &str = "secret:";
/// Channels with this prefix refuse publications with `103 permission denied`.
pub const READ_ONLY_PREFIX: &str = "readonly:";
/// Publications into channels with this prefix are never acknowledged.
pub const SILENT_PREFIX: &str = "blackhole:";

/// A connected, authenticated peer.
struct Peer {
    user: String,
    tx: mpsc::UnboundedSender<Message>,
    kill: CancellationToken,
}

struct Shared {
    issuer: Hs256Issuer,
    /// Deliver publications back to the publishing connection too
    echo: bool,
    /// Answer `PING` frames
    pong: AtomicBool,
    next_client: AtomicU32,
    peers: DashMap<String, Peer>,
    /// Channel name to subscribed client ids, in subscription order
    channels: DashMap<String, Vec<String>>,
    /// Channels refusing subscriptions from now on, on top of `DENIED_PREFIX`
    denied: Mutex<HashSet<String>>,
    /// Every command received, in order
    commands: Mutex<Vec<Value>>,
}

/// In-process pub/sub server speaking the client's JSON protocol.
pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    /// Start a server that does not echo publications to their publisher.
    pub async fn start() -> Self {
        Self::start_with(false).await
    }

    /// Start a server that delivers publications to their publisher as well.
    pub async fn start_echo() -> Self {
        Self::start_with(true).await
    }

    async fn start_with(echo: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let shared = Arc::new(Shared {
            issuer: Hs256Issuer::new(SECRET.to_owned()),
            echo,
            pong: AtomicBool::new(true),
            next_client: AtomicU32::new(1),
            peers: DashMap::new(),
            channels: DashMap::new(),
            denied: Mutex::new(HashSet::new()),
            commands: Mutex::new(Vec::new()),
        });

        let accept_shared = Arc::clone(&shared);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(serve(Arc::clone(&accept_shared), stream));
            }
        });

        Self { addr, shared }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/connection/websocket", self.addr)
    }

    /// A token the server accepts for `user`.
    pub fn token(&self, user: &str) -> Token {
        self.shared
            .issuer
            .issue(user, Some(Utc::now() + TimeDelta::hours(1)))
            .unwrap()
    }

    /// A correctly signed token that expired a minute ago.
    pub fn expired_token(&self, user: &str) -> Token {
        self.shared
            .issuer
            .issue(user, Some(Utc::now() - TimeDelta::minutes(1)))
            .unwrap()
    }

    pub fn issuer(&self) -> Hs256Issuer {
        self.shared.issuer.clone()
    }

    /// Number of authenticated connections.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    /// Number of connections subscribed to `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.shared.channels.get(channel).map_or(0, |ids| ids.len())
    }

    /// Commands received so far for `method` (`connect`, `subscribe`, ...).
    pub fn commands(&self, method: &str) -> Vec<Value> {
        self.shared
            .commands
            .lock()
            .unwrap()
            .iter()
            .filter(|command| command.get(method).is_some())
            .cloned()
            .collect()
    }

    /// Stop answering heartbeats.
    pub fn stop_pong(&self) {
        self.shared.pong.store(false, Ordering::SeqCst);
    }

    /// Refuse later subscriptions to `channel` with `103 permission denied`.
    pub fn deny(&self, channel: &str) {
        self.shared.denied.lock().unwrap().insert(channel.to_owned());
    }

    /// Send `frame` verbatim as one text frame to every connection.
    pub fn send_raw(&self, frame: &str) {
        for peer in &self.shared.peers {
            drop(peer.tx.send(Message::Text(frame.into())));
        }
    }

    /// Drop every connection without a close handshake.
    pub fn drop_connections(&self) {
        for peer in &self.shared.peers {
            peer.kill.cancel();
        }
    }

    /// Send a `disconnect` push to every connection.
    pub fn disconnect_all(&self, code: u32, reason: &str, reconnect: bool) {
        let push = json!({
            "push": { "disconnect": { "code": code, "reason": reason, "reconnect": reconnect } }
        });
        for peer in &self.shared.peers {
            send(&peer.tx, &push);
        }
    }

    /// Remove every subscriber from `channel` with an `unsubscribe` push.
    pub fn unsubscribe_all(&self, channel: &str) {
        let Some((_, ids)) = self.shared.channels.remove(channel) else {
            return;
        };
        let push = json!({ "push": { "channel": channel, "unsubscribe": {} } });
        for id in ids {
            if let Some(peer) = self.shared.peers.get(&id) {
                send(&peer.tx, &push);
            }
        }
    }

    /// Wait until `condition` holds, polling the server state.
    pub async fn wait_until<F: Fn(&Self) -> bool>(&self, condition: F) {
        timeout(Duration::from_secs(5), async {
            while !condition(self) {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }
}

fn send(tx: &mpsc::UnboundedSender<Message>, value: &Value) {
    drop(tx.send(Message::Text(value.to_string().into())));
}

fn reply(tx: &mpsc::UnboundedSender<Message>, id: &Value, method: &str, result: Value) {
    send(tx, &json!({ "id": id, (method): result }));
}

fn error(tx: &mpsc::UnboundedSender<Message>, id: &Value, code: u32, message: &str) {
    send(
        tx,
        &json!({ "id": id, "error": { "code": code, "message": message } }),
    );
}

/// Serve one connection until either side drops it.
async fn serve(shared: Arc<Shared>, stream: TcpStream) {
    let Ok(ws_stream) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let kill = CancellationToken::new();
    let client_id = format!(
        "client-{}",
        shared.next_client.fetch_add(1, Ordering::SeqCst)
    );

    loop {
        tokio::select! {
            () = kill.cancelled() => break,
            Some(msg) = rx.recv() => {
                if write.send(msg).await.is_err() {
                    break;
                }
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) if text == "PING" => {
                        if shared.pong.load(Ordering::SeqCst) {
                            drop(tx.send(Message::Text("PONG".into())));
                        }
                    }
                    Some(Ok(Message::Text(text))) => {
                        for line in text.lines().filter(|line| !line.trim().is_empty()) {
                            let command: Value = serde_json::from_str(line).unwrap();
                            shared.handle(&client_id, &tx, &kill, command);
                        }
                    }
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    shared.forget(&client_id);
}

impl Shared {
    fn handle(
        &self,
        client_id: &str,
        tx: &mpsc::UnboundedSender<Message>,
        kill: &CancellationToken,
        command: Value,
    ) {
        self.commands.lock().unwrap().push(command.clone());
        let id = &command["id"];

        if let Some(connect) = command.get("connect") {
            let token = connect["token"].as_str().unwrap_or_default();
            if Token::from(token).is_expired_at(Utc::now()) {
                error(tx, id, 109, "token expired");
                return;
            }
            let Ok(claims) = self.issuer.verify(token) else {
                error(tx, id, 101, "unauthorized");
                return;
            };
            self.peers.insert(
                client_id.to_owned(),
                Peer {
                    user: claims.sub,
                    tx: tx.clone(),
                    kill: kill.clone(),
                },
            );
            reply(
                tx,
                id,
                "connect",
                json!({ "client": client_id, "version": "0.0.1-mock" }),
            );
            return;
        }

        let Some(user) = self.peers.get(client_id).map(|peer| peer.user.clone()) else {
            error(tx, id, 101, "unauthorized");
            return;
        };
        let info = json!({ "user": user, "client": client_id });

        if let Some(subscribe) = command.get("subscribe") {
            let channel = subscribe["channel"].as_str().unwrap_or_default().to_owned();
            let denied = channel.starts_with(DENIED_PREFIX)
                || self.denied.lock().unwrap().contains(&channel);
            if denied {
                error(tx, id, 103, "permission denied");
                return;
            }
            {
                let mut ids = self.channels.entry(channel.clone()).or_default();
                if ids.iter().any(|existing| existing == client_id) {
                    drop(ids);
                    error(tx, id, 105, "already subscribed");
                    return;
                }
                ids.push(client_id.to_owned());
            }
            reply(tx, id, "subscribe", json!({}));
            self.fan_out(
                &channel,
                client_id,
                &json!({ "push": { "channel": channel, "join": { "info": info } } }),
            );
        } else if let Some(unsubscribe) = command.get("unsubscribe") {
            let channel = unsubscribe["channel"].as_str().unwrap_or_default().to_owned();
            if let Some(mut ids) = self.channels.get_mut(&channel) {
                ids.retain(|existing| existing != client_id);
            }
            reply(tx, id, "unsubscribe", json!({}));
            self.fan_out(
                &channel,
                client_id,
                &json!({ "push": { "channel": channel, "leave": { "info": info } } }),
            );
        } else if let Some(publish) = command.get("publish") {
            let channel = publish["channel"].as_str().unwrap_or_default().to_owned();
            if channel.starts_with(READ_ONLY_PREFIX) {
                error(tx, id, 103, "permission denied");
                return;
            }
            if channel.starts_with(SILENT_PREFIX) {
                return;
            }
            reply(tx, id, "publish", json!({}));
            let data = publish["data"].clone();
            let push = json!({
                "push": { "channel": channel, "pub": { "data": data, "info": info } }
            });
            if self.echo {
                self.fan_out(&channel, "", &push);
            } else {
                self.fan_out(&channel, client_id, &push);
            }
        } else {
            error(tx, id, 104, "method not found");
        }
    }

    /// Send `push` to every subscriber of `channel` except `skip`.
    fn fan_out(&self, channel: &str, skip: &str, push: &Value) {
        let ids = self
            .channels
            .get(channel)
            .map(|ids| ids.clone())
            .unwrap_or_default();
        for id in ids.iter().filter(|id| *id != skip) {
            if let Some(peer) = self.peers.get(id) {
                send(&peer.tx, push);
            }
        }
    }

    fn forget(&self, client_id: &str) {
        self.peers.remove(client_id);
        for mut ids in self.channels.iter_mut() {
            ids.retain(|existing| existing != client_id);
        }
    }
}

/// Connection config with fast reconnects for tests.
pub fn test_config() -> Config {
    Config::builder()
        .request_timeout(Duration::from_secs(2))
        .connect_timeout(Duration::from_secs(2))
        .reconnect(
            ReconnectConfig::builder()
                .initial_backoff(Duration::from_millis(20))
                .max_backoff(Duration::from_millis(100))
                .build(),
        )
        .build()
}

/// Records every handler callback as a line of text.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<String>>,
    publications: Mutex<Vec<Value>>,
    /// Messages of errors reported as not recoverable
    fatal: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// This recorder as the handler given to `Client::connect`.
    pub fn connection_handler(self: &Arc<Self>) -> Arc<dyn ConnectionHandler> {
        let handler: Arc<Self> = Arc::clone(self);
        handler
    }

    /// This recorder as the handler given to `Client::subscribe`.
    pub fn channel_handler(self: &Arc<Self>) -> Arc<dyn SubscriptionHandler> {
        let handler: Arc<Self> = Arc::clone(self);
        handler
    }

    pub fn fatal_errors(&self) -> Vec<String> {
        self.fatal.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events()
            .iter()
            .filter(|event| event.starts_with(prefix))
            .count()
    }

    pub fn publications(&self) -> Vec<Value> {
        self.publications.lock().unwrap().clone()
    }

    /// Wait until at least `count` events starting with `prefix` were recorded.
    pub async fn wait_for(&self, prefix: &str, count: usize) {
        let waited = timeout(Duration::from_secs(5), async {
            while self.count(prefix) < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "timed out waiting for {count} x {prefix:?}, got {:?}",
            self.events()
        );
    }

    /// Wait until at least `count` non-recoverable errors were reported.
    pub async fn wait_for_fatal(&self, count: usize) {
        let waited = timeout(Duration::from_secs(5), async {
            while self.fatal_errors().len() < count {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(
            waited.is_ok(),
            "timed out waiting for {count} fatal errors, got {:?}",
            self.events()
        );
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ConnectionHandler for Recorder {
    fn on_connect(&self, event: &ConnectEvent) {
        self.push(format!("connect {}", event.client_id));
    }

    fn on_disconnect(&self, event: &DisconnectEvent) {
        self.push(format!("disconnect reconnect={}", event.reconnect));
    }

    fn on_error(&self, event: &ErrorEvent) {
        if !event.recoverable {
            self.fatal.lock().unwrap().push(event.message.clone());
        }
        self.push(format!("error {}", event.message));
    }
}

impl SubscriptionHandler for Recorder {
    fn on_publish(&self, event: &PublishEvent) {
        self.publications.lock().unwrap().push(event.data.clone());
        self.push(format!("publish {}", event.data));
    }

    fn on_join(&self, event: &JoinEvent) {
        self.push(format!("join {}", event.info.user));
    }

    fn on_leave(&self, event: &LeaveEvent) {
        self.push(format!("leave {}", event.info.user));
    }

    fn on_subscribe_success(&self, event: &SubscribeSuccessEvent) {
        self.push(format!("subscribed resubscribed={}", event.resubscribed));
    }

    fn on_subscribe_error(&self, event: &SubscribeErrorEvent) {
        self.push(format!("subscribe error {}", event.code));
    }

    fn on_unsubscribe(&self, event: &UnsubscribeEvent) {
        self.push(format!("unsubscribe {}", event.reason));
    }
}

/// Expose a token's raw string, e.g. to tamper with it.
pub fn raw(token: &Token) -> String {
    token.secret().expose_secret().to_owned()
}
