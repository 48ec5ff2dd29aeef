#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chanpub_client_sdk::auth::{Token, TokenSource};
use chanpub_client_sdk::client::{Client, Subscription, SubscriptionState};
use chanpub_client_sdk::error::{AuthRejected, Kind};
use chanpub_client_sdk::ws::{Config, ConnectionManager, ConnectionState, ReconnectConfig, WsError};
use common::{MockServer, Recorder, raw, test_config};
use futures_util::StreamExt as _;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

/// Hands out a working token on the first call and an expired one afterwards.
struct RotatingTokens {
    fresh: Token,
    expired: Token,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl TokenSource for RotatingTokens {
    async fn token(&self) -> chanpub_client_sdk::Result<Token> {
        let token = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            &self.fresh
        } else {
            &self.expired
        };
        Ok(token.clone())
    }
}

#[test]
fn handles_are_send_and_sync() {
    fn assert_send_sync<T: Send + Sync + 'static>() {}

    assert_send_sync::<Client>();
    assert_send_sync::<Subscription>();
    assert_send_sync::<ConnectionManager>();
}

#[tokio::test]
async fn valid_token_connects_once() {
    let server = MockServer::start().await;
    let handler = Recorder::new();

    let client = Client::connect(
        &server.url(),
        server.token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap();

    handler.wait_for("connect", 1).await;
    assert!(client.connection_state().is_connected(), "client should be connected");
    let client_id = client.client_id().unwrap();
    assert_eq!(handler.events(), vec![format!("connect {client_id}")]);

    // No second on_connect for the same session
    sleep(Duration::from_millis(100)).await;
    assert_eq!(handler.count("connect"), 1);

    client.close().await;
    assert_eq!(
        handler.events(),
        vec![
            format!("connect {client_id}"),
            "disconnect reconnect=false".to_owned()
        ]
    );
    assert_eq!(client.connection_state(), ConnectionState::Closed);
    assert!(client.client_id().is_none(), "closed client has no session");
}

#[tokio::test]
async fn handshake_reports_client_name_and_version() {
    let server = MockServer::start().await;
    let config = Config::builder()
        .name("chat-demo")
        .version("1.2.3")
        .build();

    let client = Client::connect(&server.url(), server.token("42"), config, Recorder::new())
        .await
        .unwrap();

    let connects = server.commands("connect");
    assert_eq!(connects.len(), 1);
    assert_eq!(connects[0]["connect"]["name"], "chat-demo");
    assert_eq!(connects[0]["connect"]["version"], "1.2.3");
    let token = connects[0]["connect"]["token"].as_str().unwrap();
    assert_eq!(token.split('.').count(), 3, "token should be a JWT");

    client.close().await;
}

#[tokio::test]
async fn expired_token_is_refused_before_dialing() {
    let server = MockServer::start().await;
    let handler = Recorder::new();

    let err = Client::connect(
        &server.url(),
        server.expired_token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), Kind::Auth);
    assert!(err.to_string().contains("expired"), "{err}");

    sleep(Duration::from_millis(50)).await;
    assert!(server.commands("connect").is_empty(), "token must not be sent");
    assert!(handler.events().is_empty(), "no events: {:?}", handler.events());
}

#[tokio::test]
async fn server_refused_token_is_auth_error() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let forged = Token::from(format!("{}x", raw(&server.token("42"))));

    let err = Client::connect(&server.url(), forged, test_config(), handler.connection_handler())
        .await
        .unwrap_err();

    assert_eq!(err.kind(), Kind::Auth);
    assert_eq!(err.code(), Some(101));
    let rejected = err.downcast_ref::<AuthRejected>().unwrap();
    assert_eq!(rejected.reason, "unauthorized");

    sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.count("connect"), 0);
    assert_eq!(server.peer_count(), 0);
}

#[tokio::test]
async fn non_websocket_endpoint_is_rejected() {
    let err = Client::connect(
        "http://localhost:8000/connection/websocket",
        Token::from("token"),
        test_config(),
        Recorder::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), Kind::Validation);
}

#[tokio::test]
async fn unreachable_server_is_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let err = Client::connect(
        &format!("ws://{addr}/connection/websocket"),
        Token::from("token"),
        test_config(),
        Recorder::new(),
    )
    .await
    .unwrap_err();

    assert_eq!(err.kind(), Kind::Transport);
}

#[tokio::test]
async fn reconnects_and_resubscribes_after_drop() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let channel_handler = Recorder::new();

    let client = Client::connect(
        &server.url(),
        server.token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap();
    let subscription = client
        .subscribe("chat:index", channel_handler.channel_handler())
        .await
        .unwrap();
    let first_session = client.client_id().unwrap();

    server.drop_connections();

    handler.wait_for("connect", 2).await;
    channel_handler
        .wait_for("subscribed resubscribed=true", 1)
        .await;
    assert_eq!(handler.count("disconnect reconnect=true"), 1);
    assert_ne!(client.client_id().unwrap(), first_session, "new session");
    assert_eq!(subscription.state(), SubscriptionState::Subscribed);
    server.wait_until(|s| s.subscriber_count("chat:index") == 1).await;

    // Publications reach the re-established subscription
    let publisher =
        Client::connect(&server.url(), server.token("7"), test_config(), Recorder::new())
            .await
            .unwrap();
    publisher
        .publish("chat:index", &serde_json::json!({ "input": "again" }))
        .await
        .unwrap();
    channel_handler.wait_for("publish", 1).await;
    assert_eq!(
        channel_handler.publications(),
        vec![serde_json::json!({ "input": "again" })]
    );

    publisher.close().await;
    client.close().await;
    assert_eq!(handler.count("disconnect"), 2);
}

#[tokio::test]
async fn server_disconnect_without_reconnect_closes_client() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let channel_handler = Recorder::new();

    let client = Client::connect(
        &server.url(),
        server.token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap();
    client
        .subscribe("news", channel_handler.channel_handler())
        .await
        .unwrap();

    server.disconnect_all(3501, "shutdown", false);

    handler.wait_for("disconnect", 1).await;
    channel_handler.wait_for("unsubscribe closed", 1).await;
    assert_eq!(handler.events()[1], "disconnect reconnect=false");

    let mut state = client.state_receiver();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|state| state.is_closed()),
    )
    .await
    .unwrap()
    .unwrap();

    let err = client.publish("news", "late").await.unwrap_err();
    assert_eq!(err.kind(), Kind::Publish);

    client.close().await;
    assert_eq!(handler.count("disconnect"), 1);
    assert_eq!(handler.count("connect"), 1);
}

#[tokio::test]
async fn refused_token_on_reconnect_closes_client() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let channel_handler = Recorder::new();
    let calls = Arc::new(AtomicU32::new(0));
    let tokens = RotatingTokens {
        fresh: server.token("42"),
        expired: server.expired_token("42"),
        calls: Arc::clone(&calls),
    };

    let client = Client::connect(&server.url(), tokens, test_config(), handler.connection_handler())
        .await
        .unwrap();
    let subscription = client
        .subscribe("news", channel_handler.channel_handler())
        .await
        .unwrap();

    server.drop_connections();

    let mut state = client.state_receiver();
    timeout(
        Duration::from_secs(5),
        state.wait_for(|state| state.is_closed()),
    )
    .await
    .unwrap()
    .unwrap();
    handler.wait_for_fatal(1).await;
    channel_handler.wait_for("unsubscribe closed", 1).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2, "token source is asked again on reconnect");
    let fatal = handler.fatal_errors();
    assert_eq!(fatal.len(), 1, "{fatal:?}");
    assert!(fatal[0].contains("expired"), "{fatal:?}");
    assert_eq!(handler.count("connect"), 1);
    assert_eq!(server.commands("connect").len(), 1, "expired token must not be sent");
    assert_eq!(subscription.state(), SubscriptionState::Unsubscribed);
    assert_eq!(client.connection_state(), ConnectionState::Closed);

    client.close().await;
}

#[tokio::test]
async fn undecodable_push_does_not_drop_its_frame() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let channel_handler = Recorder::new();

    let client = Client::connect(
        &server.url(),
        server.token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap();
    client
        .subscribe("chat:index", channel_handler.channel_handler())
        .await
        .unwrap();

    server.send_raw(concat!(
        r#"{"push":{"channel":"chat:index","message":{"data":"unknown kind"}}}"#,
        "\n",
        r#"{"push":{"channel":"chat:index","pub":{"data":{"input":"kept"}}}}"#,
    ));

    channel_handler.wait_for("publish", 1).await;
    handler.wait_for("error", 1).await;
    assert_eq!(channel_handler.publications(), vec![json!({ "input": "kept" })]);
    assert!(handler.fatal_errors().is_empty(), "{:?}", handler.events());
    assert!(client.connection_state().is_connected(), "session should survive");

    client.close().await;
}

#[tokio::test]
async fn connect_timeout_bounds_dial_and_handshake_together() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        // Slow upgrade, then the connect command is never answered
        sleep(Duration::from_millis(200)).await;
        let Ok(mut ws_stream) = tokio_tungstenite::accept_async(stream).await else {
            return;
        };
        while let Some(Ok(_)) = ws_stream.next().await {}
    });
    let config = Config::builder()
        .connect_timeout(Duration::from_millis(300))
        .build();

    let started = Instant::now();
    let err = Client::connect(
        &format!("ws://{addr}/connection/websocket"),
        Token::from("token"),
        config,
        Recorder::new(),
    )
    .await
    .unwrap_err();
    let elapsed = started.elapsed();

    assert_eq!(err.kind(), Kind::Transport);
    assert!(
        matches!(err.downcast_ref::<WsError>(), Some(WsError::Timeout)),
        "{err:?}"
    );
    assert!(elapsed < Duration::from_millis(450), "handshake took {elapsed:?}");
}

#[tokio::test]
async fn missing_heartbeat_reconnects() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let config = Config::builder()
        .heartbeat_interval(Duration::from_millis(50))
        .heartbeat_timeout(Duration::from_millis(100))
        .reconnect(
            ReconnectConfig::builder()
                .initial_backoff(Duration::from_millis(20))
                .max_backoff(Duration::from_millis(50))
                .build(),
        )
        .build();

    let client =
        Client::connect(&server.url(), server.token("42"), config, handler.connection_handler())
            .await
            .unwrap();
    server.stop_pong();

    handler.wait_for("error heartbeat timeout", 1).await;
    handler.wait_for("connect", 2).await;

    client.close().await;
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    let server = MockServer::start().await;
    let handler = Recorder::new();
    let config = Config::builder()
        .reconnect(
            ReconnectConfig::builder()
                .max_attempts(0)
                .build(),
        )
        .build();

    let client =
        Client::connect(&server.url(), server.token("42"), config, handler.connection_handler())
            .await
            .unwrap();
    server.drop_connections();

    handler.wait_for("disconnect reconnect=false", 1).await;
    let mut state = client.state_receiver();
    timeout(
        Duration::from_secs(2),
        state.wait_for(|state| state.is_closed()),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(handler.count("connect"), 1);

    client.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_cancels_later_requests() {
    let server = MockServer::start().await;
    let handler = Recorder::new();

    let client = Client::connect(
        &server.url(),
        server.token("42"),
        test_config(),
        handler.connection_handler(),
    )
    .await
    .unwrap();

    client.close().await;
    client.close().await;

    let err = client.publish("chat:index", "hello").await.unwrap_err();
    assert_eq!(err.kind(), Kind::Publish);
    assert!(
        matches!(err.downcast_ref::<WsError>(), Some(WsError::Cancelled)),
        "{err:?}"
    );
    assert_eq!(handler.count("disconnect"), 1);
}
