use super::*;

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    time::Duration,
};

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};

use crate::events::SignOutReason;

#[derive(Clone)]
struct BackendState {
    profile_calls: Arc<AtomicUsize>,
    profile_ok: Arc<AtomicBool>,
    drop_next_socket: Arc<AtomicBool>,
    tokens: mpsc::UnboundedSender<String>,
    frames: mpsc::UnboundedSender<Value>,
    pushes: broadcast::Sender<String>,
}

struct FakeBackend {
    settings: Settings,
    profile_calls: Arc<AtomicUsize>,
    profile_ok: Arc<AtomicBool>,
    tokens: mpsc::UnboundedReceiver<String>,
    frames: mpsc::UnboundedReceiver<Value>,
    pushes: broadcast::Sender<String>,
}

async fn handle_signin(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["password"] == "pw" {
        (StatusCode::OK, Json(json!({"accessToken": "token-1"})))
    } else {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"message": "Invalid credentials"})),
        )
    }
}

async fn handle_refresh() -> Json<Value> {
    Json(json!({"accessToken": "token-2"}))
}

async fn handle_logout() -> Json<Value> {
    Json(json!({"message": "Logged out successfully"}))
}

async fn handle_user_info(State(state): State<BackendState>) -> (StatusCode, Json<Value>) {
    state.profile_calls.fetch_add(1, Ordering::SeqCst);
    if !state.profile_ok.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({})));
    }
    (StatusCode::OK, Json(json!({
        "user": {
            "_id": "me",
            "email": "me@example.com",
            "name": "Me",
            "friends": [
                {"_id": "a", "name": "a", "email": "a@example.com"},
                {"_id": "b", "name": "b", "email": "b@example.com"},
                {"_id": "c", "name": "c", "email": "c@example.com"}
            ]
        }
    })))
}

async fn handle_friend_request(Path(receiver): Path<String>) -> Json<Value> {
    Json(json!({"message": format!("Friend request sent to {receiver}")}))
}

async fn handle_add_people(Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    if body["userToAddId"] == "already-member" {
        return (StatusCode::BAD_REQUEST, Json(json!({})));
    }
    (
        StatusCode::OK,
        Json(json!({"server": {"_id": body["serverId"], "server_name": "General"}})),
    )
}

async fn handle_socket_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<BackendState>,
) -> Response {
    let _ = state
        .tokens
        .send(query.get("token").cloned().unwrap_or_default());
    ws.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn serve_socket(mut socket: WebSocket, state: BackendState) {
    if state.drop_next_socket.swap(false, Ordering::SeqCst) {
        let _ = socket.close().await;
        return;
    }
    let mut pushes = state.pushes.subscribe();
    loop {
        tokio::select! {
            incoming = socket.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(&text) {
                        let _ = state.frames.send(frame);
                    }
                }
                Some(Ok(_)) => {}
                _ => break,
            },
            push = pushes.recv() => match push {
                Ok(text) => {
                    if socket.send(WsMessage::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
}

async fn spawn_backend(drop_first_socket: bool) -> FakeBackend {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (tokens_tx, tokens) = mpsc::unbounded_channel();
    let (frames_tx, frames) = mpsc::unbounded_channel();
    let (pushes, _) = broadcast::channel(16);
    let state = BackendState {
        profile_calls: Arc::new(AtomicUsize::new(0)),
        profile_ok: Arc::new(AtomicBool::new(true)),
        drop_next_socket: Arc::new(AtomicBool::new(drop_first_socket)),
        tokens: tokens_tx,
        frames: frames_tx,
        pushes: pushes.clone(),
    };
    let profile_calls = Arc::clone(&state.profile_calls);
    let profile_ok = Arc::clone(&state.profile_ok);
    let app = Router::new()
        .route("/signin", post(handle_signin))
        .route("/refresh_token", post(handle_refresh))
        .route("/logout", post(handle_logout))
        .route("/get_user_info", get(handle_user_info))
        .route("/send_friend_request/:id", post(handle_friend_request))
        .route("/add_people", put(handle_add_people))
        .route("/socket", get(handle_socket_upgrade))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let mut settings = Settings::default().with_server_url(format!("http://{addr}"));
    settings.reconnect_min_delay_ms = 10;
    settings.reconnect_max_delay_ms = 50;
    FakeBackend {
        settings,
        profile_calls,
        profile_ok,
        tokens,
        frames,
        pushes,
    }
}

async fn wait_for_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event bus closed"),
            }
        }
    })
    .await
    .expect("event within timeout")
}

async fn next_frame(backend: &mut FakeBackend, event: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = backend.frames.recv().await.expect("frame channel open");
            if frame["event"] == event {
                return frame;
            }
        }
    })
    .await
    .expect("frame within timeout")
}

async fn signed_in_client(
    backend: &mut FakeBackend,
) -> (Arc<ChatClient>, broadcast::Receiver<ClientEvent>) {
    let client = ChatClient::new(backend.settings.clone()).expect("client");
    let events = client.subscribe_events();
    client.start().await;
    client.login("me@example.com", "pw").await.expect("login");
    let frame = next_frame(backend, "set-user").await;
    assert_eq!(frame["data"]["_id"], "me");
    (client, events)
}

#[tokio::test]
async fn sign_in_connects_realtime_and_registers_presence() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;

    assert_eq!(backend.tokens.recv().await.as_deref(), Some("token-1"));
    assert_eq!(
        client.profile().await.map(|profile| profile.id),
        Some(UserId::new("me"))
    );

    let _ = backend.pushes.send(
        json!({
            "event": "show-user-friends-online",
            "data": [{"_id": "a", "name": "a", "email": "a@example.com"}]
        })
        .to_string(),
    );
    let event = wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::PresenceChanged(snapshot) if !snapshot.online.is_empty())
    })
    .await;
    let ClientEvent::PresenceChanged(snapshot) = event else {
        unreachable!()
    };
    let offline: Vec<_> = snapshot.offline.iter().map(|f| f.email.as_str()).collect();
    assert_eq!(snapshot.online.len(), 1);
    assert_eq!(offline, ["b@example.com", "c@example.com"]);

    let _ = backend.pushes.send(
        json!({"event": "friend-online", "data": {"name": "b", "email": "b@example.com"}})
            .to_string(),
    );
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::PresenceChanged(snapshot) if snapshot.online.len() == 2)
    })
    .await;
    assert_eq!(client.presence().await.offline.len(), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn failed_sign_in_publishes_backend_message() {
    let backend = spawn_backend(false).await;
    let client = ChatClient::new(backend.settings.clone()).expect("client");
    let mut events = client.subscribe_events();
    client.start().await;

    let err = client
        .login("me@example.com", "wrong")
        .await
        .expect_err("bad password");
    assert_eq!(err.user_message(), "Invalid credentials");

    let event = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Notice(_))).await;
    assert_eq!(
        event,
        ClientEvent::Notice(Notice::error("Invalid credentials"))
    );
    assert!(client.profile().await.is_none());
    assert!(!client.realtime().is_connected().await);
    client.shutdown().await;
}

#[tokio::test]
async fn friend_request_push_shows_notice_and_refetches_profile() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;
    let calls_before = backend.profile_calls.load(Ordering::SeqCst);

    let _ = backend
        .pushes
        .send(json!({"event": "receive-friend-request"}).to_string());

    let notice = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Notice(_))).await;
    assert_eq!(
        notice,
        ClientEvent::Notice(Notice::success(FRIEND_REQUEST_NOTICE))
    );
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::ProfileUpdated(_))
    })
    .await;
    assert_eq!(backend.profile_calls.load(Ordering::SeqCst), calls_before + 1);

    client.shutdown().await;
}

#[tokio::test]
async fn inbound_messages_are_republished_on_the_bus() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;

    let _ = backend.pushes.send(
        json!({
            "event": "receive-server-message",
            "data": {"_id": "m1", "message": "hello all", "senderId": "a", "serverId": "s1"}
        })
        .to_string(),
    );

    let event = wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::ServerMessage(_))
    })
    .await;
    let ClientEvent::ServerMessage(message) = event else {
        unreachable!()
    };
    assert_eq!(message.body, "hello all");
    assert_eq!(message.server_id, Some(ServerId::new("s1")));
    client.shutdown().await;
}

#[tokio::test]
async fn friend_request_helper_calls_backend_then_emits() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;

    let body = client
        .send_friend_request(&UserId::new("u42"))
        .await
        .expect("friend request");
    assert_eq!(body.message.as_deref(), Some("Friend request sent to u42"));

    let notice = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Notice(_))).await;
    assert_eq!(
        notice,
        ClientEvent::Notice(Notice::success("Friend request sent to u42"))
    );
    let frame = next_frame(&mut backend, "send-friend-request").await;
    assert_eq!(frame["data"]["toUserId"], "u42");
    client.shutdown().await;
}

#[tokio::test]
async fn add_people_uses_fallback_texts() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;
    let server_id = ServerId::new("s1");

    client
        .add_people_to_server(&server_id, &UserId::new("u7"))
        .await
        .expect("add people");
    let notice = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Notice(_))).await;
    assert_eq!(
        notice,
        ClientEvent::Notice(Notice::success("User successfully added!"))
    );
    let frame = next_frame(&mut backend, "add-people-to-server").await;
    assert_eq!(frame["data"]["toUserId"], "u7");

    client
        .add_people_to_server(&server_id, &UserId::new("already-member"))
        .await
        .expect_err("rejected");
    let notice = wait_for_event(&mut events, |event| matches!(event, ClientEvent::Notice(_))).await;
    assert_eq!(notice, ClientEvent::Notice(Notice::error("Failed to add user")));
    client.shutdown().await;
}

#[tokio::test]
async fn logout_tears_down_realtime_and_profile() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;

    client.logout().await;

    wait_for_event(&mut events, |event| {
        *event
            == ClientEvent::Session(SessionEvent::SignedOut {
                reason: SignOutReason::LoggedOut,
            })
    })
    .await;
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::RealtimeDisconnected)
    })
    .await;
    assert!(client.profile().await.is_none());
    assert!(!client.realtime().is_connected().await);
    assert!(matches!(
        client
            .open_conversation(ConversationKey::Direct {
                peer: UserId::new("a")
            })
            .await,
        Err(ClientError::NotSignedIn)
    ));
    client.shutdown().await;
}

#[tokio::test]
async fn unexpected_drop_reconnects_with_the_same_credential() {
    let mut backend = spawn_backend(true).await;
    let client = ChatClient::new(backend.settings.clone()).expect("client");
    let mut events = client.subscribe_events();
    client.start().await;
    client.login("me@example.com", "pw").await.expect("login");

    assert_eq!(backend.tokens.recv().await.as_deref(), Some("token-1"));
    wait_for_event(&mut events, |event| {
        matches!(event, ClientEvent::RealtimeDisconnected)
    })
    .await;

    let second = timeout(Duration::from_secs(5), backend.tokens.recv())
        .await
        .expect("reconnect within timeout");
    assert_eq!(second.as_deref(), Some("token-1"));
    next_frame(&mut backend, "set-user").await;
    assert!(client.realtime().is_connected().await);
    client.shutdown().await;
}

async fn next_token(backend: &mut FakeBackend) -> Option<String> {
    timeout(Duration::from_secs(5), backend.tokens.recv())
        .await
        .expect("handshake within timeout")
}

#[tokio::test]
async fn credential_refresh_rebinds_realtime() {
    let mut backend = spawn_backend(false).await;
    let (client, _events) = signed_in_client(&mut backend).await;
    assert_eq!(next_token(&mut backend).await.as_deref(), Some("token-1"));

    let fresh = client.session().refresh().await.expect("refresh");

    assert_eq!(next_token(&mut backend).await.as_deref(), Some("token-2"));
    let frame = next_frame(&mut backend, "set-user").await;
    assert_eq!(frame["data"]["_id"], "me");
    assert!(client.realtime().is_connected_with(&fresh).await);
    client.shutdown().await;
}

#[tokio::test]
async fn credential_refresh_rebinds_realtime_when_profile_fetch_fails() {
    let mut backend = spawn_backend(false).await;
    let (client, mut events) = signed_in_client(&mut backend).await;
    assert_eq!(next_token(&mut backend).await.as_deref(), Some("token-1"));
    backend.profile_ok.store(false, Ordering::SeqCst);

    let fresh = client.session().refresh().await.expect("refresh");

    assert_eq!(next_token(&mut backend).await.as_deref(), Some("token-2"));
    wait_for_event(&mut events, |event| matches!(event, ClientEvent::Error(_))).await;
    // The last known profile is registered on the new connection.
    let frame = next_frame(&mut backend, "set-user").await;
    assert_eq!(frame["data"]["_id"], "me");
    assert!(client.realtime().is_connected_with(&fresh).await);
    client.shutdown().await;
}

#[tokio::test]
async fn sign_in_connects_realtime_even_when_profile_fetch_fails() {
    let mut backend = spawn_backend(false).await;
    backend.profile_ok.store(false, Ordering::SeqCst);
    let client = ChatClient::new(backend.settings.clone()).expect("client");
    let mut events = client.subscribe_events();
    client.start().await;

    client.login("me@example.com", "pw").await.expect("login");

    assert_eq!(next_token(&mut backend).await.as_deref(), Some("token-1"));
    wait_for_event(&mut events, |event| matches!(event, ClientEvent::Error(_))).await;
    assert!(client.profile().await.is_none());
    assert!(client.realtime().is_connected().await);

    // Presence is registered once a later fetch succeeds.
    backend.profile_ok.store(true, Ordering::SeqCst);
    client.refresh_profile().await.expect("profile");
    let frame = next_frame(&mut backend, "set-user").await;
    assert_eq!(frame["data"]["_id"], "me");
    client.shutdown().await;
}

#[tokio::test]
async fn open_conversation_uses_profile_identity() {
    let mut backend = spawn_backend(false).await;
    let (client, _events) = signed_in_client(&mut backend).await;

    let view = client
        .open_conversation(ConversationKey::Server {
            server_id: ServerId::new("s1"),
        })
        .await
        .expect("view");
    assert!(view.entries().is_empty());
    assert!(view.has_more());
    assert!(matches!(view.key(), ConversationKey::Server { .. }));
    client.shutdown().await;
}
