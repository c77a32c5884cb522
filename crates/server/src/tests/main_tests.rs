use super::*;
use axum::{body, body::Body, http::Request};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::{ClientId, ConversationType, ParticipantRole, UserId},
    protocol::{ChannelEvent, ChannelName, ClientFrame, ServerFrame},
};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    state: Arc<AppState>,
    landlord: UserId,
    renter: UserId,
    outsider: UserId,
    conversation: ConversationId,
}

impl TestApp {
    fn token(&self, user_id: UserId) -> String {
        self.state.sessions.issue(user_id).expect("token")
    }
}

async fn test_app() -> TestApp {
    let storage = Storage::new("sqlite::memory:").await.expect("db");
    let landlord = storage.create_user("landlord").await.expect("user");
    let renter = storage.create_user("renter").await.expect("user");
    let outsider = storage.create_user("outsider").await.expect("user");
    let conversation = storage
        .create_conversation(ConversationType::Direct, Some("Studio"), None)
        .await
        .expect("conversation");
    storage
        .add_participant(conversation, landlord, ParticipantRole::Landlord, None)
        .await
        .expect("participant");
    storage
        .add_participant(conversation, renter, ParticipantRole::Renter, None)
        .await
        .expect("participant");

    let state = Arc::new(AppState::new(storage, &config::Settings::default()));
    TestApp {
        app: build_router(Arc::clone(&state)),
        state,
        landlord,
        renter,
        outsider,
        conversation,
    }
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    (status, bytes.to_vec())
}

fn post_message(token: Option<&str>, body: String) -> Request<Body> {
    let mut builder = Request::post("/messages").header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::from(body)).expect("request")
}

fn authed_get(uri: &str, token: &str) -> Request<Body> {
    Request::get(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .expect("request")
}

#[tokio::test]
async fn healthz_reports_ok_when_storage_is_ready() {
    let t = test_app().await;
    let request = Request::get("/healthz")
        .body(Body::empty())
        .expect("request");
    let (status, body) = call(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
}

#[tokio::test]
async fn login_issues_a_token_for_conversation_routes() {
    let t = test_app().await;

    let login_request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::json!({ "username": "landlord" }).to_string(),
        ))
        .expect("request");
    let (status, body) = call(&t.app, login_request).await;
    assert_eq!(status, StatusCode::OK);
    let dto: LoginResponse = serde_json::from_slice(&body).expect("json");
    assert_eq!(dto.user_id, t.landlord);

    let (status, body) = call(&t.app, authed_get("/conversations", &dto.token)).await;
    assert_eq!(status, StatusCode::OK);
    let conversations: Vec<ConversationSummary> = serde_json::from_slice(&body).expect("json");
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].conversation_id, t.conversation);
}

#[tokio::test]
async fn login_rejects_blank_username() {
    let t = test_app().await;
    let request = Request::post("/login")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"username":"   "}"#))
        .expect("request");
    let (status, body) = call(&t.app, request).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(err.code, ErrorCode::BadRequest);
}

#[tokio::test]
async fn routes_require_a_valid_session() {
    let t = test_app().await;

    let (status, _) = call(
        &t.app,
        Request::get("/conversations")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = call(&t.app, authed_get("/conversations", "garbage")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&t.app, post_message(None, "not even json".into())).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let err: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(err.code, ErrorCode::Unauthorized);
}

#[tokio::test]
async fn history_route_is_limited_to_participants() {
    let t = test_app().await;
    for content in ["first", "second"] {
        let request = post_message(
            Some(&t.token(t.landlord)),
            serde_json::json!({ "conversationId": t.conversation, "content": content })
                .to_string(),
        );
        let (status, _) = call(&t.app, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    let uri = format!("/conversations/{}/messages?limit=1", t.conversation);
    let (status, body) = call(&t.app, authed_get(&uri, &t.token(t.renter))).await;
    assert_eq!(status, StatusCode::OK);
    let page: Vec<Message> = serde_json::from_slice(&body).expect("json");
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content, "second");

    let uri = format!(
        "/conversations/{}/messages?before={}",
        t.conversation, page[0].id
    );
    let (status, body) = call(&t.app, authed_get(&uri, &t.token(t.renter))).await;
    assert_eq!(status, StatusCode::OK);
    let older: Vec<Message> = serde_json::from_slice(&body).expect("json");
    assert_eq!(older.len(), 1);
    assert_eq!(older[0].content, "first");

    let uri = format!("/conversations/{}/messages", t.conversation);
    let (status, body) = call(&t.app, authed_get(&uri, &t.token(t.outsider))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let err: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(err.code, ErrorCode::Forbidden);
}

#[tokio::test]
async fn send_route_echoes_client_id_and_publishes() {
    let t = test_app().await;
    let mut conversation_channel = t
        .state
        .hub
        .subscribe(ChannelName::Conversation(t.conversation))
        .await;

    let request = post_message(
        Some(&t.token(t.renter)),
        serde_json::json!({
            "conversationId": t.conversation,
            "content": "Can I see it Saturday?",
            "clientId": "tmp-42",
        })
        .to_string(),
    );
    let (status, body) = call(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);
    let sent: Message = serde_json::from_slice(&body).expect("json");
    assert_eq!(sent.client_id, Some(ClientId::from("tmp-42")));
    assert_eq!(sent.sender_id, t.renter);

    match conversation_channel.recv().await.expect("event") {
        ChannelEvent::NewMessage(message) => assert_eq!(message.id, sent.id),
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn send_route_maps_errors_to_statuses() {
    let t = test_app().await;

    let outsider = post_message(
        Some(&t.token(t.outsider)),
        serde_json::json!({ "conversationId": t.conversation, "content": "hi" }).to_string(),
    );
    let (status, _) = call(&t.app, outsider).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let blank = post_message(
        Some(&t.token(t.landlord)),
        serde_json::json!({ "conversationId": t.conversation, "content": "" }).to_string(),
    );
    let (status, _) = call(&t.app, blank).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = post_message(Some(&t.token(t.landlord)), "{\"content\":".into());
    let (status, body) = call(&t.app, malformed).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let err: ApiError = serde_json::from_slice(&body).expect("json");
    assert_eq!(err.code, ErrorCode::BadRequest);

    let stored = t
        .state
        .storage
        .list_recent_messages(t.conversation, 10, None)
        .await
        .expect("list");
    assert!(stored.is_empty());
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let t = test_app().await;
    let request = post_message(
        Some(&t.token(t.landlord)),
        serde_json::json!({
            "conversationId": t.conversation,
            "content": "x".repeat(MAX_BODY_BYTES),
        })
        .to_string(),
    );
    let (status, _) = call(&t.app, request).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
}

async fn serve(t: &TestApp) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = t.app.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    addr
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn send_frame(socket: &mut Socket, frame: ClientFrame) {
    let text = serde_json::to_string(&frame).expect("frame");
    socket.send(WsMessage::Text(text)).await.expect("send");
}

async fn next_frame(socket: &mut Socket) -> ServerFrame {
    let next = tokio::time::timeout(std::time::Duration::from_secs(5), socket.next())
        .await
        .expect("frame in time")
        .expect("open")
        .expect("ws");
    match next {
        WsMessage::Text(text) => serde_json::from_str(&text).expect("server frame"),
        other => panic!("unexpected ws message: {other:?}"),
    }
}

#[tokio::test]
async fn websocket_requires_token() {
    let t = test_app().await;
    let addr = serve(&t).await;
    let result = tokio_tungstenite::connect_async(format!("ws://{addr}/ws")).await;
    assert!(result.is_err(), "upgrade must be refused without a token");
}

#[tokio::test]
async fn websocket_subscriptions_are_authorized_and_deliver_events() {
    let t = test_app().await;
    let addr = serve(&t).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws?token={}",
        t.token(t.renter)
    ))
    .await
    .expect("connect");

    let own = ChannelName::User(t.renter);
    let conversation = ChannelName::Conversation(t.conversation);
    send_frame(&mut socket, ClientFrame::Subscribe { channel: own }).await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::Subscribed { channel } if channel == own
    ));
    send_frame(&mut socket, ClientFrame::Subscribe { channel: conversation }).await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::Subscribed { channel } if channel == conversation
    ));

    send_frame(
        &mut socket,
        ClientFrame::Subscribe {
            channel: ChannelName::User(t.landlord),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::Error(err) if err.code == ErrorCode::Forbidden
    ));

    let request = post_message(
        Some(&t.token(t.landlord)),
        serde_json::json!({ "conversationId": t.conversation, "content": "Yes, 10am" })
            .to_string(),
    );
    let (status, _) = call(&t.app, request).await;
    assert_eq!(status, StatusCode::OK);

    let mut saw_new_message = false;
    let mut saw_update = false;
    for _ in 0..2 {
        match next_frame(&mut socket).await {
            ServerFrame::Event {
                channel,
                event: ChannelEvent::NewMessage(message),
            } => {
                assert_eq!(channel, conversation);
                assert_eq!(message.content, "Yes, 10am");
                saw_new_message = true;
            }
            ServerFrame::Event {
                channel,
                event: ChannelEvent::ConversationUpdate { last_message, .. },
            } => {
                assert_eq!(channel, own);
                assert_eq!(last_message.content, "Yes, 10am");
                saw_update = true;
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
    assert!(saw_new_message && saw_update);

    send_frame(&mut socket, ClientFrame::Unsubscribe { channel: conversation }).await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::Unsubscribed { channel } if channel == conversation
    ));
}

#[tokio::test]
async fn websocket_refuses_conversations_the_user_is_not_in() {
    let t = test_app().await;
    let addr = serve(&t).await;
    let (mut socket, _) = tokio_tungstenite::connect_async(format!(
        "ws://{addr}/ws?token={}",
        t.token(t.outsider)
    ))
    .await
    .expect("connect");

    send_frame(
        &mut socket,
        ClientFrame::Subscribe {
            channel: ChannelName::Conversation(t.conversation),
        },
    )
    .await;
    assert!(matches!(
        next_frame(&mut socket).await,
        ServerFrame::Error(err) if err.code == ErrorCode::Forbidden
    ));
    assert_eq!(
        t.state
            .hub
            .subscriber_count(ChannelName::Conversation(t.conversation))
            .await,
        0
    );
}
