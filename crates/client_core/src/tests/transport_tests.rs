use axum::{
    extract::{
        ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::Response,
    routing::get,
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{Message, MessageSender},
};
use tokio::net::TcpListener;

use super::*;

/// Conversation the mock server refuses to subscribe to.
const LOCKED: ChannelName = ChannelName::Conversation(ConversationId(13));

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

fn greeting(channel: ChannelName) -> ChannelEvent {
    ChannelEvent::NewMessage(Message {
        id: MessageId(1),
        conversation_id: ConversationId(3),
        sender_id: UserId(2),
        sender: MessageSender {
            id: UserId(2),
            username: "landlord".to_string(),
            first_name: None,
            last_name: None,
        },
        content: format!("welcome to {channel}"),
        message_type: Default::default(),
        created_at: Utc::now(),
        is_edited: false,
        is_deleted: false,
        reply_to_id: None,
        client_id: None,
    })
}

fn replies(frame: ClientFrame) -> Vec<ServerFrame> {
    match frame {
        ClientFrame::Subscribe { channel } if channel == LOCKED => {
            vec![ServerFrame::Error(ApiError::forbidden("not a participant"))]
        }
        ClientFrame::Subscribe { channel } => vec![
            ServerFrame::Subscribed { channel },
            ServerFrame::Event {
                channel,
                event: greeting(channel),
            },
        ],
        ClientFrame::Unsubscribe { channel } => vec![ServerFrame::Unsubscribed { channel }],
    }
}

async fn mock_socket(mut socket: WebSocket) {
    while let Some(Ok(AxumMessage::Text(text))) = socket.recv().await {
        let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
            break;
        };
        for reply in replies(frame) {
            let text = serde_json::to_string(&reply).expect("encode");
            if socket.send(AxumMessage::Text(text)).await.is_err() {
                return;
            }
        }
    }
}

async fn mock_ws(Query(query): Query<TokenQuery>, ws: WebSocketUpgrade) -> Response {
    assert_eq!(query.token, "secret");
    ws.on_upgrade(mock_socket)
}

async fn hang_up(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| async move { drop(socket) })
}

async fn mock_server() -> String {
    let app = Router::new()
        .route("/ws", get(mock_ws))
        .route("/hang-up", get(hang_up));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn session() -> Session {
    Session {
        user_id: UserId(7),
        token: "secret".to_string(),
    }
}

#[test]
fn websocket_url_follows_server_scheme() {
    let plain = WebSocketConnector::new("http://127.0.0.1:8443").expect("connector");
    assert_eq!(
        plain.ws_url(&session()).expect("url").as_str(),
        "ws://127.0.0.1:8443/ws?token=secret"
    );

    let tls = WebSocketConnector::new("https://chat.example.com/").expect("connector");
    assert_eq!(
        tls.ws_url(&session()).expect("url").as_str(),
        "wss://chat.example.com/ws?token=secret"
    );
}

#[test]
fn logged_urls_drop_the_token() {
    assert_eq!(redact("ws://host/ws?token=secret"), "ws://host/ws");
    assert_eq!(redact("ws://host/ws"), "ws://host/ws");
}

#[tokio::test]
async fn subscribe_is_acked_and_events_reach_the_sink() {
    let connector = WebSocketConnector::new(&mock_server().await).expect("connector");
    let (sink, mut events) = mpsc::unbounded_channel();
    let transport = connector.connect(&session(), sink).await.expect("connect");

    let channel = ChannelName::User(UserId(7));
    transport.subscribe(channel).await.expect("subscribe");
    let (from, event) = events.recv().await.expect("event");
    assert_eq!(from, channel);
    assert_eq!(event.name(), shared::protocol::NEW_MESSAGE_EVENT);

    transport.unsubscribe(channel).await.expect("unsubscribe");
}

#[tokio::test]
async fn refused_subscription_surfaces_server_error() {
    let connector = WebSocketConnector::new(&mock_server().await).expect("connector");
    let (sink, _events) = mpsc::unbounded_channel();
    let transport = connector.connect(&session(), sink).await.expect("connect");

    let err = transport.subscribe(LOCKED).await.expect_err("forbidden");
    let api = err.downcast_ref::<ApiException>().expect("api error");
    assert_eq!(api.code, shared::error::ErrorCode::Forbidden);

    // acks stay aligned after an error
    let channel = ChannelName::Conversation(ConversationId(3));
    transport.subscribe(channel).await.expect("subscribe");
}

#[tokio::test]
async fn requests_after_the_socket_closed_fail_fast() {
    let server = mock_server().await.replacen("http://", "ws://", 1);
    let (sink, _events) = mpsc::unbounded_channel();
    let transport = WebSocketTransport::connect(&format!("{server}/hang-up"), sink)
        .await
        .expect("connect");

    for _ in 0..200 {
        if transport.reader.is_finished() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(transport.reader.is_finished(), "server hang-up not noticed");

    let outcome = tokio::time::timeout(
        Duration::from_secs(2),
        transport.subscribe(ChannelName::User(UserId(7))),
    )
    .await
    .expect("no ack wait");
    assert!(outcome.is_err());
}

#[tokio::test]
async fn hub_transport_forwards_until_unsubscribed() {
    let hub = ChannelHub::new();
    let (sink, mut events) = mpsc::unbounded_channel();
    let transport = HubConnector::new(hub.clone())
        .connect(&session(), sink)
        .await
        .expect("connect");

    let channel = ChannelName::Conversation(ConversationId(3));
    transport.subscribe(channel).await.expect("subscribe");
    transport.subscribe(channel).await.expect("idempotent");
    assert_eq!(hub.subscriber_count(channel).await, 1);

    assert_eq!(hub.broadcast(channel, greeting(channel)).await, 1);
    let (from, _) = events.recv().await.expect("event");
    assert_eq!(from, channel);

    transport.unsubscribe(channel).await.expect("unsubscribe");
    assert_eq!(hub.subscriber_count(channel).await, 0);
    assert_eq!(hub.broadcast(channel, greeting(channel)).await, 0);
}
