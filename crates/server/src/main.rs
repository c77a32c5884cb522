use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use server_api::{history, list_conversations, send_message, HistoryQuery};
use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, LoginRequest, LoginResponse, Message, SendMessageRequest},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app_state;
mod auth;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url};

const MAX_BODY_BYTES: usize = 64 * 1024;
const MAX_USERNAME_CHARS: usize = 64;

type HttpError = (StatusCode, Json<ApiError>);

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let state = AppState::new(storage, &settings);
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(
        %addr,
        fanout_concurrency = settings.fanout_concurrency,
        "server listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "failed to listen for shutdown signal");
    }
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route("/conversations", get(http_list_conversations))
        .route(
            "/conversations/:conversation_id/messages",
            get(http_list_messages),
        )
        .route("/messages", post(http_send_message))
        .route("/ws", get(ws_handler))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn http_error(err: ApiError) -> HttpError {
    (status_for(err.code), Json(err))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    match body {
        Ok(Json(value)) => Ok(value),
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => Err((
            StatusCode::PAYLOAD_TOO_LARGE,
            Json(ApiError::bad_request(rejection.body_text())),
        )),
        Err(rejection) => Err(http_error(ApiError::bad_request(rejection.body_text()))),
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> Response {
    match state.storage.health_check().await {
        Ok(()) => "ok".into_response(),
        Err(error) => {
            error!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable").into_response()
        }
    }
}

async fn login(
    State(state): State<Arc<AppState>>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<LoginResponse>, HttpError> {
    let req = json_body(body)?;
    let username = req.username.trim();
    if username.is_empty() || username.chars().count() > MAX_USERNAME_CHARS {
        return Err(http_error(ApiError::bad_request(format!(
            "username must be 1 to {MAX_USERNAME_CHARS} characters"
        ))));
    }

    let user_id = state
        .storage
        .create_user(username)
        .await
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;
    let token = state
        .sessions
        .issue(user_id)
        .map_err(|e| http_error(ApiError::internal(e.to_string())))?;

    info!(user_id = user_id.0, "user signed in");
    Ok(Json(LoginResponse { user_id, token }))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ConversationSummary>>, HttpError> {
    let requester = state.sessions.requester(&headers);
    let conversations = list_conversations(&state.api, requester)
        .await
        .map_err(http_error)?;
    Ok(Json(conversations))
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<i64>,
    Query(q): Query<ListMessagesQuery>,
) -> Result<Json<Vec<Message>>, HttpError> {
    let requester = state.sessions.requester(&headers);
    let messages = history(
        &state.api,
        requester,
        HistoryQuery {
            conversation_id: Some(ConversationId(conversation_id)),
            limit: q.limit,
            before: q.before.map(MessageId),
        },
    )
    .await
    .map_err(http_error)?;
    Ok(Json(messages))
}

async fn http_send_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> Result<Json<Message>, HttpError> {
    // authenticate before looking at the body
    let requester = state
        .sessions
        .requester(&headers)
        .ok_or_else(|| http_error(ApiError::unauthorized("sign in required")))?;
    let req = json_body(body)?;
    let message = send_message(&state.api, Some(requester), req)
        .await
        .map_err(http_error)?;
    Ok(Json(message))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(q): Query<WsQuery>,
) -> Result<Response, HttpError> {
    let requester = match q.token.as_deref() {
        Some(token) => state.sessions.verify(token),
        None => state.sessions.requester(&headers),
    };
    let user_id =
        requester.ok_or_else(|| http_error(ApiError::unauthorized("sign in required")))?;
    Ok(ws.on_upgrade(move |socket| ws::ws_connection(state, socket, user_id)))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
