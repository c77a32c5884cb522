use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ApiException, ErrorCode},
    protocol::{ConversationSummary, LoginRequest, LoginResponse, Message, SendMessageRequest},
};
use url::Url;

use crate::error::SendError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: UserId,
    pub token: String,
}

/// Request/response half of the chat API.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn login(&self, username: &str) -> Result<Session>;
    async fn list_conversations(&self, session: &Session) -> Result<Vec<ConversationSummary>>;
    async fn history(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>>;
    async fn send(&self, session: &Session, request: &SendMessageRequest)
        -> Result<Message, SendError>;
}

#[derive(Serialize)]
struct HistoryQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    before: Option<i64>,
}

pub struct HttpBackend {
    http: Client,
    server_url: Url,
}

impl HttpBackend {
    pub fn new(server_url: &str) -> Result<Self> {
        let server_url = parse_server_url(server_url)?;
        Ok(Self {
            http: Client::new(),
            server_url,
        })
    }

    pub fn server_url(&self) -> &Url {
        &self.server_url
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.server_url
            .join(path)
            .with_context(|| format!("invalid endpoint path: {path}"))
    }

    fn authed(&self, builder: RequestBuilder, session: &Session) -> RequestBuilder {
        builder.bearer_auth(&session.token)
    }
}

pub(crate) fn parse_server_url(raw: &str) -> Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("invalid server url: {raw}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(anyhow!(
            "server_url must start with http:// or https://, got {other}://"
        )),
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn login(&self, username: &str) -> Result<Session> {
        let response = self
            .http
            .post(self.endpoint("login")?)
            .json(&LoginRequest {
                username: username.to_string(),
            })
            .send()
            .await?;
        let body: LoginResponse = read_json(response).await?;
        Ok(Session {
            user_id: body.user_id,
            token: body.token,
        })
    }

    async fn list_conversations(&self, session: &Session) -> Result<Vec<ConversationSummary>> {
        let response = self
            .authed(self.http.get(self.endpoint("conversations")?), session)
            .send()
            .await?;
        read_json(response).await
    }

    async fn history(
        &self,
        session: &Session,
        conversation_id: ConversationId,
        limit: Option<u32>,
        before: Option<MessageId>,
    ) -> Result<Vec<Message>> {
        let url = self.endpoint(&format!("conversations/{}/messages", conversation_id.0))?;
        let response = self
            .authed(self.http.get(url), session)
            .query(&HistoryQuery {
                limit,
                before: before.map(|id| id.0),
            })
            .send()
            .await?;
        read_json(response).await
    }

    async fn send(
        &self,
        session: &Session,
        request: &SendMessageRequest,
    ) -> Result<Message, SendError> {
        let url = self.endpoint("messages").map_err(SendError::Network)?;
        let response = self
            .authed(self.http.post(url), session)
            .json(request)
            .send()
            .await
            .map_err(|err| SendError::Network(err.into()))?;

        if !response.status().is_success() {
            return Err(SendError::Rejected(api_error(response).await));
        }
        response
            .json()
            .await
            .map_err(|err| SendError::Network(err.into()))
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    if !response.status().is_success() {
        return Err(ApiException::from(api_error(response).await).into());
    }
    Ok(response.json().await?)
}

/// Decodes the server's error body, falling back to the status code.
async fn api_error(response: Response) -> ApiError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    serde_json::from_str::<ApiError>(&body).unwrap_or_else(|_| {
        let message = if body.is_empty() {
            status.to_string()
        } else {
            body
        };
        ApiError::new(code_for_status(status), message)
    })
}

fn code_for_status(status: StatusCode) -> ErrorCode {
    match status {
        StatusCode::UNAUTHORIZED => ErrorCode::Unauthorized,
        StatusCode::FORBIDDEN => ErrorCode::Forbidden,
        StatusCode::NOT_FOUND => ErrorCode::NotFound,
        s if s.is_client_error() => ErrorCode::BadRequest,
        _ => ErrorCode::Internal,
    }
}

#[cfg(test)]
#[path = "tests/backend_tests.rs"]
mod tests;
