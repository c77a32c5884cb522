use axum::http::{header, HeaderMap};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::domain::UserId;
use tracing::debug;

/// Upper bound on a session lifetime; larger values are clamped.
pub const MAX_SESSION_TTL_SECONDS: i64 = 365 * 24 * 3600;

/// Signs and checks the bearer tokens handed out by `/login`.
#[derive(Clone)]
pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iat: i64,
    exp: i64,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl_seconds: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl_seconds: ttl_seconds.clamp(-MAX_SESSION_TTL_SECONDS, MAX_SESSION_TTL_SECONDS),
        }
    }

    pub fn issue(&self, user_id: UserId) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let exp = now + Duration::seconds(self.ttl_seconds);
        let claims = Claims {
            sub: user_id.0.to_string(),
            iat: now.timestamp(),
            exp: exp.timestamp(),
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    /// `None` for anything that is not a live token we signed.
    pub fn verify(&self, token: &str) -> Option<UserId> {
        let decoded = match decode::<Claims>(token, &self.decoding, &Validation::default()) {
            Ok(decoded) => decoded,
            Err(error) => {
                debug!(%error, "rejected session token");
                return None;
            }
        };
        decoded.claims.sub.parse().ok().map(UserId)
    }

    pub fn requester(&self, headers: &HeaderMap) -> Option<UserId> {
        bearer_token(headers).and_then(|token| self.verify(token))
    }
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
