use std::time::Duration;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, StatusCode},
    Json, RequestPartsExt,
};
use axum_extra::{
    headers::{authorization::Bearer, Authorization},
    TypedHeader,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::state::AppState;

// ============================================================================
// JWT Claims
// ============================================================================

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
    pub username: String,
    /// Distinguishes access tokens (short-lived) from refresh tokens
    /// (long-lived). `AuthUser` rejects refresh tokens so they cannot be
    /// used as bearer tokens.
    pub token_type: TokenType,
}

impl Claims {
    fn new(user_id: Uuid, username: String, ttl: Duration, token_type: TokenType) -> Self {
        let now = Utc::now();
        let exp = now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());

        Claims {
            sub: user_id.to_string(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
            username,
            token_type,
        }
    }

    pub fn user_id(&self) -> AppResult<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::Unauthorized("Invalid user ID in token".into()))
    }
}

/// The pair handed back from a successful login/refresh (spec.md §11).
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

/// The authentication collaborator (spec.md §9's "authenticator" design
/// note): the Gateway handshake and the REST `AuthUser` extractor both go
/// through this trait, rather than reaching for `jsonwebtoken` directly.
/// `JwtAuthenticator` is the only implementation; the indirection exists so
/// tests can swap in a fixed-clock fake without touching real tokens.
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn issue_tokens(&self, user_id: Uuid, username: &str) -> AppResult<TokenPair>;
    fn validate_access_token(&self, token: &str) -> AppResult<Claims>;
    fn validate_refresh_token(&self, token: &str) -> AppResult<Claims>;
    fn hash_refresh_token(&self, token: &str) -> String;
}

pub struct JwtAuthenticator {
    secret: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtAuthenticator {
    pub fn new(secret: String, access_ttl: Duration, refresh_ttl: Duration) -> Self {
        Self {
            secret,
            access_ttl,
            refresh_ttl,
        }
    }

    fn validate(&self, token: &str, expected: TokenType) -> AppResult<Claims> {
        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map(|data| data.claims)
        .map_err(|e| {
            tracing::warn!(error = ?e, "token validation failed");
            AppError::Unauthorized("Invalid or expired token".into())
        })?;

        if claims.token_type != expected {
            return Err(AppError::Unauthorized("Invalid token type".into()));
        }
        Ok(claims)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    fn issue_tokens(&self, user_id: Uuid, username: &str) -> AppResult<TokenPair> {
        let encoding_key = EncodingKey::from_secret(self.secret.as_bytes());

        let access_token = encode(
            &Header::default(),
            &Claims::new(user_id, username.to_owned(), self.access_ttl, TokenType::Access),
            &encoding_key,
        )
        .map_err(|e| {
            tracing::error!(error = ?e, "failed to create access token");
            AppError::Internal
        })?;

        let refresh_token = encode(
            &Header::default(),
            &Claims::new(user_id, username.to_owned(), self.refresh_ttl, TokenType::Refresh),
            &encoding_key,
        )
        .map_err(|e| {
            tracing::error!(error = ?e, "failed to create refresh token");
            AppError::Internal
        })?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }

    fn validate_access_token(&self, token: &str) -> AppResult<Claims> {
        self.validate(token, TokenType::Access)
    }

    fn validate_refresh_token(&self, token: &str) -> AppResult<Claims> {
        self.validate(token, TokenType::Refresh)
    }

    /// SHA-256 rather than bcrypt: refresh tokens are looked up by hash, and
    /// bcrypt's per-call salt would make that lookup impossible without
    /// scanning every row.
    fn hash_refresh_token(&self, token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

// ============================================================================
// Password hashing
// ============================================================================

pub fn hash_password(password: &str) -> AppResult<String> {
    bcrypt::hash(password, 12).map_err(|e| {
        tracing::error!(error = ?e, "failed to hash password");
        AppError::Internal
    })
}

pub fn verify_password(password: &str, hash: &str) -> AppResult<bool> {
    bcrypt::verify(password, hash).map_err(|e| {
        tracing::error!(error = ?e, "failed to verify password");
        AppError::Internal
    })
}

// ============================================================================
// Auth extractor
// ============================================================================

/// Authenticated user extracted from a valid access-token bearer header.
///
/// Fields are private: the only valid constructor is the `FromRequestParts`
/// impl, so callers cannot forge an `AuthUser` via struct literal.
pub struct AuthUser {
    user_id: Uuid,
    username: String,
}

impl AuthUser {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

type AuthRejection = (StatusCode, Json<serde_json::Value>);

fn auth_error(message: &str) -> AuthRejection {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": message })))
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AuthRejection;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) = parts
            .extract::<TypedHeader<Authorization<Bearer>>>()
            .await
            .map_err(|_| auth_error("Missing or invalid Authorization header"))?;

        let claims = state
            .authenticator
            .validate_access_token(bearer.token())
            .map_err(|_| auth_error("Invalid or expired token"))?;

        let user_id = claims
            .user_id()
            .map_err(|_| auth_error("Invalid token subject"))?;

        Ok(AuthUser {
            user_id,
            username: claims.username,
        })
    }
}
