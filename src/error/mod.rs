use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// The error taxonomy used across the core and its REST companion surface.
///
/// Every variant maps to exactly one HTTP status and one gateway `error`
/// frame `code`, so the same enum serves both transports.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A dependency (shared cache, repository, push transport) is transiently
    /// down. The caller MAY retry.
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Internal server error")]
    Internal,
}

impl AppError {
    /// The taxonomy tag carried in the `{code, message}` gateway error frame
    /// and, for the REST surface, implicitly via the HTTP status.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BadRequest",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Forbidden(_) => "Forbidden",
            AppError::NotFound(_) => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::Unavailable(_) => "Unavailable",
            AppError::Internal => "Internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Render as the `{code, message}` payload used for the WS `error` frame.
    pub fn to_frame_payload(&self) -> serde_json::Value {
        json!({ "code": self.code(), "message": self.to_string() })
    }
}

/// Map sqlx errors to AppError, with special handling for unique-constraint
/// violations (PG error code 23505) so they surface as Conflict rather than
/// Internal, and connection-level failures as Unavailable (the caller may
/// retry), matching the repository/cache's transient-failure contract.
impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = e {
            if db_err.code().as_deref() == Some("23505") {
                let message = match db_err.constraint() {
                    Some(c) if c.contains("username") => "Username already taken",
                    Some(c) if c.contains("email") => "Email already registered",
                    Some(c) if c.contains("emoji") => "Reaction already exists",
                    _ => "Resource already exists",
                };
                return AppError::Conflict(message.into());
            }
        }
        if matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
            tracing::warn!(error = ?e, "Repository call failed transiently");
            return AppError::Unavailable("Repository unavailable".into());
        }
        tracing::error!(error = ?e, "Unmapped database error");
        AppError::Internal
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Internal = self {
            tracing::error!("Internal server error");
        }
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_has_a_distinct_code() {
        let errs = [
            AppError::BadRequest("x".into()),
            AppError::Unauthorized("x".into()),
            AppError::Forbidden("x".into()),
            AppError::NotFound("x".into()),
            AppError::Conflict("x".into()),
            AppError::Unavailable("x".into()),
            AppError::Internal,
        ];
        let mut codes: Vec<&str> = errs.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn unauthorized_maps_to_401() {
        let response = AppError::Unauthorized("nope".into()).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn unavailable_maps_to_503() {
        let response = AppError::Unavailable("cache down".into()).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn conflict_frame_payload_carries_code_and_message() {
        let err = AppError::Conflict("duplicate reaction".into());
        let payload = err.to_frame_payload();
        assert_eq!(payload["code"], "Conflict");
        assert_eq!(payload["message"], "Conflict: duplicate reaction");
    }
}
