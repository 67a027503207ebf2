pub mod auth;
pub mod conversations;
pub mod messages;
pub mod notifications;
pub mod reactions;
pub mod users;

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let db_ok = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => true,
        Err(e) => {
            tracing::warn!(error = ?e, "Health check: database query failed");
            false
        }
    };

    let cache_ok = state
        .cache
        .get("health-check")
        .await
        .is_ok();

    let healthy = db_ok && cache_ok;
    let http_status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "service": "chat-core",
            "version": env!("CARGO_PKG_VERSION"),
            "database": if db_ok { "ok" } else { "unavailable" },
            "shared_cache": if cache_ok { "ok" } else { "unavailable" },
            "open_sessions": state.connections.connection_count(),
        })),
    )
}
