use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::ConnectInfo,
    http::{header, HeaderValue, Method, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Router,
};
use axum_prometheus::PrometheusMetricLayer;
use tower_governor::{governor::GovernorConfigBuilder, GovernorLayer};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chat_core::auth::{Authenticator, JwtAuthenticator};
use chat_core::cache::{memory_cache::MemorySharedCache, pg_cache::PgSharedCache, SharedCache};
use chat_core::config::Config;
use chat_core::push::{HttpPushTransport, NoopPushTransport, PushTransport};
use chat_core::repository::{MemoryRepository, PgRepository, Repository};
use chat_core::state::AppState;
use chat_core::{db, handlers, websocket};

/// Middleware that restricts access to the metrics endpoint to loopback
/// connections only.
async fn require_loopback(
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    match connect_info {
        Some(ConnectInfo(addr)) if addr.ip().is_loopback() => next.run(req).await,
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "chat_core=info,tower_http=info,sqlx=warn".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("chat-core starting");

    let config = Arc::new(Config::from_env().expect("failed to load configuration"));
    info!("configuration loaded");

    let pool = db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run database migrations");
    info!("database migrations applied");

    db::health_check(&pool).await.expect("database health check failed");
    info!("database health check passed");

    // Repository: MOCK_DATABASE=1 selects the in-memory fake for local dev
    // and demos without a Postgres instance (spec.md §6).
    let repository: Arc<dyn Repository> = if std::env::var("MOCK_DATABASE").as_deref() == Ok("1") {
        info!("repository: in-memory (MOCK_DATABASE=1)");
        Arc::new(MemoryRepository::new())
    } else {
        Arc::new(PgRepository::new(pool.clone()))
    };

    // Shared cache / cross-process pub-sub: falls back to an in-process fake
    // when CACHE_URL is unset, matching the mock-database toggle's spirit.
    let cache: Arc<dyn SharedCache> = match &config.cache_url {
        Some(_) => {
            info!("shared cache: Postgres LISTEN/NOTIFY");
            Arc::new(PgSharedCache::connect(pool.clone()).await.expect("failed to start shared cache listener"))
        }
        None => {
            info!("shared cache: in-memory (CACHE_URL unset)");
            Arc::new(MemorySharedCache::new())
        }
    };

    let authenticator: Arc<dyn Authenticator> = Arc::new(JwtAuthenticator::new(
        config.jwt_secret.clone(),
        config.access_token_ttl,
        config.refresh_token_ttl,
    ));

    // Push transport: MOCK_PUSH=1 logs instead of calling out to a real
    // push endpoint, for local dev and tests without provider credentials.
    let push_transport: Arc<dyn PushTransport> = if std::env::var("MOCK_PUSH").as_deref() == Ok("1") {
        info!("push transport: no-op (MOCK_PUSH=1)");
        Arc::new(NoopPushTransport)
    } else {
        Arc::new(HttpPushTransport::new(config.push_timeout))
    };

    let app_state = AppState::new(config.clone(), pool, repository, cache, authenticator, push_transport);

    let cors = if config.is_dev {
        info!("CORS: permissive (dev mode)");
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        if origins.is_empty() {
            tracing::warn!("CORS: no ALLOWED_ORIGINS configured; all cross-origin requests will be denied");
        }
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
    };

    let addr = config.server_addr();

    let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();

    let governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(10)
            .burst_size(20)
            .finish()
            .expect("invalid global governor configuration"),
    );

    let auth_governor_conf = Arc::new(
        GovernorConfigBuilder::default()
            .per_second(2)
            .burst_size(5)
            .finish()
            .expect("invalid auth governor configuration"),
    );

    let auth_router = Router::new()
        .route("/auth/register", post(handlers::auth::register))
        .route("/auth/login", post(handlers::auth::login))
        .route("/auth/refresh-token", post(handlers::auth::refresh))
        .route("/auth/logout", post(handlers::auth::logout))
        .route_layer(GovernorLayer { config: auth_governor_conf });

    let app = Router::new()
        .route("/health", get(handlers::health_check))
        .route(
            "/metrics",
            get(move || async move { metric_handle.render() }).route_layer(middleware::from_fn(require_loopback)),
        )
        .merge(auth_router)
        .route("/users/@me", get(handlers::users::get_current_user))
        .route("/users/:id", get(handlers::users::get_user))
        .route("/status/:user_id", get(handlers::users::get_status))
        .route("/status", put(handlers::users::update_status))
        .route("/conversations", get(handlers::conversations::list_conversations))
        .route("/conversations", post(handlers::conversations::create_conversation))
        .route("/conversations/direct", post(handlers::conversations::create_direct_conversation))
        .route("/conversations/:id", put(handlers::conversations::update_conversation))
        .route("/conversations/:id/messages", get(handlers::conversations::list_messages))
        .route("/conversations/:id/participants", get(handlers::conversations::list_participants))
        .route("/messages", post(handlers::messages::create_message))
        .route("/messages/:id", get(handlers::messages::get_message))
        .route("/messages/:id", delete(handlers::messages::delete_message))
        .route("/messages/:message_id/reactions", get(handlers::reactions::list_reactions))
        .route("/messages/:message_id/reactions/:emoji", put(handlers::reactions::add_reaction))
        .route("/messages/:message_id/reactions/:emoji", delete(handlers::reactions::remove_reaction))
        .route(
            "/notifications/subscriptions",
            post(handlers::notifications::create_push_subscription),
        )
        .route(
            "/notifications/subscriptions",
            get(handlers::notifications::list_push_subscriptions),
        )
        .route(
            "/notifications/subscriptions",
            delete(handlers::notifications::delete_push_subscription),
        )
        .route(
            "/notifications/settings",
            get(handlers::notifications::get_notification_settings),
        )
        .route(
            "/notifications/settings",
            put(handlers::notifications::put_notification_settings),
        )
        .route(
            "/notifications/vapid-public-key",
            get(handlers::notifications::get_vapid_public_key),
        )
        .route("/ws", get(websocket::websocket_handler))
        .layer(GovernorLayer { config: governor_conf })
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(app_state);

    info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.expect("failed to bind to address");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    // Graceful shutdown drains in-flight requests and, since every open
    // Gateway session is an axum websocket upgrade itself, in-flight gateway
    // connections too — bounded by the `with_graceful_shutdown` future below
    // rather than an unbounded wait.
    let shutdown = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
        info!("shutdown signal received, draining connections");
    };

    if let Err(error) = server.with_graceful_shutdown(shutdown).await {
        tracing::error!(?error, "server failed");
    }
}
