use std::sync::Arc;

use sqlx::PgPool;

use crate::auth::Authenticator;
use crate::cache::SharedCache;
use crate::config::Config;
use crate::delivery::DeliveryTracker;
use crate::offline_queue::OfflineQueue;
use crate::pipeline::EphemeralPipeline;
use crate::presence::PresenceRegistry;
use crate::push::PushDispatcher;
use crate::repository::Repository;
use crate::router::ConversationRouter;
use crate::websocket::ConnectionManager;

/// How long the Conversation Router trusts a cached participant list before
/// re-reading it from the repository (spec.md §4.3).
const MEMBERSHIP_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

/// Shared application state passed to every handler, extractor, and gateway
/// session. Every cross-cutting collaborator named in spec.md §9 lives here
/// as a trait object behind an `Arc`, so the REST surface and the Gateway
/// share exactly one instance of each and tests can substitute fakes for
/// every one of them independently.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub repository: Arc<dyn Repository>,
    pub cache: Arc<dyn SharedCache>,
    pub authenticator: Arc<dyn Authenticator>,
    pub connections: ConnectionManager,
    pub presence: Arc<PresenceRegistry>,
    pub router: Arc<ConversationRouter>,
    pub delivery: Arc<DeliveryTracker>,
    pub pipeline: Arc<EphemeralPipeline>,
    pub offline_queue: Arc<OfflineQueue>,
    pub push: Arc<PushDispatcher>,
    /// Retained for health checks and the small number of REST handlers
    /// (users/auth) that still query relationally rather than through the
    /// repository abstraction's narrower surface.
    pub pool: PgPool,
}

impl AppState {
    /// Wires every collaborator together. This is the one place in the
    /// crate that knows the full dependency graph; everything downstream
    /// only sees trait objects.
    pub fn new(
        config: Arc<Config>,
        pool: PgPool,
        repository: Arc<dyn Repository>,
        cache: Arc<dyn SharedCache>,
        authenticator: Arc<dyn Authenticator>,
        push_transport: Arc<dyn crate::push::PushTransport>,
    ) -> Self {
        let connections = ConnectionManager::new();
        let presence = PresenceRegistry::new(config.away_threshold, config.presence_grace_period);
        let push = PushDispatcher::new(repository.clone(), push_transport, config.push_max_retries);
        let offline_queue = OfflineQueue::new(repository.clone(), config.offline_queue_capacity);
        let router = ConversationRouter::new(
            repository.clone(),
            Arc::new(connections.clone()),
            push.clone(),
            offline_queue.clone(),
            MEMBERSHIP_CACHE_TTL,
        );
        let delivery = DeliveryTracker::new(repository.clone(), Arc::new(connections.clone()));
        let pipeline = EphemeralPipeline::new(
            router.clone(),
            config.typing_debounce,
            config.read_receipt_throttle,
            config.reaction_batch_window,
        );

        presence.set_observer(router.clone());
        presence.spawn_away_sweeper();

        Self {
            config,
            repository,
            cache,
            authenticator,
            connections,
            presence,
            router,
            delivery,
            pipeline,
            offline_queue,
            push,
            pool,
        }
    }
}
