use std::env;
use std::time::Duration;

/// Process configuration, loaded once at startup from environment variables
/// (optionally via a `.env` file in development).
///
/// Every knob named in spec.md §6 has a field here; core-internal tunables
/// (away threshold, grace period, debounce/throttle windows, queue bound,
/// push retry policy) are also collected here rather than scattered as
/// magic numbers through the component modules.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    /// `None` selects the in-memory shared-cache/pub-sub fake, matching
    /// spec.md §6's "Optional mock-cache ... toggle for development".
    pub cache_url: Option<String>,
    pub jwt_secret: String,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub server_host: String,
    pub server_port: u16,
    pub allowed_origins: Vec<String>,
    pub is_dev: bool,

    // -- Push Dispatcher (G) --
    pub push_public_key: Option<String>,
    pub push_private_key: Option<String>,
    pub push_subject: Option<String>,
    pub push_timeout: Duration,
    pub push_max_retries: u32,

    // -- Presence Registry (B) --
    pub away_threshold: Duration,
    pub presence_grace_period: Duration,

    // -- Ephemeral Signal Pipeline (E) --
    pub typing_debounce: Duration,
    pub read_receipt_throttle: Duration,
    pub presence_batch_window: Duration,
    pub reaction_batch_window: Duration,

    // -- Offline Queue (F) --
    pub offline_queue_capacity: usize,

    // -- cross-collaborator deadlines (§5) --
    pub cache_deadline: Duration,
    pub repository_deadline: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_duration_ms(key: &str, default_ms: u64) -> Duration {
    Duration::from_millis(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_ms),
    )
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        dotenvy::dotenv().ok();

        let is_dev = env::var("APP_ENV").as_deref() != Ok("production");

        let allowed_origins = env::var("ALLOWED_ORIGINS")
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_owned()).collect())
            .unwrap_or_default();

        Ok(Config {
            database_url: env::var("DATABASE_URL")?,
            cache_url: env::var("CACHE_URL").ok().filter(|v| !v.is_empty()),
            jwt_secret: env_or("JWT_SECRET", "dev_secret_change_in_production"),
            access_token_ttl: Duration::from_secs(
                env_or("ACCESS_TOKEN_TTL_MINUTES", "15")
                    .parse::<u64>()
                    .unwrap_or(15)
                    * 60,
            ),
            refresh_token_ttl: Duration::from_secs(
                env_or("REFRESH_TOKEN_TTL_DAYS", "7").parse::<u64>().unwrap_or(7) * 86_400,
            ),
            server_host: env_or("SERVER_HOST", "127.0.0.1"),
            server_port: env_or("SERVER_PORT", "8080").parse().unwrap_or(8080),
            allowed_origins,
            is_dev,

            push_public_key: env::var("PUSH_PUBLIC_KEY").ok(),
            push_private_key: env::var("PUSH_PRIVATE_KEY").ok(),
            push_subject: env::var("PUSH_SUBJECT").ok(),
            push_timeout: Duration::from_secs(2),
            push_max_retries: env_or("PUSH_MAX_RETRIES", "5").parse().unwrap_or(5),

            away_threshold: env_duration_ms("AWAY_THRESHOLD_MS", 10 * 60 * 1000),
            presence_grace_period: env_duration_ms("PRESENCE_GRACE_MS", 10_000),

            typing_debounce: env_duration_ms("TYPING_DEBOUNCE_MS", 300),
            read_receipt_throttle: env_duration_ms("READ_RECEIPT_THROTTLE_MS", 200),
            presence_batch_window: env_duration_ms("PRESENCE_BATCH_MS", 100),
            reaction_batch_window: env_duration_ms("REACTION_BATCH_MS", 50),

            offline_queue_capacity: env_or("OFFLINE_QUEUE_CAPACITY", "1000")
                .parse()
                .unwrap_or(1000),

            cache_deadline: Duration::from_millis(500),
            repository_deadline: Duration::from_secs(5),
        })
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            database_url: "postgres://x".into(),
            cache_url: None,
            jwt_secret: "s".into(),
            access_token_ttl: Duration::from_secs(900),
            refresh_token_ttl: Duration::from_secs(604_800),
            server_host: "127.0.0.1".into(),
            server_port: 8080,
            allowed_origins: vec![],
            is_dev: true,
            push_public_key: None,
            push_private_key: None,
            push_subject: None,
            push_timeout: Duration::from_secs(2),
            push_max_retries: 5,
            away_threshold: Duration::from_secs(600),
            presence_grace_period: Duration::from_secs(10),
            typing_debounce: Duration::from_millis(300),
            read_receipt_throttle: Duration::from_millis(200),
            presence_batch_window: Duration::from_millis(100),
            reaction_batch_window: Duration::from_millis(50),
            offline_queue_capacity: 1000,
            cache_deadline: Duration::from_millis(500),
            repository_deadline: Duration::from_secs(5),
        }
    }

    #[test]
    fn server_addr_joins_host_and_port() {
        let config = Config {
            server_host: "0.0.0.0".into(),
            server_port: 9000,
            ..test_config()
        };
        assert_eq!(config.server_addr(), "0.0.0.0:9000");
    }
}
