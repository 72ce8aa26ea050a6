use std::env;
use std::str::FromStr;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub ingest: IngestConfig,
    pub delivery: DeliveryConfig,
    pub delivery_retry: DeliveryRetryConfig,
    pub discord: DiscordConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Allowed CORS origin.
    pub frontend_url: String,
    /// Public address of this site, linked from message footers when set.
    pub site_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Shared bearer token required by `POST /api/ingest` when set.
    pub token: Option<String>,
    /// Directory of GQL JSON dumps polled by the background ingester. Disabled when unset.
    pub dir: Option<String>,
    pub poll_interval_seconds: u64,
    /// Delete stored games that are absent from a batch and already have no campaigns.
    pub prune_empty_games: bool,
    /// How many previous snapshots are loaded in parallel.
    pub load_concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Upper bound for a single webhook call.
    pub timeout_seconds: u64,
    /// Number of webhooks served in parallel during a cycle.
    pub concurrency: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryRetryConfig {
    /// Whether the delivery retry worker is enabled.
    pub enabled: bool,
    /// Initial backoff in seconds for the first retry attempt.
    pub initial_backoff_seconds: u64,
    /// How often (seconds) the worker polls for due tasks.
    pub poll_interval_seconds: u64,
    /// Maximum number of retry attempts before moving the task to DLQ.
    pub max_attempts: u32,
    /// Maximum parallel tasks processed by the retry worker.
    pub worker_concurrency: u32,
    /// Cap for exponential backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Queued deliveries older than this are dropped instead of retried.
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DiscordConfig {
    /// Name shown as the webhook author.
    pub username: String,
    pub avatar_url: Option<String>,
    /// Fetch webhook URLs with GET before registering them.
    pub verify_webhooks: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for webhook registration
    pub webhook_per_second: u32,
    /// Burst size for webhook registration
    pub webhook_burst: u32,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Read `name`, falling back to `default` when unset. Set but unparsable values are errors.
fn env_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(v) => v
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(name) {
        Ok(v) => parse_bool(&v).ok_or_else(|| ConfigError::InvalidValue(name.to_string())),
        Err(_) => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or(defaults.server.host),
                port: env_or("PORT", defaults.server.port)?,
                frontend_url: env::var("FRONTEND_URL").unwrap_or(defaults.server.frontend_url),
                site_url: env_opt("SITE_URL"),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or(defaults.database.url),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                )?,
            },
            ingest: IngestConfig {
                token: env_opt("INGEST_TOKEN"),
                dir: env_opt("INGEST_DIR"),
                poll_interval_seconds: env_or(
                    "INGEST_POLL_INTERVAL_SECONDS",
                    defaults.ingest.poll_interval_seconds,
                )?,
                prune_empty_games: env_bool(
                    "INGEST_PRUNE_EMPTY_GAMES",
                    defaults.ingest.prune_empty_games,
                )?,
                load_concurrency: env_or(
                    "INGEST_LOAD_CONCURRENCY",
                    defaults.ingest.load_concurrency,
                )?,
            },
            delivery: DeliveryConfig {
                timeout_seconds: env_or(
                    "DELIVERY_TIMEOUT_SECONDS",
                    defaults.delivery.timeout_seconds,
                )?,
                concurrency: env_or("DELIVERY_CONCURRENCY", defaults.delivery.concurrency)?,
            },
            delivery_retry: DeliveryRetryConfig {
                enabled: env_bool(
                    "DELIVERY_RETRY_ENABLED",
                    defaults.delivery_retry.enabled,
                )?,
                initial_backoff_seconds: env_or(
                    "DELIVERY_RETRY_INITIAL_BACKOFF_SECONDS",
                    defaults.delivery_retry.initial_backoff_seconds,
                )?,
                poll_interval_seconds: env_or(
                    "DELIVERY_RETRY_POLL_INTERVAL_SECONDS",
                    defaults.delivery_retry.poll_interval_seconds,
                )?,
                max_attempts: env_or(
                    "DELIVERY_RETRY_MAX_ATTEMPTS",
                    defaults.delivery_retry.max_attempts,
                )?,
                worker_concurrency: env_or(
                    "DELIVERY_RETRY_WORKER_CONCURRENCY",
                    defaults.delivery_retry.worker_concurrency,
                )?,
                max_backoff_seconds: env_or(
                    "DELIVERY_RETRY_MAX_BACKOFF_SECONDS",
                    defaults.delivery_retry.max_backoff_seconds,
                )?,
                ttl_seconds: env_or(
                    "DELIVERY_RETRY_TTL_SECONDS",
                    defaults.delivery_retry.ttl_seconds,
                )?,
            },
            discord: DiscordConfig {
                username: env::var("DISCORD_USERNAME").unwrap_or(defaults.discord.username),
                avatar_url: env_opt("DISCORD_AVATAR_URL"),
                verify_webhooks: env_bool(
                    "DISCORD_VERIFY_WEBHOOKS",
                    defaults.discord.verify_webhooks,
                )?,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: env_or(
                    "RATE_LIMIT_WEBHOOKS_PER_SECOND",
                    defaults.rate_limit.webhook_per_second,
                )?,
                webhook_burst: env_or(
                    "RATE_LIMIT_WEBHOOKS_BURST",
                    defaults.rate_limit.webhook_burst,
                )?,
            },
        };

        if config.ingest.load_concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "INGEST_LOAD_CONCURRENCY".to_string(),
            ));
        }
        if config.delivery.concurrency == 0 {
            return Err(ConfigError::InvalidValue("DELIVERY_CONCURRENCY".to_string()));
        }

        Ok(config)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                frontend_url: "http://localhost:3000".to_string(),
                site_url: None,
            },
            database: DatabaseConfig {
                url: "sqlite://data/drops.db".to_string(),
                max_connections: 5,
            },
            ingest: IngestConfig {
                token: None,
                dir: None,
                poll_interval_seconds: 300,
                prune_empty_games: false,
                load_concurrency: 8,
            },
            delivery: DeliveryConfig {
                timeout_seconds: 10,
                concurrency: 8,
            },
            delivery_retry: DeliveryRetryConfig {
                enabled: true,
                initial_backoff_seconds: 30,
                poll_interval_seconds: 5,
                max_attempts: 5,
                worker_concurrency: 10,
                max_backoff_seconds: 3600,
                ttl_seconds: 86400,
            },
            discord: DiscordConfig {
                username: "Twitch Drops".to_string(),
                avatar_url: None,
                verify_webhooks: false,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 2,
                webhook_burst: 10,
            },
        }
    }
}
