//! Application configuration

use std::env;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub log_format: LogFormat,

    // Authentication
    pub jwt_secret: String,
    pub identity_verify_url: Option<String>,
    pub publish_secret: Option<String>,

    // Live sync
    pub live: LiveSyncSettings,
}

/// Tunables for connection handling and delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSyncSettings {
    /// Bounded outbound queue capacity per connection
    pub queue_capacity: usize,
    /// Interval between keepalive pings
    pub keepalive_interval: Duration,
    /// A connection silent for longer than this is closed
    pub idle_timeout: Duration,
    /// Largest inbound frame accepted from clients
    pub max_message_bytes: usize,
}

impl Default for LiveSyncSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            keepalive_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(60),
            max_message_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = LiveSyncSettings::default();

        let live = LiveSyncSettings {
            queue_capacity: parse_or("LIVESYNC_QUEUE_CAPACITY", defaults.queue_capacity),
            keepalive_interval: Duration::from_secs(parse_or(
                "LIVESYNC_KEEPALIVE_INTERVAL_SECS",
                defaults.keepalive_interval.as_secs(),
            )),
            idle_timeout: Duration::from_secs(parse_or(
                "LIVESYNC_IDLE_TIMEOUT_SECS",
                defaults.idle_timeout.as_secs(),
            )),
            max_message_bytes: parse_or("LIVESYNC_MAX_MESSAGE_BYTES", defaults.max_message_bytes),
        };

        if live.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "LIVESYNC_QUEUE_CAPACITY must be greater than zero",
            ));
        }
        if live.keepalive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "LIVESYNC_KEEPALIVE_INTERVAL_SECS must be greater than zero",
            ));
        }
        if live.idle_timeout <= live.keepalive_interval {
            return Err(ConfigError::Invalid(
                "LIVESYNC_IDLE_TIMEOUT_SECS must exceed the keepalive interval",
            ));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            identity_verify_url: env::var("IDENTITY_VERIFY_URL")
                .ok()
                .filter(|url| !url.is_empty()),
            publish_secret: match env::var("PUBLISH_SECRET") {
                Ok(secret) if secret.is_empty() => None,
                Ok(secret) if secret.len() < 32 => {
                    return Err(ConfigError::WeakSecret(
                        "PUBLISH_SECRET must be at least 32 characters",
                    ));
                }
                Ok(secret) => Some(secret),
                Err(_) => None,
            },

            live,
        })
    }
}

fn parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}
