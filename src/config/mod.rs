use std::env;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port: {0}")]
    InvalidPort(String),
    #[error("JWKS_URL is required")]
    EmptyJwksUrl,
    #[error("at least one durable-bus broker is required")]
    EmptyBrokers,
    #[error("pubsub address is required")]
    EmptyPubSubAddr,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_as_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Clone, Debug)]
pub struct Config {
    pub app_name: String,
    pub server_host: String,
    pub server_port: u16,

    pub jwks_url: String,
    pub jwks_refresh_interval: Duration,

    pub durable_brokers: Vec<String>,
    pub durable_topic: String,

    pub pubsub_addr: String,
    pub pubsub_password: Option<String>,
    pub pubsub_db: i64,
    pub deliver_channel: String,
    pub presence_channel: String,

    pub log_level: String,

    pub presence_heartbeat_enabled: bool,
    pub presence_heartbeat_interval: Duration,

    pub shutdown_budget: Duration,
    pub connection_close_budget: Duration,
}

impl Config {
    /// Load configuration from the environment, applying defaults and
    /// rejecting malformed values: out-of-range port, empty JWKS URL, empty
    /// broker list, empty pubsub address.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let server_port_raw = env_or("SERVER_PORT", "7200");
        let server_port: u16 = server_port_raw
            .parse()
            .map_err(|_| ConfigError::InvalidPort(server_port_raw.clone()))?;

        let durable_brokers: Vec<String> = env_or("DURABLE_BUS_BROKERS", "localhost:9092")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let pubsub_addr = env_or("PUBSUB_ADDR", "localhost:6379");
        let jwks_url = env_or(
            "JWKS_URL",
            "http://localhost:7100/.well-known/jwks.json",
        );

        let config = Config {
            app_name: env_or("APP_NAME", "chat-gateway"),
            server_host: env_or("SERVER_HOST", "0.0.0.0"),
            server_port,

            jwks_url,
            jwks_refresh_interval: Duration::from_secs(env_as_u64("JWKS_REFRESH_SECS", 900)),

            durable_brokers,
            durable_topic: env_or("DURABLE_BUS_TOPIC", "chat-messages"),

            pubsub_addr,
            pubsub_password: env::var("PUBSUB_PASSWORD").ok().filter(|s| !s.is_empty()),
            pubsub_db: env_as_u64("PUBSUB_DB", 0) as i64,
            deliver_channel: env_or("PUBSUB_DELIVER_CHANNEL", "message-deliver"),
            presence_channel: env_or("PUBSUB_PRESENCE_CHANNEL", "presence-events"),

            log_level: env_or("LOG_LEVEL", "info"),

            presence_heartbeat_enabled: env_or("PRESENCE_HEARTBEAT_ENABLED", "true") == "true",
            presence_heartbeat_interval: Duration::from_secs(30),

            shutdown_budget: Duration::from_secs(15),
            connection_close_budget: Duration::from_secs(10),
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.server_port == 0 {
            return Err(ConfigError::InvalidPort(self.server_port.to_string()));
        }
        if self.jwks_url.trim().is_empty() {
            return Err(ConfigError::EmptyJwksUrl);
        }
        if self.durable_brokers.is_empty() {
            return Err(ConfigError::EmptyBrokers);
        }
        if self.pubsub_addr.trim().is_empty() {
            return Err(ConfigError::EmptyPubSubAddr);
        }
        Ok(())
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}
