//! Beacon Configuration
//!
//! Configuration structures with serde defaults, a loader that resolves the
//! config file location, environment overrides and a validator.

use crate::error::BeaconError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

/// Default gateway host
pub const DEFAULT_GATEWAY_HOST: &str = "127.0.0.1";
/// Default gateway port
pub const DEFAULT_GATEWAY_PORT: u16 = 8081;
/// Default WebSocket path
pub const DEFAULT_WS_PATH: &str = "/ws";
/// Default maximum inbound frame size (bytes)
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
/// Default shared store URL
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
/// Redis hash holding `userId -> [connectionId]`
pub const DEFAULT_ONLINE_USERS_KEY: &str = "online-users";
/// Boot-time connection attempts before giving up
pub const DEFAULT_CONNECT_ATTEMPTS: u32 = 5;
/// Default bus channels, one per event family
pub const DEFAULT_MESSAGE_CHANNEL: &str = "MESSAGE_CHANNEL";
pub const DEFAULT_FRIEND_CHANNEL: &str = "FRIEND_CHANNEL";
pub const DEFAULT_NOTIFICATION_CHANNEL: &str = "NOTIFICATION_CHANNEL";
/// Default broker topics shared with backend services
pub const DEFAULT_FRIEND_TOPIC: &str = "FRIEND_TOPIC";
pub const DEFAULT_MESSAGE_TOPIC: &str = "MESSAGE_TOPIC";
pub const DEFAULT_NOTIFICATION_TOPIC: &str = "NOTIFICATION_TOPIC";
/// Tag stamped on every message this gateway produces
pub const DEFAULT_PRODUCER_TAG: &str = "WS_SERVER";
/// Correlated request timeout (milliseconds)
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
/// Delay before announcing a user as online (milliseconds)
pub const DEFAULT_ONLINE_DELAY_MS: u64 = 10_000;
/// Delay before announcing a user as offline (milliseconds)
pub const DEFAULT_OFFLINE_DELAY_MS: u64 = 15_000;

// ============================================================================
// Helper functions for paths (required for serde defaults)
// ============================================================================

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn default_beacon_dir() -> PathBuf {
    home_dir().join(".beacon")
}

// ============================================================================
// Main Config
// ============================================================================

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Shared store configuration
    #[serde(default)]
    pub redis: RedisConfig,
    /// Event bus channels
    #[serde(default)]
    pub bus: BusConfig,
    /// Broker topics and correlation settings
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Presence debounce windows
    #[serde(default)]
    pub presence: PresenceConfig,
    /// Access token verification
    #[serde(default)]
    pub auth: AuthConfig,
}

// ============================================================================
// Gateway Config
// ============================================================================

/// Gateway server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "GatewayConfig::default_host")]
    pub host: String,
    #[serde(default = "GatewayConfig::default_port")]
    pub port: u16,
    /// WebSocket path; upgrades on any other path are refused
    #[serde(default = "GatewayConfig::default_ws_path")]
    pub ws_path: String,
    /// Identifier of this gateway process within the fleet
    #[serde(default = "GatewayConfig::default_instance_id")]
    pub instance_id: String,
    /// Maximum accepted client frame size (bytes)
    #[serde(default = "GatewayConfig::default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl GatewayConfig {
    fn default_host() -> String {
        DEFAULT_GATEWAY_HOST.to_string()
    }
    fn default_port() -> u16 {
        DEFAULT_GATEWAY_PORT
    }
    fn default_ws_path() -> String {
        DEFAULT_WS_PATH.to_string()
    }
    fn default_instance_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }
    fn default_max_frame_bytes() -> usize {
        DEFAULT_MAX_FRAME_BYTES
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            port: DEFAULT_GATEWAY_PORT,
            ws_path: Self::default_ws_path(),
            instance_id: Self::default_instance_id(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

// ============================================================================
// Redis Config
// ============================================================================

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "RedisConfig::default_url")]
    pub url: String,
    #[serde(default = "RedisConfig::default_online_users_key")]
    pub online_users_key: String,
    /// Attempts made at boot before the process gives up
    #[serde(default = "RedisConfig::default_connect_attempts")]
    pub connect_attempts: u32,
}

impl RedisConfig {
    fn default_url() -> String {
        DEFAULT_REDIS_URL.to_string()
    }
    fn default_online_users_key() -> String {
        DEFAULT_ONLINE_USERS_KEY.to_string()
    }
    fn default_connect_attempts() -> u32 {
        DEFAULT_CONNECT_ATTEMPTS
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: Self::default_url(),
            online_users_key: Self::default_online_users_key(),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
        }
    }
}

// ============================================================================
// Bus Config
// ============================================================================

/// Event bus channels, one per event family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    #[serde(default = "BusConfig::default_message_channel")]
    pub message_channel: String,
    #[serde(default = "BusConfig::default_friend_channel")]
    pub friend_channel: String,
    #[serde(default = "BusConfig::default_notification_channel")]
    pub notification_channel: String,
}

impl BusConfig {
    fn default_message_channel() -> String {
        DEFAULT_MESSAGE_CHANNEL.to_string()
    }
    fn default_friend_channel() -> String {
        DEFAULT_FRIEND_CHANNEL.to_string()
    }
    fn default_notification_channel() -> String {
        DEFAULT_NOTIFICATION_CHANNEL.to_string()
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            message_channel: Self::default_message_channel(),
            friend_channel: Self::default_friend_channel(),
            notification_channel: Self::default_notification_channel(),
        }
    }
}

// ============================================================================
// Broker Config
// ============================================================================

/// Broker topics shared with backend services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "BrokerConfig::default_friend_topic")]
    pub friend_topic: String,
    #[serde(default = "BrokerConfig::default_message_topic")]
    pub message_topic: String,
    #[serde(default = "BrokerConfig::default_notification_topic")]
    pub notification_topic: String,
    /// Value of `sendByProducer` on everything this gateway publishes
    #[serde(default = "BrokerConfig::default_producer_tag")]
    pub producer_tag: String,
    #[serde(default = "BrokerConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl BrokerConfig {
    fn default_friend_topic() -> String {
        DEFAULT_FRIEND_TOPIC.to_string()
    }
    fn default_message_topic() -> String {
        DEFAULT_MESSAGE_TOPIC.to_string()
    }
    fn default_notification_topic() -> String {
        DEFAULT_NOTIFICATION_TOPIC.to_string()
    }
    fn default_producer_tag() -> String {
        DEFAULT_PRODUCER_TAG.to_string()
    }
    fn default_request_timeout_ms() -> u64 {
        DEFAULT_REQUEST_TIMEOUT_MS
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Topics on which responses and unsolicited service events arrive
    pub fn inbound_topics(&self) -> Vec<String> {
        vec![
            self.friend_topic.clone(),
            self.message_topic.clone(),
            self.notification_topic.clone(),
        ]
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            friend_topic: Self::default_friend_topic(),
            message_topic: Self::default_message_topic(),
            notification_topic: Self::default_notification_topic(),
            producer_tag: Self::default_producer_tag(),
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

// ============================================================================
// Presence Config
// ============================================================================

/// Presence debounce windows
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceConfig {
    #[serde(default = "PresenceConfig::default_online_delay_ms")]
    pub online_delay_ms: u64,
    #[serde(default = "PresenceConfig::default_offline_delay_ms")]
    pub offline_delay_ms: u64,
}

impl PresenceConfig {
    fn default_online_delay_ms() -> u64 {
        DEFAULT_ONLINE_DELAY_MS
    }
    fn default_offline_delay_ms() -> u64 {
        DEFAULT_OFFLINE_DELAY_MS
    }

    pub fn online_delay(&self) -> Duration {
        Duration::from_millis(self.online_delay_ms)
    }

    pub fn offline_delay(&self) -> Duration {
        Duration::from_millis(self.offline_delay_ms)
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            online_delay_ms: DEFAULT_ONLINE_DELAY_MS,
            offline_delay_ms: DEFAULT_OFFLINE_DELAY_MS,
        }
    }
}

// ============================================================================
// Auth Config
// ============================================================================

/// Access token verification settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub audience: Option<String>,
}

// ============================================================================
// Config Loading and Validation
// ============================================================================

/// Configuration loader
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file or default locations
    pub fn load(path: Option<&str>) -> Result<Config, BeaconError> {
        let config_path = Self::resolve_config_path(path)?;
        Self::load_from(&config_path)
    }

    /// Load configuration, falling back to defaults when no file exists
    pub fn load_or_default(path: Option<&str>) -> Result<Config, BeaconError> {
        match Self::resolve_config_path(path) {
            Ok(config_path) => Self::load_from(&config_path),
            Err(BeaconError::Domain(crate::error::DomainError::ConfigNotFound { .. }))
                if path.is_none() =>
            {
                tracing::info!("No config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(e),
        }
    }

    pub fn load_from(config_path: &Path) -> Result<Config, BeaconError> {
        let content = std::fs::read_to_string(config_path)
            .map_err(|e| BeaconError::config_parse_error(format!("Failed to read: {}", e)))?;
        let config: Config = serde_yml::from_str(&content)
            .map_err(|e| BeaconError::config_parse_error(format!("Failed to parse: {}", e)))?;
        tracing::debug!(path = %config_path.display(), "Config loaded");
        Ok(config)
    }

    /// Resolve configuration file path
    fn resolve_config_path(path: Option<&str>) -> Result<PathBuf, BeaconError> {
        if let Some(p) = path {
            let p = PathBuf::from(p);
            if !p.exists() {
                return Err(BeaconError::config_not_found(p.display().to_string()));
            }
            return Ok(p);
        }

        let default_paths = [
            default_beacon_dir().join("config.yaml"),
            dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("beacon.yaml"),
            PathBuf::from("./beacon.yaml"),
        ];

        default_paths
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                BeaconError::config_not_found(
                    "Config not found. Run `beacon config-sample` or create ~/.beacon/config.yaml",
                )
            })
    }
}

/// Environment variables that override file values
pub const ENV_REDIS_URL: &str = "BEACON_REDIS_URL";
pub const ENV_PORT: &str = "BEACON_PORT";
pub const ENV_JWT_SECRET: &str = "BEACON_JWT_SECRET";
pub const ENV_INSTANCE_ID: &str = "BEACON_INSTANCE_ID";

impl Config {
    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), BeaconError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), BeaconError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_REDIS_URL) {
            self.redis.url = url;
        }
        if let Some(port) = lookup(ENV_PORT) {
            self.gateway.port = port
                .parse()
                .map_err(|_| BeaconError::config_invalid("gateway.port", format!("'{}' is not a port", port)))?;
        }
        if let Some(secret) = lookup(ENV_JWT_SECRET) {
            self.auth.jwt_secret = secret;
        }
        if let Some(instance_id) = lookup(ENV_INSTANCE_ID) {
            self.gateway.instance_id = instance_id;
        }
        Ok(())
    }
}

/// Configuration validator
pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &Config) -> Result<(), BeaconError> {
        if config.redis.url.trim().is_empty() {
            return Err(BeaconError::config_invalid("redis.url", "Redis url cannot be empty"));
        }
        if config.redis.online_users_key.trim().is_empty() {
            return Err(BeaconError::config_invalid(
                "redis.online_users_key",
                "Directory key cannot be empty",
            ));
        }

        let names = [
            ("bus.message_channel", &config.bus.message_channel),
            ("bus.friend_channel", &config.bus.friend_channel),
            ("bus.notification_channel", &config.bus.notification_channel),
            ("broker.friend_topic", &config.broker.friend_topic),
            ("broker.message_topic", &config.broker.message_topic),
            ("broker.notification_topic", &config.broker.notification_topic),
            ("broker.producer_tag", &config.broker.producer_tag),
        ];
        for (field, value) in names {
            if value.trim().is_empty() {
                return Err(BeaconError::config_invalid(field, "cannot be empty"));
            }
        }

        if config.broker.request_timeout_ms == 0 {
            return Err(BeaconError::config_invalid(
                "broker.request_timeout_ms",
                "Request timeout must be greater than zero",
            ));
        }

        // Offline window must outlast the online one to absorb reconnect flapping
        if config.presence.offline_delay_ms <= config.presence.online_delay_ms {
            return Err(BeaconError::config_invalid(
                "presence.offline_delay_ms",
                format!(
                    "Offline delay ({}ms) must be longer than online delay ({}ms)",
                    config.presence.offline_delay_ms, config.presence.online_delay_ms
                ),
            ));
        }

        if !config.gateway.ws_path.starts_with('/') {
            return Err(BeaconError::config_invalid(
                "gateway.ws_path",
                "WebSocket path must start with '/'",
            ));
        }

        if config.auth.jwt_secret.is_empty() {
            return Err(BeaconError::config_invalid(
                "auth.jwt_secret",
                "JWT secret cannot be empty (set BEACON_JWT_SECRET)",
            ));
        }

        Ok(())
    }
}

impl Config {
    /// Load configuration (defaults when no file is present), then apply env overrides
    pub fn load(path: &Option<String>) -> Result<Self, BeaconError> {
        let mut config = ConfigLoader::load_or_default(path.as_deref())?;
        config.apply_env()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<(), BeaconError> {
        let content = serde_yml::to_string(self)
            .map_err(|e| BeaconError::config_parse_error(format!("Serialization failed: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Generate a sample configuration
    pub fn sample() -> Self {
        Config {
            gateway: GatewayConfig {
                instance_id: "gateway-1".to_string(),
                ..GatewayConfig::default()
            },
            auth: AuthConfig {
                jwt_secret: "change-me".to_string(),
                issuer: None,
                audience: None,
            },
            ..Config::default()
        }
    }
}
