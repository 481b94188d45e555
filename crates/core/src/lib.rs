pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    AuthConfig, BrokerConfig, BusConfig, Config, ConfigLoader, ConfigValidator, GatewayConfig,
    PresenceConfig, RedisConfig,
};
pub use error::{BeaconError, DomainError, InfraError, Result};
