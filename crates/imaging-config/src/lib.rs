pub mod config;

pub use config::{CONFIG_VERSION, ConfigError, ENV_PREFIX, EngineConfig};
