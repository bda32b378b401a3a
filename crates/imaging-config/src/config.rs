use imaging_types::{CacheOption, CreateOptions};
use serde::{Deserialize, Serialize};
use std::num::{NonZeroU32, NonZeroUsize};
use std::path::Path;
use thiserror::Error;

pub const CONFIG_VERSION: u64 = 1;

/// Prefix of the environment variables understood by [`EngineConfig::apply_env`].
pub const ENV_PREFIX: &str = "IMAGING_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid value for `{key}`: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Unsupported config version {0}")]
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub version: u64,
    /// Cache option used when a caller passes `CacheOption::Default`.
    pub default_cache_option: CacheOption,
    /// Options OR-ed into every decoder request.
    pub default_create_options: CreateOptions,
    /// Disabling this makes every decoder request a cache miss.
    pub decoder_cache_enabled: bool,
    /// Rows per band in on-demand bitmaps.
    pub on_demand_band_height: u32,
    /// Bands kept alive per on-demand bitmap.
    pub on_demand_max_bands: usize,
    /// Read size used while draining non-seekable streams.
    pub stream_chunk_size: usize,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            default_cache_option: CacheOption::OnDemand,
            default_create_options: CreateOptions::NONE,
            decoder_cache_enabled: true,
            on_demand_band_height: 64,
            on_demand_max_bands: 32,
            stream_chunk_size: 64 * 1024,
            user_agent: format!("imaging/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file. Missing keys fall back to their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: EngineConfig = serde_json::from_str(&text)?;
        if config.version > CONFIG_VERSION {
            return Err(ConfigError::Version(config.version));
        }
        config.validate()?;
        Ok(config)
    }

    /// Defaults with `IMAGING_*` overrides from the process environment. Invalid
    /// variables are logged and skipped.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Defaults with the `IMAGING_*` overrides found in `vars`.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        let (errors, updated) = config.apply_env(vars);
        for error in &errors {
            tracing::warn!("ignoring environment override: {}", error);
        }
        if !updated.is_empty() {
            tracing::debug!(?updated, "applied environment overrides");
        }
        config
    }

    /// Resolves `CacheOption::Default` through the configured default.
    pub fn resolve_cache_option(&self, requested: CacheOption) -> CacheOption {
        match requested {
            CacheOption::Default => self.default_cache_option.effective(),
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.on_demand_band_height == 0 {
            return Err(ConfigError::InvalidValue {
                key: "on_demand_band_height".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.on_demand_max_bands == 0 {
            return Err(ConfigError::InvalidValue {
                key: "on_demand_max_bands".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.stream_chunk_size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "stream_chunk_size".into(),
                message: "must be at least 1".into(),
            });
        }
        Ok(())
    }

    /// Applies `IMAGING_<KEY>` variables. Returns the errors hit and the keys that
    /// were updated; a bad value leaves its field untouched.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> (Vec<ConfigError>, Vec<&'static str>)
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut errors = Vec::new();
        let mut updated = Vec::new();

        macro_rules! set_field {
            ($name:literal, $field:ident, $value:expr, $ty:ty) => {
                match $value.parse::<$ty>() {
                    Ok(val) => {
                        self.$field = val.into();
                        updated.push($name);
                    }
                    Err(e) => errors.push(ConfigError::InvalidValue {
                        key: $name.into(),
                        message: format!("{}", e),
                    }),
                }
            };
        }

        for (key, value) in vars {
            let Some(key) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref().trim();

            match key.to_ascii_lowercase().as_str() {
                "default_cache_option" => {
                    set_field!("default_cache_option", default_cache_option, value, CacheOption)
                }
                "default_create_options" => set_field!(
                    "default_create_options",
                    default_create_options,
                    value,
                    CreateOptions
                ),
                "decoder_cache_enabled" => {
                    set_field!("decoder_cache_enabled", decoder_cache_enabled, value, bool)
                }
                "on_demand_band_height" => set_field!(
                    "on_demand_band_height",
                    on_demand_band_height,
                    value,
                    NonZeroU32
                ),
                "on_demand_max_bands" => set_field!(
                    "on_demand_max_bands",
                    on_demand_max_bands,
                    value,
                    NonZeroUsize
                ),
                "stream_chunk_size" => {
                    set_field!("stream_chunk_size", stream_chunk_size, value, NonZeroUsize)
                }
                "user_agent" => {
                    self.user_agent = value.to_string();
                    updated.push("user_agent");
                }
                _ => {}
            }
        }

        (errors, updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.decoder_cache_enabled);
        assert_eq!(
            config.resolve_cache_option(CacheOption::Default),
            CacheOption::OnDemand
        );
        assert_eq!(
            config.resolve_cache_option(CacheOption::None),
            CacheOption::None
        );
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "default_cache_option": "OnLoad", "on_demand_band_height": 16 }}"#
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.default_cache_option, CacheOption::OnLoad);
        assert_eq!(config.on_demand_band_height, 16);
        assert_eq!(config.on_demand_max_bands, 32);
    }

    #[test]
    fn test_load_rejects_future_version() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "version": 99 }}"#).unwrap();
        assert!(matches!(
            EngineConfig::load(file.path()),
            Err(ConfigError::Version(99))
        ));
    }

    #[test]
    fn test_apply_env_updates_and_reports() {
        let mut config = EngineConfig::default();
        let (errors, updated) = config.apply_env([
            ("IMAGING_DEFAULT_CACHE_OPTION", "none"),
            ("IMAGING_DEFAULT_CREATE_OPTIONS", "DelayCreation|PreservePixelFormat"),
            ("IMAGING_ON_DEMAND_MAX_BANDS", "not-a-number"),
            ("UNRELATED", "1"),
        ]);

        assert_eq!(errors.len(), 1);
        assert_eq!(updated, vec!["default_cache_option", "default_create_options"]);
        assert_eq!(config.default_cache_option, CacheOption::None);
        assert!(
            config
                .default_create_options
                .contains(CreateOptions::DELAY_CREATION)
        );
        assert_eq!(config.on_demand_max_bands, 32);
    }

    #[test]
    fn test_from_vars_skips_invalid_overrides() {
        let config = EngineConfig::from_vars([
            ("IMAGING_DECODER_CACHE_ENABLED", "maybe"),
            ("IMAGING_ON_DEMAND_BAND_HEIGHT", "16"),
        ]);
        assert!(config.decoder_cache_enabled);
        assert_eq!(config.on_demand_band_height, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_env_rejects_zero_sizes() {
        let mut config = EngineConfig::default();
        let (errors, updated) = config.apply_env([("IMAGING_STREAM_CHUNK_SIZE", "0")]);
        assert!(matches!(errors[0], ConfigError::InvalidValue { .. }));
        assert!(updated.is_empty());
        assert_eq!(config.stream_chunk_size, 64 * 1024);
    }
}
