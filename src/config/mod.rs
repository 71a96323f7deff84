//! Configuration management for the translation runtime.
//!
//! Provides hierarchical configuration loading and validation with:
//! - Default values as code base
//! - Configuration file support
//! - Environment variable overrides
//! - Section-wise validation
mod auth;
mod monitoring;
mod notification;
mod store;

pub use auth::*;
pub use monitoring::*;
pub use notification::*;
pub use store::*;


use std::env;
use std::fmt::Debug;

use config::Config;
use config::Environment;
use config::File;
use serde::Deserialize;
use serde::Serialize;

use crate::Result;

/// Prefix of environment variables overriding configuration values.
pub const ENV_PREFIX: &str = "TRANSLIB";

/// Main configuration container
///
/// Combines all section configurations with hierarchical override support:
/// 1. Default values from code implementation
/// 2. Configuration file specified by `CONFIG_PATH`
/// 3. Environment variables (highest priority)
#[derive(Serialize, Deserialize, Clone, Default)]
pub struct TranslibConfig {
    /// Store connections opened by read paths
    #[serde(default)]
    pub store: StoreConfig,
    /// Subscription session limits
    #[serde(default)]
    pub notification: NotificationConfig,
    /// Write authorization
    #[serde(default)]
    pub auth: AuthConfig,
    /// Prometheus exporter
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

impl Debug for TranslibConfig {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("TranslibConfig")
            .field("store", &self.store)
            .field("notification", &self.notification)
            .field("auth_enabled", &self.auth.enabled)
            .field("monitoring", &self.monitoring)
            .finish_non_exhaustive()
    }
}

impl TranslibConfig {
    /// Loads configuration from hierarchical sources without validation.
    ///
    /// Sources are merged in the following order (later sources override earlier):
    /// 1. Type defaults
    /// 2. Configuration file from `CONFIG_PATH` environment variable (if set)
    /// 3. Environment variables with `TRANSLIB__` prefix
    ///
    /// Callers must call `validate()` once all overrides are applied.
    ///
    /// # Examples
    /// ```ignore
    /// std::env::set_var("TRANSLIB__NOTIFICATION__MAX_SESSIONS", "64");
    /// let cfg = TranslibConfig::new()?.validate()?;
    /// ```
    pub fn new() -> Result<Self> {
        let mut builder = Config::builder().add_source(Config::try_from(&Self::default())?);

        if let Ok(config_path) = env::var("CONFIG_PATH") {
            builder = builder.add_source(File::with_name(&config_path).required(true));
        }

        let config: Self = builder.add_source(env_source()).build()?.try_deserialize()?;
        Ok(config)
    }

    /// Applies additional overrides from file without validation.
    ///
    /// Environment variables still take precedence over the file.
    pub fn with_override_config(
        &self,
        path: &str,
    ) -> Result<Self> {
        let config: Self = Config::builder()
            .add_source(Config::try_from(self)?)
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Validates every section and returns the validated instance.
    pub fn validate(self) -> Result<Self> {
        self.store.validate()?;
        self.notification.validate()?;
        self.auth.validate()?;
        self.monitoring.validate()?;
        Ok(self)
    }
}

fn env_source() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        .ignore_empty(true)
        .try_parsing(true)
}
