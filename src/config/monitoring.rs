use std::path::PathBuf;

use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MonitoringConfig {
    #[serde(default)]
    pub prometheus_enabled: bool,

    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,

    /// Directory the daemon writes `translibd.log` into
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            prometheus_enabled: false,
            prometheus_port: default_prometheus_port(),
            log_dir: default_log_dir(),
        }
    }
}

impl MonitoringConfig {
    /// Fails on an empty log directory, or when the exporter is enabled on port 0 or a
    /// privileged port.
    pub fn validate(&self) -> Result<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(Error::Config(ConfigError::Message("log_dir cannot be empty".to_string())));
        }

        if !self.prometheus_enabled {
            if self.prometheus_port != default_prometheus_port() {
                warn!(
                    port = self.prometheus_port,
                    "prometheus_port configured but monitoring is disabled"
                );
            }
            return Ok(());
        }

        if self.prometheus_port == 0 {
            return Err(Error::Config(ConfigError::Message(
                "prometheus_port cannot be 0 when enabled".to_string(),
            )));
        }
        if self.prometheus_port < 1024 {
            return Err(Error::Config(ConfigError::Message(format!(
                "prometheus_port {} is a privileged port (requires root)",
                self.prometheus_port
            ))));
        }
        Ok(())
    }
}

fn default_prometheus_port() -> u16 {
    9091
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}
