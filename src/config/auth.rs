use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// When false every principal may perform every operation
    #[serde(default)]
    pub enabled: bool,

    /// Roles allowed to write, run actions and submit bulk requests
    #[serde(default = "default_write_roles")]
    pub write_roles: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            write_roles: default_write_roles(),
        }
    }
}

impl AuthConfig {
    pub fn validate(&self) -> Result<()> {
        if self.enabled && self.write_roles.is_empty() {
            return Err(Error::Config(ConfigError::Message(
                "auth.write_roles cannot be empty when auth is enabled".to_string(),
            )));
        }
        Ok(())
    }
}

fn default_write_roles() -> Vec<String> {
    vec!["admin".to_string()]
}
