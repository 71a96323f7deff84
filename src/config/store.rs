use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::store::StoreIndex;
use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoreConfig {
    /// Databases Get and Action handlers receive a read-only connection to
    #[serde(default = "default_indices")]
    pub indices: Vec<StoreIndex>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            indices: default_indices(),
        }
    }
}

impl StoreConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.indices.contains(&StoreIndex::ConfigDb) {
            return Err(Error::Config(ConfigError::Message(
                "store.indices must include CONFIG_DB".to_string(),
            )));
        }
        Ok(())
    }
}

fn default_indices() -> Vec<StoreIndex> {
    StoreIndex::ALL.to_vec()
}
