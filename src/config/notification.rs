use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;

use crate::Error;
use crate::Result;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NotificationConfig {
    /// Capacity of a session's output queue and of its key-space event queue, in items
    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    /// Concurrent subscription sessions allowed; 0 disables the limit
    #[serde(default)]
    pub max_sessions: usize,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: default_event_buffer_size(),
            max_sessions: 0,
        }
    }
}

impl NotificationConfig {
    pub fn validate(&self) -> Result<()> {
        if self.event_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "notification.event_buffer_size must be > 0".to_string(),
            )));
        }
        Ok(())
    }

    pub fn is_session_limited(&self) -> bool {
        self.max_sessions > 0
    }
}

fn default_event_buffer_size() -> usize {
    1024
}
