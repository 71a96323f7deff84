//! Handler Registry
//!
//! Three process-scoped maps, each behind its own lock:
//! - path prefix → [`HandlerInfo`]
//! - handler type → [`HandlerFactory`]
//! - model name → [`ModelData`]
//!
//! Populated at startup; afterwards mutated only by [`HandlerRegistry::unregister`] and
//! [`HandlerRegistry::clear`].


use std::collections::BTreeMap;
use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;
use tracing::info;

use crate::handler::AppHandler;
use crate::store::Table;
use crate::ProtocolError;
use crate::Result;

/// Prefix consulted when no registered prefix matches a path.
pub const CATCH_ALL_PREFIX: &str = "*";

/// How a handler maps paths to store rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerMode {
    /// Handler code maps paths to rows itself
    Native,
    /// Mapping is derived from schema annotations
    Schema,
}

/// Static registration record for one path prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub prefix: String,
    pub handler_type: String,
    pub mode: HandlerMode,
    /// Tables every write transaction of this handler watches
    pub static_tables: Vec<Table>,
}

impl HandlerInfo {
    pub fn new(
        prefix: impl Into<String>,
        handler_type: impl Into<String>,
        mode: HandlerMode,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            handler_type: handler_type.into(),
            mode,
            static_tables: Vec::new(),
        }
    }

    pub fn with_static_tables(
        mut self,
        tables: impl IntoIterator<Item = Table>,
    ) -> Self {
        self.static_tables = tables.into_iter().collect();
        self
    }
}

pub type HandlerFactory = fn() -> Box<dyn AppHandler>;

/// One supported data model, as advertised to capability queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelData {
    pub name: String,
    pub org: String,
    pub version: String,
}

impl ModelData {
    pub fn new(
        name: impl Into<String>,
        org: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            org: org.into(),
            version: version.into(),
        }
    }
}

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, HandlerInfo>>,
    factories: RwLock<HashMap<String, HandlerFactory>>,
    models: RwLock<BTreeMap<String, ModelData>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.handlers.read().len())
            .field("factories", &self.factories.read().len())
            .field("models", &self.models.read().len())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        prefix: &str,
        info: HandlerInfo,
    ) -> Result<()> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(prefix) {
            return Err(ProtocolError::DuplicateRegistration {
                prefix: prefix.to_string(),
            }
            .into());
        }

        info!(prefix, handler_type = %info.handler_type, "Registered handler");
        handlers.insert(prefix.to_string(), info);
        Ok(())
    }

    /// Registers (or replaces) the constructor for one handler type.
    pub fn register_factory(
        &self,
        handler_type: &str,
        factory: HandlerFactory,
    ) {
        debug!(handler_type, "Registered handler factory");
        self.factories.write().insert(handler_type.to_string(), factory);
    }

    /// Longest registered prefix of `path`, falling back to the catch-all.
    pub fn resolve(
        &self,
        path: &str,
    ) -> Result<HandlerInfo> {
        if !path.starts_with('/') {
            return Err(ProtocolError::InvalidPath {
                path: path.to_string(),
                reason: "must start with '/'".to_string(),
            }
            .into());
        }
        let handlers = self.handlers.read();

        let best = handlers
            .iter()
            .filter(|(prefix, _)| prefix.as_str() != CATCH_ALL_PREFIX && path.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, info)| info)
            .or_else(|| handlers.get(CATCH_ALL_PREFIX));

        match best {
            Some(info) => Ok(info.clone()),
            None => Err(ProtocolError::NoHandlerForPath {
                path: path.to_string(),
            }
            .into()),
        }
    }

    /// Fresh, uninitialized handler of the given type.
    pub fn instantiate(
        &self,
        handler_type: &str,
    ) -> Result<Box<dyn AppHandler>> {
        match self.factories.read().get(handler_type) {
            Some(factory) => Ok(factory()),
            None => Err(ProtocolError::TypeMismatch {
                handler_type: handler_type.to_string(),
            }
            .into()),
        }
    }

    pub fn unregister(
        &self,
        prefix: &str,
    ) -> Option<HandlerInfo> {
        let removed = self.handlers.write().remove(prefix);
        if removed.is_some() {
            info!(prefix, "Unregistered handler");
        }
        removed
    }

    /// Drops every registration, factory and model.
    pub fn clear(&self) {
        self.handlers.write().clear();
        self.factories.write().clear();
        self.models.write().clear();
        debug!("Handler registry cleared");
    }

    pub fn register_model(
        &self,
        model: ModelData,
    ) {
        self.models.write().insert(model.name.clone(), model);
    }

    /// Supported models sorted by name.
    pub fn models(&self) -> Vec<ModelData> {
        self.models.read().values().cloned().collect()
    }

    pub fn prefixes(&self) -> Vec<String> {
        let mut prefixes: Vec<String> = self.handlers.read().keys().cloned().collect();
        prefixes.sort();
        prefixes
    }
}
