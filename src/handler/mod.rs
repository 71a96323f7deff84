//! Handler contract
//!
//! A handler ("app module") owns one configuration subtree. For every request the runtime
//! creates a fresh instance, calls [`AppHandler::initialize`] with the request context and
//! then drives it through a translate phase and a process phase:
//!
//! ```text
//! write:     translate_<verb>(read-only store) -> watch keys
//!            process_<verb>(transaction)       -> SetResult
//! get:       translate_get(stores) -> process_get(stores) -> JSON
//! action:    translate_action(stores) -> process_action(stores) -> JSON
//! subscribe: translate_subscribe(stores, path) -> options + notification descriptor
//! ```
//!
//! Translate must not mutate the store; process runs inside the transaction the runtime
//! opened with the translate-phase watch keys.

mod table_app;


use async_trait::async_trait;
use bytes::Bytes;

pub use table_app::*;

use crate::auth::Principal;
use crate::store::Key;
use crate::store::Store;
use crate::store::StoreIndex;
use crate::store::StoreSet;
use crate::store::Table;
use crate::store::WatchKey;
use crate::AppError;
use crate::Result;

/// Request verb a handler instance was created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Update,
    Replace,
    Delete,
    Get,
    Action,
    Subscribe,
}

impl Verb {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Replace => "replace",
            Verb::Delete => "delete",
            Verb::Get => "get",
            Verb::Action => "action",
            Verb::Subscribe => "subscribe",
        }
    }

    pub fn is_write(&self) -> bool {
        matches!(self, Verb::Create | Verb::Update | Verb::Replace | Verb::Delete)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a handler learns about the request it serves.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub path: String,
    /// JSON body for writes and actions; empty otherwise
    pub payload: Bytes,
    pub verb: Verb,
    pub principal: Principal,
    pub request_id: String,
}

impl RequestContext {
    /// Parses the payload as JSON; empty payloads are an error.
    pub fn payload_json(&self) -> Result<serde_json::Value> {
        if self.payload.is_empty() {
            return Err(AppError::InvalidArgs(format!("{}: empty payload", self.path)).into());
        }
        serde_json::from_slice(&self.payload)
            .map_err(|e| AppError::InvalidArgs(format!("{}: {e}", self.path)).into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetResult {
    /// Rows the process phase wrote or removed
    pub affected: Vec<WatchKey>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetResult {
    /// JSON document for the requested path
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionResult {
    pub payload: Bytes,
}

/// Streaming mode a path prefers when it cannot serve on-change updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreferredStreamType {
    OnChange,
    Sample,
}

/// Capabilities a handler reports for one subscribed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    pub on_change_supported: bool,
    /// Smallest sample interval the path supports, in seconds
    pub min_interval_secs: u32,
    pub preferred: PreferredStreamType,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            on_change_supported: true,
            min_interval_secs: 0,
            preferred: PreferredStreamType::OnChange,
        }
    }
}

/// Store region backing a subscribed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationSpec {
    pub table: Table,
    /// Row key; may contain wildcard components
    pub key: Key,
    pub index: StoreIndex,
    /// When false every change is emitted without comparing to the previous snapshot
    pub need_cache: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscribeTranslation {
    pub options: Option<SubscribeOptions>,
    pub descriptor: Option<NotificationSpec>,
}

#[async_trait]
pub trait AppHandler: Send + Sync {
    fn initialize(
        &mut self,
        ctx: RequestContext,
    ) -> Result<()>;

    async fn translate_create(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>>;

    async fn translate_update(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>>;

    async fn translate_replace(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>>;

    async fn translate_delete(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>>;

    async fn translate_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<()>;

    async fn translate_action(
        &mut self,
        _stores: &StoreSet,
    ) -> Result<()> {
        Err(AppError::NotSupported("action".to_string()).into())
    }

    async fn translate_subscribe(
        &mut self,
        stores: &StoreSet,
        path: &str,
    ) -> Result<SubscribeTranslation>;

    async fn process_create(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult>;

    async fn process_update(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult>;

    async fn process_replace(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult>;

    async fn process_delete(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult>;

    async fn process_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<GetResult>;

    async fn process_action(
        &mut self,
        _stores: &StoreSet,
    ) -> Result<ActionResult> {
        Err(AppError::NotSupported("action".to_string()).into())
    }
}

/// Runs the translate step matching a write verb.
pub(crate) async fn translate_write(
    handler: &mut dyn AppHandler,
    verb: Verb,
    store: &dyn Store,
) -> Result<Vec<WatchKey>> {
    match verb {
        Verb::Create => handler.translate_create(store).await,
        Verb::Update => handler.translate_update(store).await,
        Verb::Replace => handler.translate_replace(store).await,
        Verb::Delete => handler.translate_delete(store).await,
        other => Err(AppError::NotSupported(format!("{other} is not a write verb")).into()),
    }
}

/// Runs the process step matching a write verb.
pub(crate) async fn process_write(
    handler: &mut dyn AppHandler,
    verb: Verb,
    tx: &dyn Store,
) -> Result<SetResult> {
    match verb {
        Verb::Create => handler.process_create(tx).await,
        Verb::Update => handler.process_update(tx).await,
        Verb::Replace => handler.process_replace(tx).await,
        Verb::Delete => handler.process_delete(tx).await,
        other => Err(AppError::NotSupported(format!("{other} is not a write verb")).into()),
    }
}
