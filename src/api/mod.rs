//! Caller-facing request and response types.


use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::Principal;
use crate::handler::PreferredStreamType;
use crate::handler::SubscribeOptions;
use crate::handler::Verb;
use crate::store::WatchKey;
use crate::Error;
use crate::ErrorSource;

/// Body of a Create, Update, Replace or Delete request.
#[derive(Debug, Clone, Default)]
pub struct SetRequest {
    pub path: String,
    /// JSON document; empty for Delete
    pub payload: Bytes,
    pub principal: Principal,
}

impl SetRequest {
    pub fn new(
        path: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
            principal: Principal::default(),
        }
    }

    pub fn with_principal(
        mut self,
        principal: Principal,
    ) -> Self {
        self.principal = principal;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetResponse {
    pub path: String,
    /// Rows written or removed by the committed transaction
    pub affected: Vec<WatchKey>,
}

#[derive(Debug, Clone, Default)]
pub struct GetRequest {
    pub path: String,
    pub principal: Principal,
}

impl GetRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            principal: Principal::default(),
        }
    }

    pub fn with_principal(
        mut self,
        principal: Principal,
    ) -> Self {
        self.principal = principal;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResponse {
    pub path: String,
    pub payload: Bytes,
}

pub type ActionRequest = SetRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionResponse {
    pub path: String,
    pub payload: Bytes,
}

/// Error attached to one bulk slot or one subscribed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub source: ErrorSource,
    pub message: String,
}

impl From<&Error> for ItemError {
    fn from(e: &Error) -> Self {
        Self {
            source: e.error_source(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BulkItem {
    pub path: String,
    pub payload: Bytes,
}

impl BulkItem {
    pub fn new(
        path: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
        }
    }
}

/// Heterogeneous writes applied in one transaction. Items run in the order
/// Delete, Replace, Update, Create; within a verb in list order.
#[derive(Debug, Clone, Default)]
pub struct BulkRequest {
    pub delete: Vec<BulkItem>,
    pub replace: Vec<BulkItem>,
    pub update: Vec<BulkItem>,
    pub create: Vec<BulkItem>,
    pub principal: Principal,
}

impl BulkRequest {
    pub const VERB_ORDER: [Verb; 4] = [Verb::Delete, Verb::Replace, Verb::Update, Verb::Create];

    pub fn items(
        &self,
        verb: Verb,
    ) -> &[BulkItem] {
        match verb {
            Verb::Delete => &self.delete,
            Verb::Replace => &self.replace,
            Verb::Update => &self.update,
            Verb::Create => &self.create,
            _ => &[],
        }
    }

    pub fn len(&self) -> usize {
        Self::VERB_ORDER.iter().map(|v| self.items(*v).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemStatus {
    Ok,
    Failed(ItemError),
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub path: String,
    pub status: ItemStatus,
}

/// Per-item outcome, one slot per request item in the same layout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkResponse {
    pub delete: Vec<BulkItemResult>,
    pub replace: Vec<BulkItemResult>,
    pub update: Vec<BulkItemResult>,
    pub create: Vec<BulkItemResult>,
}

impl BulkResponse {
    /// Every slot starts out not attempted.
    pub fn pending(request: &BulkRequest) -> Self {
        let slots = |items: &[BulkItem]| {
            items
                .iter()
                .map(|item| BulkItemResult {
                    path: item.path.clone(),
                    status: ItemStatus::NotAttempted,
                })
                .collect()
        };
        Self {
            delete: slots(&request.delete),
            replace: slots(&request.replace),
            update: slots(&request.update),
            create: slots(&request.create),
        }
    }

    pub fn slots(
        &self,
        verb: Verb,
    ) -> &[BulkItemResult] {
        match verb {
            Verb::Delete => &self.delete,
            Verb::Replace => &self.replace,
            Verb::Update => &self.update,
            Verb::Create => &self.create,
            _ => &[],
        }
    }

    pub(crate) fn set_status(
        &mut self,
        verb: Verb,
        index: usize,
        status: ItemStatus,
    ) {
        let slots = match verb {
            Verb::Delete => &mut self.delete,
            Verb::Replace => &mut self.replace,
            Verb::Update => &mut self.update,
            Verb::Create => &mut self.create,
            _ => return,
        };
        if let Some(slot) = slots.get_mut(index) {
            slot.status = status;
        }
    }

    /// First failed slot, in execution order.
    pub fn failed(&self) -> Option<(Verb, &BulkItemResult)> {
        BulkRequest::VERB_ORDER.iter().find_map(|verb| {
            self.slots(*verb)
                .iter()
                .find(|slot| matches!(slot.status, ItemStatus::Failed(_)))
                .map(|slot| (*verb, slot))
        })
    }

    pub fn is_ok(&self) -> bool {
        BulkRequest::VERB_ORDER
            .iter()
            .all(|verb| self.slots(*verb).iter().all(|slot| slot.status == ItemStatus::Ok))
    }
}

/// Opens a subscription session over `paths`.
///
/// Items are pushed into `output`; cancelling `stop` ends the session.
#[derive(Debug, Clone)]
pub struct SubscribeRequest {
    pub paths: Vec<String>,
    pub output: mpsc::Sender<SubscribeResponse>,
    pub stop: CancellationToken,
    pub principal: Principal,
}

/// One item of a subscription stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeResponse {
    pub path: String,
    /// JSON snapshot of `path`; empty when the data no longer exists
    pub payload: Bytes,
    pub timestamp_nanos: u64,
    /// Set on the last initial snapshot and on every item after it
    pub sync_complete: bool,
    /// Set on the final item of a session ended by a backend error
    pub terminated: bool,
}

/// Streaming capabilities of one requested path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeCapability {
    pub path: String,
    pub on_change_supported: bool,
    pub min_interval_secs: u32,
    pub preferred: PreferredStreamType,
    /// Why the path cannot be streamed
    pub error: Option<ItemError>,
}

impl SubscribeCapability {
    pub(crate) fn supported(
        path: &str,
        options: SubscribeOptions,
    ) -> Self {
        Self {
            path: path.to_string(),
            on_change_supported: options.on_change_supported,
            min_interval_secs: options.min_interval_secs,
            preferred: options.preferred,
            error: None,
        }
    }

    pub(crate) fn failed(
        path: &str,
        error: &Error,
    ) -> Self {
        Self {
            path: path.to_string(),
            on_change_supported: false,
            min_interval_secs: 0,
            preferred: PreferredStreamType::Sample,
            error: Some(error.into()),
        }
    }

    pub fn is_supported(&self) -> bool {
        self.error.is_none()
    }
}
