use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::api::SubscribeResponse;
use crate::auth::Principal;
use crate::coordinator::TransactionCoordinator;
use crate::handler::NotificationSpec;
use crate::metrics::ACTIVE_SESSIONS;
use crate::metrics::NOTIFICATIONS_EMITTED;
use crate::metrics::NOTIFICATIONS_SUPPRESSED;
use crate::registry::HandlerInfo;
use crate::store::KeyPattern;
use crate::store::KeySpaceEvent;
use crate::store::KeySpaceEventKind;
use crate::store::KeySpaceReceiver;
use crate::store::StoreClient;
use crate::store::SubscriptionHandle;
use crate::store::WatchKey;
use crate::utils::time::now_nanos;
use crate::Result;

pub(crate) type SessionId = u64;

/// Watched store region of one subscribed path.
#[derive(Debug, Clone)]
pub(crate) struct Descriptor {
    pub(crate) path: String,
    pub(crate) info: HandlerInfo,
    pub(crate) spec: NotificationSpec,
    pub(crate) handle: Option<SubscriptionHandle>,
    /// Last emitted snapshot; `None` until primed
    pub(crate) cache: Option<Bytes>,
}

impl Descriptor {
    pub(crate) fn pattern(&self) -> KeyPattern {
        KeyPattern::new(self.spec.table.clone(), self.spec.key.clone())
    }

    fn watches(
        &self,
        handle: SubscriptionHandle,
        row: &WatchKey,
    ) -> bool {
        self.handle == Some(handle) && self.pattern().matches(&row.table, &row.key)
    }
}

#[derive(Debug)]
struct SessionRecord {
    handles: Vec<SubscriptionHandle>,
    paths: Vec<String>,
}

/// Global lookup chain from low-level subscription to owning session.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionTables {
    sessions: HashMap<SessionId, SessionRecord>,
    owners: HashMap<SubscriptionHandle, SessionId>,
}

impl SubscriptionTables {
    pub(crate) fn insert(
        &mut self,
        id: SessionId,
        handles: Vec<SubscriptionHandle>,
        paths: Vec<String>,
    ) {
        for handle in &handles {
            self.owners.insert(*handle, id);
        }
        self.sessions.insert(id, SessionRecord { handles, paths });
    }

    /// Drops the session and every handle it owns; returns the handles to unsubscribe.
    pub(crate) fn remove(
        &mut self,
        id: SessionId,
    ) -> Vec<SubscriptionHandle> {
        let Some(record) = self.sessions.remove(&id) else {
            return Vec::new();
        };
        for handle in &record.handles {
            self.owners.remove(handle);
        }
        trace!(session_id = id, paths = ?record.paths, "Session removed from lookup tables");
        record.handles
    }

    pub(crate) fn owner(
        &self,
        handle: SubscriptionHandle,
    ) -> Option<SessionId> {
        self.owners.get(&handle).copied()
    }

    pub(crate) fn len(&self) -> usize {
        self.sessions.len()
    }
}

/// Unsubscribes every handle, logging failures.
pub(crate) fn unsubscribe_all(
    client: &dyn StoreClient,
    handles: &[SubscriptionHandle],
) {
    for handle in handles {
        if let Err(e) = client.unsubscribe_key_space(*handle) {
            warn!(%handle, error = %e, "Unsubscribe failed");
        }
    }
}

/// Dispatch task of one subscription session.
pub(crate) struct SessionTask {
    pub(crate) id: SessionId,
    pub(crate) coordinator: Arc<TransactionCoordinator>,
    pub(crate) tables: Arc<Mutex<SubscriptionTables>>,
    pub(crate) descriptors: Vec<Descriptor>,
    pub(crate) principal: Principal,
    pub(crate) events: KeySpaceReceiver,
    pub(crate) output: mpsc::Sender<SubscribeResponse>,
    pub(crate) stop: CancellationToken,
    pub(crate) shutdown: CancellationToken,
}

impl SessionTask {
    pub(crate) async fn run(mut self) {
        info!(session_id = self.id, descriptors = self.descriptors.len(), "Subscription session started");

        if self.prime().await {
            self.stream().await;
        }

        self.teardown();
    }

    /// Emits one snapshot per descriptor. Returns false when the session must stop.
    async fn prime(&mut self) -> bool {
        let mut snapshots = Vec::with_capacity(self.descriptors.len());
        for i in 0..self.descriptors.len() {
            match self.recompute(i).await {
                Ok(payload) => {
                    self.descriptors[i].cache = Some(payload.clone());
                    snapshots.push((self.descriptors[i].path.clone(), payload));
                }
                Err(e) => warn!(
                    session_id = self.id,
                    path = %self.descriptors[i].path,
                    error = %e,
                    "Initial snapshot failed"
                ),
            }
        }

        if snapshots.is_empty() {
            let path = self.descriptors.first().map(|d| d.path.clone()).unwrap_or_default();
            self.emit_terminal(path, false).await;
            return false;
        }

        let last = snapshots.len() - 1;
        for (n, (path, payload)) in snapshots.into_iter().enumerate() {
            let item = SubscribeResponse {
                path,
                payload,
                timestamp_nanos: now_nanos(),
                sync_complete: n == last,
                terminated: false,
            };
            if !self.emit(item, "sync").await {
                return false;
            }
        }
        debug!(session_id = self.id, "Initial sync complete");
        true
    }

    async fn stream(&mut self) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    debug!(session_id = self.id, "Stop signal received");
                    break;
                }
                _ = self.shutdown.cancelled() => {
                    debug!(session_id = self.id, "Engine shutting down");
                    break;
                }
                event = self.events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if !self.handle_event(event).await {
                break;
            }
        }
    }

    /// Returns false when the session must stop.
    async fn handle_event(
        &mut self,
        event: KeySpaceEvent,
    ) -> bool {
        if self.tables.lock().owner(event.handle) != Some(self.id) {
            trace!(session_id = self.id, handle = %event.handle, "Event for a handle this session no longer owns");
            return true;
        }

        match (event.kind, &event.row) {
            (KeySpaceEventKind::SubscriptionClosed, _) => true,
            (KeySpaceEventKind::SubscriptionError, _) => {
                let path = self
                    .descriptors
                    .iter()
                    .find(|d| d.handle == Some(event.handle))
                    .map(|d| d.path.clone())
                    .unwrap_or_default();
                warn!(session_id = self.id, handle = %event.handle, %path, "Key-space subscription failed");
                self.emit_terminal(path, true).await;
                false
            }
            (KeySpaceEventKind::Overflow, _) => {
                debug!(session_id = self.id, handle = %event.handle, "Events dropped; resyncing subscription");
                let owned: Vec<usize> = (0..self.descriptors.len())
                    .filter(|i| self.descriptors[*i].handle == Some(event.handle))
                    .collect();
                self.refresh(owned).await
            }
            (_, Some(row)) => {
                let matching: Vec<usize> = (0..self.descriptors.len())
                    .filter(|i| self.descriptors[*i].watches(event.handle, row))
                    .collect();
                self.refresh(matching).await
            }
            (kind, None) => {
                trace!(session_id = self.id, ?kind, "Row event without a row");
                true
            }
        }
    }

    /// Recomputes the given descriptors and emits the snapshots that changed.
    async fn refresh(
        &mut self,
        indices: Vec<usize>,
    ) -> bool {
        for i in indices {
            let payload = match self.recompute(i).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(session_id = self.id, path = %self.descriptors[i].path, error = %e, "Recompute failed");
                    continue;
                }
            };

            let descriptor = &mut self.descriptors[i];
            if descriptor.spec.need_cache && descriptor.cache.as_ref() == Some(&payload) {
                NOTIFICATIONS_SUPPRESSED
                    .with_label_values(&[descriptor.spec.index.name()])
                    .inc();
                trace!(session_id = self.id, path = %descriptor.path, "Snapshot unchanged");
                continue;
            }
            descriptor.cache = Some(payload.clone());

            let item = SubscribeResponse {
                path: descriptor.path.clone(),
                payload,
                timestamp_nanos: now_nanos(),
                sync_complete: true,
                terminated: false,
            };
            if !self.emit(item, "update").await {
                return false;
            }
        }
        true
    }

    /// Re-runs the Get path of descriptor `i`; a vanished resource is an empty snapshot.
    async fn recompute(
        &self,
        i: usize,
    ) -> Result<Bytes> {
        let descriptor = &self.descriptors[i];
        match self
            .coordinator
            .read_payload(&descriptor.info, &descriptor.path, &self.principal)
            .await
        {
            Ok(payload) => Ok(payload),
            Err(e) if e.is_not_found() => Ok(Bytes::new()),
            Err(e) => Err(e),
        }
    }

    async fn emit_terminal(
        &self,
        path: String,
        sync_complete: bool,
    ) {
        let item = SubscribeResponse {
            path,
            payload: Bytes::new(),
            timestamp_nanos: now_nanos(),
            sync_complete,
            terminated: true,
        };
        self.emit(item, "terminal").await;
    }

    /// Pushes one item unless the session is being stopped. Returns false when the item
    /// could not be delivered.
    async fn emit(
        &self,
        item: SubscribeResponse,
        phase: &'static str,
    ) -> bool {
        let path = item.path.clone();
        let sent = tokio::select! {
            biased;
            _ = self.stop.cancelled() => false,
            _ = self.shutdown.cancelled() => false,
            sent = self.output.send(item) => sent.is_ok(),
        };

        if sent {
            NOTIFICATIONS_EMITTED.with_label_values(&[phase]).inc();
            trace!(session_id = self.id, %path, phase, "Notification emitted");
        } else {
            debug!(session_id = self.id, %path, "Output closed or session stopping");
        }
        sent
    }

    fn teardown(&mut self) {
        {
            let mut tables = self.tables.lock();
            let handles = tables.remove(self.id);
            unsubscribe_all(self.coordinator.client(), &handles);
        }
        self.events.close();
        ACTIVE_SESSIONS.dec();
        info!(session_id = self.id, "Subscription session stopped");
    }
}
