//! In-memory store backend
//!
//! Every database keeps a monotonically increasing revision. Each write stamps the row it
//! touched and the row's table with the new revision, and the stamp survives deletion, so a
//! watcher can tell "never existed" from "was created and removed again".
//!
//! Transactions follow the WATCH/MULTI/EXEC model: writes issued after `start_tx` are
//! buffered on the connection and become visible to that connection's own reads
//! immediately; `commit_tx` re-checks every watched revision under the database write lock
//! and only then applies the buffer.
//!
//! Each connection also remembers the revision of every row and table it read. Those
//! observations are the baseline a later watch is checked against, so a caller that decided
//! what to write from an outdated read gets a conflict instead of overwriting newer data.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::store::Key;
use crate::store::KeyPattern;
use crate::store::KeySpaceEvent;
use crate::store::KeySpaceEventKind;
use crate::store::KeySpaceSink;
use crate::store::Store;
use crate::store::StoreClient;
use crate::store::StoreIndex;
use crate::store::StoreOptions;
use crate::store::SubscriptionHandle;
use crate::store::Table;
use crate::store::TableData;
use crate::store::Value;
use crate::store::WatchKey;
use crate::BackendError;
use crate::Result;

#[derive(Debug, Default)]
struct DbState {
    tables: BTreeMap<Table, BTreeMap<Key, Value>>,
    row_revisions: HashMap<WatchKey, u64>,
    table_revisions: HashMap<Table, u64>,
    revision: u64,
}

impl DbState {
    fn row_revision(
        &self,
        row: &WatchKey,
    ) -> u64 {
        self.row_revisions.get(row).copied().unwrap_or(0)
    }

    fn table_revision(
        &self,
        table: &Table,
    ) -> u64 {
        self.table_revisions.get(table).copied().unwrap_or(0)
    }

    fn entry(
        &self,
        row: &WatchKey,
    ) -> Option<&Value> {
        self.tables.get(&row.table).and_then(|rows| rows.get(&row.key))
    }

    fn stamp(
        &mut self,
        row: &WatchKey,
    ) {
        self.revision += 1;
        self.row_revisions.insert(row.clone(), self.revision);
        self.table_revisions.insert(row.table.clone(), self.revision);
    }

    /// Applies one write and reports the key-space event it produced, if any.
    fn apply(
        &mut self,
        op: &PendingOp,
    ) -> Option<KeySpaceEventKind> {
        match op {
            PendingOp::Set(row, value) => {
                self.stamp(row);
                self.tables
                    .entry(row.table.clone())
                    .or_default()
                    .insert(row.key.clone(), value.clone());
                Some(KeySpaceEventKind::FieldSet)
            }
            PendingOp::Modify(row, value) => {
                self.stamp(row);
                self.tables
                    .entry(row.table.clone())
                    .or_default()
                    .entry(row.key.clone())
                    .or_default()
                    .merge(value);
                Some(KeySpaceEventKind::FieldSet)
            }
            PendingOp::Delete(row) => {
                let removed = self
                    .tables
                    .get_mut(&row.table)
                    .and_then(|rows| rows.remove(&row.key))
                    .is_some();
                if !removed {
                    return None;
                }
                self.stamp(row);
                self.prune_table(&row.table);
                Some(KeySpaceEventKind::KeyDelete)
            }
            PendingOp::DeleteFields(row, fields) => {
                let rows = self.tables.get_mut(&row.table)?;
                let value = rows.get_mut(&row.key)?;
                let mut changed = false;
                for field in fields {
                    changed |= value.remove(field).is_some();
                }
                if !changed {
                    return None;
                }
                let emptied = value.is_empty();
                if emptied {
                    rows.remove(&row.key);
                }
                self.stamp(row);
                self.prune_table(&row.table);
                Some(if emptied {
                    KeySpaceEventKind::KeyDelete
                } else {
                    KeySpaceEventKind::FieldDelete
                })
            }
        }
    }

    fn prune_table(
        &mut self,
        table: &Table,
    ) {
        if self.tables.get(table).is_some_and(|rows| rows.is_empty()) {
            self.tables.remove(table);
        }
    }
}

#[derive(Debug, Clone)]
enum PendingOp {
    Set(WatchKey, Value),
    Modify(WatchKey, Value),
    Delete(WatchKey),
    DeleteFields(WatchKey, Vec<String>),
}

impl PendingOp {
    fn row(&self) -> &WatchKey {
        match self {
            PendingOp::Set(row, _)
            | PendingOp::Modify(row, _)
            | PendingOp::Delete(row)
            | PendingOp::DeleteFields(row, _) => row,
        }
    }

    /// Replays this op over `current` for read-your-writes inside a transaction.
    fn overlay(
        &self,
        current: Option<Value>,
    ) -> Option<Value> {
        match self {
            PendingOp::Set(_, value) => Some(value.clone()),
            PendingOp::Modify(_, value) => {
                let mut merged = current.unwrap_or_default();
                merged.merge(value);
                Some(merged)
            }
            PendingOp::Delete(_) => None,
            PendingOp::DeleteFields(_, fields) => current.and_then(|mut v| {
                for f in fields {
                    v.remove(f);
                }
                (!v.is_empty()).then_some(v)
            }),
        }
    }
}

/// Revisions a connection saw on its first read of each row and table.
#[derive(Debug, Default)]
struct Observed {
    rows: HashMap<WatchKey, u64>,
    tables: HashMap<Table, u64>,
}

#[derive(Debug, Default)]
struct TxState {
    watched_rows: HashMap<WatchKey, u64>,
    watched_tables: HashMap<Table, u64>,
    ops: Vec<PendingOp>,
}

struct KeySpaceSubscriber {
    index: StoreIndex,
    patterns: Vec<KeyPattern>,
    sink: KeySpaceSink,
}

struct MemShared {
    dbs: HashMap<StoreIndex, RwLock<DbState>>,
    subscribers: DashMap<SubscriptionHandle, KeySpaceSubscriber>,
    next_handle: AtomicU64,
    reachable: AtomicBool,
    open_txs: AtomicUsize,
    max_open_txs: AtomicUsize,
    commits: AtomicU64,
}

impl MemShared {
    fn db(
        &self,
        index: StoreIndex,
    ) -> &RwLock<DbState> {
        // Every index is created in MemStoreClient::new
        &self.dbs[&index]
    }

    fn ensure_reachable(&self) -> Result<()> {
        if self.reachable.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(BackendError::Unreachable("in-memory store is offline".to_string()).into())
        }
    }

    /// Pushes a row change to every matching subscriber. Called with the database write
    /// lock held so subscribers observe commit order.
    fn publish(
        &self,
        index: StoreIndex,
        row: &WatchKey,
        kind: KeySpaceEventKind,
    ) {
        for sub in self.subscribers.iter() {
            if sub.index != index || !sub.patterns.iter().any(|p| p.matches(&row.table, &row.key)) {
                continue;
            }
            let event = KeySpaceEvent {
                handle: *sub.key(),
                row: Some(row.clone()),
                kind,
            };
            if !sub.sink.deliver(event) {
                trace!(handle = %sub.key(), "Key-space subscriber sink closed");
            }
        }
    }

    fn tx_opened(&self) {
        let now = self.open_txs.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_open_txs.fetch_max(now, Ordering::SeqCst);
    }

    fn tx_closed(&self) {
        self.open_txs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Store client backed by process memory; cheap to clone, all clones share data.
#[derive(Clone)]
pub struct MemStoreClient {
    shared: Arc<MemShared>,
}

impl Default for MemStoreClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemStoreClient {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemStoreClient")
            .field("subscribers", &self.shared.subscribers.len())
            .field("open_txs", &self.shared.open_txs)
            .finish_non_exhaustive()
    }
}

impl MemStoreClient {
    pub fn new() -> Self {
        let dbs = StoreIndex::ALL
            .iter()
            .map(|index| (*index, RwLock::new(DbState::default())))
            .collect();

        Self {
            shared: Arc::new(MemShared {
                dbs,
                subscribers: DashMap::new(),
                next_handle: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                open_txs: AtomicUsize::new(0),
                max_open_txs: AtomicUsize::new(0),
                commits: AtomicU64::new(0),
            }),
        }
    }

    /// Takes the backend offline (or back online). Offline backends refuse new
    /// connections and transaction starts.
    pub fn set_reachable(
        &self,
        reachable: bool,
    ) {
        self.shared.reachable.store(reachable, Ordering::Release);
    }

    /// Delivers a `SubscriptionError` event to one subscriber, as a broken backend
    /// connection would.
    pub fn fail_subscription(
        &self,
        handle: SubscriptionHandle,
    ) -> bool {
        match self.shared.subscribers.get(&handle) {
            Some(sub) => sub.sink.deliver(KeySpaceEvent {
                handle,
                row: None,
                kind: KeySpaceEventKind::SubscriptionError,
            }),
            None => false,
        }
    }

    /// Copy of one table, bypassing connections.
    pub fn dump_table(
        &self,
        index: StoreIndex,
        table: &Table,
    ) -> BTreeMap<Key, Value> {
        self.shared.db(index).read().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    pub fn subscription_handles(&self) -> Vec<SubscriptionHandle> {
        self.shared.subscribers.iter().map(|s| *s.key()).collect()
    }

    pub fn open_transactions(&self) -> usize {
        self.shared.open_txs.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously open transactions observed so far.
    pub fn max_concurrent_transactions(&self) -> usize {
        self.shared.max_open_txs.load(Ordering::SeqCst)
    }

    pub fn committed_transactions(&self) -> u64 {
        self.shared.commits.load(Ordering::SeqCst)
    }

    pub fn connect(
        &self,
        options: StoreOptions,
    ) -> MemStore {
        MemStore {
            options,
            shared: self.shared.clone(),
            tx: Mutex::new(None),
            observed: Mutex::new(Observed::default()),
        }
    }
}

#[async_trait]
impl StoreClient for MemStoreClient {
    async fn new_connection(
        &self,
        options: StoreOptions,
    ) -> Result<Box<dyn Store>> {
        self.shared.ensure_reachable()?;
        trace!(index = %options.index, read_only = options.read_only, "New connection");
        Ok(Box::new(self.connect(options)))
    }

    fn subscribe_key_space(
        &self,
        options: StoreOptions,
        patterns: Vec<KeyPattern>,
        sink: KeySpaceSink,
    ) -> Result<SubscriptionHandle> {
        self.shared.ensure_reachable()?;
        if patterns.is_empty() {
            return Err(BackendError::Subscription("no key patterns given".to_string()).into());
        }

        let handle = SubscriptionHandle(self.shared.next_handle.fetch_add(1, Ordering::Relaxed));
        debug!(%handle, index = %options.index, patterns = patterns.len(), "Key-space subscription opened");

        self.shared.subscribers.insert(
            handle,
            KeySpaceSubscriber {
                index: options.index,
                patterns,
                sink,
            },
        );
        Ok(handle)
    }

    fn unsubscribe_key_space(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<()> {
        match self.shared.subscribers.remove(&handle) {
            Some((_, sub)) => {
                sub.sink.deliver(KeySpaceEvent {
                    handle,
                    row: None,
                    kind: KeySpaceEventKind::SubscriptionClosed,
                });
                debug!(%handle, "Key-space subscription closed");
                Ok(())
            }
            None => Err(BackendError::Subscription(format!("{handle} is not active")).into()),
        }
    }
}

/// One connection to an in-memory database.
pub struct MemStore {
    options: StoreOptions,
    shared: Arc<MemShared>,
    tx: Mutex<Option<TxState>>,
    observed: Mutex<Observed>,
}

impl std::fmt::Debug for MemStore {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("MemStore")
            .field("options", &self.options)
            .field("in_tx", &self.tx.lock().is_some())
            .finish()
    }
}

impl MemStore {
    fn db(&self) -> &RwLock<DbState> {
        self.shared.db(self.options.index)
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.options.read_only {
            return Err(BackendError::ReadOnly(self.options.index.name().to_string()).into());
        }
        Ok(())
    }

    /// Buffers `op` when a transaction is open, otherwise applies it immediately.
    fn write(
        &self,
        op: PendingOp,
    ) -> Result<()> {
        self.ensure_writable()?;

        let mut tx = self.tx.lock();
        if let Some(state) = tx.as_mut() {
            trace!(row = %op.row(), "Buffered write");
            state.ops.push(op);
            return Ok(());
        }
        drop(tx);

        self.shared.ensure_reachable()?;
        let mut db = self.db().write();
        if let Some(kind) = db.apply(&op) {
            self.shared.publish(self.options.index, op.row(), kind);

            // A connection's own write does not outdate what it read
            let row = op.row();
            let mut observed = self.observed.lock();
            if let Some(seen) = observed.rows.get_mut(row) {
                *seen = db.row_revision(row);
            }
            if let Some(seen) = observed.tables.get_mut(&row.table) {
                *seen = db.table_revision(&row.table);
            }
        }
        Ok(())
    }

    /// Adds rows and tables to the watch-set. The baseline is the revision this connection
    /// read earlier, or the current one when it never read them; a baseline that is already
    /// outdated is a conflict.
    fn watch(
        &self,
        state: &mut TxState,
        watch_keys: &[WatchKey],
        tables: &[Table],
    ) -> Result<()> {
        let db = self.db().read();
        let observed = self.observed.lock();

        for row in watch_keys {
            let current = db.row_revision(row);
            let seen = observed.rows.get(row).copied().unwrap_or(current);
            if seen != current {
                debug!(%row, seen, current, "Watch rejected: row changed since it was read");
                return Err(BackendError::TxConflict(row.to_string()).into());
            }
            state.watched_rows.entry(row.clone()).or_insert(seen);
        }
        for table in tables {
            let current = db.table_revision(table);
            let seen = observed.tables.get(table).copied().unwrap_or(current);
            if seen != current {
                debug!(%table, seen, current, "Watch rejected: table changed since it was read");
                return Err(BackendError::TxConflict(table.to_string()).into());
            }
            state.watched_tables.entry(table.clone()).or_insert(seen);
        }
        Ok(())
    }

    fn close_tx(&self) -> Option<TxState> {
        let state = self.tx.lock().take();
        if state.is_some() {
            self.shared.tx_closed();
        }
        state
    }
}

impl Drop for MemStore {
    fn drop(&mut self) {
        if self.close_tx().is_some() {
            warn!(index = %self.options.index, "Connection dropped with an open transaction; aborted");
        }
    }
}

#[async_trait]
impl Store for MemStore {
    fn options(&self) -> StoreOptions {
        self.options
    }

    async fn get_entry(
        &self,
        table: &Table,
        key: &Key,
    ) -> Result<Option<Value>> {
        let row = WatchKey::new(table.clone(), key.clone());
        let committed = {
            let db = self.db().read();
            let revision = db.row_revision(&row);
            self.observed.lock().rows.entry(row.clone()).or_insert(revision);
            db.entry(&row).cloned()
        };

        let tx = self.tx.lock();
        let Some(state) = tx.as_ref() else {
            return Ok(committed);
        };
        Ok(state
            .ops
            .iter()
            .filter(|op| op.row() == &row)
            .fold(committed, |current, op| op.overlay(current)))
    }

    async fn get_table(
        &self,
        table: &Table,
    ) -> Result<TableData> {
        let mut rows = {
            let db = self.db().read();
            let revision = db.table_revision(table);
            self.observed.lock().tables.entry(table.clone()).or_insert(revision);
            db.tables.get(table).cloned().unwrap_or_default()
        };

        if let Some(state) = self.tx.lock().as_ref() {
            for op in state.ops.iter().filter(|op| &op.row().table == table) {
                let key = &op.row().key;
                if let Some(value) = op.overlay(rows.remove(key)) {
                    rows.insert(key.clone(), value);
                }
            }
        }

        Ok(TableData {
            table: Some(table.clone()),
            rows,
        })
    }

    async fn set_entry(
        &self,
        table: &Table,
        key: &Key,
        value: Value,
    ) -> Result<()> {
        self.write(PendingOp::Set(WatchKey::new(table.clone(), key.clone()), value))
    }

    async fn mod_entry(
        &self,
        table: &Table,
        key: &Key,
        value: Value,
    ) -> Result<()> {
        self.write(PendingOp::Modify(WatchKey::new(table.clone(), key.clone()), value))
    }

    async fn delete_entry(
        &self,
        table: &Table,
        key: &Key,
    ) -> Result<()> {
        self.write(PendingOp::Delete(WatchKey::new(table.clone(), key.clone())))
    }

    async fn delete_entry_fields(
        &self,
        table: &Table,
        key: &Key,
        fields: Vec<String>,
    ) -> Result<()> {
        self.write(PendingOp::DeleteFields(
            WatchKey::new(table.clone(), key.clone()),
            fields,
        ))
    }

    async fn start_tx(
        &self,
        watch_keys: &[WatchKey],
        tables: &[Table],
    ) -> Result<()> {
        self.ensure_writable()?;
        self.shared.ensure_reachable()?;

        let mut tx = self.tx.lock();
        if tx.is_some() {
            return Err(BackendError::TxState("transaction already open").into());
        }

        let mut state = TxState::default();
        self.watch(&mut state, watch_keys, tables)?;
        *tx = Some(state);
        self.shared.tx_opened();

        trace!(
            index = %self.options.index,
            keys = watch_keys.len(),
            tables = tables.len(),
            "Transaction started"
        );
        Ok(())
    }

    async fn append_watch_tx(
        &self,
        watch_keys: &[WatchKey],
        tables: &[Table],
    ) -> Result<()> {
        let mut tx = self.tx.lock();
        let Some(state) = tx.as_mut() else {
            return Err(BackendError::TxState("no open transaction").into());
        };
        // Buffered writes are not stamped until commit, so rows this transaction already
        // wrote still carry their committed revision here.
        self.watch(state, watch_keys, tables)
    }

    async fn commit_tx(&self) -> Result<()> {
        let Some(state) = self.close_tx() else {
            return Err(BackendError::TxState("no open transaction").into());
        };
        self.shared.ensure_reachable()?;

        let mut db = self.db().write();

        for (row, seen) in &state.watched_rows {
            if db.row_revision(row) != *seen {
                debug!(%row, "Commit rejected: watched row changed");
                return Err(BackendError::TxConflict(row.to_string()).into());
            }
        }
        for (table, seen) in &state.watched_tables {
            if db.table_revision(table) != *seen {
                debug!(%table, "Commit rejected: watched table changed");
                return Err(BackendError::TxConflict(table.to_string()).into());
            }
        }

        for op in &state.ops {
            if let Some(kind) = db.apply(op) {
                self.shared.publish(self.options.index, op.row(), kind);
            }
        }
        self.shared.commits.fetch_add(1, Ordering::SeqCst);

        trace!(index = %self.options.index, ops = state.ops.len(), "Transaction committed");
        Ok(())
    }

    async fn abort_tx(&self) -> Result<()> {
        match self.close_tx() {
            Some(state) => {
                trace!(index = %self.options.index, dropped = state.ops.len(), "Transaction aborted");
                Ok(())
            }
            None => Err(BackendError::TxState("no open transaction").into()),
        }
    }
}
