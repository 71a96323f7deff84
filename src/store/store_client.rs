//! Store client primitives
//!
//! [`StoreClient`] opens connections and manages key-space subscriptions;
//! [`Store`] is one connection. A read-write connection may carry at most one open
//! transaction at a time:
//! - `start_tx` records the watch-set and buffers later writes
//! - `append_watch_tx` widens the watch-set of the live transaction
//! - `commit_tx` applies buffered writes only if nothing watched changed
//! - `abort_tx` drops buffered writes
//!
//! Reads made on a connection before `start_tx` form its watch baseline: a watched row or
//! table that changed since the connection last read it makes `start_tx` (or
//! `append_watch_tx`) fail with a conflict. [`ReadOnlyStore`] lends such a connection to
//! code that must not write through it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::future::try_join_all;
#[cfg(test)]
use mockall::automock;
use tracing::trace;

use super::Key;
use super::KeyPattern;
use super::KeySpaceSink;
use super::StoreIndex;
use super::StoreOptions;
use super::SubscriptionHandle;
use super::Table;
use super::Value;
use super::WatchKey;
use crate::BackendError;
use crate::Result;

/// Rows of one table as seen by a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableData {
    pub table: Option<Table>,
    pub rows: BTreeMap<Key, Value>,
}

impl TableData {
    pub fn keys(&self) -> Vec<Key> {
        self.rows.keys().cloned().collect()
    }

    pub fn entry(
        &self,
        key: &Key,
    ) -> Option<&Value> {
        self.rows.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Store: Send + Sync {
    fn options(&self) -> StoreOptions;

    async fn get_entry(
        &self,
        table: &Table,
        key: &Key,
    ) -> Result<Option<Value>>;

    async fn get_table(
        &self,
        table: &Table,
    ) -> Result<TableData>;

    async fn get_keys(
        &self,
        table: &Table,
    ) -> Result<Vec<Key>> {
        Ok(self.get_table(table).await?.keys())
    }

    /// Replaces the whole row.
    async fn set_entry(
        &self,
        table: &Table,
        key: &Key,
        value: Value,
    ) -> Result<()>;

    /// Merges fields into the row, creating it when absent.
    async fn mod_entry(
        &self,
        table: &Table,
        key: &Key,
        value: Value,
    ) -> Result<()>;

    async fn delete_entry(
        &self,
        table: &Table,
        key: &Key,
    ) -> Result<()>;

    async fn delete_entry_fields(
        &self,
        table: &Table,
        key: &Key,
        fields: Vec<String>,
    ) -> Result<()>;

    /// Opens a transaction watching `watch_keys` and `tables`. Fails with a conflict when
    /// any of them changed after this connection read it.
    async fn start_tx(
        &self,
        watch_keys: &[WatchKey],
        tables: &[Table],
    ) -> Result<()>;

    async fn append_watch_tx(
        &self,
        watch_keys: &[WatchKey],
        tables: &[Table],
    ) -> Result<()>;

    async fn commit_tx(&self) -> Result<()>;

    async fn abort_tx(&self) -> Result<()>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait StoreClient: Send + Sync + 'static {
    async fn new_connection(
        &self,
        options: StoreOptions,
    ) -> Result<Box<dyn Store>>;

    /// Opens one subscription covering every pattern; events are pushed into `sink`
    /// from the store's own dispatch context without waiting on the subscriber.
    fn subscribe_key_space(
        &self,
        options: StoreOptions,
        patterns: Vec<KeyPattern>,
        sink: KeySpaceSink,
    ) -> Result<SubscriptionHandle>;

    fn unsubscribe_key_space(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<()>;
}

/// Read-only view over a borrowed connection. Reads are forwarded, so they still count
/// toward the connection's watch baseline; writes and transaction control are refused.
pub struct ReadOnlyStore<'a> {
    inner: &'a dyn Store,
}

impl<'a> ReadOnlyStore<'a> {
    pub fn new(inner: &'a dyn Store) -> Self {
        Self { inner }
    }

    fn refuse(&self) -> Result<()> {
        Err(BackendError::ReadOnly(self.inner.options().index.name().to_string()).into())
    }
}

#[async_trait]
impl Store for ReadOnlyStore<'_> {
    fn options(&self) -> StoreOptions {
        StoreOptions {
            read_only: true,
            ..self.inner.options()
        }
    }

    async fn get_entry(
        &self,
        table: &Table,
        key: &Key,
    ) -> Result<Option<Value>> {
        self.inner.get_entry(table, key).await
    }

    async fn get_table(
        &self,
        table: &Table,
    ) -> Result<TableData> {
        self.inner.get_table(table).await
    }

    async fn get_keys(
        &self,
        table: &Table,
    ) -> Result<Vec<Key>> {
        self.inner.get_keys(table).await
    }

    async fn set_entry(
        &self,
        _table: &Table,
        _key: &Key,
        _value: Value,
    ) -> Result<()> {
        self.refuse()
    }

    async fn mod_entry(
        &self,
        _table: &Table,
        _key: &Key,
        _value: Value,
    ) -> Result<()> {
        self.refuse()
    }

    async fn delete_entry(
        &self,
        _table: &Table,
        _key: &Key,
    ) -> Result<()> {
        self.refuse()
    }

    async fn delete_entry_fields(
        &self,
        _table: &Table,
        _key: &Key,
        _fields: Vec<String>,
    ) -> Result<()> {
        self.refuse()
    }

    async fn start_tx(
        &self,
        _watch_keys: &[WatchKey],
        _tables: &[Table],
    ) -> Result<()> {
        self.refuse()
    }

    async fn append_watch_tx(
        &self,
        _watch_keys: &[WatchKey],
        _tables: &[Table],
    ) -> Result<()> {
        self.refuse()
    }

    async fn commit_tx(&self) -> Result<()> {
        self.refuse()
    }

    async fn abort_tx(&self) -> Result<()> {
        self.refuse()
    }
}

/// One connection per store index, as handed to Get, Action and Subscribe handlers.
pub struct StoreSet {
    stores: BTreeMap<StoreIndex, Box<dyn Store>>,
}

impl StoreSet {
    /// Opens a connection to every index in `indices` concurrently.
    pub async fn open(
        client: &dyn StoreClient,
        indices: &[StoreIndex],
        read_only: bool,
    ) -> Result<Self> {
        let connections = try_join_all(indices.iter().map(|index| {
            let options = StoreOptions {
                index: *index,
                read_only,
            };
            async move { client.new_connection(options).await.map(|store| (*index, store)) }
        }))
        .await?;

        trace!(count = connections.len(), read_only, "Opened store set");

        Ok(Self {
            stores: connections.into_iter().collect(),
        })
    }

    pub fn from_stores(stores: Vec<Box<dyn Store>>) -> Self {
        Self {
            stores: stores.into_iter().map(|s| (s.options().index, s)).collect(),
        }
    }

    pub fn get(
        &self,
        index: StoreIndex,
    ) -> Result<&dyn Store> {
        self.stores
            .get(&index)
            .map(|s| &**s)
            .ok_or_else(|| BackendError::Unreachable(format!("{index} is not open")).into())
    }

    pub fn indices(&self) -> Vec<StoreIndex> {
        self.stores.keys().copied().collect()
    }
}

impl std::fmt::Debug for StoreSet {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("StoreSet").field("indices", &self.indices()).finish()
    }
}
