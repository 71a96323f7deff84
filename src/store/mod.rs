//! Key-value store contract consumed by the runtime.
//!
//! The store is organised as numbered databases ([`StoreIndex`]) holding tables of rows.
//! A row is addressed by a [`Table`] and a composite [`Key`] and holds a flat map of string
//! fields ([`Value`]). Writers use optimistic transactions: the keys and tables a transaction
//! watches are checked for outside modification at commit time.

mod mem;
mod sink;
mod store_client;


use std::collections::BTreeMap;
use std::fmt;

pub use mem::*;
pub use sink::*;
pub use store_client::*;

/// Separator used when a composite key is rendered as a single string.
pub const KEY_SEPARATOR: char = '|';

/// Wildcard key component accepted in subscription patterns.
pub const KEY_WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Table(String);

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Table {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite row key, e.g. `Vlan10|Ethernet0`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    comps: Vec<String>,
}

impl Key {
    pub fn new<I, S>(comps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            comps: comps.into_iter().map(Into::into).collect(),
        }
    }

    pub fn single(comp: impl Into<String>) -> Self {
        Self {
            comps: vec![comp.into()],
        }
    }

    /// Key matching every row of a table when used in a [`KeyPattern`].
    pub fn wildcard() -> Self {
        Self::single(KEY_WILDCARD)
    }

    /// Splits a rendered key on [`KEY_SEPARATOR`].
    pub fn parse(rendered: &str) -> Self {
        Self::new(rendered.split(KEY_SEPARATOR))
    }

    pub fn comps(&self) -> &[String] {
        &self.comps
    }

    pub fn len(&self) -> usize {
        self.comps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.comps.is_empty()
    }

    pub fn is_wildcard(&self) -> bool {
        self.comps.len() == 1 && self.comps[0] == KEY_WILDCARD
    }
}

impl fmt::Display for Key {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        for (i, comp) in self.comps.iter().enumerate() {
            if i > 0 {
                write!(f, "{KEY_SEPARATOR}")?;
            }
            f.write_str(comp)?;
        }
        Ok(())
    }
}

/// Field map stored under one row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Value {
    pub fields: BTreeMap<String, String>,
}

impl Value {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_field(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn get(
        &self,
        name: &str,
    ) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    pub fn set(
        &mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn remove(
        &mut self,
        name: &str,
    ) -> Option<String> {
        self.fields.remove(name)
    }

    /// Overlays `other`'s fields onto this value.
    pub fn merge(
        &mut self,
        other: &Value,
    ) {
        for (k, v) in &other.fields {
            self.fields.insert(k.clone(), v.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A row a handler declares it will touch; watched for conflicts until commit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey {
    pub table: Table,
    pub key: Key,
}

impl WatchKey {
    pub fn new(
        table: Table,
        key: Key,
    ) -> Self {
        Self { table, key }
    }
}

impl fmt::Display for WatchKey {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}{KEY_SEPARATOR}{}", self.table, self.key)
    }
}

/// Logical databases of the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StoreIndex {
    ApplDb,
    AsicDb,
    CountersDb,
    ConfigDb,
    FlexCounterDb,
    StateDb,
}

impl StoreIndex {
    pub const ALL: [StoreIndex; 6] = [
        StoreIndex::ApplDb,
        StoreIndex::AsicDb,
        StoreIndex::CountersDb,
        StoreIndex::ConfigDb,
        StoreIndex::FlexCounterDb,
        StoreIndex::StateDb,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            StoreIndex::ApplDb => "APPL_DB",
            StoreIndex::AsicDb => "ASIC_DB",
            StoreIndex::CountersDb => "COUNTERS_DB",
            StoreIndex::ConfigDb => "CONFIG_DB",
            StoreIndex::FlexCounterDb => "FLEX_COUNTER_DB",
            StoreIndex::StateDb => "STATE_DB",
        }
    }
}

impl fmt::Display for StoreIndex {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub index: StoreIndex,
    pub read_only: bool,
}

impl StoreOptions {
    pub fn read_only(index: StoreIndex) -> Self {
        Self {
            index,
            read_only: true,
        }
    }

    pub fn read_write(index: StoreIndex) -> Self {
        Self {
            index,
            read_only: false,
        }
    }
}

/// Row selector for key-space subscriptions. Key components equal to
/// [`KEY_WILDCARD`] match any value; a lone wildcard matches every key of the table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPattern {
    pub table: Table,
    pub key: Key,
}

impl KeyPattern {
    pub fn new(
        table: Table,
        key: Key,
    ) -> Self {
        Self { table, key }
    }

    pub fn matches(
        &self,
        table: &Table,
        key: &Key,
    ) -> bool {
        if &self.table != table {
            return false;
        }
        if self.key.is_wildcard() {
            return true;
        }
        self.key.len() == key.len()
            && self
                .key
                .comps()
                .iter()
                .zip(key.comps())
                .all(|(p, k)| p == KEY_WILDCARD || p == k)
    }
}

/// Identifier of one low-level key-space subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionHandle(pub u64);

impl fmt::Display for SubscriptionHandle {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpaceEventKind {
    /// One or more fields of a row were written
    FieldSet,
    /// Fields were removed but the row still exists
    FieldDelete,
    /// The whole row was removed
    KeyDelete,
    /// The subscription was closed by an unsubscribe call
    SubscriptionClosed,
    /// The subscription failed and will deliver no further events
    SubscriptionError,
    /// Row events of the subscription were dropped because its queue was full
    Overflow,
}

/// Change notification pushed by the store to a key-space subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpaceEvent {
    pub handle: SubscriptionHandle,
    /// Affected row; `None` for subscription lifecycle events
    pub row: Option<WatchKey>,
    pub kind: KeySpaceEventKind,
}

impl KeySpaceEvent {
    pub fn is_row_change(&self) -> bool {
        matches!(
            self.kind,
            KeySpaceEventKind::FieldSet | KeySpaceEventKind::FieldDelete | KeySpaceEventKind::KeyDelete
        )
    }
}
