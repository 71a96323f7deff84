//! Native table handler
//!
//! Serves paths that address store rows directly:
//!
//! ```text
//! /[<DB>/]<TABLE>                  whole table   {"<key>": {"<field>": "<value>"}}
//! /[<DB>/]<TABLE>/<key>            one row       {"<field>": "<value>"}
//! /[<DB>/]<TABLE>/<key>/<field>    one field     {"<field>": "<value>"}
//! ```
//!
//! `<key>` uses the store's `|` separator for composite keys. `<DB>` defaults to CONFIG_DB
//! and only CONFIG_DB accepts writes. Registered as the catch-all handler.

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::Map;
use serde_json::Value as Json;
use tracing::trace;

use super::AppHandler;
use super::GetResult;
use super::NotificationSpec;
use super::RequestContext;
use super::SetResult;
use super::SubscribeOptions;
use super::SubscribeTranslation;
use crate::registry::HandlerInfo;
use crate::registry::HandlerMode;
use crate::store::Key;
use crate::store::Store;
use crate::store::StoreIndex;
use crate::store::StoreSet;
use crate::store::Table;
use crate::store::Value;
use crate::store::WatchKey;
use crate::AppError;
use crate::Error;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TableTarget {
    pub(crate) index: StoreIndex,
    pub(crate) table: Table,
    pub(crate) key: Option<Key>,
    pub(crate) field: Option<String>,
}

impl TableTarget {
    pub(crate) fn parse(path: &str) -> Result<Self> {
        let invalid = |reason: &str| -> Error { AppError::InvalidArgs(format!("{path}: {reason}")).into() };

        let mut segments: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty path segment"));
        }

        let index = match StoreIndex::ALL.iter().find(|i| i.name() == segments[0]) {
            Some(index) => {
                segments.remove(0);
                *index
            }
            None => StoreIndex::ConfigDb,
        };

        match segments.as_slice() {
            [table] => Ok(Self {
                index,
                table: Table::new(*table),
                key: None,
                field: None,
            }),
            [table, key] => Ok(Self {
                index,
                table: Table::new(*table),
                key: Some(Key::parse(key)),
                field: None,
            }),
            [table, key, field] => Ok(Self {
                index,
                table: Table::new(*table),
                key: Some(Key::parse(key)),
                field: Some(field.to_string()),
            }),
            [] => Err(invalid("missing table name")),
            _ => Err(invalid("too many path segments")),
        }
    }
}

/// Rows a write resolved to during translate, replayed by process.
#[derive(Debug, Clone, Default)]
struct WritePlan {
    sets: Vec<(Key, Value)>,
    deletes: Vec<Key>,
    deleted_fields: Vec<(Key, Vec<String>)>,
}

#[derive(Debug, Default)]
pub struct TableApp {
    ctx: Option<RequestContext>,
    target: Option<TableTarget>,
    plan: WritePlan,
}

impl TableApp {
    pub const TYPE_NAME: &'static str = "table";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> Box<dyn AppHandler> {
        Box::new(Self::new())
    }

    /// Catch-all registration record.
    pub fn info() -> HandlerInfo {
        HandlerInfo::new(crate::registry::CATCH_ALL_PREFIX, Self::TYPE_NAME, HandlerMode::Native)
    }

    fn ctx(&self) -> Result<&RequestContext> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::Fatal("table handler used before initialize".to_string()))
    }

    fn target(&self) -> Result<&TableTarget> {
        self.target
            .as_ref()
            .ok_or_else(|| Error::Fatal("table handler used before initialize".to_string()))
    }

    fn writable_target(&self) -> Result<TableTarget> {
        let target = self.target()?.clone();
        if target.index != StoreIndex::ConfigDb {
            return Err(AppError::NotSupported(format!("{} is read-only", target.index)).into());
        }
        Ok(target)
    }

    /// Rows named by the payload: `{field: value}` for a row/field target,
    /// `{key: {field: value}}` for a table target.
    fn payload_rows(&self) -> Result<Vec<(Key, Value)>> {
        let ctx = self.ctx()?;
        let target = self.target()?;
        let json = ctx.payload_json()?;
        let object = as_object(&json, &ctx.path)?;

        match &target.key {
            Some(key) => {
                let value = json_to_value(object, &ctx.path)?;
                if let Some(field) = &target.field {
                    if value.fields.len() != 1 || value.get(field).is_none() {
                        return Err(AppError::InvalidArgs(format!(
                            "{}: payload must carry exactly field {field}",
                            ctx.path
                        ))
                        .into());
                    }
                }
                Ok(vec![(key.clone(), value)])
            }
            None => {
                let mut rows = Vec::with_capacity(object.len());
                for (k, v) in object {
                    rows.push((Key::parse(k), json_to_value(as_object(v, &ctx.path)?, &ctx.path)?));
                }
                Ok(rows)
            }
        }
    }

    fn watch_keys(
        &self,
        table: &Table,
        keys: impl IntoIterator<Item = Key>,
    ) -> Vec<WatchKey> {
        keys.into_iter().map(|k| WatchKey::new(table.clone(), k)).collect()
    }

    async fn apply_plan(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        let table = self.target()?.table.clone();
        let plan = std::mem::take(&mut self.plan);
        let mut affected = Vec::new();

        for key in plan.deletes {
            tx.delete_entry(&table, &key).await?;
            affected.push(WatchKey::new(table.clone(), key));
        }
        for (key, fields) in plan.deleted_fields {
            tx.delete_entry_fields(&table, &key, fields).await?;
            affected.push(WatchKey::new(table.clone(), key));
        }
        for (key, value) in plan.sets {
            tx.set_entry(&table, &key, value).await?;
            affected.push(WatchKey::new(table.clone(), key));
        }

        trace!(table = %table, rows = affected.len(), "Table handler applied plan");
        Ok(SetResult { affected })
    }
}

#[async_trait]
impl AppHandler for TableApp {
    fn initialize(
        &mut self,
        ctx: RequestContext,
    ) -> Result<()> {
        self.target = Some(TableTarget::parse(&ctx.path)?);
        self.ctx = Some(ctx);
        self.plan = WritePlan::default();
        Ok(())
    }

    async fn translate_create(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let target = self.writable_target()?;
        if target.field.is_some() {
            return Err(AppError::NotSupported("create on a single field".to_string()).into());
        }
        let rows = self.payload_rows()?;
        for (key, _) in &rows {
            if store.get_entry(&target.table, key).await?.is_some() {
                return Err(AppError::AlreadyExists(format!("{}|{key}", target.table)).into());
            }
        }

        let keys = self.watch_keys(&target.table, rows.iter().map(|(k, _)| k.clone()));
        self.plan.sets = rows;
        Ok(keys)
    }

    async fn translate_update(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let target = self.writable_target()?;
        let rows = self.payload_rows()?;

        let mut sets = Vec::with_capacity(rows.len());
        for (key, value) in rows {
            let current = store.get_entry(&target.table, &key).await?;
            if target.field.is_some() && current.is_none() {
                return Err(AppError::NotFound(format!("{}|{key}", target.table)).into());
            }
            let mut merged = current.unwrap_or_default();
            merged.merge(&value);
            sets.push((key, merged));
        }

        let keys = self.watch_keys(&target.table, sets.iter().map(|(k, _)| k.clone()));
        self.plan.sets = sets;
        Ok(keys)
    }

    async fn translate_replace(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let target = self.writable_target()?;
        if target.field.is_some() {
            // Replacing one field is an update of that field
            return self.translate_update(store).await;
        }
        let rows = self.payload_rows()?;

        let mut watched: Vec<Key> = rows.iter().map(|(k, _)| k.clone()).collect();
        if target.key.is_none() {
            let stale: Vec<Key> = store
                .get_keys(&target.table)
                .await?
                .into_iter()
                .filter(|k| !rows.iter().any(|(new, _)| new == k))
                .collect();
            watched.extend(stale.iter().cloned());
            self.plan.deletes = stale;
        }

        self.plan.sets = rows;
        Ok(self.watch_keys(&target.table, watched))
    }

    async fn translate_delete(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let target = self.writable_target()?;

        match (&target.key, &target.field) {
            (None, _) => {
                let keys = store.get_keys(&target.table).await?;
                self.plan.deletes = keys.clone();
                Ok(self.watch_keys(&target.table, keys))
            }
            (Some(key), None) => {
                if store.get_entry(&target.table, key).await?.is_none() {
                    return Err(AppError::NotFound(format!("{}|{key}", target.table)).into());
                }
                self.plan.deletes = vec![key.clone()];
                Ok(self.watch_keys(&target.table, [key.clone()]))
            }
            (Some(key), Some(field)) => {
                let present = store
                    .get_entry(&target.table, key)
                    .await?
                    .is_some_and(|v| v.get(field).is_some());
                if !present {
                    return Err(AppError::NotFound(format!("{}|{key}/{field}", target.table)).into());
                }
                self.plan.deleted_fields = vec![(key.clone(), vec![field.clone()])];
                Ok(self.watch_keys(&target.table, [key.clone()]))
            }
        }
    }

    async fn translate_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<()> {
        stores.get(self.target()?.index).map(|_| ())
    }

    async fn translate_subscribe(
        &mut self,
        _stores: &StoreSet,
        path: &str,
    ) -> Result<SubscribeTranslation> {
        let target = TableTarget::parse(path)?;
        Ok(SubscribeTranslation {
            options: Some(SubscribeOptions::default()),
            descriptor: Some(NotificationSpec {
                key: target.key.clone().unwrap_or_else(Key::wildcard),
                table: target.table,
                index: target.index,
                need_cache: true,
            }),
        })
    }

    async fn process_create(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply_plan(tx).await
    }

    async fn process_update(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply_plan(tx).await
    }

    async fn process_replace(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply_plan(tx).await
    }

    async fn process_delete(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply_plan(tx).await
    }

    async fn process_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<GetResult> {
        let target = self.target()?.clone();
        let store = stores.get(target.index)?;

        let json = match (&target.key, &target.field) {
            (None, _) => {
                let data = store.get_table(&target.table).await?;
                let rows: Map<String, Json> = data
                    .rows
                    .iter()
                    .map(|(k, v)| (k.to_string(), value_to_json(v)))
                    .collect();
                Json::Object(rows)
            }
            (Some(key), field) => {
                let value = store
                    .get_entry(&target.table, key)
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("{}|{key}", target.table)))?;
                match field {
                    None => value_to_json(&value),
                    Some(field) => {
                        let v = value
                            .get(field)
                            .ok_or_else(|| AppError::NotFound(format!("{}|{key}/{field}", target.table)))?;
                        let mut one = Map::new();
                        one.insert(field.clone(), Json::String(v.to_string()));
                        Json::Object(one)
                    }
                }
            }
        };

        Ok(GetResult {
            payload: Bytes::from(serde_json::to_vec(&json)?),
        })
    }
}

fn as_object<'a>(
    json: &'a Json,
    path: &str,
) -> Result<&'a Map<String, Json>> {
    json.as_object()
        .ok_or_else(|| AppError::InvalidArgs(format!("{path}: expected a JSON object")).into())
}

fn json_to_value(
    object: &Map<String, Json>,
    path: &str,
) -> Result<Value> {
    let mut fields = BTreeMap::new();
    for (name, v) in object {
        let rendered = match v {
            Json::String(s) => s.clone(),
            Json::Number(n) => n.to_string(),
            Json::Bool(b) => b.to_string(),
            _ => {
                return Err(AppError::InvalidArgs(format!("{path}: field {name} must be a scalar")).into());
            }
        };
        fields.insert(name.clone(), rendered);
    }
    Ok(Value { fields })
}

fn value_to_json(value: &Value) -> Json {
    Json::Object(
        value
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), Json::String(v.clone())))
            .collect(),
    )
}
