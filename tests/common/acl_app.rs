//! Schema-mode handler for a trimmed OpenConfig ACL tree:
//!
//! ```text
//! /openconfig-acl:acl                              all sets
//! /openconfig-acl:acl/acl-sets/acl-set=<name>      one set, row ACL_TABLE|<name>
//! /openconfig-acl:acl/count                        action: number of sets
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::json;
use serde_json::Value as Json;
use translib::handler::ActionResult;
use translib::handler::AppHandler;
use translib::handler::GetResult;
use translib::handler::NotificationSpec;
use translib::handler::RequestContext;
use translib::handler::SetResult;
use translib::handler::SubscribeOptions;
use translib::handler::SubscribeTranslation;
use translib::registry::HandlerInfo;
use translib::registry::HandlerMode;
use translib::registry::ModelData;
use translib::store::Key;
use translib::store::Store;
use translib::store::StoreIndex;
use translib::store::StoreSet;
use translib::store::Table;
use translib::store::Value;
use translib::store::WatchKey;
use translib::AppError;
use translib::Error;
use translib::Result;

pub const ACL_ROOT: &str = "/openconfig-acl:acl";
pub const ACL_TABLE: &str = "ACL_TABLE";
pub const ACL_RULE: &str = "ACL_RULE";

pub fn acl_set_path(name: &str) -> String {
    format!("{ACL_ROOT}/acl-sets/acl-set={name}")
}

#[derive(Debug, Default)]
pub struct AclApp {
    ctx: Option<RequestContext>,
    /// Rows to write (`Some`) or remove (`None`), resolved during translate
    plan: Vec<(Key, Option<Value>)>,
}

impl AclApp {
    pub fn factory() -> Box<dyn AppHandler> {
        Box::new(Self::default())
    }

    pub fn info() -> HandlerInfo {
        HandlerInfo::new(ACL_ROOT, "acl", HandlerMode::Schema).with_static_tables([Table::new(ACL_RULE)])
    }

    pub fn model() -> ModelData {
        ModelData::new("openconfig-acl", "OpenConfig working group", "1.0.2")
    }

    fn table() -> Table {
        Table::new(ACL_TABLE)
    }

    fn ctx(&self) -> Result<&RequestContext> {
        self.ctx
            .as_ref()
            .ok_or_else(|| Error::Fatal("acl handler used before initialize".to_string()))
    }

    /// `Some(name)` for a set path, `None` for the root.
    fn set_name(path: &str) -> Result<Option<String>> {
        if path == ACL_ROOT {
            return Ok(None);
        }
        match path.strip_prefix(&format!("{ACL_ROOT}/acl-sets/acl-set=")) {
            Some(name) if !name.is_empty() && !name.contains('/') => Ok(Some(name.to_string())),
            _ => Err(AppError::InvalidArgs(format!("{path}: unsupported ACL path")).into()),
        }
    }

    fn required_name(&self) -> Result<String> {
        let ctx = self.ctx()?;
        Self::set_name(&ctx.path)?
            .ok_or_else(|| AppError::NotSupported(format!("{}: writes need an acl-set", ctx.path)).into())
    }

    fn payload_row(&self) -> Result<Value> {
        let ctx = self.ctx()?;
        let body = ctx.payload_json()?;
        let mut value = Value::new();
        if let Some(description) = body.get("description").and_then(Json::as_str) {
            value.set("policy_desc", description);
        }
        if let Some(kind) = body.get("type").and_then(Json::as_str) {
            value.set("type", kind);
        }
        if value.is_empty() {
            return Err(AppError::InvalidArgs(format!("{}: no known ACL fields", ctx.path)).into());
        }
        Ok(value)
    }

    fn watch(
        &self,
        name: &str,
    ) -> Vec<WatchKey> {
        vec![WatchKey::new(Self::table(), Key::single(name))]
    }

    async fn apply(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        let mut affected = Vec::new();
        for (key, value) in std::mem::take(&mut self.plan) {
            match value {
                Some(value) => tx.set_entry(&Self::table(), &key, value).await?,
                None => tx.delete_entry(&Self::table(), &key).await?,
            }
            affected.push(WatchKey::new(Self::table(), key));
        }
        Ok(SetResult { affected })
    }
}

fn set_json(
    name: &str,
    value: &Value,
) -> Json {
    json!({
        "name": name,
        "description": value.get("policy_desc").unwrap_or_default(),
        "type": value.get("type").unwrap_or_default(),
    })
}

#[async_trait]
impl AppHandler for AclApp {
    fn initialize(
        &mut self,
        ctx: RequestContext,
    ) -> Result<()> {
        self.ctx = Some(ctx);
        self.plan.clear();
        Ok(())
    }

    async fn translate_create(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let name = self.required_name()?;
        if store.get_entry(&Self::table(), &Key::single(&name)).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("acl-set {name}")).into());
        }
        self.plan = vec![(Key::single(&name), Some(self.payload_row()?))];
        Ok(self.watch(&name))
    }

    async fn translate_update(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let name = self.required_name()?;
        let mut row = store
            .get_entry(&Self::table(), &Key::single(&name))
            .await?
            .unwrap_or_default();
        row.merge(&self.payload_row()?);
        self.plan = vec![(Key::single(&name), Some(row))];
        Ok(self.watch(&name))
    }

    async fn translate_replace(
        &mut self,
        _store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let name = self.required_name()?;
        self.plan = vec![(Key::single(&name), Some(self.payload_row()?))];
        Ok(self.watch(&name))
    }

    async fn translate_delete(
        &mut self,
        store: &dyn Store,
    ) -> Result<Vec<WatchKey>> {
        let path = self.ctx()?.path.clone();
        let names: Vec<Key> = match Self::set_name(&path)? {
            Some(name) => {
                if store.get_entry(&Self::table(), &Key::single(&name)).await?.is_none() {
                    return Err(AppError::NotFound(format!("acl-set {name}")).into());
                }
                vec![Key::single(name)]
            }
            None => store.get_keys(&Self::table()).await?,
        };

        self.plan = names.iter().map(|k| (k.clone(), None)).collect();
        Ok(names.into_iter().map(|k| WatchKey::new(Self::table(), k)).collect())
    }

    async fn translate_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<()> {
        Self::set_name(&self.ctx()?.path)?;
        stores.get(StoreIndex::ConfigDb).map(|_| ())
    }

    async fn translate_action(
        &mut self,
        _stores: &StoreSet,
    ) -> Result<()> {
        let path = &self.ctx()?.path;
        if path != &format!("{ACL_ROOT}/count") {
            return Err(AppError::NotSupported(format!("{path}: unknown action")).into());
        }
        Ok(())
    }

    async fn translate_subscribe(
        &mut self,
        _stores: &StoreSet,
        path: &str,
    ) -> Result<SubscribeTranslation> {
        let key = Self::set_name(path)?.map(Key::single).unwrap_or_else(Key::wildcard);
        Ok(SubscribeTranslation {
            options: Some(SubscribeOptions::default()),
            descriptor: Some(NotificationSpec {
                table: Self::table(),
                key,
                index: StoreIndex::ConfigDb,
                need_cache: true,
            }),
        })
    }

    async fn process_create(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply(tx).await
    }

    async fn process_update(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply(tx).await
    }

    async fn process_replace(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply(tx).await
    }

    async fn process_delete(
        &mut self,
        tx: &dyn Store,
    ) -> Result<SetResult> {
        self.apply(tx).await
    }

    async fn process_get(
        &mut self,
        stores: &StoreSet,
    ) -> Result<GetResult> {
        let store = stores.get(StoreIndex::ConfigDb)?;
        let body = match Self::set_name(&self.ctx()?.path)? {
            Some(name) => {
                let row = store
                    .get_entry(&Self::table(), &Key::single(&name))
                    .await?
                    .ok_or_else(|| AppError::NotFound(format!("acl-set {name}")))?;
                set_json(&name, &row)
            }
            None => {
                let data = store.get_table(&Self::table()).await?;
                let sets: Vec<Json> = data.rows.iter().map(|(k, v)| set_json(&k.to_string(), v)).collect();
                json!({ "acl-sets": { "acl-set": sets } })
            }
        };
        Ok(GetResult {
            payload: Bytes::from(serde_json::to_vec(&body)?),
        })
    }

    async fn process_action(
        &mut self,
        stores: &StoreSet,
    ) -> Result<ActionResult> {
        let keys = stores.get(StoreIndex::ConfigDb)?.get_keys(&Self::table()).await?;
        Ok(ActionResult {
            payload: Bytes::from(serde_json::to_vec(&json!({ "count": keys.len() }))?),
        })
    }
}
