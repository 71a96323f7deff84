use std::sync::Arc;

use bytes::Bytes;
use nanoid::nanoid;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use crate::api::ActionRequest;
use crate::api::ActionResponse;
use crate::api::GetRequest;
use crate::api::GetResponse;
use crate::api::SetRequest;
use crate::api::SetResponse;
use crate::auth::Authorizer;
use crate::auth::Principal;
use crate::handler::process_write;
use crate::handler::translate_write;
use crate::handler::AppHandler;
use crate::handler::RequestContext;
use crate::handler::Verb;
use crate::metrics::TX_ABORTED;
use crate::metrics::TX_COMMITTED;
use crate::metrics::TX_CONFLICTS;
use crate::registry::HandlerInfo;
use crate::registry::HandlerRegistry;
use crate::store::ReadOnlyStore;
use crate::store::Store;
use crate::store::StoreClient;
use crate::store::StoreIndex;
use crate::store::StoreOptions;
use crate::store::StoreSet;
use crate::Result;

/// Database every write transaction runs against.
pub(crate) const WRITE_INDEX: StoreIndex = StoreIndex::ConfigDb;

/// A fresh handler instance bound to one request.
pub(crate) struct PreparedHandler {
    pub(crate) info: HandlerInfo,
    pub(crate) handler: Box<dyn AppHandler>,
    pub(crate) request_id: String,
}

pub(crate) struct TransactionCoordinator {
    registry: Arc<HandlerRegistry>,
    client: Arc<dyn StoreClient>,
    authorizer: Authorizer,
    /// Databases opened for Get, Action and Subscribe
    indices: Vec<StoreIndex>,
    pub(super) write_lock: Mutex<()>,
}

impl TransactionCoordinator {
    pub(crate) fn new(
        registry: Arc<HandlerRegistry>,
        client: Arc<dyn StoreClient>,
        authorizer: Authorizer,
        indices: Vec<StoreIndex>,
    ) -> Self {
        Self {
            registry,
            client,
            authorizer,
            indices,
            write_lock: Mutex::new(()),
        }
    }

    pub(crate) fn client(&self) -> &dyn StoreClient {
        &*self.client
    }

    pub(crate) fn authorizer(&self) -> &Authorizer {
        &self.authorizer
    }

    pub(crate) fn indices(&self) -> &[StoreIndex] {
        &self.indices
    }

    /// Resolves the handler for `path` and initializes a fresh instance of it.
    pub(crate) fn prepare(
        &self,
        verb: Verb,
        path: &str,
        payload: Bytes,
        principal: &Principal,
    ) -> Result<PreparedHandler> {
        let info = self.registry.resolve(path)?;
        self.instantiate(info, verb, path, payload, principal)
    }

    /// Initializes a fresh instance of an already resolved handler.
    pub(crate) fn instantiate(
        &self,
        info: HandlerInfo,
        verb: Verb,
        path: &str,
        payload: Bytes,
        principal: &Principal,
    ) -> Result<PreparedHandler> {
        let mut handler = self.registry.instantiate(&info.handler_type)?;
        let request_id = nanoid!();
        trace!(%request_id, path, %verb, handler_type = %info.handler_type, "Handler instantiated");

        handler.initialize(RequestContext {
            path: path.to_string(),
            payload,
            verb,
            principal: principal.clone(),
            request_id: request_id.clone(),
        })?;

        Ok(PreparedHandler {
            info,
            handler,
            request_id,
        })
    }

    pub(crate) async fn write(
        &self,
        verb: Verb,
        request: SetRequest,
    ) -> Result<SetResponse> {
        let result = self.run_write(verb, &request).await;
        match &result {
            Ok(response) => {
                TX_COMMITTED.with_label_values(&[verb.as_str()]).inc();
                debug!(path = %request.path, %verb, rows = response.affected.len(), "Write committed");
            }
            Err(e) => {
                TX_ABORTED.with_label_values(&[verb.as_str()]).inc();
                if e.is_conflict() {
                    TX_CONFLICTS.with_label_values(&[verb.as_str()]).inc();
                }
                debug!(path = %request.path, %verb, error = %e, "Write failed");
            }
        }
        result
    }

    async fn run_write(
        &self,
        verb: Verb,
        request: &SetRequest,
    ) -> Result<SetResponse> {
        self.authorizer.authorize(&request.principal, verb)?;
        let mut prepared = self.prepare(verb, &request.path, request.payload.clone(), &request.principal)?;

        // Translate reads on the transaction connection are its watch baseline
        let tx = self.client.new_connection(StoreOptions::read_write(WRITE_INDEX)).await?;
        let watch_keys = translate_write(&mut *prepared.handler, verb, &ReadOnlyStore::new(&*tx)).await?;
        trace!(request_id = %prepared.request_id, keys = watch_keys.len(), "Translated write");

        let _guard = self.write_lock.lock().await;
        tx.start_tx(&watch_keys, &prepared.info.static_tables).await?;

        let result = match process_write(&mut *prepared.handler, verb, &*tx).await {
            Ok(result) => result,
            Err(e) => {
                abort(&*tx, &request.path).await;
                return Err(e);
            }
        };

        tx.commit_tx().await?;

        Ok(SetResponse {
            path: request.path.clone(),
            affected: result.affected,
        })
    }

    pub(crate) async fn get(
        &self,
        request: GetRequest,
    ) -> Result<GetResponse> {
        self.authorizer.authorize(&request.principal, Verb::Get)?;
        let prepared = self.prepare(Verb::Get, &request.path, Bytes::new(), &request.principal)?;
        let payload = self.run_get(prepared).await?;

        Ok(GetResponse {
            path: request.path,
            payload,
        })
    }

    /// Runs the Get path of an already resolved handler.
    pub(crate) async fn read_payload(
        &self,
        info: &HandlerInfo,
        path: &str,
        principal: &Principal,
    ) -> Result<Bytes> {
        let prepared = self.instantiate(info.clone(), Verb::Get, path, Bytes::new(), principal)?;
        self.run_get(prepared).await
    }

    async fn run_get(
        &self,
        mut prepared: PreparedHandler,
    ) -> Result<Bytes> {
        let stores = StoreSet::open(&*self.client, &self.indices, true).await?;
        prepared.handler.translate_get(&stores).await?;
        let result = prepared.handler.process_get(&stores).await?;
        Ok(result.payload)
    }

    pub(crate) async fn action(
        &self,
        request: ActionRequest,
    ) -> Result<ActionResponse> {
        self.authorizer.authorize(&request.principal, Verb::Action)?;
        let mut prepared = self.prepare(Verb::Action, &request.path, request.payload, &request.principal)?;

        let stores = StoreSet::open(&*self.client, &self.indices, true).await?;
        prepared.handler.translate_action(&stores).await?;
        let result = prepared.handler.process_action(&stores).await?;

        debug!(path = %request.path, request_id = %prepared.request_id, "Action completed");
        Ok(ActionResponse {
            path: request.path,
            payload: result.payload,
        })
    }
}

/// Aborts `tx`; abort failures are logged, not surfaced.
pub(super) async fn abort(
    tx: &dyn Store,
    path: &str,
) {
    if let Err(e) = tx.abort_tx().await {
        warn!(path, error = %e, "Abort failed");
    }
}
