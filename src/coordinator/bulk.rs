//! Bulk Coordinator
//!
//! Runs every item of a [`BulkRequest`] against one transaction opened with an empty
//! watch-set. Each item's translate-phase keys are appended to that transaction before its
//! process phase runs, and translate reads go through the transaction connection so later
//! items observe what earlier items wrote. The first failure aborts the whole batch.

use tracing::debug;
use tracing::info;

use super::transaction::abort;
use super::transaction::TransactionCoordinator;
use super::transaction::WRITE_INDEX;
use crate::api::BulkItem;
use crate::api::BulkRequest;
use crate::api::BulkResponse;
use crate::api::ItemStatus;
use crate::auth::Principal;
use crate::handler::process_write;
use crate::handler::translate_write;
use crate::handler::Verb;
use crate::metrics::TX_ABORTED;
use crate::metrics::TX_COMMITTED;
use crate::metrics::TX_CONFLICTS;
use crate::store::Store;
use crate::store::StoreOptions;
use crate::BulkError;
use crate::Result;

const BULK_LABEL: &str = "bulk";

impl TransactionCoordinator {
    pub(crate) async fn bulk(
        &self,
        request: BulkRequest,
    ) -> std::result::Result<BulkResponse, BulkError> {
        let mut response = BulkResponse::pending(&request);

        match self.run_bulk(&request, &mut response).await {
            Ok(()) => {
                TX_COMMITTED.with_label_values(&[BULK_LABEL]).inc();
                info!(items = request.len(), "Bulk request committed");
                Ok(response)
            }
            Err(error) => {
                TX_ABORTED.with_label_values(&[BULK_LABEL]).inc();
                if error.is_conflict() {
                    TX_CONFLICTS.with_label_values(&[BULK_LABEL]).inc();
                }
                debug!(error = %error, "Bulk request rolled back");
                Err(BulkError { response, error })
            }
        }
    }

    async fn run_bulk(
        &self,
        request: &BulkRequest,
        response: &mut BulkResponse,
    ) -> Result<()> {
        self.authorizer().authorize_bulk(&request.principal)?;

        let _guard = self.write_lock.lock().await;

        let tx = self.client().new_connection(StoreOptions::read_write(WRITE_INDEX)).await?;
        tx.start_tx(&[], &[]).await?;

        for verb in BulkRequest::VERB_ORDER {
            for (index, item) in request.items(verb).iter().enumerate() {
                if let Err(e) = self.bulk_item(verb, item, &request.principal, &*tx).await {
                    response.set_status(verb, index, ItemStatus::Failed((&e).into()));
                    abort(&*tx, &item.path).await;
                    return Err(e);
                }
                response.set_status(verb, index, ItemStatus::Ok);
            }
        }

        tx.commit_tx().await
    }

    async fn bulk_item(
        &self,
        verb: Verb,
        item: &BulkItem,
        principal: &Principal,
        tx: &dyn Store,
    ) -> Result<()> {
        let mut prepared = self.prepare(verb, &item.path, item.payload.clone(), principal)?;

        let watch_keys = translate_write(&mut *prepared.handler, verb, tx).await?;
        tx.append_watch_tx(&watch_keys, &prepared.info.static_tables).await?;

        let result = process_write(&mut *prepared.handler, verb, tx).await?;
        debug!(
            path = %item.path,
            %verb,
            request_id = %prepared.request_id,
            rows = result.affected.len(),
            "Bulk item applied"
        );
        Ok(())
    }
}
