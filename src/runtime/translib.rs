use std::sync::Arc;

use autometrics::autometrics;
use tokio::sync::mpsc;
use tracing::info;

use crate::api::ActionRequest;
use crate::api::ActionResponse;
use crate::api::BulkRequest;
use crate::api::BulkResponse;
use crate::api::GetRequest;
use crate::api::GetResponse;
use crate::api::SetRequest;
use crate::api::SetResponse;
use crate::api::SubscribeCapability;
use crate::api::SubscribeRequest;
use crate::api::SubscribeResponse;
use crate::auth::Principal;
use crate::config::TranslibConfig;
use crate::coordinator::TransactionCoordinator;
use crate::handler::Verb;
use crate::notification::NotificationEngine;
use crate::registry::HandlerRegistry;
use crate::registry::ModelData;
use crate::BulkError;
use crate::Result;
use crate::API_SLO;

/// Translation runtime.
///
/// Routes every request to the handler registered for its path and runs it against the
/// shared store: writes as one optimistic transaction each, reads and actions on fresh
/// read-only connections, subscriptions as streaming sessions. Cheap to share behind an
/// `Arc`; every method takes `&self`.
pub struct Translib {
    pub(super) config: TranslibConfig,
    pub(super) registry: Arc<HandlerRegistry>,
    pub(super) coordinator: Arc<TransactionCoordinator>,
    pub(super) notifications: NotificationEngine,
}

impl std::fmt::Debug for Translib {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Translib")
            .field("config", &self.config)
            .field("prefixes", &self.registry.prefixes())
            .field("sessions", &self.notifications.session_count())
            .finish()
    }
}

impl Translib {
    #[autometrics(objective = API_SLO)]
    pub async fn create(
        &self,
        request: SetRequest,
    ) -> Result<SetResponse> {
        self.coordinator.write(Verb::Create, request).await
    }

    /// Merges the payload into existing data, creating rows as needed.
    #[autometrics(objective = API_SLO)]
    pub async fn update(
        &self,
        request: SetRequest,
    ) -> Result<SetResponse> {
        self.coordinator.write(Verb::Update, request).await
    }

    /// Replaces the addressed subtree with the payload.
    #[autometrics(objective = API_SLO)]
    pub async fn replace(
        &self,
        request: SetRequest,
    ) -> Result<SetResponse> {
        self.coordinator.write(Verb::Replace, request).await
    }

    #[autometrics(objective = API_SLO)]
    pub async fn delete(
        &self,
        request: SetRequest,
    ) -> Result<SetResponse> {
        self.coordinator.write(Verb::Delete, request).await
    }

    #[autometrics(objective = API_SLO)]
    pub async fn get(
        &self,
        request: GetRequest,
    ) -> Result<GetResponse> {
        self.coordinator.get(request).await
    }

    #[autometrics(objective = API_SLO)]
    pub async fn action(
        &self,
        request: ActionRequest,
    ) -> Result<ActionResponse> {
        self.coordinator.action(request).await
    }

    /// Applies every item in one transaction, in the order Delete, Replace, Update, Create.
    ///
    /// On failure nothing is applied and [`BulkError::response`] tells which item failed.
    #[autometrics(objective = API_SLO)]
    pub async fn bulk(
        &self,
        request: BulkRequest,
    ) -> std::result::Result<BulkResponse, BulkError> {
        self.coordinator.bulk(request).await
    }

    /// Opens a subscription session.
    ///
    /// Returns one capability entry per requested path once the session is registered;
    /// snapshots then arrive on `request.output` until `request.stop` is cancelled. Fails
    /// only when no path can be subscribed or the store is unavailable.
    #[autometrics(objective = API_SLO)]
    pub async fn subscribe(
        &self,
        request: SubscribeRequest,
    ) -> Result<Vec<SubscribeCapability>> {
        self.notifications.subscribe(request).await
    }

    /// Streaming capabilities of `paths`; opens no session.
    pub async fn is_subscribe_supported(
        &self,
        paths: &[String],
        principal: &Principal,
    ) -> Result<Vec<SubscribeCapability>> {
        self.notifications.is_subscribe_supported(paths, principal).await
    }

    /// Output queue sized by `notification.event_buffer_size`.
    pub fn subscribe_channel(&self) -> (mpsc::Sender<SubscribeResponse>, mpsc::Receiver<SubscribeResponse>) {
        mpsc::channel(self.notifications.config().event_buffer_size)
    }

    /// Data models served by the registered handlers.
    pub fn models(&self) -> Vec<ModelData> {
        self.registry.models()
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn config(&self) -> &TranslibConfig {
        &self.config
    }

    pub fn active_sessions(&self) -> usize {
        self.notifications.session_count()
    }

    /// Stops every subscription session and waits for them to finish.
    pub async fn shutdown(&self) {
        info!("Translib shutting down");
        self.notifications.shutdown().await;
    }
}
