//! A builder for assembling a [`Translib`] runtime.
//!
//! ## Example
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(());
//! let translib = TranslibBuilder::new()?
//!     .with_table_app()?
//!     .handler(HandlerInfo::new("/openconfig-acl:acl", "acl", HandlerMode::Native), AclApp::factory)?
//!     .model(ModelData::new("openconfig-acl", "OpenConfig", "1.0.2"))
//!     .start_metrics_server(shutdown_rx)
//!     .build();
//! ```
//!
//! Without an explicit [`TranslibBuilder::store_client`] the runtime runs over a fresh
//! [`MemStoreClient`].

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;
use tracing::info;

use super::Translib;
use crate::auth::Authorizer;
use crate::config::TranslibConfig;
use crate::coordinator::TransactionCoordinator;
use crate::handler::TableApp;
use crate::metrics;
use crate::notification::NotificationEngine;
use crate::registry::HandlerFactory;
use crate::registry::HandlerInfo;
use crate::registry::HandlerRegistry;
use crate::registry::ModelData;
use crate::store::MemStoreClient;
use crate::store::StoreClient;
use crate::Result;

pub struct TranslibBuilder {
    config: TranslibConfig,
    store_client: Option<Arc<dyn StoreClient>>,
    registry: Arc<HandlerRegistry>,
}

impl TranslibBuilder {
    /// Loads and validates configuration from `CONFIG_PATH` and `TRANSLIB__` variables.
    pub fn new() -> Result<Self> {
        let config = TranslibConfig::new()?.validate()?;
        Ok(Self::from_config(config))
    }

    /// Starts from an in-memory configuration, taken as already validated.
    pub fn from_config(config: TranslibConfig) -> Self {
        Self {
            config,
            store_client: None,
            registry: Arc::new(HandlerRegistry::new()),
        }
    }

    pub fn store_client(
        mut self,
        store_client: Arc<dyn StoreClient>,
    ) -> Self {
        self.store_client = Some(store_client);
        self
    }

    /// Replaces the handler registry, including anything registered on this builder so far.
    pub fn registry(
        mut self,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        self.registry = registry;
        self
    }

    /// Registers a handler type and the prefix it serves.
    pub fn handler(
        self,
        info: HandlerInfo,
        factory: HandlerFactory,
    ) -> Result<Self> {
        self.registry.register_factory(&info.handler_type, factory);
        let prefix = info.prefix.clone();
        self.registry.register(&prefix, info)?;
        Ok(self)
    }

    /// Registers [`TableApp`] as the catch-all handler.
    pub fn with_table_app(self) -> Result<Self> {
        self.handler(TableApp::info(), TableApp::factory)
    }

    pub fn model(
        self,
        model: ModelData,
    ) -> Self {
        self.registry.register_model(model);
        self
    }

    /// Spawns the Prometheus exporter when `monitoring.prometheus_enabled` is set.
    pub fn start_metrics_server(
        self,
        shutdown_signal: watch::Receiver<()>,
    ) -> Self {
        if self.config.monitoring.prometheus_enabled {
            let port = self.config.monitoring.prometheus_port;
            tokio::spawn(async move {
                metrics::start_server(port, shutdown_signal).await;
            });
        } else {
            debug!("Prometheus exporter disabled");
        }
        self
    }

    pub fn build(self) -> Translib {
        let store_client = self
            .store_client
            .unwrap_or_else(|| Arc::new(MemStoreClient::new()));

        let coordinator = Arc::new(TransactionCoordinator::new(
            self.registry.clone(),
            store_client,
            Authorizer::new(self.config.auth.clone()),
            self.config.store.indices.clone(),
        ));
        let notifications = NotificationEngine::new(coordinator.clone(), self.config.notification.clone());

        info!(
            prefixes = self.registry.prefixes().len(),
            indices = self.config.store.indices.len(),
            "Translib runtime built"
        );

        Translib {
            config: self.config,
            registry: self.registry,
            coordinator,
            notifications,
        }
    }
}
