use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use super::ScriptedApp;
use crate::auth::Principal;
use crate::config::TranslibConfig;
use crate::handler::TableApp;
use crate::registry::HandlerRegistry;
use crate::registry::CATCH_ALL_PREFIX;
use crate::store::MemStoreClient;
use crate::Translib;
use crate::TranslibBuilder;

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
}

pub fn admin() -> Principal {
    Principal::new("admin", ["admin"])
}

/// Registry with the table handler as catch-all and every scripted mode under its own
/// table prefix.
pub fn test_registry() -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    registry.register_factory(TableApp::TYPE_NAME, TableApp::factory);
    registry.register(CATCH_ALL_PREFIX, TableApp::info()).unwrap();

    for (info, factory) in ScriptedApp::modes() {
        registry.register_factory(&info.handler_type, factory);
        let prefix = info.prefix.clone();
        registry.register(&prefix, info).unwrap();
    }
    Arc::new(registry)
}

pub fn test_runtime(config: TranslibConfig) -> (Translib, MemStoreClient) {
    enable_logger();
    let client = MemStoreClient::new();
    let translib = TranslibBuilder::from_config(config)
        .store_client(Arc::new(client.clone()))
        .registry(test_registry())
        .build();
    (translib, client)
}
