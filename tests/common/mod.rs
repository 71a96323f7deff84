mod acl_app;

use std::sync::Arc;
use std::time::Duration;

pub use acl_app::*;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use translib::api::SubscribeCapability;
use translib::api::SubscribeRequest;
use translib::api::SubscribeResponse;
use translib::auth::Principal;
use translib::config::TranslibConfig;
use translib::store::MemStoreClient;
use translib::Result;
use translib::Translib;
use translib::TranslibBuilder;

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

/// Runtime with the ACL handler and the table handler as catch-all.
pub fn runtime(config: TranslibConfig) -> (Arc<Translib>, MemStoreClient) {
    enable_logger();
    let client = MemStoreClient::new();
    let translib = TranslibBuilder::from_config(config)
        .store_client(Arc::new(client.clone()))
        .with_table_app()
        .and_then(|b| b.handler(AclApp::info(), AclApp::factory))
        .map(|b| b.model(AclApp::model()))
        .expect("test runtime registration")
        .build();
    (Arc::new(translib), client)
}

pub async fn subscribe(
    translib: &Translib,
    paths: &[&str],
) -> (
    Result<Vec<SubscribeCapability>>,
    mpsc::Receiver<SubscribeResponse>,
    CancellationToken,
) {
    let (output, rx) = translib.subscribe_channel();
    let stop = CancellationToken::new();
    let result = translib
        .subscribe(SubscribeRequest {
            paths: paths.iter().map(|p| p.to_string()).collect(),
            output,
            stop: stop.clone(),
            principal: admin(),
        })
        .await;
    (result, rx, stop)
}

pub async fn next(rx: &mut mpsc::Receiver<SubscribeResponse>) -> SubscribeResponse {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no notification within 5s")
        .expect("stream closed")
}

/// Asserts nothing arrives for a short while.
pub async fn quiet(rx: &mut mpsc::Receiver<SubscribeResponse>) {
    let item = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(item.is_err(), "unexpected notification {item:?}");
}

pub async fn closed(rx: &mut mpsc::Receiver<SubscribeResponse>) {
    let item = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("stream did not close within 5s");
    assert!(item.is_none());
}

pub fn json(payload: &[u8]) -> serde_json::Value {
    serde_json::from_slice(payload).expect("payload is JSON")
}
