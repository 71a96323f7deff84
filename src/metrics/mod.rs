//! Prometheus collectors and the `/metrics` endpoint.


use autometrics::prometheus_exporter;
use lazy_static::lazy_static;
use prometheus::IntCounterVec;
use prometheus::IntGauge;
use prometheus::Opts;
use prometheus::Registry;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use warp::Filter;
use warp::Rejection;
use warp::Reply;

lazy_static! {
    pub static ref TX_COMMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("tx_committed_total", "Write transactions committed, by verb"),
        &["verb"]
    )
    .expect("metric can not be created");

    pub static ref TX_ABORTED: IntCounterVec = IntCounterVec::new(
        Opts::new("tx_aborted_total", "Write requests that did not commit, by verb"),
        &["verb"]
    )
    .expect("metric can not be created");

    pub static ref TX_CONFLICTS: IntCounterVec = IntCounterVec::new(
        Opts::new("tx_conflicts_total", "Commits rejected because a watched key changed"),
        &["verb"]
    )
    .expect("metric can not be created");

    pub static ref NOTIFICATIONS_EMITTED: IntCounterVec = IntCounterVec::new(
        Opts::new("notifications_emitted_total", "Subscription items pushed to clients"),
        &["phase"]
    )
    .expect("metric can not be created");

    pub static ref NOTIFICATIONS_SUPPRESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("notifications_suppressed_total", "Recomputed snapshots dropped as unchanged"),
        &["index"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_SESSIONS: IntGauge =
        IntGauge::new("subscribe_sessions_active", "Subscription sessions currently streaming")
            .expect("metric can not be created");

    pub static ref REGISTRY: Registry = Registry::new();
}

pub(crate) fn register_custom_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(TX_COMMITTED.clone()),
        Box::new(TX_ABORTED.clone()),
        Box::new(TX_CONFLICTS.clone()),
        Box::new(NOTIFICATIONS_EMITTED.clone()),
        Box::new(NOTIFICATIONS_SUPPRESSED.clone()),
        Box::new(ACTIVE_SESSIONS.clone()),
    ];
    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            error!(error = %e, "collector can not be registered");
        }
    }
}

/// Serves `/metrics` on `port` until `shutdown_signal` fires.
pub async fn start_server(
    port: u16,
    mut shutdown_signal: watch::Receiver<()>,
) {
    register_custom_metrics(&REGISTRY);

    let metrics_route = warp::path!("metrics")
        .map(|| REGISTRY.clone())
        .and_then(metrics_handler);

    info!(port, "Metrics endpoint listening");
    let (_, server) = warp::serve(metrics_route).bind_with_graceful_shutdown(([0, 0, 0, 0], port), async move {
        let _ = shutdown_signal.changed().await;
    });
    server.await;
}

async fn metrics_handler(registry: Registry) -> Result<impl Reply, Rejection> {
    let mut body = encode(&registry);
    body.push_str(&encode_default());
    body.push_str(&get_metrics_body());
    Ok(body)
}

fn encode(registry: &Registry) -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&registry.gather(), &mut buffer) {
        error!(error = %e, "could not encode custom metrics");
    }
    String::from_utf8(buffer).unwrap_or_else(|e| {
        error!(error = %e, "custom metrics could not be from_utf8'd");
        String::default()
    })
}

fn encode_default() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %e, "could not encode prometheus metrics");
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Autometrics series for the request API.
pub fn get_metrics_body() -> String {
    prometheus_exporter::encode_http_response().into_body()
}
