use std::sync::Arc;
use std::thread;
use tracing::info;
use wiper_io::metrics::{serve_metrics, BridgeMetrics};

pub fn start_metrics_server(
    addr: &Option<String>,
    metrics: &Arc<BridgeMetrics>,
) -> Option<thread::JoinHandle<()>> {
    addr.as_ref().map(|addr| {
        info!(addr = %addr, "Starting metrics server");
        serve_metrics(addr.clone(), Arc::clone(metrics))
    })
}
