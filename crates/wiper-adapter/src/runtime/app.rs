use crate::adapter::{Adapter, AdapterConfig, AdapterError};
use crate::runtime::config::{ConfigError, RuntimeConfig, TargetSet};
use crate::runtime::logging::init_tracing;
use crate::runtime::telemetry;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use wiper_core::signals::{FREQUENCY, MODE, TARGET_POSITION};
use wiper_core::SimConfig;
use wiper_io::{
    BridgeMetrics, BusClient, BusSettings, DatapointValue, LocalBus, MemoryBroker, PumpConfig,
    UpdateBatch,
};

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
    #[error("failed to create metrics: {0}")]
    Metrics(#[from] prometheus::Error),
}

pub fn run_from_args() -> Result<(), RunError> {
    let config = RuntimeConfig::from_env()?;
    if config.show_help {
        RuntimeConfig::print_help();
        return Ok(());
    }
    run(config)
}

pub fn run(config: RuntimeConfig) -> Result<(), RunError> {
    let _log_guard = init_tracing(config.json_logs, config.log_dir.as_deref());

    let metrics = Arc::new(BridgeMetrics::new()?);
    let _metrics_handle = telemetry::start_metrics_server(&config.metrics_addr, &metrics);

    let adapter_config = build_adapter_config(&config)?;
    let broker = Arc::new(
        MemoryBroker::new(&config.broker_addr).with_client_token(config.token.clone()),
    );
    let bus: Option<Arc<dyn BusClient>> = if config.bus_enabled() {
        let local = LocalBus::new();
        Some(Arc::new(local.client(&adapter_config.bus.app_name)))
    } else {
        warn!(
            bus_app = ?config.bus_app,
            bus_config = ?config.bus_config,
            dummy_feeder = config.dummy_feeder,
            "bus side not configured"
        );
        None
    };

    let signal_root = adapter_config.signal_root.clone();
    let adapter = Arc::new(Adapter::new(
        adapter_config,
        bus,
        broker.clone(),
        metrics.clone(),
    ));

    let signal_adapter = Arc::clone(&adapter);
    if let Err(e) = ctrlc::set_handler(move || {
        info!("termination signal received");
        signal_adapter.shutdown();
    }) {
        warn!(error = %e, "failed to install termination handler");
    }

    info!(
        broker = %config.broker_addr,
        root = %signal_root,
        cycle_ms = config.publish_cycle.as_millis() as u64,
        "Starting wiper adapter"
    );
    adapter.init()?;
    adapter.start()?;

    if !adapter.is_degraded() {
        if let Some(target) = config.set_target {
            info!(?target, "injecting actuator targets");
            broker.set_actuator_targets(target_batch(&signal_root, target));
        }
        match config.run_seconds {
            Some(seconds) => {
                info!(seconds, "Running for limited duration");
                adapter.wait_for_shutdown(Duration::from_secs(seconds));
            }
            None => while !adapter.wait_for_shutdown(Duration::from_secs(1)) {},
        }
    }

    adapter.shutdown();
    info!(
        events_published = metrics.events_published.get(),
        telemetry_batches = metrics.telemetry_batches.get(),
        stream_restarts = metrics.stream_restarts.get(),
        "Run complete"
    );
    Ok(())
}

fn build_adapter_config(config: &RuntimeConfig) -> Result<AdapterConfig, ConfigError> {
    let mut adapter = AdapterConfig {
        signal_root: config.signal_root.clone(),
        pump: PumpConfig {
            publish_cycle: config.publish_cycle,
            step_interval: config.step_interval,
        },
        ..AdapterConfig::default()
    };

    if let Some(path) = &config.sim_config {
        let raw = std::fs::read_to_string(path).map_err(|e| file_error(path, e))?;
        adapter.sim = SimConfig::from_json(&raw).map_err(|e| file_error(path, e))?;
    }

    if config.bus_enabled() {
        if let Some(path) = &config.bus_config {
            adapter.bus = BusSettings::from_file(path).map_err(|e| file_error(path, e))?;
        }
        if let Some(app) = &config.bus_app {
            adapter.bus.app_name = app.clone();
        }
    }
    Ok(adapter)
}

fn file_error(path: &Path, err: impl std::fmt::Display) -> ConfigError {
    ConfigError::File {
        path: path.display().to_string(),
        reason: err.to_string(),
    }
}

pub(crate) fn target_batch(root: &str, target: TargetSet) -> UpdateBatch {
    UpdateBatch::from([
        (
            MODE.path(root),
            DatapointValue::String(target.mode.as_str().to_string()),
        ),
        (FREQUENCY.path(root), DatapointValue::Uint32(target.frequency)),
        (
            TARGET_POSITION.path(root),
            DatapointValue::Float(target.position),
        ),
    ])
}
