//! Converts actuator target batches into wiper set requests.

use crate::broker::{DatapointValue, UpdateBatch};
use crate::bus::{BusClient, BusError, BusMessage, ServiceAddr};
use crate::metrics::BridgeMetrics;
use crate::responder::RequestResponseBridge;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, instrument};
use wiper_core::signals::{FREQUENCY, MODE, TARGET_POSITION};
use wiper_core::{encode_set_request, SetRequest, WiperMode};

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("required target value {0} is missing")]
    Missing(String),
    #[error("wrong value type {actual} for {path}, expected {expected}")]
    WrongType {
        path: String,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("invalid wiper mode '{0}'")]
    InvalidMode(String),
    #[error("frequency {0} does not fit in a byte")]
    FrequencyOutOfRange(u32),
    #[error("failed to forward set request: {0}")]
    Forward(#[from] BusError),
}

/// Destination of validated set requests.
pub trait SetRequestSink: Send + Sync {
    fn submit(&self, request: &SetRequest) -> Result<(), BusError>;
}

/// Sends the encoded request to the set-request method on the bus.
pub struct BusRequestPath {
    bus: Arc<dyn BusClient>,
    addr: ServiceAddr,
    method: u16,
}

impl BusRequestPath {
    pub fn new(bus: Arc<dyn BusClient>, addr: ServiceAddr, method: u16) -> Self {
        Self { bus, addr, method }
    }
}

impl SetRequestSink for BusRequestPath {
    fn submit(&self, request: &SetRequest) -> Result<(), BusError> {
        let payload = encode_set_request(request).to_vec();
        info!(%request, service = %self.addr, "sending set request");
        self.bus
            .send(BusMessage::request(self.addr, self.method, payload))
    }
}

/// Applies requests straight to the model, skipping the bus.
impl SetRequestSink for RequestResponseBridge {
    fn submit(&self, request: &SetRequest) -> Result<(), BusError> {
        self.apply(request);
        Ok(())
    }
}

pub struct ActuatorBridge {
    mode_path: String,
    frequency_path: String,
    target_path: String,
    sink: Arc<dyn SetRequestSink>,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl ActuatorBridge {
    pub fn new(root: &str, sink: Arc<dyn SetRequestSink>) -> Self {
        Self {
            mode_path: MODE.path(root),
            frequency_path: FREQUENCY.path(root),
            target_path: TARGET_POSITION.path(root),
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Paths to subscribe for actuator targets.
    pub fn paths(&self) -> Vec<String> {
        vec![
            self.mode_path.clone(),
            self.frequency_path.clone(),
            self.target_path.clone(),
        ]
    }

    /// Validates the whole batch; nothing is forwarded unless all three targets are usable.
    pub fn to_request(&self, batch: &UpdateBatch) -> Result<SetRequest, ActuatorError> {
        let mode = match self.field(batch, &self.mode_path)? {
            DatapointValue::String(s) => s
                .parse::<WiperMode>()
                .map_err(|_| ActuatorError::InvalidMode(s.clone()))?,
            other => return Err(self.wrong_type(&self.mode_path, "string", other)),
        };
        let frequency = match self.field(batch, &self.frequency_path)? {
            DatapointValue::Uint32(f) => {
                u8::try_from(*f).map_err(|_| ActuatorError::FrequencyOutOfRange(*f))?
            }
            other => return Err(self.wrong_type(&self.frequency_path, "uint32", other)),
        };
        let target_position = match self.field(batch, &self.target_path)? {
            DatapointValue::Float(p) => *p,
            other => return Err(self.wrong_type(&self.target_path, "float", other)),
        };
        Ok(SetRequest {
            frequency,
            target_position,
            mode,
        })
    }

    /// Handles one update batch from the subscriber. Invalid batches are logged and dropped.
    #[instrument(skip_all, fields(values = batch.len()))]
    pub fn on_update(&self, batch: UpdateBatch) {
        for (path, value) in &batch {
            debug!(%path, %value, "actuator target");
        }
        let result = self
            .to_request(&batch)
            .and_then(|request| self.sink.submit(&request).map_err(ActuatorError::from));
        match result {
            Ok(()) => self.count("forwarded"),
            Err(e) => {
                error!(error = %e, "discarding actuator targets");
                self.count("discarded");
            }
        }
    }

    fn field<'a>(
        &self,
        batch: &'a UpdateBatch,
        path: &str,
    ) -> Result<&'a DatapointValue, ActuatorError> {
        batch
            .get(path)
            .ok_or_else(|| ActuatorError::Missing(path.to_string()))
    }

    fn wrong_type(&self, path: &str, expected: &'static str, actual: &DatapointValue) -> ActuatorError {
        ActuatorError::WrongType {
            path: path.to_string(),
            expected,
            actual: actual.kind(),
        }
    }

    fn count(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.actuator_batches.with_label_values(&[result]).inc();
        }
    }
}
