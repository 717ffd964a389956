//! Request/response bridge for the wiper set-request method.

use crate::bus::BusMessage;
use crate::metrics::BridgeMetrics;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use wiper_core::codec::hex_dump;
use wiper_core::{decode_set_request, CodecError, SetRequest, WiperEcu};

pub const STATUS_OK: u8 = 0x00;
pub const STATUS_PAYLOAD_SIZE: u8 = 0x01;
pub const STATUS_INVALID_MODE: u8 = 0x02;

pub fn status_for(err: &CodecError) -> u8 {
    match err {
        CodecError::PayloadSize { .. } => STATUS_PAYLOAD_SIZE,
        CodecError::InvalidEnum { .. } | CodecError::UnknownMode(_) => STATUS_INVALID_MODE,
    }
}

pub struct RequestResponseBridge {
    ecu: Arc<dyn WiperEcu>,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl RequestResponseBridge {
    pub fn new(ecu: Arc<dyn WiperEcu>) -> Self {
        Self { ecu, metrics: None }
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Decodes and applies a set-request payload. Returns the response status byte.
    pub fn handle_payload(&self, payload: &[u8]) -> u8 {
        match decode_set_request(payload) {
            Ok(request) => {
                self.apply(&request);
                self.count("ok");
                STATUS_OK
            }
            Err(e) => {
                warn!(error = %e, payload = %hex_dump(payload), "rejecting set request");
                self.count("rejected");
                status_for(&e)
            }
        }
    }

    /// Applies an already decoded request, bypassing the wire format.
    pub fn apply(&self, request: &SetRequest) {
        info!(%request, "applying set request");
        self.ecu.apply(request);
    }

    /// Builds the response for a bus request.
    #[instrument(skip_all, fields(client = request.client, session = request.session))]
    pub fn handle_message(&self, request: &BusMessage) -> BusMessage {
        let status = self.handle_payload(&request.payload);
        BusMessage::response_to(request, vec![status])
    }

    fn count(&self, result: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.set_requests.with_label_values(&[result]).inc();
        }
    }
}
