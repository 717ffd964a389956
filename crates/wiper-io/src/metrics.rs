//! Prometheus metrics for the wiper bridge.
//!
//! Metrics live in a [`BridgeMetrics`] value owned by the adapter and shared
//! with each component, each instance with its own registry.

use prometheus::{Encoder, Gauge, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;
use std::thread;
use tiny_http::{Header, Response, Server};
use wiper_core::signals;

pub struct BridgeMetrics {
    registry: Registry,

    // Bus side
    pub events_published: IntCounter,
    pub set_requests: IntCounterVec,
    pub notifications_decoded: IntCounter,
    pub decode_failures: IntCounter,

    // Aggregation side
    pub actuator_batches: IntCounterVec,
    pub connect_failures: IntCounter,
    pub stream_restarts: IntCounter,
    pub subscriber_connected: Gauge,
    pub telemetry_batches: IntCounter,
    pub feed_failures: IntCounter,

    // Process state
    pub actual_position: Gauge,
    pub drive_current: Gauge,
}

impl BridgeMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounter::new(
            "wiper_events_published_total",
            "Telemetry events notified on the bus",
        )?;
        let set_requests = IntCounterVec::new(
            Opts::new(
                "wiper_set_requests_total",
                "Set requests handled by the request/response bridge",
            ),
            &["result"],
        )?;
        let notifications_decoded = IntCounter::new(
            "wiper_notifications_decoded_total",
            "Telemetry notifications received and decoded",
        )?;
        let decode_failures = IntCounter::new(
            "wiper_decode_failures_total",
            "Bus payloads rejected by the codec",
        )?;
        let actuator_batches = IntCounterVec::new(
            Opts::new(
                "wiper_actuator_batches_total",
                "Actuator target batches received from the aggregation service",
            ),
            &["result"],
        )?;
        let connect_failures = IntCounter::new(
            "wiper_subscriber_connect_failures_total",
            "Failed connection attempts to the aggregation service",
        )?;
        let stream_restarts = IntCounter::new(
            "wiper_subscriber_stream_restarts_total",
            "Actuator streams ended with a recoverable status",
        )?;
        let subscriber_connected = Gauge::new(
            "wiper_subscriber_connected",
            "Actuator stream status (1=open, 0=closed)",
        )?;
        let telemetry_batches = IntCounter::new(
            "wiper_telemetry_batches_total",
            "Sensor batches written to the aggregation service",
        )?;
        let feed_failures = IntCounter::new(
            "wiper_feed_failures_total",
            "Failed writes to the aggregation service",
        )?;
        let actual_position = Gauge::new(
            signals::ACTUAL_POSITION.metric,
            "Last reported wiper position in degrees",
        )?;
        let drive_current = Gauge::new(
            signals::DRIVE_CURRENT.metric,
            "Last reported wiper drive current in amperes",
        )?;

        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(set_requests.clone()))?;
        registry.register(Box::new(notifications_decoded.clone()))?;
        registry.register(Box::new(decode_failures.clone()))?;
        registry.register(Box::new(actuator_batches.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;
        registry.register(Box::new(stream_restarts.clone()))?;
        registry.register(Box::new(subscriber_connected.clone()))?;
        registry.register(Box::new(telemetry_batches.clone()))?;
        registry.register(Box::new(feed_failures.clone()))?;
        registry.register(Box::new(actual_position.clone()))?;
        registry.register(Box::new(drive_current.clone()))?;

        Ok(Self {
            registry,
            events_published,
            set_requests,
            notifications_decoded,
            decode_failures,
            actuator_batches,
            connect_failures,
            stream_restarts,
            subscriber_connected,
            telemetry_batches,
            feed_failures,
            actual_position,
            drive_current,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

/// Start the metrics HTTP server on the given address.
/// Returns a join handle for the server thread.
pub fn serve_metrics(bind_addr: String, metrics: Arc<BridgeMetrics>) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let server = match Server::http(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("Failed to start metrics server on {}: {}", bind_addr, e);
                return;
            }
        };

        tracing::info!("Metrics server listening on http://{}/metrics", bind_addr);

        for request in server.incoming_requests() {
            match request.url() {
                "/metrics" => {
                    let buffer = match metrics.encode() {
                        Ok(buffer) => buffer,
                        Err(e) => {
                            tracing::warn!("Failed to encode metrics: {}", e);
                            let _ = request.respond(
                                Response::from_string("Internal Server Error")
                                    .with_status_code(500),
                            );
                            continue;
                        }
                    };
                    let mut response = Response::from_data(buffer);
                    if let Ok(header) = Header::from_bytes(
                        &b"Content-Type"[..],
                        &b"text/plain; version=0.0.4"[..],
                    ) {
                        response = response.with_header(header);
                    }
                    let _ = request.respond(response);
                }
                "/health" => {
                    let _ = request.respond(Response::from_string("OK"));
                }
                "/ready" => {
                    // Ready once telemetry has been published at least once
                    if metrics.events_published.get() > 0 {
                        let _ = request.respond(Response::from_string("Ready"));
                    } else {
                        let _ = request
                            .respond(Response::from_string("Not Ready").with_status_code(503));
                    }
                }
                _ => {
                    let _ =
                        request.respond(Response::from_string("Not Found").with_status_code(404));
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instances_do_not_share_state() {
        let a = BridgeMetrics::new().unwrap();
        let b = BridgeMetrics::new().unwrap();
        a.events_published.inc();
        assert_eq!(a.events_published.get(), 1);
        assert_eq!(b.events_published.get(), 0);
    }

    #[test]
    fn encodes_text_exposition() {
        let metrics = BridgeMetrics::new().unwrap();
        metrics.set_requests.with_label_values(&["ok"]).inc();
        metrics.actual_position.set(42.5);
        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("wiper_set_requests_total{result=\"ok\"} 1"));
        assert!(text.contains("wiper_actual_position_degrees 42.5"));
    }
}
