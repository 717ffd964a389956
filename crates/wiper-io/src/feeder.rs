//! Writes decoded wiper telemetry to the aggregation service.

use crate::broker::{AggregationClient, BrokerError, DatapointMetadata, DatapointValue, UpdateBatch};
use crate::metrics::BridgeMetrics;
use std::sync::Arc;
use tracing::{debug, warn};
use wiper_core::signals::{
    self, ACTUAL_POSITION, DRIVE_CURRENT, IS_BLOCKED, IS_ENDING_WIPE_CYCLE, IS_OVERHEATED,
    IS_POSITION_REACHED, IS_WIPER_ERROR, IS_WIPING,
};
use wiper_core::{decode_event, TelemetryEvent};

pub struct TelemetryFeeder {
    client: Arc<dyn AggregationClient>,
    root: String,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl TelemetryFeeder {
    pub fn new(client: Arc<dyn AggregationClient>, root: &str) -> Self {
        Self {
            client,
            root: root.to_string(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Registers metadata for every signal of the wiper group.
    pub fn register_signals(&self) -> Result<(), BrokerError> {
        let metadata: Vec<DatapointMetadata> = signals::ALL
            .iter()
            .map(|signal| DatapointMetadata::for_signal(signal, &self.root))
            .collect();
        self.client.register_datapoints(&metadata)?;
        debug!(count = metadata.len(), root = %self.root, "registered wiper signals");
        Ok(())
    }

    /// Sensor values carried by one telemetry event.
    pub fn sensor_batch(&self, event: &TelemetryEvent) -> UpdateBatch {
        let float = DatapointValue::Float;
        let flag = |v: u8| DatapointValue::Bool(v != 0);
        UpdateBatch::from([
            (ACTUAL_POSITION.path(&self.root), float(event.actual_position)),
            (DRIVE_CURRENT.path(&self.root), float(event.drive_current)),
            (IS_WIPING.path(&self.root), flag(event.is_wiping)),
            (IS_BLOCKED.path(&self.root), flag(event.is_blocked)),
            (
                IS_ENDING_WIPE_CYCLE.path(&self.root),
                flag(event.is_ending_wipe_cycle),
            ),
            (IS_OVERHEATED.path(&self.root), flag(event.is_overheated)),
            (
                IS_POSITION_REACHED.path(&self.root),
                flag(event.is_position_reached),
            ),
            (IS_WIPER_ERROR.path(&self.root), flag(event.is_wiper_error)),
        ])
    }

    pub fn feed_event(&self, event: &TelemetryEvent) -> Result<(), BrokerError> {
        let batch = self.sensor_batch(event);
        match self.client.update_datapoints(&batch) {
            Ok(()) => {
                if let Some(metrics) = &self.metrics {
                    metrics.telemetry_batches.inc();
                }
                Ok(())
            }
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.feed_failures.inc();
                }
                Err(e)
            }
        }
    }

    /// Decodes a telemetry notification payload and feeds it.
    /// Decode and upsert failures are logged and counted; nothing is written
    /// for an undecodable payload.
    pub fn feed_payload(&self, payload: &[u8]) {
        let event = match decode_event(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "dropping telemetry notification");
                if let Some(metrics) = &self.metrics {
                    metrics.decode_failures.inc();
                }
                return;
            }
        };
        if let Some(metrics) = &self.metrics {
            metrics.notifications_decoded.inc();
        }
        debug!(%event, "wiper event");
        if let Err(e) = self.feed_event(&event) {
            warn!(error = %e, "failed to feed wiper telemetry");
        }
    }

    /// Upserts arbitrary values, used by the dummy feed.
    pub fn feed_batch(&self, batch: &UpdateBatch) -> Result<(), BrokerError> {
        self.client.update_datapoints(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ChangeType;
    use crate::memory_broker::MemoryBroker;
    use wiper_core::{encode_event, WIPER_ROOT};

    fn feeder() -> (Arc<MemoryBroker>, TelemetryFeeder) {
        let broker = Arc::new(MemoryBroker::new("mem"));
        (broker.clone(), TelemetryFeeder::new(broker, WIPER_ROOT))
    }

    #[test]
    fn registers_all_signals() {
        let (broker, feeder) = feeder();
        feeder.register_signals().unwrap();
        for signal in signals::ALL {
            let md = broker.metadata(&signal.path(WIPER_ROOT)).unwrap();
            assert_eq!(md.data_type, signal.data_type);
            assert_eq!(md.change_type, ChangeType::OnChange);
            assert!(!md.description.is_empty());
        }
    }

    #[test]
    fn event_feeds_eight_sensor_values() {
        let (broker, feeder) = feeder();
        let event = TelemetryEvent {
            actual_position: 42.0,
            drive_current: 9.5,
            is_wiping: 1,
            is_position_reached: 0,
            is_overheated: 3,
            ..TelemetryEvent::default()
        };
        feeder.feed_payload(&encode_event(&event));

        let updates = broker.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].len(), 8);
        assert_eq!(
            broker.value(&ACTUAL_POSITION.path(WIPER_ROOT)),
            Some(DatapointValue::Float(42.0))
        );
        assert_eq!(
            broker.value(&IS_WIPING.path(WIPER_ROOT)),
            Some(DatapointValue::Bool(true))
        );
        assert_eq!(
            broker.value(&IS_OVERHEATED.path(WIPER_ROOT)),
            Some(DatapointValue::Bool(true))
        );
        assert_eq!(
            broker.value(&IS_POSITION_REACHED.path(WIPER_ROOT)),
            Some(DatapointValue::Bool(false))
        );
    }

    #[test]
    fn undecodable_payload_writes_nothing() {
        let (broker, feeder) = feeder();
        let metrics = Arc::new(BridgeMetrics::new().unwrap());
        let feeder = feeder.with_metrics(metrics.clone());
        feeder.feed_payload(&[1, 2, 3]);
        assert!(broker.updates().is_empty());
        assert_eq!(metrics.decode_failures.get(), 1);
        assert_eq!(metrics.notifications_decoded.get(), 0);
    }
}
