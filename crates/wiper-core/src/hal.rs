use crate::codec::{SetRequest, TelemetryEvent};

/// Wiper ECU as seen by the bus side: accepts set requests and yields telemetry.
///
/// Implementations serialize `apply` and `sample` internally; callers may hold
/// the model behind an `Arc` and use it from several threads.
pub trait WiperEcu: Send + Sync {
    fn apply(&self, request: &SetRequest);
    fn sample(&self) -> TelemetryEvent;
    fn is_cycle_ending(&self) -> bool;
}
