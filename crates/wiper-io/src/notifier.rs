//! Drives the wiper model and publishes its telemetry while a consumer is subscribed.

use crate::bus::{BusClient, BusError, ServiceAddr};
use crate::metrics::BridgeMetrics;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use wiper_core::codec::hex_dump;
use wiper_core::{encode_event, LifecycleFlag, TelemetryEvent, WaitFlag, WiperEcu, EVENT_PAYLOAD_SIZE};

#[derive(Debug, Clone)]
pub struct PumpConfig {
    /// Nominal interval between published events.
    pub publish_cycle: Duration,
    /// Model step interval; must be shorter than `publish_cycle`.
    pub step_interval: Duration,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            publish_cycle: Duration::from_millis(100),
            step_interval: Duration::from_millis(10),
        }
    }
}

pub trait EventPublisher: Send + Sync {
    fn publish(&self, payload: &[u8]) -> Result<(), BusError>;
}

/// Publishes through `notify` on the telemetry event.
pub struct BusEventPublisher {
    bus: Arc<dyn BusClient>,
    addr: ServiceAddr,
    event: u16,
}

impl BusEventPublisher {
    pub fn new(bus: Arc<dyn BusClient>, addr: ServiceAddr, event: u16) -> Self {
        Self { bus, addr, event }
    }
}

impl EventPublisher for BusEventPublisher {
    fn publish(&self, payload: &[u8]) -> Result<(), BusError> {
        self.bus.notify(self.addr, self.event, payload)
    }
}

pub struct NotificationPump {
    config: PumpConfig,
    ecu: Arc<dyn WiperEcu>,
    publisher: Arc<dyn EventPublisher>,
    metrics: Option<Arc<BridgeMetrics>>,
    running: LifecycleFlag,
    offered: WaitFlag,
    payload: Mutex<[u8; EVENT_PAYLOAD_SIZE]>,
}

impl NotificationPump {
    pub fn new(
        config: PumpConfig,
        ecu: Arc<dyn WiperEcu>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            config,
            ecu,
            publisher,
            metrics: None,
            running: LifecycleFlag::new(),
            offered: WaitFlag::new(false),
            payload: Mutex::new([0u8; EVENT_PAYLOAD_SIZE]),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BridgeMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.is_up()
    }

    pub fn is_offered(&self) -> bool {
        self.offered.get()
    }

    /// Marks whether a consumer is subscribed to the telemetry event.
    pub fn set_offered(&self, offered: bool) {
        if self.offered.set(offered) != offered {
            info!(offered, "telemetry consumer state changed");
        }
    }

    /// Requests the run loop to exit. Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let lowered = self.running.lower();
        self.offered.wake();
        lowered
    }

    /// Runs until [`NotificationPump::stop`]. Blocks while nobody is subscribed.
    pub fn run(&self) {
        if !self.running.raise() {
            warn!("notification pump already ran or was stopped before start");
            return;
        }
        info!(
            cycle_ms = self.config.publish_cycle.as_millis() as u64,
            step_ms = self.config.step_interval.as_millis() as u64,
            "notification pump started"
        );

        while self.running.is_up() {
            self.offered
                .wait_until(|offered| offered || !self.running.is_up());
            if !self.running.is_up() {
                break;
            }
            self.pump_while_offered();
        }
        info!("notification pump stopped");
    }

    fn pump_while_offered(&self) {
        debug!("consumer present, publishing telemetry");
        let mut last_ending = self.ecu.is_cycle_ending();
        let mut accumulated = Duration::ZERO;
        let mut last_tick = Instant::now();
        let mut publish_now = true;

        while self.running.is_up() && self.offered.get() {
            let event = self.ecu.sample();
            let ending = event.is_ending_wipe_cycle != 0;
            if ending != last_ending {
                trace!(ending, "cycle ending changed, publishing early");
                last_ending = ending;
                publish_now = true;
            }

            let now = Instant::now();
            accumulated += now - last_tick;
            last_tick = now;

            if publish_now || accumulated >= self.config.publish_cycle {
                self.publish(&event);
                accumulated = Duration::ZERO;
                publish_now = false;
            }
            thread::sleep(self.config.step_interval);
        }
    }

    fn publish(&self, event: &TelemetryEvent) {
        let mut payload = self.payload.lock().unwrap_or_else(PoisonError::into_inner);
        *payload = encode_event(event);
        trace!(payload = %hex_dump(&payload[..]), "notify");
        match self.publisher.publish(&payload[..]) {
            Ok(()) => {
                debug!(%event, "published telemetry");
                if let Some(metrics) = &self.metrics {
                    metrics.events_published.inc();
                    metrics.actual_position.set(f64::from(event.actual_position));
                    metrics.drive_current.set(f64::from(event.drive_current));
                }
            }
            Err(e) => warn!(error = %e, "failed to publish telemetry"),
        }
    }
}
