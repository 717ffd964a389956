//! Lifecycle owner of the wiper bridge.
//!
//! Wires the simulator, notification pump, request/response bridge, bus
//! dispatcher, actuator subscriber and telemetry feeder together and runs
//! each long-lived loop on its own named thread.

use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use wiper_core::signals::{ACTUAL_POSITION, TARGET_POSITION};
use wiper_core::{LifecycleFlag, SimConfig, WiperSimulator, WIPER_ROOT};
use wiper_io::{
    ActuatorBridge, AggregationClient, BridgeMetrics, BusClient, BusDispatcher, BusError,
    BusEvent, BusEventPublisher, BusRequestPath, BusSettings, DatapointValue, NotificationPump,
    PumpConfig, ReconnectingSubscriber, RequestResponseBridge, SetRequestSink, SubscriberConfig,
    SubscriberExit, TelemetryFeeder, UpdateBatch,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterState {
    Created,
    Initialized,
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter is {actual:?}, expected {expected:?}")]
    InvalidState {
        expected: AdapterState,
        actual: AdapterState,
    },
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub signal_root: String,
    pub bus: BusSettings,
    pub sim: SimConfig,
    pub pump: PumpConfig,
    pub subscriber: SubscriberConfig,
    /// Interval between batches of the degraded dummy feed.
    pub dummy_interval: Duration,
    /// Pause between thread launches in [`Adapter::start`].
    pub settle_delay: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            signal_root: WIPER_ROOT.to_string(),
            bus: BusSettings::default(),
            sim: SimConfig::default(),
            pump: PumpConfig::default(),
            subscriber: SubscriberConfig::default(),
            dummy_interval: Duration::from_secs(1),
            settle_delay: Duration::from_millis(50),
        }
    }
}

/// Bus-facing half of the adapter. Absent in degraded mode.
struct BusSide {
    client: Arc<dyn BusClient>,
    pump: Arc<NotificationPump>,
    events: Mutex<Option<Receiver<BusEvent>>>,
}

#[derive(Default)]
struct Threads {
    pump: Option<JoinHandle<()>>,
    subscriber: Option<JoinHandle<()>>,
    bus: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
}

pub struct Adapter {
    config: AdapterConfig,
    metrics: Arc<BridgeMetrics>,
    simulator: Arc<WiperSimulator>,
    responder: Arc<RequestResponseBridge>,
    feeder: Arc<TelemetryFeeder>,
    subscriber: Arc<ReconnectingSubscriber>,
    actuator: Arc<ActuatorBridge>,
    bus: Option<BusSide>,
    state: Mutex<AdapterState>,
    /// Serializes shutdown; true once the stop sequence ran.
    shutdown_done: Mutex<bool>,
    running: LifecycleFlag,
    threads: Mutex<Threads>,
}

impl Adapter {
    /// Builds the component graph. Without a bus client the adapter runs the
    /// degraded dummy feed on [`Adapter::start`].
    pub fn new(
        config: AdapterConfig,
        bus: Option<Arc<dyn BusClient>>,
        broker: Arc<dyn AggregationClient>,
        metrics: Arc<BridgeMetrics>,
    ) -> Self {
        let simulator = Arc::new(WiperSimulator::new(config.sim.clone()));
        let responder = Arc::new(
            RequestResponseBridge::new(simulator.clone()).with_metrics(metrics.clone()),
        );
        let feeder = Arc::new(
            TelemetryFeeder::new(broker.clone(), &config.signal_root)
                .with_metrics(metrics.clone()),
        );

        let sink: Arc<dyn SetRequestSink> = match &bus {
            Some(client) => Arc::new(BusRequestPath::new(
                client.clone(),
                config.bus.set_addr(),
                config.bus.set_method,
            )),
            None => responder.clone(),
        };
        let actuator = Arc::new(
            ActuatorBridge::new(&config.signal_root, sink).with_metrics(metrics.clone()),
        );
        let subscriber = Arc::new(
            ReconnectingSubscriber::new(broker, actuator.paths(), config.subscriber.clone())
                .with_metrics(metrics.clone()),
        );

        let bus = bus.map(|client| {
            let publisher = Arc::new(BusEventPublisher::new(
                client.clone(),
                config.bus.event_addr(),
                config.bus.event_id,
            ));
            let pump = Arc::new(
                NotificationPump::new(config.pump.clone(), simulator.clone(), publisher)
                    .with_metrics(metrics.clone()),
            );
            BusSide {
                client,
                pump,
                events: Mutex::new(None),
            }
        });

        Self {
            config,
            metrics,
            simulator,
            responder,
            feeder,
            subscriber,
            actuator,
            bus,
            state: Mutex::new(AdapterState::Created),
            shutdown_done: Mutex::new(false),
            running: LifecycleFlag::new(),
            threads: Mutex::new(Threads::default()),
        }
    }

    pub fn state(&self) -> AdapterState {
        *self.state_lock()
    }

    pub fn is_degraded(&self) -> bool {
        self.bus.is_none()
    }

    pub fn metrics(&self) -> &Arc<BridgeMetrics> {
        &self.metrics
    }

    pub fn simulator(&self) -> &Arc<WiperSimulator> {
        &self.simulator
    }

    fn state_lock(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn threads(&self) -> MutexGuard<'_, Threads> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, expected: AdapterState, next: AdapterState) -> Result<(), AdapterError> {
        let mut state = self.state_lock();
        if *state != expected {
            return Err(AdapterError::InvalidState {
                expected,
                actual: *state,
            });
        }
        debug!(from = ?*state, to = ?next, "adapter state");
        *state = next;
        Ok(())
    }

    /// Registers the signal metadata and attaches the bus event queue.
    pub fn init(&self) -> Result<(), AdapterError> {
        self.transition(AdapterState::Created, AdapterState::Initialized)?;

        if let Err(e) = self.feeder.register_signals() {
            warn!(error = %e, "failed to register wiper signals");
        }
        if let Some(side) = &self.bus {
            side.client.init()?;
            let (tx, rx) = std::sync::mpsc::channel();
            side.client.register_handlers(tx);
            *side.events.lock().unwrap_or_else(PoisonError::into_inner) = Some(rx);
            info!(
                app = %side.client.name(),
                client = side.client.client_id(),
                transport = self.config.bus.transport(),
                "bus application initialized"
            );
        }
        Ok(())
    }

    /// Launches pump, subscriber and bus threads in that order. In degraded
    /// mode pushes the dummy ramp instead and returns when it is done.
    pub fn start(&self) -> Result<(), AdapterError> {
        self.transition(AdapterState::Initialized, AdapterState::Running)?;
        self.running.raise();

        let Some(side) = &self.bus else {
            warn!("bus not configured, feeding dummy data");
            let batches = self.feed_dummy_data();
            info!(batches, "dummy feed finished");
            return Ok(());
        };

        let pump = side.pump.clone();
        let handle = spawn_named("wiper-pump", move || pump.run())?;
        self.threads().pump = Some(handle);
        thread::sleep(self.config.settle_delay);

        let subscriber = self.subscriber.clone();
        let actuator = self.actuator.clone();
        let handle = spawn_named("actuator-sub", move || {
            match subscriber.run(|batch| actuator.on_update(batch)) {
                SubscriberExit::Shutdown => debug!("actuator subscriber finished"),
                exit => error!(?exit, "actuator path stopped, telemetry feed continues"),
            }
        })?;
        self.threads().subscriber = Some(handle);
        thread::sleep(self.config.settle_delay);

        let events = side
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(events) = events {
            let dispatcher = BusDispatcher::new(side.client.clone(), self.config.bus.clone())
                .with_pump(side.pump.clone())
                .with_responder(self.responder.clone())
                .with_feeder(self.feeder.clone());
            let handle = spawn_named("bus-dispatch", move || dispatcher.run(events))?;
            self.threads().dispatch = Some(handle);
        }
        let client = side.client.clone();
        let handle = spawn_named("bus-main", move || client.start())?;
        self.threads().bus = Some(handle);

        info!(root = %self.config.signal_root, "wiper adapter running");
        Ok(())
    }

    /// Blocks until shutdown begins or `timeout` passes. Returns true if
    /// shutdown began.
    pub fn wait_for_shutdown(&self, timeout: Duration) -> bool {
        self.running.wait_for_down(timeout)
    }

    /// Runs the stop sequence. Concurrent and repeated calls collapse into one
    /// execution; only that call returns true.
    pub fn shutdown(&self) -> bool {
        let mut done = self
            .shutdown_done
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *done {
            debug!("shutdown already performed");
            return false;
        }
        *done = true;
        *self.state_lock() = AdapterState::ShuttingDown;
        info!("wiper adapter shutting down");

        self.running.lower();
        self.subscriber.shutdown();
        if let Some(side) = &self.bus {
            side.pump.stop();
            self.stop_bus(side.client.as_ref());
        }

        let mut threads = std::mem::take(&mut *self.threads());
        join_named("actuator-sub", threads.subscriber.take());
        join_named("bus-main", threads.bus.take());
        join_named("bus-dispatch", threads.dispatch.take());
        join_named("wiper-pump", threads.pump.take());

        *self.state_lock() = AdapterState::Stopped;
        info!("wiper adapter stopped");
        true
    }

    fn stop_bus(&self, client: &dyn BusClient) {
        let settings = &self.config.bus;
        let event_addr = settings.event_addr();
        let set_addr = settings.set_addr();
        client.unsubscribe(event_addr, settings.eventgroup);
        client.release_event(event_addr, settings.event_id);
        client.release_service(event_addr);
        client.release_service(set_addr);
        client.stop_offer_service(event_addr);
        client.stop_offer_service(set_addr);
        client.clear_all_handlers();
        client.stop();
    }

    /// Pushes one ramp of synthetic positions to the aggregation service.
    /// Stops early on shutdown. Returns the number of batches written.
    pub fn feed_dummy_data(&self) -> usize {
        const RAMP_END: f32 = 110.0;
        #[allow(clippy::approx_constant)]
        const RAMP_STEP: f32 = 3.14;

        let actual = ACTUAL_POSITION.path(&self.config.signal_root);
        let target = TARGET_POSITION.path(&self.config.signal_root);
        let mut position = 0.0f32;
        let mut batches = 0;
        while position < RAMP_END {
            let batch = UpdateBatch::from([
                (actual.clone(), DatapointValue::Float(position)),
                (target.clone(), DatapointValue::Float(RAMP_END)),
            ]);
            match self.feeder.feed_batch(&batch) {
                Ok(()) => {
                    debug!(position, "dummy feed");
                    batches += 1;
                }
                Err(e) => warn!(error = %e, "dummy feed update failed"),
            }
            position += RAMP_STEP;
            if self.running.wait_for_down(self.config.dummy_interval) {
                debug!("dummy feed interrupted by shutdown");
                break;
            }
        }
        batches
    }
}

fn spawn_named<F>(name: &'static str, body: F) -> Result<JoinHandle<()>, AdapterError>
where
    F: FnOnce() + Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| AdapterError::Spawn { name, source })
}

/// Joins unless called from the thread itself, which would deadlock.
fn join_named(name: &str, handle: Option<JoinHandle<()>>) {
    let Some(handle) = handle else {
        return;
    };
    if handle.thread().id() == thread::current().id() {
        warn!(thread = name, "shutdown called from own thread, detaching");
        return;
    }
    if handle.join().is_err() {
        error!(thread = name, "thread panicked");
    }
}
