//! Single consumer of the bus event queue.

use crate::bus::{BusClient, BusEvent, BusMessage, BusSettings, BusState, MessageKind};
use crate::feeder::TelemetryFeeder;
use crate::notifier::NotificationPump;
use crate::responder::RequestResponseBridge;
use std::collections::BTreeSet;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, info, warn};
use wiper_core::codec::hex_dump;

/// Routes bus events to the components of the adapter.
///
/// With a pump or responder attached the application acts as the wiper
/// service and offers its event and set-request method. With a feeder
/// attached it subscribes to the wiper event.
pub struct BusDispatcher {
    bus: Arc<dyn BusClient>,
    settings: BusSettings,
    pump: Option<Arc<NotificationPump>>,
    responder: Option<Arc<RequestResponseBridge>>,
    feeder: Option<Arc<TelemetryFeeder>>,
}

impl BusDispatcher {
    pub fn new(bus: Arc<dyn BusClient>, settings: BusSettings) -> Self {
        Self {
            bus,
            settings,
            pump: None,
            responder: None,
            feeder: None,
        }
    }

    pub fn with_pump(mut self, pump: Arc<NotificationPump>) -> Self {
        self.pump = Some(pump);
        self
    }

    pub fn with_responder(mut self, responder: Arc<RequestResponseBridge>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn with_feeder(mut self, feeder: Arc<TelemetryFeeder>) -> Self {
        self.feeder = Some(feeder);
        self
    }

    /// Consumes events until every sender of the queue is dropped.
    pub fn run(&self, events: Receiver<BusEvent>) {
        let mut consumers = BTreeSet::new();
        for event in events {
            self.handle(event, &mut consumers);
        }
        if let Some(pump) = &self.pump {
            pump.set_offered(false);
        }
        info!(app = %self.bus.name(), "bus dispatcher stopped");
    }

    fn handle(&self, event: BusEvent, consumers: &mut BTreeSet<u16>) {
        match event {
            BusEvent::State(BusState::Registered) => self.on_registered(),
            BusEvent::State(BusState::Deregistered) => {
                info!(app = %self.bus.name(), "deregistered");
                consumers.clear();
                if let Some(pump) = &self.pump {
                    pump.set_offered(false);
                }
            }
            BusEvent::Availability {
                service,
                instance,
                available,
            } => {
                info!(
                    service = format_args!("{service:04x}"),
                    instance = format_args!("{instance:04x}"),
                    available,
                    "service availability"
                );
            }
            BusEvent::Subscription {
                service,
                instance,
                eventgroup,
                client,
                subscribed,
            } => {
                let event_addr = self.settings.event_addr();
                if (service, instance) != event_addr.key() || eventgroup != self.settings.eventgroup
                {
                    return;
                }
                if subscribed {
                    consumers.insert(client);
                } else {
                    consumers.remove(&client);
                }
                debug!(client, subscribed, consumers = consumers.len(), "telemetry subscription");
                if let Some(pump) = &self.pump {
                    pump.set_offered(!consumers.is_empty());
                }
            }
            BusEvent::Message(message) => self.on_message(message),
        }
    }

    fn on_registered(&self) {
        let event_addr = self.settings.event_addr();
        let set_addr = self.settings.set_addr();
        info!(app = %self.bus.name(), "registered");

        if self.pump.is_some() || self.responder.is_some() {
            self.bus.offer_service(event_addr);
            self.bus
                .offer_event(event_addr, self.settings.event_id, self.settings.eventgroup);
            self.bus.offer_service(set_addr);
        }
        if self.feeder.is_some() {
            self.bus.request_service(event_addr);
            self.bus
                .request_event(event_addr, self.settings.event_id, self.settings.eventgroup);
            self.bus.subscribe(event_addr, self.settings.eventgroup);
        }
        self.bus.request_service(set_addr);
    }

    fn is_set_method(&self, message: &BusMessage) -> bool {
        let set_addr = self.settings.set_addr();
        (message.service, message.instance) == set_addr.key()
            && message.method == self.settings.set_method
    }

    fn is_wiper_event(&self, message: &BusMessage) -> bool {
        let event_addr = self.settings.event_addr();
        (message.service, message.instance) == event_addr.key()
            && message.method == self.settings.event_id
    }

    fn on_message(&self, message: BusMessage) {
        match message.kind {
            MessageKind::Request if self.is_set_method(&message) => {
                let Some(responder) = &self.responder else {
                    warn!(%message, "no handler for set request");
                    return;
                };
                let response = responder.handle_message(&message);
                if let Err(e) = self.bus.send(response) {
                    warn!(error = %e, "failed to send set response");
                }
            }
            MessageKind::Notification if self.is_wiper_event(&message) => {
                if let Some(feeder) = &self.feeder {
                    feeder.feed_payload(&message.payload);
                }
            }
            MessageKind::Response | MessageKind::Error if self.is_set_method(&message) => {
                info!(
                    session = message.session,
                    status = message.payload.first().copied(),
                    payload = %hex_dump(&message.payload),
                    "set request response"
                );
            }
            _ => {
                warn!(%message, "ignored non-wiper message");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_bus::LocalBus;
    use crate::memory_broker::MemoryBroker;
    use crate::notifier::{BusEventPublisher, PumpConfig};
    use crate::responder::{STATUS_INVALID_MODE, STATUS_OK};
    use std::sync::mpsc::channel;
    use std::thread;
    use std::time::{Duration, Instant};
    use wiper_core::{
        encode_event, encode_set_request, ManualClock, SetRequest, SimConfig, TelemetryEvent,
        WiperMode, WiperSimulator, WIPER_ROOT,
    };

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(5), "condition not reached");
            thread::sleep(Duration::from_millis(2));
        }
    }

    struct Harness {
        bus: LocalBus,
        app: Arc<dyn BusClient>,
        handle: thread::JoinHandle<()>,
    }

    impl Harness {
        fn start(bus: LocalBus, build: impl FnOnce(Arc<dyn BusClient>) -> BusDispatcher) -> Self {
            let client = bus.client("adapter");
            client.init().unwrap();
            let app: Arc<dyn BusClient> = Arc::new(client);
            let (tx, rx) = channel();
            app.register_handlers(tx.clone());
            let dispatcher = build(app.clone());
            let handle = thread::spawn(move || dispatcher.run(rx));
            tx.send(BusEvent::State(BusState::Registered)).unwrap();
            Self { bus, app, handle }
        }

        fn finish(self) {
            self.app.clear_all_handlers();
            self.handle.join().unwrap();
        }
    }

    fn peer(bus: &LocalBus) -> (crate::local_bus::LocalBusClient, Receiver<BusEvent>) {
        let client = bus.client("peer");
        client.init().unwrap();
        let (tx, rx) = channel();
        client.register_handlers(tx);
        (client, rx)
    }

    fn simulator() -> Arc<WiperSimulator> {
        Arc::new(WiperSimulator::with_clock(
            SimConfig::default(),
            Arc::new(ManualClock::new(0)),
        ))
    }

    fn response_status(rx: &Receiver<BusEvent>) -> u8 {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                BusEvent::Message(msg) if msg.kind == MessageKind::Response => {
                    return msg.payload[0]
                }
                _ => continue,
            }
        }
    }

    #[test]
    fn subscription_marks_pump_offered() {
        let settings = BusSettings::default();
        let bus = LocalBus::new();
        let pump_slot = std::sync::Mutex::new(None);
        let harness = Harness::start(bus, |app| {
            let publisher = Arc::new(BusEventPublisher::new(
                app.clone(),
                settings.event_addr(),
                settings.event_id,
            ));
            let pump = Arc::new(NotificationPump::new(
                PumpConfig::default(),
                simulator(),
                publisher,
            ));
            *pump_slot.lock().unwrap() = Some(pump.clone());
            BusDispatcher::new(app, settings.clone()).with_pump(pump)
        });
        let pump = pump_slot.lock().unwrap().clone().unwrap();
        wait_for(|| harness.bus.is_offered(settings.set_addr()));
        assert!(!pump.is_offered());

        let (peer, _rx) = peer(&harness.bus);
        peer.subscribe(settings.event_addr(), settings.eventgroup);
        wait_for(|| pump.is_offered());
        peer.unsubscribe(settings.event_addr(), settings.eventgroup);
        wait_for(|| !pump.is_offered());
        harness.finish();
    }

    #[test]
    fn set_request_is_answered() {
        let settings = BusSettings::default();
        let sim = simulator();
        let responder = Arc::new(RequestResponseBridge::new(sim.clone()));
        let harness = Harness::start(LocalBus::new(), |app| {
            BusDispatcher::new(app, settings.clone()).with_responder(responder)
        });
        wait_for(|| harness.bus.is_offered(settings.set_addr()));

        let (peer, rx) = peer(&harness.bus);
        let request = SetRequest {
            frequency: 40,
            target_position: 80.0,
            mode: WiperMode::Wipe,
        };
        peer.send(BusMessage::request(
            settings.set_addr(),
            settings.set_method,
            encode_set_request(&request).to_vec(),
        ))
        .unwrap();
        assert_eq!(response_status(&rx), STATUS_OK);
        assert_eq!(sim.model_step().is_wiping, 1);

        let mut bad = encode_set_request(&request);
        bad[5] = 7;
        peer.send(BusMessage::request(
            settings.set_addr(),
            settings.set_method,
            bad.to_vec(),
        ))
        .unwrap();
        assert_eq!(response_status(&rx), STATUS_INVALID_MODE);
        harness.finish();
    }

    #[test]
    fn wiper_notifications_are_fed() {
        let settings = BusSettings::default();
        let broker = Arc::new(MemoryBroker::new("mem"));
        let feeder = Arc::new(TelemetryFeeder::new(broker.clone(), WIPER_ROOT));

        let bus = LocalBus::new();
        let (ecu, _ecu_rx) = peer(&bus);
        ecu.offer_service(settings.event_addr());
        ecu.offer_event(settings.event_addr(), settings.event_id, settings.eventgroup);

        let harness = Harness::start(bus, |app| {
            BusDispatcher::new(app, settings.clone()).with_feeder(feeder)
        });
        wait_for(|| harness.bus.subscriber_count(settings.event_addr(), settings.eventgroup) == 1);

        let event = TelemetryEvent {
            actual_position: 33.0,
            ..TelemetryEvent::default()
        };
        ecu.notify(settings.event_addr(), settings.event_id, &encode_event(&event))
            .unwrap();
        wait_for(|| broker.updates().len() == 1);
        assert_eq!(
            broker.value(&wiper_core::signals::ACTUAL_POSITION.path(WIPER_ROOT)),
            Some(crate::broker::DatapointValue::Float(33.0))
        );

        // Undecodable notifications are dropped.
        ecu.notify(settings.event_addr(), settings.event_id, &[0; 4])
            .unwrap();
        harness.finish();
        assert_eq!(broker.updates().len(), 1);
    }

    #[test]
    fn foreign_subscription_is_ignored() {
        let settings = BusSettings::default();
        let bus = LocalBus::new();
        let pump = Arc::new(NotificationPump::new(
            PumpConfig::default(),
            simulator(),
            Arc::new(BusEventPublisher::new(
                Arc::new(bus.client("unused")),
                settings.event_addr(),
                settings.event_id,
            )),
        ));
        let (tx, rx) = channel();
        let dispatcher =
            BusDispatcher::new(Arc::new(bus.client("adapter")), settings.clone())
                .with_pump(pump.clone());
        tx.send(BusEvent::Subscription {
            service: 0x1234,
            instance: 1,
            eventgroup: settings.eventgroup,
            client: 9,
            subscribed: true,
        })
        .unwrap();
        drop(tx);
        dispatcher.run(rx);
        assert!(!pump.is_offered());
    }
}
