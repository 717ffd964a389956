//! In-process service bus connecting applications within one process.
//!
//! Routing follows the service/instance/event addressing of the bus: services
//! and events are offered by one application, requests are routed to the
//! offering application and responses back to the requester by client id.
//! Events have field semantics: a new subscriber immediately receives the
//! last notified value.

use crate::bus::{BusClient, BusError, BusEvent, BusMessage, BusState, MessageKind, ServiceAddr};
use std::collections::{BTreeSet, HashMap};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};
use wiper_core::LifecycleFlag;

type ServiceKey = (u16, u16);
type EventKey = (u16, u16, u16);

#[derive(Debug, Default)]
struct AppSlot {
    name: String,
    handler: Option<Sender<BusEvent>>,
    requested: BTreeSet<ServiceKey>,
}

#[derive(Debug)]
struct EventSlot {
    owner: u16,
    eventgroup: u16,
    last: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Hub {
    next_client: u16,
    next_session: u16,
    apps: HashMap<u16, AppSlot>,
    offers: HashMap<ServiceKey, u16>,
    events: HashMap<EventKey, EventSlot>,
    /// (service, instance, eventgroup) -> subscribed client ids.
    subscriptions: HashMap<EventKey, BTreeSet<u16>>,
}

impl Hub {
    fn post(&self, client: u16, event: BusEvent) {
        let Some(app) = self.apps.get(&client) else {
            return;
        };
        if let Some(tx) = &app.handler {
            if tx.send(event).is_err() {
                trace!(app = %app.name, "handler queue closed, dropping bus event");
            }
        }
    }

    fn post_availability(&self, key: ServiceKey, available: bool) {
        for (id, app) in &self.apps {
            if app.requested.contains(&key) {
                self.post(
                    *id,
                    BusEvent::Availability {
                        service: key.0,
                        instance: key.1,
                        available,
                    },
                );
            }
        }
    }

    fn owner_of_group(&self, key: ServiceKey, eventgroup: u16) -> Option<u16> {
        self.events
            .iter()
            .find(|((svc, inst, _), slot)| (*svc, *inst) == key && slot.eventgroup == eventgroup)
            .map(|(_, slot)| slot.owner)
    }

    fn next_session(&mut self) -> u16 {
        self.next_session = self.next_session.wrapping_add(1).max(1);
        self.next_session
    }
}

/// Shared in-process bus. Cloning yields another handle to the same bus.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    hub: Arc<Mutex<Hub>>,
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates an application attached to this bus.
    pub fn client(&self, name: &str) -> LocalBusClient {
        let mut hub = self.lock();
        hub.next_client = hub.next_client.wrapping_add(1).max(1);
        let id = hub.next_client;
        hub.apps.insert(
            id,
            AppSlot {
                name: name.to_string(),
                ..AppSlot::default()
            },
        );
        LocalBusClient {
            bus: self.clone(),
            id,
            name: name.to_string(),
            initialized: Mutex::new(false),
            running: LifecycleFlag::new(),
        }
    }

    /// Number of applications subscribed to an eventgroup.
    pub fn subscriber_count(&self, addr: ServiceAddr, eventgroup: u16) -> usize {
        self.lock()
            .subscriptions
            .get(&(addr.service, addr.instance, eventgroup))
            .map_or(0, BTreeSet::len)
    }

    pub fn is_offered(&self, addr: ServiceAddr) -> bool {
        self.lock().offers.contains_key(&addr.key())
    }
}

pub struct LocalBusClient {
    bus: LocalBus,
    id: u16,
    name: String,
    initialized: Mutex<bool>,
    running: LifecycleFlag,
}

impl LocalBusClient {
    fn ensure_init(&self) -> Result<(), BusError> {
        if *self.initialized.lock().unwrap_or_else(PoisonError::into_inner) {
            Ok(())
        } else {
            Err(BusError::NotInitialized(self.name.clone()))
        }
    }
}

impl BusClient for LocalBusClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn client_id(&self) -> u16 {
        self.id
    }

    fn init(&self) -> Result<(), BusError> {
        *self.initialized.lock().unwrap_or_else(PoisonError::into_inner) = true;
        debug!(app = %self.name, client = self.id, "bus application initialized");
        Ok(())
    }

    fn register_handlers(&self, events: Sender<BusEvent>) {
        let mut hub = self.bus.lock();
        if let Some(app) = hub.apps.get_mut(&self.id) {
            app.handler = Some(events);
        }
    }

    fn clear_all_handlers(&self) {
        let mut hub = self.bus.lock();
        if let Some(app) = hub.apps.get_mut(&self.id) {
            app.handler = None;
        }
    }

    fn request_service(&self, addr: ServiceAddr) {
        let mut hub = self.bus.lock();
        let offered = hub.offers.contains_key(&addr.key());
        if let Some(app) = hub.apps.get_mut(&self.id) {
            app.requested.insert(addr.key());
        }
        if offered {
            hub.post(
                self.id,
                BusEvent::Availability {
                    service: addr.service,
                    instance: addr.instance,
                    available: true,
                },
            );
        }
    }

    fn release_service(&self, addr: ServiceAddr) {
        let mut hub = self.bus.lock();
        if let Some(app) = hub.apps.get_mut(&self.id) {
            app.requested.remove(&addr.key());
        }
    }

    fn offer_service(&self, addr: ServiceAddr) {
        let mut hub = self.bus.lock();
        hub.offers.insert(addr.key(), self.id);
        debug!(app = %self.name, service = %addr, "offering service");
        hub.post_availability(addr.key(), true);
    }

    fn stop_offer_service(&self, addr: ServiceAddr) {
        let mut hub = self.bus.lock();
        if hub.offers.get(&addr.key()) == Some(&self.id) {
            hub.offers.remove(&addr.key());
            debug!(app = %self.name, service = %addr, "stopped offering service");
            hub.post_availability(addr.key(), false);
        }
    }

    fn offer_event(&self, addr: ServiceAddr, event: u16, eventgroup: u16) {
        let mut hub = self.bus.lock();
        hub.events.insert(
            (addr.service, addr.instance, event),
            EventSlot {
                owner: self.id,
                eventgroup,
                last: None,
            },
        );
    }

    fn request_event(&self, addr: ServiceAddr, event: u16, eventgroup: u16) {
        trace!(app = %self.name, service = %addr, event, eventgroup, "event requested");
    }

    fn release_event(&self, addr: ServiceAddr, event: u16) {
        trace!(app = %self.name, service = %addr, event, "event released");
    }

    fn subscribe(&self, addr: ServiceAddr, eventgroup: u16) {
        let mut hub = self.bus.lock();
        let inserted = hub
            .subscriptions
            .entry((addr.service, addr.instance, eventgroup))
            .or_default()
            .insert(self.id);
        if !inserted {
            return;
        }
        debug!(app = %self.name, service = %addr, eventgroup, "subscribed");

        if let Some(owner) = hub.owner_of_group(addr.key(), eventgroup) {
            hub.post(
                owner,
                BusEvent::Subscription {
                    service: addr.service,
                    instance: addr.instance,
                    eventgroup,
                    client: self.id,
                    subscribed: true,
                },
            );
        }

        let initial: Vec<BusMessage> = hub
            .events
            .iter()
            .filter(|((svc, inst, _), slot)| {
                (*svc, *inst) == addr.key() && slot.eventgroup == eventgroup
            })
            .filter_map(|((svc, inst, event), slot)| {
                slot.last.as_ref().map(|payload| BusMessage {
                    service: *svc,
                    instance: *inst,
                    method: *event,
                    kind: MessageKind::Notification,
                    client: 0,
                    session: 0,
                    payload: payload.clone(),
                })
            })
            .collect();
        for message in initial {
            hub.post(self.id, BusEvent::Message(message));
        }
    }

    fn unsubscribe(&self, addr: ServiceAddr, eventgroup: u16) {
        let mut hub = self.bus.lock();
        let removed = hub
            .subscriptions
            .get_mut(&(addr.service, addr.instance, eventgroup))
            .is_some_and(|subs| subs.remove(&self.id));
        if !removed {
            return;
        }
        if let Some(owner) = hub.owner_of_group(addr.key(), eventgroup) {
            hub.post(
                owner,
                BusEvent::Subscription {
                    service: addr.service,
                    instance: addr.instance,
                    eventgroup,
                    client: self.id,
                    subscribed: false,
                },
            );
        }
    }

    fn notify(&self, addr: ServiceAddr, event: u16, payload: &[u8]) -> Result<(), BusError> {
        self.ensure_init()?;
        let mut hub = self.bus.lock();
        let key = (addr.service, addr.instance, event);
        let eventgroup = match hub.events.get_mut(&key) {
            Some(slot) if slot.owner == self.id => {
                slot.last = Some(payload.to_vec());
                slot.eventgroup
            }
            _ => return Err(BusError::EventNotOffered { addr, event }),
        };
        let subscribers: Vec<u16> = hub
            .subscriptions
            .get(&(addr.service, addr.instance, eventgroup))
            .map(|subs| subs.iter().copied().collect())
            .unwrap_or_default();
        for client in subscribers {
            hub.post(
                client,
                BusEvent::Message(BusMessage {
                    service: addr.service,
                    instance: addr.instance,
                    method: event,
                    kind: MessageKind::Notification,
                    client: 0,
                    session: 0,
                    payload: payload.to_vec(),
                }),
            );
        }
        Ok(())
    }

    fn send(&self, mut message: BusMessage) -> Result<(), BusError> {
        self.ensure_init()?;
        let mut hub = self.bus.lock();
        match message.kind {
            MessageKind::Request => {
                let key = (message.service, message.instance);
                let Some(owner) = hub.offers.get(&key).copied() else {
                    return Err(BusError::ServiceUnavailable(ServiceAddr::new(key.0, key.1)));
                };
                message.client = self.id;
                message.session = hub.next_session();
                trace!(app = %self.name, msg = %message, "routing request");
                hub.post(owner, BusEvent::Message(message));
                Ok(())
            }
            MessageKind::Response | MessageKind::Error => {
                let target = message.client;
                if !hub.apps.contains_key(&target) {
                    return Err(BusError::UnknownClient(target));
                }
                hub.post(target, BusEvent::Message(message));
                Ok(())
            }
            MessageKind::Notification => {
                let event = message.method;
                drop(hub);
                self.notify(
                    ServiceAddr::new(message.service, message.instance),
                    event,
                    &message.payload,
                )
            }
        }
    }

    fn start(&self) {
        if !self.running.raise() {
            warn!(app = %self.name, "bus application already started or stopped");
            return;
        }
        self.bus.lock().post(self.id, BusEvent::State(BusState::Registered));
        while !self.running.wait_for_down(Duration::from_secs(1)) {}
        self.bus
            .lock()
            .post(self.id, BusEvent::State(BusState::Deregistered));
        debug!(app = %self.name, "bus application stopped");
    }

    fn stop(&self) {
        self.running.lower();
    }
}

impl Drop for LocalBusClient {
    fn drop(&mut self) {
        let mut hub = self.bus.lock();
        hub.apps.remove(&self.id);
        hub.offers.retain(|_, owner| *owner != self.id);
        hub.events.retain(|_, slot| slot.owner != self.id);
        for subs in hub.subscriptions.values_mut() {
            subs.remove(&self.id);
        }
    }
}
