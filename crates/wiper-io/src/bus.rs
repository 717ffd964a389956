//! Service bus collaborator: addressing, message types and the client trait.
//!
//! Middleware callbacks are delivered as [`BusEvent`] values on one channel
//! per application; a single dispatch loop consumes them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::mpsc::Sender;
use thiserror::Error;

pub const WIPER_EVENT_SERVICE_ID: u16 = 0x60D0;
pub const WIPER_EVENT_INSTANCE_ID: u16 = 0x0001;
pub const WIPER_EVENT_ID: u16 = 0x8001;
pub const WIPER_EVENTGROUP_ID: u16 = 0x0064;

pub const WIPER_SET_SERVICE_ID: u16 = 0x6123;
pub const WIPER_SET_INSTANCE_ID: u16 = 0x000B;
pub const WIPER_SET_METHOD_ID: u16 = 0x0007;

pub const WIPER_SERVICE_MAJOR: u8 = 1;
pub const WIPER_SERVICE_MINOR: u32 = 0;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus application '{0}' is not initialized")]
    NotInitialized(String),
    #[error("service {0} is not available")]
    ServiceUnavailable(ServiceAddr),
    #[error("event {event:#06x} of {addr} is not offered by this application")]
    EventNotOffered { addr: ServiceAddr, event: u16 },
    #[error("no application with client id {0:#06x}")]
    UnknownClient(u16),
    #[error("failed to read bus configuration {path}: {reason}")]
    Config { path: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceAddr {
    pub service: u16,
    pub instance: u16,
    pub major: u8,
    pub minor: u32,
}

impl ServiceAddr {
    pub fn new(service: u16, instance: u16) -> Self {
        Self {
            service,
            instance,
            major: WIPER_SERVICE_MAJOR,
            minor: WIPER_SERVICE_MINOR,
        }
    }

    /// Routing key, ignoring the interface version.
    pub fn key(&self) -> (u16, u16) {
        (self.service, self.instance)
    }
}

impl fmt::Display for ServiceAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:04x}.{:04x}] v{}.{}",
            self.service, self.instance, self.major, self.minor
        )
    }
}

/// Bus identifiers and transport options, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusSettings {
    pub app_name: String,
    pub use_tcp: bool,
    pub event_service: u16,
    pub event_instance: u16,
    pub event_id: u16,
    pub eventgroup: u16,
    pub set_service: u16,
    pub set_instance: u16,
    pub set_method: u16,
    pub major: u8,
    pub minor: u32,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            app_name: "wiper_adapter".to_string(),
            use_tcp: false,
            event_service: WIPER_EVENT_SERVICE_ID,
            event_instance: WIPER_EVENT_INSTANCE_ID,
            event_id: WIPER_EVENT_ID,
            eventgroup: WIPER_EVENTGROUP_ID,
            set_service: WIPER_SET_SERVICE_ID,
            set_instance: WIPER_SET_INSTANCE_ID,
            set_method: WIPER_SET_METHOD_ID,
            major: WIPER_SERVICE_MAJOR,
            minor: WIPER_SERVICE_MINOR,
        }
    }
}

impl BusSettings {
    pub fn from_file(path: &Path) -> Result<Self, BusError> {
        let config_err = |reason: String| BusError::Config {
            path: path.display().to_string(),
            reason,
        };
        let raw = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        serde_json::from_str(&raw).map_err(|e| config_err(e.to_string()))
    }

    /// Transport name for logs; the in-process bus carries both alike.
    pub fn transport(&self) -> &'static str {
        if self.use_tcp {
            "tcp"
        } else {
            "udp"
        }
    }

    pub fn event_addr(&self) -> ServiceAddr {
        ServiceAddr {
            service: self.event_service,
            instance: self.event_instance,
            major: self.major,
            minor: self.minor,
        }
    }

    pub fn set_addr(&self) -> ServiceAddr {
        ServiceAddr {
            service: self.set_service,
            instance: self.set_instance,
            major: self.major,
            minor: self.minor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Registered,
    Deregistered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    Notification,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub service: u16,
    pub instance: u16,
    /// Method id for requests and responses, event id for notifications.
    pub method: u16,
    pub kind: MessageKind,
    /// Client id of the requester; filled in by the bus on send.
    pub client: u16,
    pub session: u16,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn request(addr: ServiceAddr, method: u16, payload: Vec<u8>) -> Self {
        Self {
            service: addr.service,
            instance: addr.instance,
            method,
            kind: MessageKind::Request,
            client: 0,
            session: 0,
            payload,
        }
    }

    /// Response addressed back to the sender of `request`.
    pub fn response_to(request: &BusMessage, payload: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Response,
            payload,
            ..request.clone()
        }
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} [{:04x}.{:04x}.{:04x}] client/session [{:04x}/{:04x}] {} bytes",
            self.kind,
            self.service,
            self.instance,
            self.method,
            self.client,
            self.session,
            self.payload.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    State(BusState),
    Availability {
        service: u16,
        instance: u16,
        available: bool,
    },
    /// A remote application subscribed to or left an eventgroup this application offers.
    Subscription {
        service: u16,
        instance: u16,
        eventgroup: u16,
        client: u16,
        subscribed: bool,
    },
    Message(BusMessage),
}

/// Service bus middleware as seen by one application.
///
/// Events for the application are posted to the sender handed to
/// [`BusClient::register_handlers`]. Responses to [`BusClient::send`] requests
/// arrive there as [`MessageKind::Response`] messages.
pub trait BusClient: Send + Sync {
    fn name(&self) -> &str;
    fn client_id(&self) -> u16;
    fn init(&self) -> Result<(), BusError>;
    fn register_handlers(&self, events: Sender<BusEvent>);
    /// Drops the registered sender; the dispatch loop ends once it drains.
    fn clear_all_handlers(&self);

    fn request_service(&self, addr: ServiceAddr);
    fn release_service(&self, addr: ServiceAddr);
    fn offer_service(&self, addr: ServiceAddr);
    fn stop_offer_service(&self, addr: ServiceAddr);

    fn offer_event(&self, addr: ServiceAddr, event: u16, eventgroup: u16);
    fn request_event(&self, addr: ServiceAddr, event: u16, eventgroup: u16);
    fn release_event(&self, addr: ServiceAddr, event: u16);
    fn subscribe(&self, addr: ServiceAddr, eventgroup: u16);
    fn unsubscribe(&self, addr: ServiceAddr, eventgroup: u16);

    fn notify(&self, addr: ServiceAddr, event: u16, payload: &[u8]) -> Result<(), BusError>;
    fn send(&self, message: BusMessage) -> Result<(), BusError>;

    /// Runs the application until [`BusClient::stop`] is called.
    fn start(&self);
    fn stop(&self);
}
