pub mod actuator;
pub mod broker;
pub mod bus;
pub mod dispatch;
pub mod feeder;
pub mod local_bus;
pub mod memory_broker;
pub mod metrics;
pub mod notifier;
pub mod responder;
pub mod subscriber;

pub use actuator::{ActuatorBridge, ActuatorError, BusRequestPath, SetRequestSink};
pub use broker::{
    AggregationClient, BrokerError, CallContext, DatapointMetadata, DatapointValue, StatusCode,
    StreamItem, StreamReader, StreamStatus, UpdateBatch,
};
pub use bus::{BusClient, BusError, BusEvent, BusMessage, BusSettings, BusState, MessageKind, ServiceAddr};
pub use dispatch::BusDispatcher;
pub use feeder::TelemetryFeeder;
pub use local_bus::{LocalBus, LocalBusClient};
pub use memory_broker::MemoryBroker;
pub use metrics::{serve_metrics, BridgeMetrics};
pub use notifier::{BusEventPublisher, EventPublisher, NotificationPump, PumpConfig};
pub use responder::RequestResponseBridge;
pub use subscriber::{ReconnectingSubscriber, SubscriberConfig, SubscriberExit};
