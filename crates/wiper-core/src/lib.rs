pub mod codec;
pub mod hal;
pub mod lifecycle;
pub mod signals;
pub mod simulator;
pub mod timebase;

pub use codec::{
    decode_event, decode_set_request, encode_event, encode_set_request, CodecError, SetRequest,
    TelemetryEvent, WiperMode, EVENT_PAYLOAD_SIZE, SET_REQUEST_PAYLOAD_SIZE,
};
pub use hal::WiperEcu;
pub use lifecycle::{LifecycleFlag, Phase, WaitFlag};
pub use signals::{DataType, Signal, WIPER_ROOT};
pub use simulator::{SimConfig, WiperSimulator};
pub use timebase::{Clock, ManualClock, TimeBase};
