//! Fixed-layout payloads exchanged over the wiper bus service.
//!
//! All multi-byte fields are IEEE754 single precision, little-endian.

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Wire size of an encoded [`TelemetryEvent`].
pub const EVENT_PAYLOAD_SIZE: usize = 20;
/// Wire size of an encoded [`SetRequest`].
pub const SET_REQUEST_PAYLOAD_SIZE: usize = 6;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("payload too short: expected {expected} bytes, got {actual}")]
    PayloadSize { expected: usize, actual: usize },
    #[error("invalid wiper mode ordinal {value}")]
    InvalidEnum { value: u8 },
    #[error("unknown wiper mode '{0}'")]
    UnknownMode(String),
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WiperMode {
    PlantMode = 0,
    StopHold = 1,
    Wipe = 2,
    EmergencyStop = 3,
}

impl WiperMode {
    pub const ALL: [WiperMode; 4] = [
        WiperMode::PlantMode,
        WiperMode::StopHold,
        WiperMode::Wipe,
        WiperMode::EmergencyStop,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WiperMode::PlantMode => "PLANT_MODE",
            WiperMode::StopHold => "STOP_HOLD",
            WiperMode::Wipe => "WIPE",
            WiperMode::EmergencyStop => "EMERGENCY_STOP",
        }
    }
}

impl TryFrom<u8> for WiperMode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WiperMode::PlantMode),
            1 => Ok(WiperMode::StopHold),
            2 => Ok(WiperMode::Wipe),
            3 => Ok(WiperMode::EmergencyStop),
            other => Err(CodecError::InvalidEnum { value: other }),
        }
    }
}

impl FromStr for WiperMode {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WiperMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == s)
            .ok_or_else(|| CodecError::UnknownMode(s.to_string()))
    }
}

impl fmt::Display for WiperMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One telemetry sample published by the wiper ECU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetryEvent {
    pub seq: u8,
    pub actual_position: f32,
    pub drive_current: f32,
    pub temp_gear: u8,
    pub is_wiping: u8,
    pub is_ending_wipe_cycle: u8,
    pub is_wiper_error: u8,
    pub is_position_reached: u8,
    pub is_blocked: u8,
    pub is_overheated: u8,
    pub ecu_temp: u8,
    pub lin_error: u8,
    pub is_over_voltage: u8,
    pub is_under_voltage: u8,
}

impl Default for TelemetryEvent {
    fn default() -> Self {
        Self {
            seq: 0,
            actual_position: 0.0,
            drive_current: 0.0,
            temp_gear: 100,
            is_wiping: 0,
            is_ending_wipe_cycle: 0,
            is_wiper_error: 0,
            is_position_reached: 0,
            is_blocked: 0,
            is_overheated: 0,
            ecu_temp: 75,
            lin_error: 255,
            is_over_voltage: 0,
            is_under_voltage: 0,
        }
    }
}

impl TelemetryEvent {
    fn status_bytes(&self) -> [u8; 11] {
        [
            self.temp_gear,
            self.is_wiping,
            self.is_ending_wipe_cycle,
            self.is_wiper_error,
            self.is_position_reached,
            self.is_blocked,
            self.is_overheated,
            self.ecu_temp,
            self.lin_error,
            self.is_over_voltage,
            self.is_under_voltage,
        ]
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:3}] pos:{:6.2}, cur:{:6.3}, gear:{:3}, wiping:{}, ending:{}, error:{}, reached:{}, blocked:{}, overheat:{}, ecu:{:3}, lin:{:3}, overV:{}, underV:{}",
            self.seq,
            self.actual_position,
            self.drive_current,
            self.temp_gear,
            self.is_wiping,
            self.is_ending_wipe_cycle,
            self.is_wiper_error,
            self.is_position_reached,
            self.is_blocked,
            self.is_overheated,
            self.ecu_temp,
            self.lin_error,
            self.is_over_voltage,
            self.is_under_voltage
        )
    }
}

/// Actuation request accepted by the wiper ECU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SetRequest {
    /// Wipe cycles per minute.
    pub frequency: u8,
    /// Degrees, 0..=180.
    pub target_position: f32,
    pub mode: WiperMode,
}

impl fmt::Display for SetRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "freq:{}, target:{:.2}, mode:{}",
            self.frequency, self.target_position, self.mode
        )
    }
}

pub fn encode_event(event: &TelemetryEvent) -> [u8; EVENT_PAYLOAD_SIZE] {
    let mut out = [0u8; EVENT_PAYLOAD_SIZE];
    out[0] = event.seq;
    out[1..5].copy_from_slice(&event.actual_position.to_le_bytes());
    out[5..9].copy_from_slice(&event.drive_current.to_le_bytes());
    out[9..].copy_from_slice(&event.status_bytes());
    out
}

/// Decodes a telemetry payload. Bytes past the fixed size are ignored.
pub fn decode_event(payload: &[u8]) -> Result<TelemetryEvent, CodecError> {
    if payload.len() < EVENT_PAYLOAD_SIZE {
        return Err(CodecError::PayloadSize {
            expected: EVENT_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    Ok(TelemetryEvent {
        seq: payload[0],
        actual_position: read_f32(payload, 1),
        drive_current: read_f32(payload, 5),
        temp_gear: payload[9],
        is_wiping: payload[10],
        is_ending_wipe_cycle: payload[11],
        is_wiper_error: payload[12],
        is_position_reached: payload[13],
        is_blocked: payload[14],
        is_overheated: payload[15],
        ecu_temp: payload[16],
        lin_error: payload[17],
        is_over_voltage: payload[18],
        is_under_voltage: payload[19],
    })
}

pub fn encode_set_request(request: &SetRequest) -> [u8; SET_REQUEST_PAYLOAD_SIZE] {
    let mut out = [0u8; SET_REQUEST_PAYLOAD_SIZE];
    out[0] = request.frequency;
    out[1..5].copy_from_slice(&request.target_position.to_le_bytes());
    out[5] = request.mode as u8;
    out
}

pub fn decode_set_request(payload: &[u8]) -> Result<SetRequest, CodecError> {
    if payload.len() < SET_REQUEST_PAYLOAD_SIZE {
        return Err(CodecError::PayloadSize {
            expected: SET_REQUEST_PAYLOAD_SIZE,
            actual: payload.len(),
        });
    }
    let mode = WiperMode::try_from(payload[5])?;
    Ok(SetRequest {
        frequency: payload[0],
        target_position: read_f32(payload, 1),
        mode,
    })
}

/// Space separated hex rendering used for trace logging of raw payloads.
pub fn hex_dump(payload: &[u8]) -> String {
    payload
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn read_f32(payload: &[u8], offset: usize) -> f32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&payload[offset..offset + 4]);
    f32::from_le_bytes(raw)
}
