use wiper_core::{
    decode_event, decode_set_request, encode_event, encode_set_request, CodecError, SetRequest,
    TelemetryEvent, WiperMode,
};

#[test]
fn encodes_reference_event() {
    let event = TelemetryEvent {
        seq: 0x2A,
        actual_position: 90.0,
        drive_current: 10.0,
        is_wiping: 1,
        ..TelemetryEvent::default()
    };

    let bytes = encode_event(&event);
    assert_eq!(
        bytes,
        [
            0x2A, // seq
            0x00, 0x00, 0xB4, 0x42, // 90.0
            0x00, 0x00, 0x20, 0x41, // 10.0
            100, 1, 0, 0, 0, 0, 0, 75, 255, 0, 0,
        ]
    );
}

#[test]
fn decodes_reference_event() {
    let bytes = [
        0xFF, 0x00, 0x00, 0xA0, 0x41, 0xCD, 0xCC, 0x4C, 0x3E, 99, 0, 1, 1, 0, 1, 1, 80, 3, 1, 1,
    ];

    let event = decode_event(&bytes).expect("reference event should decode");
    assert_eq!(event.seq, 255);
    assert_eq!(event.actual_position, 20.0);
    assert_eq!(event.drive_current, 0.2);
    assert_eq!(event.temp_gear, 99);
    assert_eq!(event.is_wiping, 0);
    assert_eq!(event.is_ending_wipe_cycle, 1);
    assert_eq!(event.is_wiper_error, 1);
    assert_eq!(event.is_position_reached, 0);
    assert_eq!(event.is_blocked, 1);
    assert_eq!(event.is_overheated, 1);
    assert_eq!(event.ecu_temp, 80);
    assert_eq!(event.lin_error, 3);
    assert_eq!(event.is_over_voltage, 1);
    assert_eq!(event.is_under_voltage, 1);
}

#[test]
fn encodes_reference_set_request() {
    let request = SetRequest {
        frequency: 50,
        target_position: 20.0,
        mode: WiperMode::Wipe,
    };
    assert_eq!(
        encode_set_request(&request),
        [0x32, 0x00, 0x00, 0xA0, 0x41, 0x02]
    );
}

#[test]
fn decodes_every_mode_ordinal() {
    for (ordinal, mode) in WiperMode::ALL.into_iter().enumerate() {
        let bytes = [10, 0, 0, 0x80, 0x3F, ordinal as u8];
        let request = decode_set_request(&bytes).expect("valid mode");
        assert_eq!(request.mode, mode);
        assert_eq!(request.target_position, 1.0);
    }
}

#[test]
fn rejects_truncated_set_request() {
    assert_eq!(
        decode_set_request(&[0x32, 0x00, 0x00, 0xA0, 0x41]),
        Err(CodecError::PayloadSize {
            expected: 6,
            actual: 5
        })
    );
}
