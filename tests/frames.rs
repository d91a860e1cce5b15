use bytes::BytesMut;
use h2mux::{
    flags::*,
    frame::{Frame, Priority},
    types::{ErrorCode, SettingsParameter, DEFAULT_MAX_FRAME_SIZE},
    Bytes,
};

fn round_trip(frame: Frame) {
    let mut wire = BytesMut::new();
    frame.encode(&mut wire, DEFAULT_MAX_FRAME_SIZE).unwrap();
    let parsed = Frame::parse(&mut wire, DEFAULT_MAX_FRAME_SIZE)
        .unwrap()
        .unwrap();
    assert!(wire.is_empty(), "parse left bytes behind");
    assert_eq!(parsed, frame);
}

#[test]
fn every_frame_type_round_trips() {
    round_trip(Frame::Data {
        stream: 1,
        flags: DataFlags::END_STREAM,
        data: Bytes::from_static(b"hello"),
    });
    round_trip(Frame::Data {
        stream: 3,
        flags: DataFlags::empty(),
        data: Bytes::new(),
    });
    round_trip(Frame::Headers {
        stream: 3,
        flags: HeadersFlags::END_HEADERS,
        priority: None,
        fragment: Bytes::from_static(&[0x82, 0x86, 0x84]),
    });
    round_trip(Frame::Headers {
        stream: 5,
        flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM | HeadersFlags::PRIORITY,
        priority: Some(Priority {
            dependency: 3,
            exclusive: true,
            weight: 200,
        }),
        fragment: Bytes::from_static(&[0x82]),
    });
    round_trip(Frame::Priority {
        stream: 7,
        priority: Priority {
            dependency: 0,
            exclusive: false,
            weight: 16,
        },
    });
    round_trip(Frame::ResetStream {
        stream: 5,
        error: ErrorCode::Cancel,
    });
    round_trip(Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![
            (SettingsParameter::HeaderTableSize, 0),
            (SettingsParameter::InitialWindowSize, 1_000_000),
        ],
    });
    round_trip(Frame::Settings {
        flags: SettingsFlags::ACK,
        params: Vec::new(),
    });
    round_trip(Frame::PushPromise {
        stream: 1,
        flags: PushPromiseFlags::END_HEADERS,
        promised: 2,
        fragment: Bytes::from_static(&[0x82, 0x84]),
    });
    round_trip(Frame::Ping {
        flags: PingFlags::ACK,
        payload: [1, 2, 3, 4, 5, 6, 7, 8],
    });
    round_trip(Frame::GoAway {
        last_stream: 5,
        error: ErrorCode::ProtocolError,
        debug: Bytes::from_static(b"bye"),
    });
    round_trip(Frame::WindowUpdate {
        stream: 0,
        increment: 10_000,
    });
    round_trip(Frame::Continuation {
        stream: 9,
        flags: ContinuationFlags::END_HEADERS,
        fragment: Bytes::from_static(&[0xbe]),
    });
    round_trip(Frame::Unknown {
        kind: 0x42,
        stream: 7,
    });
}

#[test]
fn settings_frame_wire_layout() {
    let mut wire = BytesMut::new();
    Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![(SettingsParameter::MaxConcurrentStreams, 100)],
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE)
    .unwrap();
    assert_eq!(
        wire.as_ref(),
        &[0, 0, 6, 4, 0, 0, 0, 0, 0, 0, 3, 0, 0, 0, 100]
    );
}

#[test]
fn ping_ack_wire_layout() {
    let mut wire = BytesMut::new();
    Frame::Ping {
        flags: PingFlags::ACK,
        payload: [0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04],
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE)
    .unwrap();
    assert_eq!(
        wire.as_ref(),
        &[0, 0, 8, 6, 1, 0, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef, 0x01, 0x02, 0x03, 0x04]
    );
}

#[test]
fn frames_parse_across_arbitrary_read_boundaries() {
    let mut wire = BytesMut::new();
    Frame::WindowUpdate {
        stream: 1,
        increment: 42,
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE)
    .unwrap();
    Frame::Data {
        stream: 1,
        flags: DataFlags::END_STREAM,
        data: Bytes::from_static(b"world"),
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE)
    .unwrap();

    let mut buf = BytesMut::new();
    let mut parsed = Vec::new();
    for chunk in wire.as_ref().chunks(3) {
        buf.extend_from_slice(chunk);
        while let Some(frame) = Frame::parse(&mut buf, DEFAULT_MAX_FRAME_SIZE).unwrap() {
            parsed.push(frame);
        }
    }
    assert_eq!(parsed.len(), 2);
    assert_eq!(
        parsed[1],
        Frame::Data {
            stream: 1,
            flags: DataFlags::END_STREAM,
            data: Bytes::from_static(b"world"),
        }
    );
}

#[test]
fn oversized_payloads_are_rejected_at_encode_time() {
    let mut wire = BytesMut::new();
    let result = Frame::Data {
        stream: 1,
        flags: DataFlags::empty(),
        data: Bytes::from(vec![0u8; 20_000]),
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE);
    assert!(result.is_err());
}

#[test]
fn goaway_debug_data_survives_the_wire() {
    let mut wire = BytesMut::new();
    Frame::GoAway {
        last_stream: 7,
        error: ErrorCode::EnhanceYourCalm,
        debug: Bytes::from_static(b"slow down"),
    }
    .encode(&mut wire, DEFAULT_MAX_FRAME_SIZE)
    .unwrap();
    match Frame::parse(&mut wire, DEFAULT_MAX_FRAME_SIZE)
        .unwrap()
        .unwrap()
    {
        Frame::GoAway { debug, error, .. } => {
            assert_eq!(debug.as_ref(), b"slow down");
            assert_eq!(error, ErrorCode::EnhanceYourCalm);
        }
        other => panic!("expected GOAWAY, got {:?}", other),
    }
}
