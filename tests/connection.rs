//! End-to-end engine tests over an in-memory duplex transport, with the
//! test body scripting the server side of the connection frame by frame.

use bytes::BytesMut;
use h2mux::{
    flags::*,
    frame::Frame,
    types::{SettingsParameter, MAX_ALLOWED_FRAME_SIZE, PREFACE},
    Bytes, Connection, ConnectionConfig, ConnectionError, Error, ErrorCode, Request, StreamError,
    Url,
};
use std::time::Duration;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};

fn test_url() -> Url {
    Url::parse("https://example.com/").unwrap()
}

/// Scripted server half of a connection.
struct Peer {
    io: DuplexStream,
    buf: BytesMut,
    decoder: hpack::Decoder<'static>,
    encoder: hpack::Encoder<'static>,
}

impl Peer {
    /// Consumes the preface and the client's SETTINGS, sends our SETTINGS
    /// (plus the ACK), and waits for the client to acknowledge ours.
    async fn handshake(io: DuplexStream, params: Vec<(SettingsParameter, u32)>) -> Self {
        let mut peer = Self {
            io,
            buf: BytesMut::new(),
            decoder: hpack::Decoder::new(),
            encoder: hpack::Encoder::new(),
        };
        let mut preface = [0u8; 24];
        peer.io.read_exact(&mut preface).await.unwrap();
        assert_eq!(&preface[..], PREFACE);
        match peer.read_frame().await {
            Frame::Settings { flags, .. } => assert!(!flags.contains(SettingsFlags::ACK)),
            other => panic!("expected client SETTINGS, got {:?}", other),
        }
        peer.write_frame(Frame::Settings {
            flags: SettingsFlags::empty(),
            params,
        })
        .await;
        peer.write_frame(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        })
        .await;
        match peer.read_frame().await {
            Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
            other => panic!("expected SETTINGS ACK, got {:?}", other),
        }
        peer
    }

    async fn read_frame(&mut self) -> Frame {
        loop {
            if let Some(frame) = Frame::parse(&mut self.buf, MAX_ALLOWED_FRAME_SIZE).unwrap() {
                return frame;
            }
            let n = self.io.read_buf(&mut self.buf).await.unwrap();
            assert!(n > 0, "connection closed while waiting for a frame");
        }
    }

    async fn write_frame(&mut self, frame: Frame) {
        let mut wire = BytesMut::new();
        frame.encode(&mut wire, MAX_ALLOWED_FRAME_SIZE).unwrap();
        self.io.write_all(&wire).await.unwrap();
    }

    /// Reads the next frame, expecting request HEADERS, and returns
    /// (stream id, decoded header list, end_stream).
    async fn read_request(&mut self) -> (u32, Vec<(String, String)>, bool) {
        match self.read_frame().await {
            Frame::Headers {
                stream,
                flags,
                fragment,
                ..
            } => {
                assert!(flags.contains(HeadersFlags::END_HEADERS));
                let headers = self.decode_block(&fragment);
                (stream, headers, flags.contains(HeadersFlags::END_STREAM))
            }
            other => panic!("expected HEADERS, got {:?}", other),
        }
    }

    fn decode_block(&mut self, fragment: &[u8]) -> Vec<(String, String)> {
        self.decoder
            .decode(fragment)
            .unwrap()
            .into_iter()
            .map(|(k, v)| {
                (
                    String::from_utf8(k).unwrap(),
                    String::from_utf8(v).unwrap(),
                )
            })
            .collect()
    }

    async fn respond(&mut self, stream: u32, status: &str, body: &[u8]) {
        let block = self
            .encoder
            .encode(vec![(&b":status"[..], status.as_bytes())]);
        let mut flags = HeadersFlags::END_HEADERS;
        if body.is_empty() {
            flags |= HeadersFlags::END_STREAM;
        }
        self.write_frame(Frame::Headers {
            stream,
            flags,
            priority: None,
            fragment: Bytes::from(block),
        })
        .await;
        if !body.is_empty() {
            self.write_frame(Frame::Data {
                stream,
                flags: DataFlags::END_STREAM,
                data: Bytes::from(body.to_vec()),
            })
            .await;
        }
    }
}

// Scenario: the very first bytes on the wire are the 24-byte preface
// followed by an empty SETTINGS frame.
#[tokio::test]
async fn preface_and_empty_settings_lead_the_connection() {
    let (client_io, mut server_io) = duplex(1 << 20);
    let _connection = Connection::handshake(client_io, ConnectionConfig::default());

    let mut first = [0u8; 33];
    server_io.read_exact(&mut first).await.unwrap();
    assert_eq!(
        &first[..24],
        &[
            0x50, 0x52, 0x49, 0x20, 0x2a, 0x20, 0x48, 0x54, 0x54, 0x50, 0x2f, 0x32, 0x2e, 0x30,
            0x0d, 0x0a, 0x0d, 0x0a, 0x53, 0x4d, 0x0d, 0x0a, 0x0d, 0x0a
        ]
    );
    assert_eq!(&first[24..], &[0, 0, 0, 4, 0, 0, 0, 0, 0]);
}

// Scenario: PING is echoed with the ACK flag and an identical payload.
#[tokio::test]
async fn ping_is_echoed_with_identical_payload() {
    let (client_io, server_io) = duplex(1 << 20);
    let _connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    peer.io
        .write_all(&[
            0x00, 0x00, 0x08, 0x06, 0x00, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef, 0x01,
            0x02, 0x03, 0x04,
        ])
        .await
        .unwrap();
    let mut echo = [0u8; 17];
    peer.io.read_exact(&mut echo).await.unwrap();
    assert_eq!(
        echo,
        [
            0x00, 0x00, 0x08, 0x06, 0x01, 0x00, 0x00, 0x00, 0x00, 0xde, 0xad, 0xbe, 0xef, 0x01,
            0x02, 0x03, 0x04,
        ]
    );
}

#[tokio::test]
async fn user_pings_round_trip() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let (payload, echoed) = tokio::join!(connection.ping(), async {
        match peer.read_frame().await {
            Frame::Ping { flags, payload } => {
                assert!(!flags.contains(PingFlags::ACK));
                peer.write_frame(Frame::Ping {
                    flags: PingFlags::ACK,
                    payload,
                })
                .await;
                payload
            }
            other => panic!("expected PING, got {:?}", other),
        }
    });
    assert_eq!(payload.unwrap(), echoed);
}

// Scenario: a 70000-byte body against the 65535-byte connection window
// sends 65535 bytes, parks, and resumes for exactly 4465 bytes after a
// connection-level WINDOW_UPDATE. The peer's larger INITIAL_WINDOW_SIZE
// keeps the stream window out of the way.
#[tokio::test]
async fn body_parks_on_connection_window_and_resumes() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(
        server_io,
        vec![(SettingsParameter::InitialWindowSize, 1_000_000)],
    )
    .await;

    let body = vec![0xabu8; 70_000];
    let handle = connection
        .submit(Request::post(test_url(), body.clone()))
        .unwrap();

    let (stream, headers, end_stream) = peer.read_request().await;
    assert_eq!(stream, 1);
    assert!(!end_stream);
    assert!(headers.contains(&(":method".to_owned(), "POST".to_owned())));

    let mut received = 0usize;
    while received < 65_535 {
        match peer.read_frame().await {
            Frame::Data { stream, flags, data } => {
                assert_eq!(stream, 1);
                assert!(!flags.contains(DataFlags::END_STREAM));
                received += data.len();
            }
            other => panic!("expected DATA, got {:?}", other),
        }
    }
    assert_eq!(received, 65_535);

    // the connection window is exhausted; nothing else may arrive
    let quiet = tokio::time::timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(quiet.is_err(), "data sent past the connection window");

    peer.write_frame(Frame::WindowUpdate {
        stream: 0,
        increment: 10_000,
    })
    .await;
    match peer.read_frame().await {
        Frame::Data { stream, flags, data } => {
            assert_eq!(stream, 1);
            assert_eq!(data.len(), 4_465);
            assert!(flags.contains(DataFlags::END_STREAM));
        }
        other => panic!("expected the final DATA, got {:?}", other),
    }

    peer.respond(1, "200", b"").await;
    assert_eq!(handle.response().await.unwrap().status(), Some(200));
}

// Scenario: a stream-level WINDOW_UPDATE with increment 0 resets that
// stream with PROTOCOL_ERROR while the connection keeps running.
#[tokio::test]
async fn zero_window_increment_resets_only_the_stream() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handle = connection.submit(Request::get(test_url())).unwrap();
    let (stream, _, end_stream) = peer.read_request().await;
    assert_eq!(stream, 1);
    assert!(end_stream);

    peer.write_frame(Frame::WindowUpdate {
        stream: 1,
        increment: 0,
    })
    .await;
    match peer.read_frame().await {
        Frame::ResetStream { stream, error } => {
            assert_eq!(stream, 1);
            assert_eq!(error, ErrorCode::ProtocolError);
        }
        other => panic!("expected RST_STREAM, got {:?}", other),
    }
    match handle.response().await {
        Err(Error::Stream(StreamError::LocalReset(ErrorCode::ProtocolError))) => {}
        other => panic!("expected a local reset, got {:?}", other),
    }

    // the connection survived the stream error
    let (payload, echoed) = tokio::join!(connection.ping(), async {
        match peer.read_frame().await {
            Frame::Ping { payload, .. } => {
                peer.write_frame(Frame::Ping {
                    flags: PingFlags::ACK,
                    payload,
                })
                .await;
                payload
            }
            other => panic!("expected PING, got {:?}", other),
        }
    });
    assert_eq!(payload.unwrap(), echoed);
}

// Scenario: GOAWAY with last_stream_id=5 refuses stream 7 (retryable),
// lets 1/3/5 finish, refuses new submissions, and closes afterwards.
#[tokio::test]
async fn goaway_triages_streams_and_drains_the_rest() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handles: Vec<_> = (0..4)
        .map(|_| connection.submit(Request::get(test_url())).unwrap())
        .collect();
    for expected in [1, 3, 5, 7] {
        let (stream, _, _) = peer.read_request().await;
        assert_eq!(stream, expected);
    }

    peer.write_frame(Frame::GoAway {
        last_stream: 5,
        error: ErrorCode::NoError,
        debug: Bytes::new(),
    })
    .await;

    let mut handles = handles.into_iter();
    let (h1, h3, h5, h7) = (
        handles.next().unwrap(),
        handles.next().unwrap(),
        handles.next().unwrap(),
        handles.next().unwrap(),
    );
    match h7.response().await {
        Err(Error::Stream(StreamError::Refused)) => {}
        other => panic!("stream 7 should be refused, got {:?}", other),
    }

    // new submissions are refused while the drain continues
    let late = connection.submit(Request::get(test_url())).unwrap();
    match late.response().await {
        Err(Error::Stream(StreamError::Refused)) => {}
        other => panic!("late request should be refused, got {:?}", other),
    }

    for (stream, handle) in [(1, h1), (3, h3), (5, h5)] {
        peer.respond(stream, "200", b"").await;
        assert_eq!(handle.response().await.unwrap().status(), Some(200));
    }

    // with the last stream done the connection winds down
    let mut tail = [0u8; 16];
    assert_eq!(peer.io.read(&mut tail).await.unwrap(), 0);
}

// Scenario: the peer lowers HEADER_TABLE_SIZE to 0; the next outbound
// header block leads with the size-update directive.
#[tokio::test]
async fn lowered_header_table_size_is_announced_in_the_next_block() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    peer.write_frame(Frame::Settings {
        flags: SettingsFlags::empty(),
        params: vec![(SettingsParameter::HeaderTableSize, 0)],
    })
    .await;
    match peer.read_frame().await {
        Frame::Settings { flags, .. } => assert!(flags.contains(SettingsFlags::ACK)),
        other => panic!("expected SETTINGS ACK, got {:?}", other),
    }

    let handle = connection.submit(Request::get(test_url())).unwrap();
    match peer.read_frame().await {
        Frame::Headers { stream, fragment, .. } => {
            assert_eq!(stream, 1);
            assert_eq!(fragment[0], 0x20, "expected a size-update to 0 first");
        }
        other => panic!("expected HEADERS, got {:?}", other),
    }
    peer.respond(1, "200", b"").await;
    assert_eq!(handle.response().await.unwrap().status(), Some(200));
}

#[tokio::test]
async fn requests_queue_behind_max_concurrent_streams() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(
        server_io,
        vec![(SettingsParameter::MaxConcurrentStreams, 1)],
    )
    .await;

    let first = connection.submit(Request::get(test_url())).unwrap();
    let second = connection.submit(Request::get(test_url())).unwrap();

    let (stream, _, _) = peer.read_request().await;
    assert_eq!(stream, 1);
    let quiet = tokio::time::timeout(Duration::from_millis(100), peer.read_frame()).await;
    assert!(quiet.is_err(), "second request jumped the concurrency cap");

    peer.respond(1, "200", b"").await;
    assert_eq!(first.response().await.unwrap().status(), Some(200));

    let (stream, _, _) = peer.read_request().await;
    assert_eq!(stream, 3);
    peer.respond(3, "200", b"").await;
    assert_eq!(second.response().await.unwrap().status(), Some(200));
}

#[tokio::test]
async fn cancelled_requests_reset_their_stream() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handle = connection.submit(Request::get(test_url())).unwrap();
    let (stream, _, _) = peer.read_request().await;
    assert_eq!(stream, 1);

    handle.cancel();
    match peer.read_frame().await {
        Frame::ResetStream { stream, error } => {
            assert_eq!(stream, 1);
            assert_eq!(error, ErrorCode::Cancel);
        }
        other => panic!("expected RST_STREAM(CANCEL), got {:?}", other),
    }
    match handle.response().await {
        Err(Error::Stream(StreamError::Cancelled)) => {}
        other => panic!("expected a cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn push_promises_are_delivered_and_acceptable() {
    let (client_io, server_io) = duplex(1 << 20);
    let mut connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handle = connection.submit(Request::get(test_url())).unwrap();
    let (stream, _, _) = peer.read_request().await;
    assert_eq!(stream, 1);

    let promise_block = peer.encoder.encode(vec![
        (&b":method"[..], &b"GET"[..]),
        (&b":scheme"[..], &b"https"[..]),
        (&b":path"[..], &b"/style.css"[..]),
        (&b":authority"[..], &b"example.com"[..]),
    ]);
    peer.write_frame(Frame::PushPromise {
        stream: 1,
        flags: PushPromiseFlags::END_HEADERS,
        promised: 2,
        fragment: Bytes::from(promise_block),
    })
    .await;
    peer.respond(1, "200", b"main resource").await;
    peer.respond(2, "200", b"body{}").await;

    let response = handle.response().await.unwrap();
    assert_eq!(response.body.as_ref(), b"main resource");

    let push = connection.push_promise().await.unwrap();
    assert_eq!(push.parent, 1);
    assert_eq!(push.promised, 2);
    assert!(push
        .headers
        .contains(&(":path".to_owned(), "/style.css".to_owned())));

    let pushed = push.accept().await.unwrap();
    assert_eq!(pushed.status(), Some(200));
    assert_eq!(pushed.body.as_ref(), b"body{}");
}

#[tokio::test]
async fn rejected_pushes_are_reset_with_cancel() {
    let (client_io, server_io) = duplex(1 << 20);
    let mut connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handle = connection.submit(Request::get(test_url())).unwrap();
    peer.read_request().await;

    let promise_block = peer.encoder.encode(vec![(&b":path"[..], &b"/push"[..])]);
    peer.write_frame(Frame::PushPromise {
        stream: 1,
        flags: PushPromiseFlags::END_HEADERS,
        promised: 2,
        fragment: Bytes::from(promise_block),
    })
    .await;
    peer.respond(1, "200", b"").await;
    handle.response().await.unwrap();

    connection.push_promise().await.unwrap().cancel();
    match peer.read_frame().await {
        Frame::ResetStream { stream, error } => {
            assert_eq!(stream, 2);
            assert_eq!(error, ErrorCode::Cancel);
        }
        other => panic!("expected RST_STREAM(CANCEL), got {:?}", other),
    }
}

#[tokio::test]
async fn oversized_header_blocks_continue_into_continuation_frames() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let big = "a".repeat(40_000);
    let handle = connection
        .submit(Request::get(test_url()).header("x-big", big.clone()))
        .unwrap();

    let mut block = BytesMut::new();
    match peer.read_frame().await {
        Frame::Headers {
            stream,
            flags,
            fragment,
            ..
        } => {
            assert_eq!(stream, 1);
            assert!(!flags.contains(HeadersFlags::END_HEADERS));
            block.extend_from_slice(&fragment);
        }
        other => panic!("expected HEADERS, got {:?}", other),
    }
    loop {
        match peer.read_frame().await {
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                assert_eq!(stream, 1);
                block.extend_from_slice(&fragment);
                if flags.contains(ContinuationFlags::END_HEADERS) {
                    break;
                }
            }
            other => panic!("header block interleaved with {:?}", other),
        }
    }
    let headers = peer.decode_block(&block);
    assert!(headers.contains(&("x-big".to_owned(), big)));

    peer.respond(1, "200", b"").await;
    assert_eq!(handle.response().await.unwrap().status(), Some(200));
}

#[tokio::test]
async fn missing_settings_ack_times_out_the_connection() {
    let (client_io, mut server_io) = duplex(1 << 20);
    let connection = Connection::handshake(
        client_io,
        ConnectionConfig::default().settings_ack_timeout(Duration::from_millis(100)),
    );

    // accept the preface and client SETTINGS, reply with SETTINGS, never ACK
    let mut preface = [0u8; 24];
    server_io.read_exact(&mut preface).await.unwrap();
    let mut client_settings = [0u8; 9];
    server_io.read_exact(&mut client_settings).await.unwrap();
    server_io
        .write_all(&[0, 0, 0, 4, 0, 0, 0, 0, 0])
        .await
        .unwrap();

    let handle = connection.submit(Request::get(test_url())).unwrap();
    match handle.response().await {
        Err(Error::Stream(StreamError::ConnectionClosed(ErrorCode::SettingsTimeout))) => {}
        other => panic!("expected a settings timeout, got {:?}", other),
    }
}

#[tokio::test]
async fn idle_timeout_closes_gracefully_and_cancels_streams() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(
        client_io,
        ConnectionConfig::default().idle_timeout(Duration::from_millis(100)),
    );
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    let handle = connection.submit(Request::get(test_url())).unwrap();
    peer.read_request().await;

    match peer.read_frame().await {
        Frame::GoAway { error, .. } => assert_eq!(error, ErrorCode::NoError),
        other => panic!("expected GOAWAY, got {:?}", other),
    }
    match handle.response().await {
        Err(Error::Stream(StreamError::Cancelled)) => {}
        other => panic!("expected a cancellation, got {:?}", other),
    }
}

#[tokio::test]
async fn unknown_frame_types_are_ignored() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    // type 0xab, 3-byte payload, stream 0
    peer.io
        .write_all(&[0, 0, 3, 0xab, 0, 0, 0, 0, 0, 1, 2, 3])
        .await
        .unwrap();

    let (payload, echoed) = tokio::join!(connection.ping(), async {
        match peer.read_frame().await {
            Frame::Ping { payload, .. } => {
                peer.write_frame(Frame::Ping {
                    flags: PingFlags::ACK,
                    payload,
                })
                .await;
                payload
            }
            other => panic!("expected PING, got {:?}", other),
        }
    });
    assert_eq!(payload.unwrap(), echoed);
}

#[tokio::test]
async fn graceful_close_sends_goaway_and_completes() {
    let (client_io, server_io) = duplex(1 << 20);
    let connection = Connection::handshake(client_io, ConnectionConfig::default());
    let mut peer = Peer::handshake(server_io, Vec::new()).await;

    connection.close(true).await;
    match peer.read_frame().await {
        Frame::GoAway { error, last_stream, .. } => {
            assert_eq!(error, ErrorCode::NoError);
            assert_eq!(last_stream, 0);
        }
        other => panic!("expected GOAWAY, got {:?}", other),
    }
    let mut tail = [0u8; 16];
    assert_eq!(peer.io.read(&mut tail).await.unwrap(), 0);

    // submissions after close fail without touching the wire
    match connection.request(Request::get(test_url())).await {
        Err(Error::Connection(ConnectionError::Closed)) => {}
        other => panic!("expected Closed, got {:?}", other),
    }
}
