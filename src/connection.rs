//! The per-connection engine: one task owns every piece of connection state
//! (settings, flow windows, stream table, HPACK contexts) and serializes all
//! frame I/O. HPACK requires the codec state to advance in exact frame
//! order, so nothing here is shared across tasks; the user boundary is a
//! command channel in and per-request oneshots out.

use crate::{
    error::{ConnectionError, ErrorScope, HpackError, StreamError},
    flags::*,
    flow::{self, FlowController},
    frame::{Frame, FrameHeader, FRAME_HEADER_LEN},
    hpack,
    request::Request,
    response::Response,
    settings::SettingsStore,
    stream::StateViolation,
    stream_coordinator::StreamCoordinator,
    types::*,
};
use bytes::{Bytes, BytesMut};
use log::{debug, error, trace, warn};
use std::{cmp, collections::VecDeque, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{mpsc, oneshot},
    time::Instant,
};

/// Compressed header blocks larger than this are abandoned outright. The
/// decoded size is separately bounded by MAX_HEADER_LIST_SIZE.
const MAX_HEADER_BLOCK_SIZE: usize = 256 * 1024;

/// Tunables for one connection. The default advertises no settings (an
/// empty SETTINGS frame follows the preface) and applies a 10-second
/// SETTINGS acknowledgment deadline.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    settings: Vec<(SettingsParameter, u32)>,
    settings_ack_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            settings: Vec::new(),
            settings_ack_timeout: Duration::from_secs(10),
            idle_timeout: None,
        }
    }
}

impl ConnectionConfig {
    /// Adds a parameter to the initial SETTINGS frame, replacing any earlier
    /// value for the same parameter.
    #[must_use]
    pub fn setting(mut self, param: SettingsParameter, value: u32) -> Self {
        if let Some(entry) = self.settings.iter_mut().find(|(p, _)| *p == param) {
            entry.1 = value;
        } else {
            self.settings.push((param, value));
        }
        self
    }

    /// Advertising ENABLE_PUSH=0 makes any later PUSH_PROMISE a connection
    /// error.
    #[must_use]
    pub fn enable_push(self, enabled: bool) -> Self {
        self.setting(SettingsParameter::EnablePush, u32::from(enabled))
    }

    #[must_use]
    pub fn settings_ack_timeout(mut self, timeout: Duration) -> Self {
        self.settings_ack_timeout = timeout;
        self
    }

    /// With no inbound frame for this long, the connection is closed with
    /// GOAWAY(NO_ERROR); outstanding streams observe a cancellation.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

enum Command {
    Submit {
        request: Request,
        response_tx: oneshot::Sender<Result<Response, StreamError>>,
    },
    Cancel {
        request_id: usize,
    },
    Ping {
        ack_tx: oneshot::Sender<Result<[u8; 8], ConnectionError>>,
    },
    Close {
        graceful: bool,
        done_tx: oneshot::Sender<()>,
    },
}

enum PushAction {
    Accept {
        promised: StreamId,
        response_tx: oneshot::Sender<Result<Response, StreamError>>,
    },
    Cancel {
        promised: StreamId,
    },
}

/// An in-flight request. Dropping the handle leaves the stream running;
/// call [`ResponseHandle::cancel`] to reset it.
pub struct ResponseHandle {
    request_id: usize,
    cmd_tx: mpsc::UnboundedSender<Command>,
    rx: oneshot::Receiver<Result<Response, StreamError>>,
}

impl ResponseHandle {
    pub async fn response(self) -> Result<Response, crate::Error> {
        match self.rx.await {
            Ok(result) => result.map_err(crate::Error::Stream),
            Err(_) => Err(ConnectionError::Closed.into()),
        }
    }

    /// Sends RST_STREAM(CANCEL) for the request's stream (or drops it from
    /// the admission queue if it never started).
    pub fn cancel(&self) {
        self.cmd_tx
            .send(Command::Cancel {
                request_id: self.request_id,
            })
            .ok();
    }
}

/// A server push offer. Accept it to await the pushed response, or cancel
/// to reset the promised stream with CANCEL.
pub struct PushPromise {
    pub parent: StreamId,
    pub promised: StreamId,
    pub headers: Headers,
    action_tx: mpsc::UnboundedSender<PushAction>,
}

impl PushPromise {
    pub async fn accept(self) -> Result<Response, crate::Error> {
        let (response_tx, rx) = oneshot::channel();
        self.action_tx
            .send(PushAction::Accept {
                promised: self.promised,
                response_tx,
            })
            .map_err(|_| ConnectionError::Closed)?;
        match rx.await {
            Ok(result) => result.map_err(crate::Error::Stream),
            Err(_) => Err(ConnectionError::Closed.into()),
        }
    }

    pub fn cancel(self) {
        self.action_tx
            .send(PushAction::Cancel {
                promised: self.promised,
            })
            .ok();
    }
}

/// Handle to a running connection. Cloneable operations go through the
/// command channel; dropping the handle (and every [`ResponseHandle`])
/// gracefully closes the connection.
pub struct Connection {
    cmd_tx: mpsc::UnboundedSender<Command>,
    push_rx: mpsc::UnboundedReceiver<PushPromise>,
}

impl Connection {
    /// Takes an established transport (TLS already negotiated, ALPN `h2`)
    /// and spawns the connection task. The preface and initial SETTINGS are
    /// the first bytes written.
    pub fn handshake<T>(io: T, config: ConnectionConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        let engine = Engine {
            io,
            config,
            cmd_rx,
            cmd_open: true,
            push_tx,
            action_tx,
            action_rx,
            read_buf: BytesMut::with_capacity(4096),
            out: BytesMut::with_capacity(4096),
            settings: SettingsStore::new(),
            encoder: hpack::Encoder::default(),
            decoder: hpack::Decoder::default(),
            flow: FlowController::new(),
            streams: StreamCoordinator::default(),
            pending: VecDeque::new(),
            continuation: None,
            pings: VecDeque::new(),
            ping_counter: 1,
            goaway_received: None,
            goaway_sent: false,
            closing: false,
            close_done: Vec::new(),
            settings_deadline: None,
            idle_deadline: None,
        };
        tokio::spawn(engine.run());
        Self { cmd_tx, push_rx }
    }

    /// Submits a request without awaiting it. Fails synchronously when the
    /// connection task is gone; nothing touches the wire in that case.
    pub fn submit(&self, request: Request) -> Result<ResponseHandle, ConnectionError> {
        let (response_tx, rx) = oneshot::channel();
        let request_id = request.id;
        self.cmd_tx
            .send(Command::Submit {
                request,
                response_tx,
            })
            .map_err(|_| ConnectionError::Closed)?;
        Ok(ResponseHandle {
            request_id,
            cmd_tx: self.cmd_tx.clone(),
            rx,
        })
    }

    pub async fn request(&self, request: Request) -> Result<Response, crate::Error> {
        self.submit(request)
            .map_err(crate::Error::Connection)?
            .response()
            .await
    }

    /// Round-trips a PING and returns its opaque payload.
    pub async fn ping(&self) -> Result<[u8; 8], ConnectionError> {
        let (ack_tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Ping { ack_tx })
            .map_err(|_| ConnectionError::Closed)?;
        rx.await.map_err(|_| ConnectionError::Closed)?
    }

    /// Sends GOAWAY(NO_ERROR). A graceful close lets in-flight streams
    /// finish; otherwise they observe a cancellation.
    pub async fn close(&self, graceful: bool) {
        let (done_tx, rx) = oneshot::channel();
        if self
            .cmd_tx
            .send(Command::Close { graceful, done_tx })
            .is_ok()
        {
            rx.await.ok();
        }
    }

    /// Next server push offer, or `None` once the connection is down.
    pub async fn push_promise(&mut self) -> Option<PushPromise> {
        self.push_rx.recv().await
    }
}

enum Shutdown {
    /// A connection error; GOAWAY with this code has been queued.
    Error { code: ErrorCode, reason: String },
    Io(ConnectionError),
}

struct HeaderBlock {
    stream: StreamId,
    promised: Option<StreamId>,
    end_stream: bool,
    buf: BytesMut,
}

enum RecvAction {
    Done,
    Finished,
    Replenish(u32),
    Reset(ErrorCode),
    Protocol(&'static str),
}

struct Engine<T> {
    io: T,
    config: ConnectionConfig,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    cmd_open: bool,
    push_tx: mpsc::UnboundedSender<PushPromise>,
    action_tx: mpsc::UnboundedSender<PushAction>,
    action_rx: mpsc::UnboundedReceiver<PushAction>,
    read_buf: BytesMut,
    out: BytesMut,
    settings: SettingsStore,
    encoder: hpack::Encoder,
    decoder: hpack::Decoder,
    flow: FlowController,
    streams: StreamCoordinator,
    pending: VecDeque<(Request, oneshot::Sender<Result<Response, StreamError>>)>,
    continuation: Option<HeaderBlock>,
    pings: VecDeque<([u8; 8], oneshot::Sender<Result<[u8; 8], ConnectionError>>)>,
    ping_counter: u64,
    goaway_received: Option<(StreamId, ErrorCode)>,
    goaway_sent: bool,
    closing: bool,
    close_done: Vec<oneshot::Sender<()>>,
    settings_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl<T> Engine<T>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn run(mut self) {
        let result = self.drive().await;
        match &result {
            Ok(()) => debug!("connection closed"),
            Err(Shutdown::Error { code, reason }) => {
                error!("connection error: {:?}: {}", code, reason);
            }
            Err(Shutdown::Io(err)) => debug!("connection lost: {}", err),
        }
        self.teardown(result).await;
    }

    async fn drive(&mut self) -> Result<(), Shutdown> {
        self.start().await?;
        loop {
            self.process_input()?;
            self.flush().await?;
            if self.finished() {
                return Ok(());
            }
            let deadline = self.next_deadline();
            tokio::select! {
                result = self.io.read_buf(&mut self.read_buf) => match result {
                    Ok(0) => {
                        if self.closing || self.goaway_received.is_some() {
                            return Ok(());
                        }
                        return Err(Shutdown::Io(ConnectionError::Closed));
                    }
                    Ok(_) => {}
                    Err(err) => return Err(Shutdown::Io(err.into())),
                },
                cmd = self.cmd_rx.recv(), if self.cmd_open => match cmd {
                    Some(cmd) => self.handle_command(cmd)?,
                    None => {
                        // every user handle is gone
                        self.cmd_open = false;
                        self.begin_close(ErrorCode::NoError);
                    }
                },
                action = self.action_rx.recv() => {
                    if let Some(action) = action {
                        self.handle_push_action(action);
                    }
                },
                _ = tokio::time::sleep_until(
                    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600)),
                ), if deadline.is_some() => self.check_deadlines()?,
            }
        }
    }

    /// Writes the preface plus our SETTINGS, then waits for the peer's
    /// SETTINGS, which must be the first thing it sends.
    async fn start(&mut self) -> Result<(), Shutdown> {
        let mut greeting = BytesMut::with_capacity(PREFACE.len() + FRAME_HEADER_LEN);
        greeting.extend_from_slice(PREFACE);
        Frame::Settings {
            flags: SettingsFlags::empty(),
            params: self.config.settings.clone(),
        }
        .encode(&mut greeting, DEFAULT_MAX_FRAME_SIZE)
        .map_err(|err| self.connection_error(err.code(), err.to_string()))?;
        self.io
            .write_all(&greeting)
            .await
            .map_err(|err| Shutdown::Io(err.into()))?;
        self.io
            .flush()
            .await
            .map_err(|err| Shutdown::Io(err.into()))?;
        self.settings.sent(self.config.settings.clone());
        self.settings_deadline = Some(Instant::now() + self.config.settings_ack_timeout);
        trace!("preface and SETTINGS sent");

        let limit = self.settings.local(SettingsParameter::MaxFrameSize);
        loop {
            match Frame::parse(&mut self.read_buf, limit) {
                Ok(Some(Frame::Settings { flags, params })) if !flags.contains(SettingsFlags::ACK) => {
                    self.apply_remote_settings(params)?;
                    self.idle_deadline = self.config.idle_timeout.map(|t| Instant::now() + t);
                    return Ok(());
                }
                Ok(Some(_)) => {
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        "peer did not start with SETTINGS",
                    ));
                }
                Ok(None) => {}
                Err(err) => {
                    return Err(self.connection_error(err.code(), err.to_string()));
                }
            }
            let deadline = self.settings_deadline.expect("deadline armed above");
            tokio::select! {
                result = self.io.read_buf(&mut self.read_buf) => match result {
                    Ok(0) => return Err(Shutdown::Io(ConnectionError::Closed)),
                    Ok(_) => {}
                    Err(err) => return Err(Shutdown::Io(err.into())),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(self.connection_error(
                        ErrorCode::SettingsTimeout,
                        "no SETTINGS from peer",
                    ));
                }
            }
        }
    }

    async fn flush(&mut self) -> Result<(), Shutdown> {
        if self.out.is_empty() {
            return Ok(());
        }
        let buf = self.out.split();
        self.io
            .write_all(&buf)
            .await
            .map_err(|err| Shutdown::Io(err.into()))?;
        self.io
            .flush()
            .await
            .map_err(|err| Shutdown::Io(err.into()))
    }

    fn finished(&self) -> bool {
        (self.closing || self.goaway_received.is_some())
            && self.streams.is_empty()
            && self.pending.is_empty()
    }

    fn next_deadline(&self) -> Option<Instant> {
        match (self.settings_deadline, self.idle_deadline) {
            (Some(a), Some(b)) => Some(cmp::min(a, b)),
            (a, b) => a.or(b),
        }
    }

    fn check_deadlines(&mut self) -> Result<(), Shutdown> {
        let now = Instant::now();
        if self.settings_deadline.is_some_and(|d| now >= d) {
            return Err(self.connection_error(
                ErrorCode::SettingsTimeout,
                "peer did not acknowledge SETTINGS",
            ));
        }
        if self.idle_deadline.is_some_and(|d| now >= d) {
            debug!("idle timeout, closing connection");
            self.idle_deadline = None;
            for id in self.streams.ids() {
                if let Some(mut stream) = self.streams.remove(id) {
                    stream.deliver_error(StreamError::Cancelled);
                }
            }
            self.begin_close(ErrorCode::NoError);
        }
        Ok(())
    }

    fn process_input(&mut self) -> Result<(), Shutdown> {
        let limit = self.settings.local(SettingsParameter::MaxFrameSize);
        loop {
            // the wire length of a DATA payload (padding included) is what
            // flow control accounts for, so grab it before parsing strips it
            let data_len = if self.read_buf.len() >= FRAME_HEADER_LEN {
                let head = FrameHeader::parse(&self.read_buf[..FRAME_HEADER_LEN]);
                (head.kind == FrameType::Data as u8).then(|| head.length as usize)
            } else {
                None
            };
            match Frame::parse(&mut self.read_buf, limit) {
                Ok(Some(frame)) => self.dispatch(frame, data_len)?,
                Ok(None) => return Ok(()),
                Err(err) => {
                    if self.continuation.is_some() {
                        return Err(self.connection_error(
                            ErrorCode::ProtocolError,
                            "frame interleaved into a header block",
                        ));
                    }
                    match err.scope() {
                        ErrorScope::Stream(id) => self.reset_stream(id, err.code()),
                        ErrorScope::Connection => {
                            return Err(self.connection_error(err.code(), err.to_string()));
                        }
                    }
                }
            }
        }
    }

    fn dispatch(&mut self, frame: Frame, data_len: Option<usize>) -> Result<(), Shutdown> {
        if let Some(timeout) = self.config.idle_timeout {
            self.idle_deadline = Some(Instant::now() + timeout);
        }
        // between a HEADERS/PUSH_PROMISE without END_HEADERS and the final
        // CONTINUATION, nothing else may appear on the connection
        if let Some(block) = &self.continuation {
            let expected = block.stream;
            match &frame {
                Frame::Continuation { stream, .. } if *stream == expected => {}
                _ => {
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        format!("expected CONTINUATION for stream {}", expected),
                    ));
                }
            }
        }

        match frame {
            Frame::Data {
                stream: id,
                flags,
                data,
            } => self.on_data(id, flags, &data, data_len.unwrap_or(data.len())),
            Frame::Headers {
                stream: id,
                flags,
                priority: _,
                fragment,
            } => {
                // even when the stream is gone the block must be decoded,
                // or the HPACK context desynchronizes
                let block = HeaderBlock {
                    stream: id,
                    promised: None,
                    end_stream: flags.contains(HeadersFlags::END_STREAM),
                    buf: BytesMut::from(&fragment[..]),
                };
                if flags.contains(HeadersFlags::END_HEADERS) {
                    self.finish_header_block(block)
                } else {
                    self.continuation = Some(block);
                    Ok(())
                }
            }
            Frame::Priority { stream, .. } => {
                // parsed and ignored; prioritization is out of scope
                trace!("ignoring PRIORITY for stream {}", stream);
                Ok(())
            }
            Frame::ResetStream { stream: id, error } => self.on_reset_stream(id, error),
            Frame::Settings { flags, params } => {
                if flags.contains(SettingsFlags::ACK) {
                    self.on_settings_acked()
                } else {
                    self.apply_remote_settings(params)
                }
            }
            Frame::PushPromise {
                stream: parent,
                flags,
                promised,
                fragment,
            } => self.on_push_promise(parent, flags, promised, fragment),
            Frame::Ping { flags, payload } => {
                if flags.contains(PingFlags::ACK) {
                    match self.pings.iter().position(|(p, _)| *p == payload) {
                        Some(pos) => {
                            if let Some((_, ack_tx)) = self.pings.remove(pos) {
                                ack_tx.send(Ok(payload)).ok();
                            }
                        }
                        None => warn!("unsolicited PING ACK"),
                    }
                } else {
                    self.write_frame(Frame::Ping {
                        flags: PingFlags::ACK,
                        payload,
                    });
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => self.on_goaway(last_stream, error, &debug),
            Frame::WindowUpdate {
                stream: 0,
                increment,
            } => {
                if self.flow.send.grow(increment).is_err() {
                    return Err(self.connection_error(
                        ErrorCode::FlowControlError,
                        "connection send window overflow",
                    ));
                }
                self.drain();
                Ok(())
            }
            Frame::WindowUpdate {
                stream: id,
                increment,
            } => {
                if let Some(stream) = self.streams.get_mut(id) {
                    if stream.send_window.grow(increment).is_err() {
                        self.reset_stream(id, ErrorCode::FlowControlError);
                    } else {
                        self.drain();
                    }
                    Ok(())
                } else if self.never_opened(id) {
                    Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        format!("WINDOW_UPDATE on unopened stream {}", id),
                    ))
                } else {
                    // updates may trail a stream we already closed
                    Ok(())
                }
            }
            Frame::Continuation {
                stream: id,
                flags,
                fragment,
            } => {
                let Some(mut block) = self.continuation.take() else {
                    return Err(self.connection_error(
                        ErrorCode::ProtocolError,
                        format!("CONTINUATION without a header block on stream {}", id),
                    ));
                };
                if block.buf.len() + fragment.len() > MAX_HEADER_BLOCK_SIZE {
                    return Err(self.connection_error(
                        ErrorCode::EnhanceYourCalm,
                        "header block too large",
                    ));
                }
                block.buf.extend_from_slice(&fragment);
                if flags.contains(ContinuationFlags::END_HEADERS) {
                    self.finish_header_block(block)
                } else {
                    self.continuation = Some(block);
                    Ok(())
                }
            }
            Frame::Unknown { kind, stream } => {
                trace!("ignoring unknown frame type {:#x} on stream {}", kind, stream);
                Ok(())
            }
        }
    }

    fn on_data(
        &mut self,
        id: StreamId,
        flags: DataFlags,
        data: &[u8],
        wire_len: usize,
    ) -> Result<(), Shutdown> {
        if let Some(increment) = self.flow.on_data_received(wire_len) {
            self.write_frame(Frame::WindowUpdate {
                stream: 0,
                increment,
            });
        }
        let end_stream = flags.contains(DataFlags::END_STREAM);
        let initial = self.settings.local(SettingsParameter::InitialWindowSize);
        let action = match self.streams.get_mut(id) {
            None => return self.on_missing_stream(id),
            Some(stream) => match stream.on_recv_data(end_stream) {
                Ok(()) => {
                    stream.recv_window.consume(wire_len);
                    stream.push_data(data);
                    if end_stream {
                        stream.deliver_response();
                        RecvAction::Finished
                    } else {
                        match flow::replenish(&mut stream.recv_window, initial) {
                            Some(increment) => RecvAction::Replenish(increment),
                            None => RecvAction::Done,
                        }
                    }
                }
                Err(StateViolation::Closed) => RecvAction::Reset(ErrorCode::StreamClosed),
                Err(StateViolation::Protocol) => RecvAction::Protocol("DATA"),
            },
        };
        self.finish_recv_action(id, action)
    }

    fn finish_recv_action(&mut self, id: StreamId, action: RecvAction) -> Result<(), Shutdown> {
        match action {
            RecvAction::Done => Ok(()),
            RecvAction::Finished => {
                self.finish_stream(id);
                Ok(())
            }
            RecvAction::Replenish(increment) => {
                self.write_frame(Frame::WindowUpdate {
                    stream: id,
                    increment,
                });
                Ok(())
            }
            RecvAction::Reset(code) => {
                self.reset_stream(id, code);
                Ok(())
            }
            RecvAction::Protocol(kind) => Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("{} on stream {} in invalid state", kind, id),
            )),
        }
    }

    fn finish_header_block(&mut self, block: HeaderBlock) -> Result<(), Shutdown> {
        let target = block.promised.unwrap_or(block.stream);
        match self.decoder.decode(&block.buf) {
            Ok(fields) => {
                let headers: Headers = fields
                    .into_iter()
                    .map(|f| {
                        (
                            String::from_utf8_lossy(&f.name).into_owned(),
                            String::from_utf8_lossy(&f.value).into_owned(),
                        )
                    })
                    .collect();
                match block.promised {
                    None => self.on_response_headers(block.stream, headers, block.end_stream),
                    Some(promised) => {
                        self.deliver_push(block.stream, promised, headers);
                        Ok(())
                    }
                }
            }
            // the table already advanced, so the context is intact and only
            // the offending stream has to go
            Err(HpackError::HeaderListTooLarge(_)) => {
                self.reset_stream(target, ErrorCode::EnhanceYourCalm);
                Ok(())
            }
            Err(err) => Err(self.connection_error(err.code(), err.to_string())),
        }
    }

    fn on_response_headers(
        &mut self,
        id: StreamId,
        headers: Headers,
        end_stream: bool,
    ) -> Result<(), Shutdown> {
        let action = match self.streams.get_mut(id) {
            None => return self.on_missing_stream(id),
            Some(stream) => match stream.on_recv_headers(end_stream) {
                Ok(()) => {
                    stream.push_headers(headers);
                    if end_stream {
                        stream.deliver_response();
                        RecvAction::Finished
                    } else {
                        RecvAction::Done
                    }
                }
                Err(StateViolation::Closed) => RecvAction::Reset(ErrorCode::StreamClosed),
                Err(StateViolation::Protocol) => RecvAction::Protocol("HEADERS"),
            },
        };
        self.finish_recv_action(id, action)
    }

    fn on_push_promise(
        &mut self,
        parent: StreamId,
        flags: PushPromiseFlags,
        promised: StreamId,
        fragment: Bytes,
    ) -> Result<(), Shutdown> {
        if self.settings.local(SettingsParameter::EnablePush) == 0 {
            return Err(self.connection_error(ErrorCode::ProtocolError, "push is disabled"));
        }
        if promised % 2 != 0 || promised <= self.streams.last_promised_id() {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("invalid promised stream id {}", promised),
            ));
        }
        let parent_live = self.streams.get_mut(parent).is_some_and(|s| !s.is_closed());
        if !parent_live {
            return Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("PUSH_PROMISE on inactive stream {}", parent),
            ));
        }
        let send = self.settings.remote(SettingsParameter::InitialWindowSize);
        let recv = self.settings.local(SettingsParameter::InitialWindowSize);
        self.streams.insert_promised(promised, send, recv);
        let block = HeaderBlock {
            stream: parent,
            promised: Some(promised),
            end_stream: false,
            buf: BytesMut::from(&fragment[..]),
        };
        if flags.contains(PushPromiseFlags::END_HEADERS) {
            self.finish_header_block(block)
        } else {
            self.continuation = Some(block);
            Ok(())
        }
    }

    fn deliver_push(&mut self, parent: StreamId, promised: StreamId, headers: Headers) {
        let push = PushPromise {
            parent,
            promised,
            headers,
            action_tx: self.action_tx.clone(),
        };
        if self.push_tx.send(push).is_err() {
            // nobody is listening for pushes
            self.reset_stream(promised, ErrorCode::Cancel);
        }
    }

    fn handle_push_action(&mut self, action: PushAction) {
        match action {
            PushAction::Accept {
                promised,
                response_tx,
            } => match self.streams.get_mut(promised) {
                Some(stream) => {
                    let buffered = stream.is_unclaimed_push();
                    stream.response_tx = Some(response_tx);
                    if buffered {
                        stream.deliver_response();
                        self.finish_stream(promised);
                    }
                }
                None => {
                    response_tx.send(Err(StreamError::Cancelled)).ok();
                }
            },
            PushAction::Cancel { promised } => {
                if self.streams.get_mut(promised).is_some() {
                    self.reset_stream(promised, ErrorCode::Cancel);
                }
            }
        }
    }

    fn on_reset_stream(&mut self, id: StreamId, error: ErrorCode) -> Result<(), Shutdown> {
        if let Some(stream) = self.streams.get_mut(id) {
            match stream.on_recv_reset() {
                Ok(()) => {
                    stream.deliver_error(StreamError::Reset(error));
                    self.streams.remove(id);
                    self.drain();
                    Ok(())
                }
                Err(_) => Err(self.connection_error(
                    ErrorCode::ProtocolError,
                    format!("RST_STREAM on idle stream {}", id),
                )),
            }
        } else if self.never_opened(id) {
            Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("RST_STREAM on unopened stream {}", id),
            ))
        } else {
            // resets may trail a stream we already forgot
            Ok(())
        }
    }

    fn on_settings_acked(&mut self) -> Result<(), Shutdown> {
        let applied = match self.settings.acked() {
            Ok(applied) => applied,
            Err(err) => return Err(self.connection_error(err.code(), err.to_string())),
        };
        for (param, old, new) in applied {
            match param {
                SettingsParameter::HeaderTableSize => {
                    self.decoder.set_max_table_size(new as usize);
                }
                SettingsParameter::MaxHeaderListSize => {
                    self.decoder.set_max_header_list_size(new);
                }
                SettingsParameter::InitialWindowSize => {
                    // our receive windows follow the acknowledged setting
                    let delta = i64::from(new) - i64::from(old);
                    for id in self.streams.ids() {
                        if let Some(stream) = self.streams.get_mut(id) {
                            stream.recv_window.adjust(delta);
                        }
                    }
                }
                _ => {}
            }
        }
        if self.settings.awaiting_ack() {
            self.settings_deadline =
                Some(Instant::now() + self.config.settings_ack_timeout);
        } else {
            self.settings_deadline = None;
        }
        Ok(())
    }

    fn apply_remote_settings(
        &mut self,
        params: Vec<(SettingsParameter, u32)>,
    ) -> Result<(), Shutdown> {
        let changed = match self.settings.apply_remote(&params) {
            Ok(changed) => changed,
            Err(err) => return Err(self.connection_error(err.code(), err.to_string())),
        };
        for (param, old, new) in changed {
            match param {
                SettingsParameter::InitialWindowSize => {
                    self.streams
                        .adjust_send_windows(i64::from(new) - i64::from(old));
                }
                SettingsParameter::HeaderTableSize => {
                    // we honor the peer's ceiling but never grow past our
                    // own default; the directive goes out with the next block
                    let target = cmp::min(new as usize, hpack::DEFAULT_TABLE_SIZE);
                    self.encoder.set_max_table_size(target);
                }
                _ => {}
            }
        }
        self.write_frame(Frame::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        });
        self.drain();
        Ok(())
    }

    fn on_goaway(
        &mut self,
        last_stream: StreamId,
        code: ErrorCode,
        debug_data: &[u8],
    ) -> Result<(), Shutdown> {
        if code != ErrorCode::NoError {
            error!("peer sent GOAWAY: {:?}", code);
        }
        if !debug_data.is_empty() {
            if let Ok(text) = std::str::from_utf8(debug_data) {
                debug!("GOAWAY debug data: {}", text);
            }
        }
        self.goaway_received = Some((last_stream, code));
        for (_, response_tx) in self.pending.drain(..) {
            response_tx.send(Err(StreamError::Refused)).ok();
        }
        // streams above the peer's high-water mark were never processed and
        // are safe to retry elsewhere; the rest run to completion
        for id in self.streams.ids() {
            if id % 2 == 1 && id > last_stream {
                if let Some(mut stream) = self.streams.remove(id) {
                    stream.deliver_error(StreamError::Refused);
                }
            }
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: Command) -> Result<(), Shutdown> {
        match cmd {
            Command::Submit {
                request,
                response_tx,
            } => {
                if self.closing || self.goaway_received.is_some() {
                    response_tx.send(Err(StreamError::Refused)).ok();
                } else if self.at_concurrency_limit() {
                    trace!(
                        "request {} queued behind MAX_CONCURRENT_STREAMS",
                        request.id
                    );
                    self.pending.push_back((request, response_tx));
                } else {
                    self.start_request(request, response_tx);
                }
                Ok(())
            }
            Command::Cancel { request_id } => {
                if let Some(pos) = self.pending.iter().position(|(r, _)| r.id == request_id) {
                    if let Some((_, response_tx)) = self.pending.remove(pos) {
                        response_tx.send(Err(StreamError::Cancelled)).ok();
                    }
                } else if let Some(id) = self.streams.find_request(request_id).map(|s| s.id) {
                    self.write_frame(Frame::ResetStream {
                        stream: id,
                        error: ErrorCode::Cancel,
                    });
                    if let Some(mut stream) = self.streams.remove(id) {
                        stream.deliver_error(StreamError::Cancelled);
                    }
                    self.drain();
                }
                Ok(())
            }
            Command::Ping { ack_tx } => {
                let payload = self.ping_counter.to_be_bytes();
                self.ping_counter += 1;
                self.pings.push_back((payload, ack_tx));
                self.write_frame(Frame::Ping {
                    flags: PingFlags::empty(),
                    payload,
                });
                Ok(())
            }
            Command::Close { graceful, done_tx } => {
                self.close_done.push(done_tx);
                if !graceful {
                    for id in self.streams.ids() {
                        if let Some(mut stream) = self.streams.remove(id) {
                            stream.deliver_error(StreamError::Cancelled);
                        }
                    }
                }
                self.begin_close(ErrorCode::NoError);
                Ok(())
            }
        }
    }

    fn begin_close(&mut self, code: ErrorCode) {
        if self.closing {
            return;
        }
        self.closing = true;
        for (_, response_tx) in self.pending.drain(..) {
            response_tx.send(Err(StreamError::Refused)).ok();
        }
        // closing means the user is done with unaccepted pushes
        for id in self.streams.ids() {
            let unclaimed = self
                .streams
                .get_mut(id)
                .is_some_and(|s| s.id % 2 == 0 && s.response_tx.is_none());
            if unclaimed {
                if let Some(mut stream) = self.streams.remove(id) {
                    if !stream.is_closed() {
                        self.write_frame(Frame::ResetStream {
                            stream: id,
                            error: ErrorCode::Cancel,
                        });
                        stream.close();
                    }
                }
            }
        }
        if !self.goaway_sent {
            self.goaway_sent = true;
            self.write_frame(Frame::GoAway {
                last_stream: self.streams.last_promised_id(),
                error: code,
                debug: Bytes::new(),
            });
        }
    }

    fn at_concurrency_limit(&self) -> bool {
        self.streams.active_local() as u64
            >= u64::from(self.settings.remote(SettingsParameter::MaxConcurrentStreams))
    }

    fn start_request(
        &mut self,
        request: Request,
        response_tx: oneshot::Sender<Result<Response, StreamError>>,
    ) {
        let send = self.settings.remote(SettingsParameter::InitialWindowSize);
        let recv = self.settings.local(SettingsParameter::InitialWindowSize);
        let id = match self.streams.allocate(send, recv) {
            Ok(id) => id,
            Err(err) => {
                response_tx.send(Err(err)).ok();
                return;
            }
        };
        let fields: Vec<hpack::HeaderField> = request
            .headers
            .iter()
            .map(|(name, value)| {
                let name = Bytes::copy_from_slice(name.as_bytes());
                let value = Bytes::copy_from_slice(value.as_bytes());
                if request
                    .sensitive
                    .iter()
                    .any(|s| s.as_bytes().eq_ignore_ascii_case(&name))
                {
                    hpack::HeaderField::sensitive(name, value)
                } else {
                    hpack::HeaderField::new(name, value)
                }
            })
            .collect();
        let block = self.encoder.encode(&fields);
        let end_stream = request.body.is_empty();
        self.write_header_block(id, block, end_stream);
        if let Some(stream) = self.streams.get_mut(id) {
            stream.request_id = request.id;
            stream.response_tx = Some(response_tx);
            stream.on_send_headers(end_stream);
            if !end_stream {
                stream.pending_body = Some(request.body);
            }
        }
        debug!("request {} started on stream {}", request.id, id);
        if !end_stream {
            self.send_stream_body(id);
        }
    }

    /// HEADERS plus any CONTINUATION frames go out back to back; nothing can
    /// interleave because this task is the only writer.
    fn write_header_block(&mut self, id: StreamId, mut block: Bytes, end_stream: bool) {
        let limit = self.settings.remote(SettingsParameter::MaxFrameSize) as usize;
        let mut flags = HeadersFlags::empty();
        if end_stream {
            flags |= HeadersFlags::END_STREAM;
        }
        if block.len() <= limit {
            flags |= HeadersFlags::END_HEADERS;
            self.write_frame(Frame::Headers {
                stream: id,
                flags,
                priority: None,
                fragment: block,
            });
            return;
        }
        let first = block.split_to(limit);
        self.write_frame(Frame::Headers {
            stream: id,
            flags,
            priority: None,
            fragment: first,
        });
        while block.len() > limit {
            let chunk = block.split_to(limit);
            self.write_frame(Frame::Continuation {
                stream: id,
                flags: ContinuationFlags::empty(),
                fragment: chunk,
            });
        }
        self.write_frame(Frame::Continuation {
            stream: id,
            flags: ContinuationFlags::END_HEADERS,
            fragment: block,
        });
    }

    /// Pushes out as much of the stream's parked body as both windows and
    /// the peer's frame-size limit admit; whatever is left stays parked.
    fn send_stream_body(&mut self, id: StreamId) {
        let limit = self.settings.remote(SettingsParameter::MaxFrameSize) as usize;
        loop {
            let Some(stream) = self.streams.get_mut(id) else {
                self.streams.unpark(id);
                return;
            };
            let Some(mut body) = stream.pending_body.take() else {
                self.streams.unpark(id);
                return;
            };
            let quota = [
                stream.send_window.available(),
                self.flow.send.available(),
                limit,
                body.len(),
            ]
            .into_iter()
            .min()
            .unwrap_or(0);
            if quota == 0 {
                stream.pending_body = Some(body);
                self.streams.queue_send(id);
                trace!("stream {} parked behind flow control", id);
                return;
            }
            let chunk = body.split_to(quota);
            let last = body.is_empty();
            stream.send_window.consume(quota);
            self.flow.send.consume(quota);
            if last {
                stream.on_send_end_stream();
            } else {
                stream.pending_body = Some(body);
            }
            self.write_frame(Frame::Data {
                stream: id,
                flags: if last {
                    DataFlags::END_STREAM
                } else {
                    DataFlags::empty()
                },
                data: chunk,
            });
            if last {
                self.streams.unpark(id);
                // the peer may have finished its side first
                if self.streams.get_mut(id).is_some_and(|s| s.is_closed()) {
                    self.streams.remove(id);
                }
                return;
            }
        }
    }

    /// Re-examines blocked work, oldest first: parked bodies, then queued
    /// requests. Stops at the first head that still cannot proceed.
    fn drain(&mut self) {
        while let Some(id) = self.streams.next_parked() {
            self.send_stream_body(id);
            if self.streams.next_parked() == Some(id) {
                return;
            }
        }
        while !self.pending.is_empty()
            && !self.at_concurrency_limit()
            && !self.closing
            && self.goaway_received.is_none()
        {
            if let Some((request, response_tx)) = self.pending.pop_front() {
                self.start_request(request, response_tx);
            }
        }
    }

    /// Removes the stream once it is closed, then re-examines blocked work.
    /// A finished push that nobody accepted yet stays in the table so a
    /// late accept can still claim the buffered response.
    fn finish_stream(&mut self, id: StreamId) {
        if self
            .streams
            .get_mut(id)
            .is_some_and(|s| s.is_closed() && !s.is_unclaimed_push())
        {
            self.streams.remove(id);
        }
        self.drain();
    }

    /// A stream error: RST_STREAM goes out, the submitter learns the code,
    /// everything else keeps running.
    fn reset_stream(&mut self, id: StreamId, code: ErrorCode) {
        warn!("resetting stream {}: {:?}", id, code);
        self.write_frame(Frame::ResetStream {
            stream: id,
            error: code,
        });
        if let Some(mut stream) = self.streams.remove(id) {
            stream.close();
            stream.deliver_error(StreamError::LocalReset(code));
        }
        self.drain();
    }

    /// A connection error: GOAWAY is queued and the caller unwinds into
    /// teardown.
    fn connection_error(&mut self, code: ErrorCode, reason: impl Into<String>) -> Shutdown {
        let reason = reason.into();
        if !self.goaway_sent {
            self.goaway_sent = true;
            self.write_frame(Frame::GoAway {
                last_stream: self.streams.last_promised_id(),
                error: code,
                debug: Bytes::from(reason.clone().into_bytes()),
            });
        }
        Shutdown::Error { code, reason }
    }

    fn never_opened(&self, id: StreamId) -> bool {
        if id % 2 == 0 {
            id > self.streams.last_promised_id()
        } else {
            self.streams.is_unopened_local(id)
        }
    }

    /// DATA or HEADERS for a stream not in the table: ids never opened are
    /// a connection error; ids we closed and forgot get STREAM_CLOSED.
    fn on_missing_stream(&mut self, id: StreamId) -> Result<(), Shutdown> {
        if self.never_opened(id) {
            Err(self.connection_error(
                ErrorCode::ProtocolError,
                format!("frame on unopened stream {}", id),
            ))
        } else {
            self.reset_stream(id, ErrorCode::StreamClosed);
            Ok(())
        }
    }

    fn write_frame(&mut self, frame: Frame) {
        let limit = self.settings.remote(SettingsParameter::MaxFrameSize);
        if let Err(err) = frame.encode(&mut self.out, limit) {
            // frames we originate are chunked to fit; this cannot happen
            error!("dropping unencodable outbound frame: {}", err);
        }
    }

    async fn teardown(&mut self, result: Result<(), Shutdown>) {
        let (stream_error, connection_error) = match &result {
            Ok(()) => (
                StreamError::ConnectionClosed(ErrorCode::NoError),
                match self.goaway_received {
                    Some((_, code)) if code != ErrorCode::NoError => {
                        ConnectionError::GoAway(code)
                    }
                    _ => ConnectionError::Closed,
                },
            ),
            Err(Shutdown::Error { code, reason }) => (
                StreamError::ConnectionClosed(*code),
                match code {
                    ErrorCode::SettingsTimeout => ConnectionError::SettingsTimeout,
                    _ => ConnectionError::Protocol {
                        code: *code,
                        reason: reason.clone(),
                    },
                },
            ),
            Err(Shutdown::Io(err)) => (
                StreamError::ConnectionClosed(ErrorCode::InternalError),
                err.clone(),
            ),
        };
        for id in self.streams.ids() {
            if let Some(mut stream) = self.streams.remove(id) {
                stream.deliver_error(stream_error.clone());
            }
        }
        for (_, response_tx) in self.pending.drain(..) {
            response_tx.send(Err(StreamError::Refused)).ok();
        }
        for (_, ack_tx) in self.pings.drain(..) {
            ack_tx.send(Err(connection_error.clone())).ok();
        }
        for done_tx in self.close_done.drain(..) {
            done_tx.send(()).ok();
        }
        // best effort: the queued GOAWAY should reach the peer
        let _ = self.flush().await;
        let _ = self.io.shutdown().await;
    }
}
