use crate::{
    error::StreamError,
    flow::Window,
    response::Response,
    types::{Headers, StreamId},
};
use bytes::{Bytes, BytesMut};
use derivative::Derivative;
use log::trace;
use tokio::sync::oneshot;

/// https://httpwg.org/specs/rfc7540.html#StreamStates
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamState {
    Idle,
    ReservedLocal,
    ReservedRemote,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

/// An inbound frame that the stream's state does not permit. `Closed` is a
/// stream error (STREAM_CLOSED); `Protocol` condemns the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateViolation {
    Closed,
    Protocol,
}

/// One request/response exchange. Client-initiated streams carry the
/// submitter's oneshot; promised streams get one attached if the push is
/// accepted.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Stream {
    pub id: StreamId,
    /// Cancellation key; 0 for server-pushed streams.
    pub request_id: usize,
    state: StreamState,
    pub send_window: Window,
    pub recv_window: Window,
    #[derivative(Debug = "ignore")]
    pub response_tx: Option<oneshot::Sender<Result<Response, StreamError>>>,
    /// Outbound body bytes parked behind flow control. The final chunk
    /// always carries END_STREAM, so no separate marker is needed.
    pub pending_body: Option<Bytes>,
    /// The response finished while nobody was waiting for it, which can
    /// only happen on a pushed stream that has not been accepted yet.
    completed: bool,
    headers: Headers,
    body: BytesMut,
}

impl Stream {
    #[must_use]
    pub fn new(id: StreamId, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            request_id: 0,
            state: StreamState::Idle,
            send_window: Window::new(send_window),
            recv_window: Window::new(recv_window),
            response_tx: None,
            pending_body: None,
            completed: false,
            headers: Headers::new(),
            body: BytesMut::new(),
        }
    }

    #[must_use]
    pub fn state(&self) -> StreamState {
        self.state
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    fn set_state(&mut self, next: StreamState) {
        if self.state != next {
            trace!("stream {} {:?} -> {:?}", self.id, self.state, next);
            self.state = next;
        }
    }

    /// A promised stream starts life reserved by the peer.
    pub fn reserve_remote(&mut self) {
        debug_assert_eq!(self.state, StreamState::Idle);
        self.set_state(StreamState::ReservedRemote);
    }

    pub fn on_send_headers(&mut self, end_stream: bool) {
        debug_assert_eq!(self.state, StreamState::Idle);
        self.set_state(if end_stream {
            StreamState::HalfClosedLocal
        } else {
            StreamState::Open
        });
    }

    /// Called when the final outbound DATA chunk has been written.
    pub fn on_send_end_stream(&mut self) {
        match self.state {
            StreamState::Open => self.set_state(StreamState::HalfClosedLocal),
            StreamState::HalfClosedRemote => self.set_state(StreamState::Closed),
            _ => {}
        }
    }

    pub fn on_recv_headers(&mut self, end_stream: bool) -> Result<(), StateViolation> {
        match self.state {
            StreamState::Open => {
                if end_stream {
                    self.set_state(StreamState::HalfClosedRemote);
                }
                Ok(())
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.set_state(StreamState::Closed);
                }
                Ok(())
            }
            // the client can only receive on a promised stream
            StreamState::ReservedRemote => {
                self.set_state(if end_stream {
                    StreamState::Closed
                } else {
                    StreamState::HalfClosedLocal
                });
                Ok(())
            }
            StreamState::HalfClosedRemote | StreamState::Closed => Err(StateViolation::Closed),
            StreamState::Idle | StreamState::ReservedLocal => Err(StateViolation::Protocol),
        }
    }

    pub fn on_recv_data(&mut self, end_stream: bool) -> Result<(), StateViolation> {
        match self.state {
            StreamState::Open => {
                if end_stream {
                    self.set_state(StreamState::HalfClosedRemote);
                }
                Ok(())
            }
            StreamState::HalfClosedLocal => {
                if end_stream {
                    self.set_state(StreamState::Closed);
                }
                Ok(())
            }
            StreamState::HalfClosedRemote | StreamState::Closed => Err(StateViolation::Closed),
            StreamState::Idle | StreamState::ReservedLocal | StreamState::ReservedRemote => {
                Err(StateViolation::Protocol)
            }
        }
    }

    pub fn on_recv_reset(&mut self) -> Result<(), StateViolation> {
        if self.state == StreamState::Idle {
            return Err(StateViolation::Protocol);
        }
        self.set_state(StreamState::Closed);
        Ok(())
    }

    pub fn close(&mut self) {
        self.set_state(StreamState::Closed);
    }

    pub fn push_headers(&mut self, decoded: Headers) {
        self.headers.extend(decoded);
    }

    pub fn push_data(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Resolves the submitter's future with the accumulated response. With
    /// no receiver attached the response stays buffered for a later accept.
    pub fn deliver_response(&mut self) {
        match self.response_tx.take() {
            Some(tx) => {
                let response = Response {
                    request_id: self.request_id,
                    headers: std::mem::take(&mut self.headers),
                    body: self.body.split().freeze(),
                };
                trace!(
                    "stream {} delivering response ({} bytes)",
                    self.id,
                    response.body.len()
                );
                // the submitter may have lost interest; that is not an error
                tx.send(Ok(response)).ok();
            }
            None => self.completed = true,
        }
    }

    /// A finished pushed response waiting for an accept.
    #[must_use]
    pub fn is_unclaimed_push(&self) -> bool {
        self.request_id == 0 && self.response_tx.is_none() && self.completed
    }

    /// Resolves the submitter's future with a terminal stream error.
    pub fn deliver_error(&mut self, error: StreamError) {
        if let Some(tx) = self.response_tx.take() {
            tx.send(Err(error)).ok();
        }
    }
}
