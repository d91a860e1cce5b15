use crate::types::{ErrorCode, FrameType, StreamId};

/// Whether a protocol violation condemns one stream or the whole connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorScope {
    Connection,
    Stream(StreamId),
}

/// Frame-level wire violations, each mapping to an RFC 7540 error code and a
/// scope for the recovery action (RST_STREAM vs GOAWAY).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {length} bytes exceeds the {limit}-byte limit")]
    Oversized { length: u32, limit: u32 },
    #[error("{kind:?} frame on stream {stream} has invalid length {length}")]
    BadFrameSize {
        kind: FrameType,
        stream: StreamId,
        length: usize,
    },
    #[error("{0:?} frame on stream 0")]
    MissingStreamId(FrameType),
    #[error("{kind:?} frame on stream {stream}")]
    UnexpectedStreamId { kind: FrameType, stream: StreamId },
    #[error("stream id {0} has the reserved bit set")]
    ReservedBitSet(StreamId),
    #[error("padding exceeds the frame payload")]
    BadPadding,
    #[error("SETTINGS payload of {0} bytes is not a multiple of 6")]
    BadSettingsLength(usize),
    #[error("SETTINGS ACK with a non-empty payload")]
    SettingsAckWithPayload,
    #[error("zero window increment on stream {0}")]
    ZeroWindowIncrement(StreamId),
}

impl FrameError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            FrameError::Oversized { .. }
            | FrameError::SettingsAckWithPayload
            | FrameError::BadSettingsLength(_)
            | FrameError::BadFrameSize { .. } => ErrorCode::FrameSizeError,
            FrameError::MissingStreamId(_)
            | FrameError::UnexpectedStreamId { .. }
            | FrameError::ReservedBitSet(_)
            | FrameError::BadPadding
            | FrameError::ZeroWindowIncrement(_) => ErrorCode::ProtocolError,
        }
    }

    /// A PRIORITY size violation condemns only its stream; a zero
    /// WINDOW_UPDATE condemns the stream it names. Everything else is a
    /// connection error.
    #[must_use]
    pub fn scope(&self) -> ErrorScope {
        match self {
            FrameError::BadFrameSize {
                kind: FrameType::Priority,
                stream,
                ..
            } => ErrorScope::Stream(*stream),
            FrameError::ZeroWindowIncrement(stream) if *stream != 0 => ErrorScope::Stream(*stream),
            _ => ErrorScope::Connection,
        }
    }
}

/// Header-compression failures. All of these desynchronize the HPACK context
/// except the list-size cap, which is enforced after the table has advanced
/// and therefore only condemns the stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HpackError {
    #[error("truncated header block")]
    Truncated,
    #[error("header block integer overflow")]
    IntegerOverflow,
    #[error("invalid header table index {0}")]
    InvalidIndex(usize),
    #[error("invalid huffman encoding")]
    InvalidHuffman,
    #[error("dynamic table size update to {size} exceeds the {limit}-byte limit")]
    TableSizeUpdate { size: usize, limit: usize },
    #[error("dynamic table size update after the first header field")]
    LateTableSizeUpdate,
    #[error("header list exceeds {0} bytes")]
    HeaderListTooLarge(u32),
}

impl HpackError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            HpackError::HeaderListTooLarge(_) => ErrorCode::EnhanceYourCalm,
            _ => ErrorCode::CompressionError,
        }
    }
}

/// Peer SETTINGS values outside their allowed ranges.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("ENABLE_PUSH value {0} is neither 0 nor 1")]
    InvalidEnablePush(u32),
    #[error("INITIAL_WINDOW_SIZE {0} exceeds 2^31-1")]
    WindowTooLarge(u32),
    #[error("MAX_FRAME_SIZE {0} outside 2^14..=2^24-1")]
    FrameSizeOutOfRange(u32),
    #[error("SETTINGS ACK without an outstanding SETTINGS")]
    UnexpectedAck,
}

impl SettingsError {
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        match self {
            SettingsError::WindowTooLarge(_) => ErrorCode::FlowControlError,
            _ => ErrorCode::ProtocolError,
        }
    }
}

/// Terminal outcome of a single stream, delivered to whoever submitted the
/// request. Other streams on the connection are unaffected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    #[error("stream reset by peer: {0:?}")]
    Reset(ErrorCode),
    #[error("stream reset locally: {0:?}")]
    LocalReset(ErrorCode),
    #[error("request cancelled")]
    Cancelled,
    #[error("stream refused; safe to retry on another connection")]
    Refused,
    #[error("stream ids exhausted; a new connection is needed")]
    IdsExhausted,
    #[error("connection closed: {0:?}")]
    ConnectionClosed(ErrorCode),
}

/// Terminal outcome of the whole connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("i/o: {0}")]
    Io(String),
    #[error("peer sent GOAWAY: {0:?}")]
    GoAway(ErrorCode),
    #[error("protocol violation: {code:?}: {reason}")]
    Protocol { code: ErrorCode, reason: String },
    #[error("peer did not acknowledge SETTINGS in time")]
    SettingsTimeout,
    #[error("connection is closed")]
    Closed,
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(err.to_string())
    }
}

/// Top-level error for the user-facing client surface.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("peer did not negotiate h2")]
    AlpnRejected,
    #[cfg(feature = "json")]
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}
