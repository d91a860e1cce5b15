use num_derive::{FromPrimitive, ToPrimitive};

/// Streams are identified by a 31-bit integer; the connection itself is stream 0.
pub type StreamId = u32;

/// Highest stream id representable on the wire (reserved bit clear).
pub const MAX_STREAM_ID: StreamId = u32::MAX >> 1;

/// The 24-byte client connection preface, sent before any frame.
///
/// https://httpwg.org/specs/rfc7540.html#ConnectionHeader
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Initial flow-control window for streams and the connection alike.
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

/// Flow-control windows may never exceed 2^31-1 octets.
pub const MAX_WINDOW_SIZE: u32 = u32::MAX >> 1;

/// Default and minimum allowed SETTINGS_MAX_FRAME_SIZE.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;

/// Ceiling for SETTINGS_MAX_FRAME_SIZE (2^24-1).
pub const MAX_ALLOWED_FRAME_SIZE: u32 = (1 << 24) - 1;

/// Decoded header lists, in wire order. Pseudo-headers come first.
pub type Headers = Vec<(String, String)>;

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorCode {
    /// Graceful shutdown or normal stream completion.
    NoError = 0x0,
    /// Unspecific protocol violation.
    ProtocolError = 0x1,
    /// Unexpected internal error.
    InternalError = 0x2,
    /// The peer violated the flow-control protocol.
    FlowControlError = 0x3,
    /// SETTINGS was not acknowledged in a timely manner.
    SettingsTimeout = 0x4,
    /// A frame arrived after the stream was half-closed.
    StreamClosed = 0x5,
    /// A frame had an invalid size.
    FrameSizeError = 0x6,
    /// The stream was refused before any application processing.
    RefusedStream = 0x7,
    /// The stream is no longer needed.
    Cancel = 0x8,
    /// The header compression context cannot be maintained.
    CompressionError = 0x9,
    /// A CONNECT tunnel was reset or abnormally closed.
    ConnectError = 0xa,
    /// The peer is generating excessive load.
    EnhanceYourCalm = 0xb,
    /// The transport does not meet minimum security requirements.
    InadequateSecurity = 0xc,
    /// The peer requires HTTP/1.1.
    Http11Required = 0xd,
}

impl ErrorCode {
    /// Unknown codes are treated as INTERNAL_ERROR instead of failing the frame.
    #[must_use]
    pub fn from_wire(raw: u32) -> Self {
        num_traits::FromPrimitive::from_u32(raw).unwrap_or(ErrorCode::InternalError)
    }

    #[must_use]
    pub fn to_wire(self) -> u32 {
        self as u32
    }
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
pub enum SettingsParameter {
    /// Maximum size of the peer's header compression table, in octets. Initially 4,096.
    HeaderTableSize = 0x1,
    /// 0 disables server push; any value other than 0 or 1 is a PROTOCOL_ERROR.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender permits the receiver to create.
    MaxConcurrentStreams = 0x3,
    /// Sender's initial stream-level window, in octets. Values above 2^31-1 are a
    /// FLOW_CONTROL_ERROR.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive; must stay within
    /// 2^14..=2^24-1.
    MaxFrameSize = 0x5,
    /// Advisory cap on the uncompressed size of a header list (32 octets of
    /// overhead per field).
    MaxHeaderListSize = 0x6,
}
