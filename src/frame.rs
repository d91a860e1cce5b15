use crate::{error::FrameError, flags::*, types::*};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use log::trace;
use num_traits::FromPrimitive;

pub const FRAME_HEADER_LEN: usize = 9;

/// The fixed 9-byte prefix of every frame.
///
/// https://httpwg.org/specs/rfc7540.html#FrameHeader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u32,
    pub kind: u8,
    pub flags: u8,
    pub stream: StreamId,
}

impl FrameHeader {
    /// Reads a header from the first 9 bytes of `buf`.
    #[must_use]
    pub fn parse(buf: &[u8]) -> Self {
        Self {
            length: u32::from_be_bytes([0, buf[0], buf[1], buf[2]]),
            kind: buf[3],
            flags: buf[4],
            stream: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & MAX_STREAM_ID,
        }
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&self.length.to_be_bytes()[1..]);
        dst.put_u8(self.kind);
        dst.put_u8(self.flags);
        dst.put_u32(self.stream & MAX_STREAM_ID);
    }
}

/// Stream dependency prefix carried by HEADERS (with the PRIORITY flag) and
/// PRIORITY frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub dependency: StreamId,
    pub exclusive: bool,
    pub weight: u8,
}

/// One decoded frame. Padding has already been stripped (and the PADDED flag
/// cleared); header block fragments are raw HPACK bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: StreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: StreamId,
        flags: HeadersFlags,
        priority: Option<Priority>,
        fragment: Bytes,
    },
    Priority {
        stream: StreamId,
        priority: Priority,
    },
    ResetStream {
        stream: StreamId,
        error: ErrorCode,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: StreamId,
        flags: PushPromiseFlags,
        promised: StreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        payload: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: StreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
    /// Frames of an unrecognized type are ignored, not rejected.
    Unknown {
        kind: u8,
        stream: StreamId,
    },
}

impl Frame {
    /// Consumes and parses at most one complete frame from `buf`. A partial
    /// frame leaves the buffer untouched and yields `Ok(None)`. Typed
    /// validation errors consume the offending frame, so parsing can resume
    /// at the next one when the violation is stream-scoped.
    pub fn parse(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Self>, FrameError> {
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        let header = FrameHeader::parse(&buf[..FRAME_HEADER_LEN]);
        if header.length > max_frame_size {
            return Err(FrameError::Oversized {
                length: header.length,
                limit: max_frame_size,
            });
        }
        if buf.len() < FRAME_HEADER_LEN + header.length as usize {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_LEN);
        let payload = buf.split_to(header.length as usize).freeze();
        Self::decode_payload(header, payload).map(Some)
    }

    fn decode_payload(header: FrameHeader, mut payload: Bytes) -> Result<Self, FrameError> {
        let Some(kind) = FrameType::from_u8(header.kind) else {
            trace!("ignoring unknown frame type {:#x}", header.kind);
            return Ok(Frame::Unknown {
                kind: header.kind,
                stream: header.stream,
            });
        };
        let stream = header.stream;
        let bad_size = |length: usize| FrameError::BadFrameSize {
            kind,
            stream,
            length,
        };

        match kind {
            FrameType::Data => {
                require_stream(kind, stream)?;
                let mut flags = DataFlags::from_bits_truncate(header.flags);
                if flags.contains(DataFlags::PADDED) {
                    strip_padding(&mut payload)?;
                    flags.remove(DataFlags::PADDED);
                }
                Ok(Frame::Data {
                    stream,
                    flags,
                    data: payload,
                })
            }
            FrameType::Headers => {
                require_stream(kind, stream)?;
                let mut flags = HeadersFlags::from_bits_truncate(header.flags);
                if flags.contains(HeadersFlags::PADDED) {
                    strip_padding(&mut payload)?;
                    flags.remove(HeadersFlags::PADDED);
                }
                let priority = if flags.contains(HeadersFlags::PRIORITY) {
                    if payload.len() < 5 {
                        return Err(bad_size(payload.len()));
                    }
                    Some(take_priority(&mut payload))
                } else {
                    None
                };
                Ok(Frame::Headers {
                    stream,
                    flags,
                    priority,
                    fragment: payload,
                })
            }
            FrameType::Priority => {
                require_stream(kind, stream)?;
                if payload.len() != 5 {
                    return Err(bad_size(payload.len()));
                }
                Ok(Frame::Priority {
                    stream,
                    priority: take_priority(&mut payload),
                })
            }
            FrameType::ResetStream => {
                require_stream(kind, stream)?;
                if payload.len() != 4 {
                    return Err(bad_size(payload.len()));
                }
                Ok(Frame::ResetStream {
                    stream,
                    error: ErrorCode::from_wire(payload.get_u32()),
                })
            }
            FrameType::Settings => {
                require_connection(kind, stream)?;
                let flags = SettingsFlags::from_bits_truncate(header.flags);
                if flags.contains(SettingsFlags::ACK) && !payload.is_empty() {
                    return Err(FrameError::SettingsAckWithPayload);
                }
                if payload.len() % 6 != 0 {
                    return Err(FrameError::BadSettingsLength(payload.len()));
                }
                let mut params = Vec::with_capacity(payload.len() / 6);
                while !payload.is_empty() {
                    let key = payload.get_u16();
                    let value = payload.get_u32();
                    // unknown settings are ignored, per spec
                    if let Some(param) = SettingsParameter::from_u16(key) {
                        params.push((param, value));
                    }
                }
                Ok(Frame::Settings { flags, params })
            }
            FrameType::PushPromise => {
                require_stream(kind, stream)?;
                let mut flags = PushPromiseFlags::from_bits_truncate(header.flags);
                if flags.contains(PushPromiseFlags::PADDED) {
                    strip_padding(&mut payload)?;
                    flags.remove(PushPromiseFlags::PADDED);
                }
                if payload.len() < 4 {
                    return Err(bad_size(payload.len()));
                }
                let promised = payload.get_u32() & MAX_STREAM_ID;
                Ok(Frame::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment: payload,
                })
            }
            FrameType::Ping => {
                require_connection(kind, stream)?;
                if payload.len() != 8 {
                    return Err(bad_size(payload.len()));
                }
                let mut opaque = [0u8; 8];
                opaque.copy_from_slice(&payload);
                Ok(Frame::Ping {
                    flags: PingFlags::from_bits_truncate(header.flags),
                    payload: opaque,
                })
            }
            FrameType::GoAway => {
                require_connection(kind, stream)?;
                if payload.len() < 8 {
                    return Err(bad_size(payload.len()));
                }
                let last_stream = payload.get_u32() & MAX_STREAM_ID;
                let error = ErrorCode::from_wire(payload.get_u32());
                Ok(Frame::GoAway {
                    last_stream,
                    error,
                    debug: payload,
                })
            }
            FrameType::WindowUpdate => {
                if payload.len() != 4 {
                    return Err(bad_size(payload.len()));
                }
                let increment = payload.get_u32() & MAX_STREAM_ID;
                if increment == 0 {
                    return Err(FrameError::ZeroWindowIncrement(stream));
                }
                Ok(Frame::WindowUpdate { stream, increment })
            }
            FrameType::Continuation => {
                require_stream(kind, stream)?;
                Ok(Frame::Continuation {
                    stream,
                    flags: ContinuationFlags::from_bits_truncate(header.flags),
                    fragment: payload,
                })
            }
        }
    }

    /// Appends the encoded frame to `dst`, enforcing the peer's
    /// MAX_FRAME_SIZE and the reserved stream-id bit. Padding is never
    /// emitted.
    pub fn encode(&self, dst: &mut BytesMut, max_frame_size: u32) -> Result<(), FrameError> {
        match self {
            Frame::Data {
                stream,
                flags,
                data,
            } => {
                let flags = *flags - DataFlags::PADDED;
                write_frame(dst, max_frame_size, FrameType::Data as u8, flags.bits(), *stream, data.len(), |p| {
                    p.put_slice(data);
                })
            }
            Frame::Headers {
                stream,
                flags,
                priority,
                fragment,
            } => {
                let mut flags = *flags - HeadersFlags::PADDED;
                flags.set(HeadersFlags::PRIORITY, priority.is_some());
                let length = fragment.len() + if priority.is_some() { 5 } else { 0 };
                write_frame(dst, max_frame_size, FrameType::Headers as u8, flags.bits(), *stream, length, |p| {
                    if let Some(priority) = priority {
                        put_priority(p, *priority);
                    }
                    p.put_slice(fragment);
                })
            }
            Frame::Priority { stream, priority } => {
                write_frame(dst, max_frame_size, FrameType::Priority as u8, 0, *stream, 5, |p| {
                    put_priority(p, *priority);
                })
            }
            Frame::ResetStream { stream, error } => {
                write_frame(dst, max_frame_size, FrameType::ResetStream as u8, 0, *stream, 4, |p| {
                    p.put_u32(error.to_wire());
                })
            }
            Frame::Settings { flags, params } => {
                write_frame(
                    dst,
                    max_frame_size,
                    FrameType::Settings as u8,
                    flags.bits(),
                    0,
                    params.len() * 6,
                    |p| {
                        for (key, value) in params {
                            p.put_u16(*key as u16);
                            p.put_u32(*value);
                        }
                    },
                )
            }
            Frame::PushPromise {
                stream,
                flags,
                promised,
                fragment,
            } => {
                let flags = *flags - PushPromiseFlags::PADDED;
                write_frame(
                    dst,
                    max_frame_size,
                    FrameType::PushPromise as u8,
                    flags.bits(),
                    *stream,
                    4 + fragment.len(),
                    |p| {
                        p.put_u32(promised & MAX_STREAM_ID);
                        p.put_slice(fragment);
                    },
                )
            }
            Frame::Ping { flags, payload } => {
                write_frame(dst, max_frame_size, FrameType::Ping as u8, flags.bits(), 0, 8, |p| {
                    p.put_slice(payload);
                })
            }
            Frame::GoAway {
                last_stream,
                error,
                debug,
            } => {
                write_frame(
                    dst,
                    max_frame_size,
                    FrameType::GoAway as u8,
                    0,
                    0,
                    8 + debug.len(),
                    |p| {
                        p.put_u32(last_stream & MAX_STREAM_ID);
                        p.put_u32(error.to_wire());
                        p.put_slice(debug);
                    },
                )
            }
            Frame::WindowUpdate { stream, increment } => {
                write_frame(dst, max_frame_size, FrameType::WindowUpdate as u8, 0, *stream, 4, |p| {
                    p.put_u32(increment & MAX_STREAM_ID);
                })
            }
            Frame::Continuation {
                stream,
                flags,
                fragment,
            } => {
                write_frame(
                    dst,
                    max_frame_size,
                    FrameType::Continuation as u8,
                    flags.bits(),
                    *stream,
                    fragment.len(),
                    |p| {
                        p.put_slice(fragment);
                    },
                )
            }
            Frame::Unknown { kind, stream } => {
                write_frame(dst, max_frame_size, *kind, 0, *stream, 0, |_| {})
            }
        }
    }

    /// The stream the frame applies to; 0 for connection-scoped frames.
    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Frame::Data { stream, .. }
            | Frame::Headers { stream, .. }
            | Frame::Priority { stream, .. }
            | Frame::ResetStream { stream, .. }
            | Frame::PushPromise { stream, .. }
            | Frame::WindowUpdate { stream, .. }
            | Frame::Continuation { stream, .. }
            | Frame::Unknown { stream, .. } => *stream,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }
}

fn require_stream(kind: FrameType, stream: StreamId) -> Result<(), FrameError> {
    if stream == 0 {
        Err(FrameError::MissingStreamId(kind))
    } else {
        Ok(())
    }
}

fn require_connection(kind: FrameType, stream: StreamId) -> Result<(), FrameError> {
    if stream != 0 {
        Err(FrameError::UnexpectedStreamId { kind, stream })
    } else {
        Ok(())
    }
}

fn strip_padding(payload: &mut Bytes) -> Result<(), FrameError> {
    if payload.is_empty() {
        return Err(FrameError::BadPadding);
    }
    let pad = payload[0] as usize;
    payload.advance(1);
    if pad > payload.len() {
        return Err(FrameError::BadPadding);
    }
    payload.truncate(payload.len() - pad);
    Ok(())
}

fn take_priority(payload: &mut Bytes) -> Priority {
    let raw = payload.get_u32();
    Priority {
        dependency: raw & MAX_STREAM_ID,
        exclusive: raw & !MAX_STREAM_ID != 0,
        weight: payload.get_u8(),
    }
}

fn put_priority(dst: &mut BytesMut, priority: Priority) {
    let mut raw = priority.dependency & MAX_STREAM_ID;
    if priority.exclusive {
        raw |= !MAX_STREAM_ID;
    }
    dst.put_u32(raw);
    dst.put_u8(priority.weight);
}

fn write_frame(
    dst: &mut BytesMut,
    max_frame_size: u32,
    kind: u8,
    flags: u8,
    stream: StreamId,
    length: usize,
    payload: impl FnOnce(&mut BytesMut),
) -> Result<(), FrameError> {
    if length as u64 > u64::from(max_frame_size) {
        return Err(FrameError::Oversized {
            length: length as u32,
            limit: max_frame_size,
        });
    }
    if stream > MAX_STREAM_ID {
        return Err(FrameError::ReservedBitSet(stream));
    }
    FrameHeader {
        length: length as u32,
        kind,
        flags,
        stream,
    }
    .encode(dst);
    dst.reserve(length);
    payload(dst);
    Ok(())
}
