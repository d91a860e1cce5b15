use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Bit 0: last frame the endpoint will send for this stream.
        const END_STREAM = 0x1;
        /// Bit 3: a Pad Length field and padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// Bit 0: the header block ends the stream. CONTINUATION frames may
        /// still follow; they are logically part of this frame.
        const END_STREAM = 0x1;
        /// Bit 2: this frame carries the entire header block. Without it, the
        /// very next frame on the connection must be a CONTINUATION for the
        /// same stream.
        const END_HEADERS = 0x4;
        /// Bit 3: a Pad Length field and padding are present.
        const PADDED = 0x8;
        /// Bit 5: an exclusive-flag/dependency/weight prefix is present.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Bit 0: acknowledges the peer's SETTINGS. The payload must be empty,
        /// otherwise the frame is a FRAME_SIZE_ERROR.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        /// Bit 2: this frame carries the entire header block.
        const END_HEADERS = 0x4;
        /// Bit 3: a Pad Length field and padding are present.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// Bit 0: this PING is a response. An endpoint must not respond to a
        /// PING that carries it.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// Bit 2: this frame ends the header block.
        const END_HEADERS = 0x4;
    }
}
