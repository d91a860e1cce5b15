//! HPACK header compression (RFC 7541).
//!
//! Encoder and decoder are independent contexts; each owns a dynamic table
//! layered over the static table, kept in sync with the peer purely through
//! the on-wire byte stream. The connection engine therefore has to feed
//! header blocks through in exact frame order.

use crate::{error::HpackError, huffman};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::VecDeque;

pub const DEFAULT_TABLE_SIZE: usize = 4096;

/// Per-entry overhead charged against the table size (RFC 7541 §4.1).
const ENTRY_OVERHEAD: usize = 32;

/// A single header field. `sensitive` fields are encoded "never indexed" and
/// survive decoding with the flag intact, so intermediaries keep the marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: Bytes,
    pub value: Bytes,
    pub sensitive: bool,
}

impl HeaderField {
    pub fn new(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: false,
        }
    }

    pub fn sensitive(name: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            sensitive: true,
        }
    }
}

#[derive(Debug, Clone)]
struct TableEntry {
    size: usize,
    name: Bytes,
    value: Bytes,
}

impl TableEntry {
    fn new(name: Bytes, value: Bytes) -> Self {
        Self {
            size: name.len() + value.len() + ENTRY_OVERHEAD,
            name,
            value,
        }
    }
}

macro_rules! static_table {
    ( $( $name:expr => $value:expr ),+ ) => {
        [
            $(
                TableEntry {
                    size: $name.len() + $value.len() + ENTRY_OVERHEAD,
                    name: Bytes::from_static($name),
                    value: Bytes::from_static($value),
                }
            ),+
        ]
    };
}

/// https://httpwg.org/specs/rfc7541.html#static.table.definition
static STATIC_TABLE: [TableEntry; 61] = static_table![
    b":authority" => b"",
    b":method" => b"GET",
    b":method" => b"POST",
    b":path" => b"/",
    b":path" => b"/index.html",
    b":scheme" => b"http",
    b":scheme" => b"https",
    b":status" => b"200",
    b":status" => b"204",
    b":status" => b"206",
    b":status" => b"304",
    b":status" => b"400",
    b":status" => b"404",
    b":status" => b"500",
    b"accept-charset" => b"",
    b"accept-encoding" => b"gzip, deflate",
    b"accept-language" => b"",
    b"accept-ranges" => b"",
    b"accept" => b"",
    b"access-control-allow-origin" => b"",
    b"age" => b"",
    b"allow" => b"",
    b"authorization" => b"",
    b"cache-control" => b"",
    b"content-disposition" => b"",
    b"content-encoding" => b"",
    b"content-language" => b"",
    b"content-length" => b"",
    b"content-location" => b"",
    b"content-range" => b"",
    b"content-type" => b"",
    b"cookie" => b"",
    b"date" => b"",
    b"etag" => b"",
    b"expect" => b"",
    b"expires" => b"",
    b"from" => b"",
    b"host" => b"",
    b"if-match" => b"",
    b"if-modified-since" => b"",
    b"if-none-match" => b"",
    b"if-range" => b"",
    b"if-unmodified-since" => b"",
    b"last-modified" => b"",
    b"link" => b"",
    b"location" => b"",
    b"max-forwards" => b"",
    b"proxy-authenticate" => b"",
    b"proxy-authorization" => b"",
    b"range" => b"",
    b"referer" => b"",
    b"refresh" => b"",
    b"retry-after" => b"",
    b"server" => b"",
    b"set-cookie" => b"",
    b"strict-transport-security" => b"",
    b"transfer-encoding" => b"",
    b"user-agent" => b"",
    b"vary" => b"",
    b"via" => b"",
    b"www-authenticate" => b""
];

enum Lookup {
    /// Name and value both matched at this index.
    Full(usize),
    /// Only the name matched.
    Name(usize),
    Miss,
}

/// Static table plus one endpoint's dynamic table. Indices are 1-based;
/// dynamic entries start at 62 with the newest first.
#[derive(Debug, Clone)]
struct Table {
    max_size: usize,
    current_size: usize,
    entries: VecDeque<TableEntry>,
}

impl Table {
    fn new(max_size: usize) -> Self {
        Self {
            max_size,
            current_size: 0,
            entries: VecDeque::new(),
        }
    }

    fn get(&self, index: usize) -> Option<&TableEntry> {
        if index == 0 {
            None
        } else if index <= STATIC_TABLE.len() {
            Some(&STATIC_TABLE[index - 1])
        } else {
            self.entries.get(index - STATIC_TABLE.len() - 1)
        }
    }

    fn insert(&mut self, name: Bytes, value: Bytes) {
        let entry = TableEntry::new(name, value);
        // an entry larger than the table empties it and is not inserted
        if entry.size > self.max_size {
            self.entries.clear();
            self.current_size = 0;
            return;
        }
        self.current_size += entry.size;
        self.entries.push_front(entry);
        self.evict();
    }

    fn resize(&mut self, max_size: usize) {
        self.max_size = max_size;
        self.evict();
    }

    fn evict(&mut self) {
        while self.current_size > self.max_size {
            let popped = self.entries.pop_back().expect("sized entries to evict");
            self.current_size -= popped.size;
        }
    }

    fn find(&self, name: &[u8], value: &[u8]) -> Lookup {
        let mut name_only = None;
        let all = STATIC_TABLE.iter().chain(self.entries.iter());
        for (i, entry) in all.enumerate() {
            if entry.name == name {
                if entry.value == value {
                    return Lookup::Full(i + 1);
                }
                name_only.get_or_insert(i + 1);
            }
        }
        match name_only {
            Some(index) => Lookup::Name(index),
            None => Lookup::Miss,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn encode_integer(dst: &mut BytesMut, prefix_bits: u8, flags: u8, value: usize) {
    let limit = (1usize << prefix_bits) - 1;
    if value < limit {
        dst.put_u8(flags | value as u8);
        return;
    }
    dst.put_u8(flags | limit as u8);
    let mut rest = value - limit;
    while rest >= 128 {
        dst.put_u8((rest as u8 & 0x7f) | 0x80);
        rest >>= 7;
    }
    dst.put_u8(rest as u8);
}

fn decode_integer(src: &[u8], pos: &mut usize, prefix_bits: u8) -> Result<usize, HpackError> {
    let limit = (1usize << prefix_bits) - 1;
    let first = *src.get(*pos).ok_or(HpackError::Truncated)?;
    *pos += 1;
    let mut value = (first & limit as u8) as usize;
    if value < limit {
        return Ok(value);
    }
    let mut shift = 0u32;
    loop {
        let byte = *src.get(*pos).ok_or(HpackError::Truncated)?;
        *pos += 1;
        if shift > 28 {
            return Err(HpackError::IntegerOverflow);
        }
        value = value
            .checked_add(usize::from(byte & 0x7f) << shift)
            .ok_or(HpackError::IntegerOverflow)?;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

fn encode_string(dst: &mut BytesMut, data: &[u8]) {
    let coded = huffman::encoded_len(data);
    if coded < data.len() {
        encode_integer(dst, 7, 0x80, coded);
        huffman::encode(data, dst);
    } else {
        encode_integer(dst, 7, 0, data.len());
        dst.put_slice(data);
    }
}

fn decode_string(src: &[u8], pos: &mut usize) -> Result<Bytes, HpackError> {
    let coded = *src.get(*pos).ok_or(HpackError::Truncated)? & 0x80 != 0;
    let length = decode_integer(src, pos, 7)?;
    let raw = src
        .get(*pos..*pos + length)
        .ok_or(HpackError::Truncated)?;
    *pos += length;
    if coded {
        huffman::decode(raw).map(Bytes::from)
    } else {
        Ok(Bytes::copy_from_slice(raw))
    }
}

/// Compresses outbound header lists.
#[derive(Debug, Clone)]
pub struct Encoder {
    table: Table,
    /// Sizes to announce at the head of the next block: the minimum the
    /// table passed through since the last block, and the final value.
    pending_resize: Option<(usize, usize)>,
}

impl Encoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            pending_resize: None,
        }
    }

    /// Applies a new table ceiling (normally the peer's HEADER_TABLE_SIZE).
    /// The table shrinks immediately; the wire directive is deferred to the
    /// start of the next header block, as RFC 7541 §4.2 requires.
    pub fn set_max_table_size(&mut self, size: usize) {
        if size == self.table.max_size {
            return;
        }
        match &mut self.pending_resize {
            Some((min, latest)) => {
                *min = (*min).min(size);
                *latest = size;
            }
            None => self.pending_resize = Some((size, size)),
        }
        self.table.resize(size);
    }

    pub fn encode(&mut self, fields: &[HeaderField]) -> Bytes {
        let mut dst = BytesMut::with_capacity(64);
        if let Some((min, latest)) = self.pending_resize.take() {
            encode_integer(&mut dst, 5, 0x20, min);
            if latest != min {
                encode_integer(&mut dst, 5, 0x20, latest);
            }
        }
        for field in fields {
            self.encode_field(&mut dst, field);
        }
        dst.freeze()
    }

    fn encode_field(&mut self, dst: &mut BytesMut, field: &HeaderField) {
        if field.sensitive {
            match self.table.find(&field.name, &field.value) {
                Lookup::Full(index) | Lookup::Name(index) => {
                    encode_integer(dst, 4, 0x10, index);
                }
                Lookup::Miss => {
                    encode_integer(dst, 4, 0x10, 0);
                    encode_string(dst, &field.name);
                }
            }
            encode_string(dst, &field.value);
            return;
        }

        let entry_size = field.name.len() + field.value.len() + ENTRY_OVERHEAD;
        match self.table.find(&field.name, &field.value) {
            Lookup::Full(index) => encode_integer(dst, 7, 0x80, index),
            Lookup::Name(index) if entry_size <= self.table.max_size => {
                encode_integer(dst, 6, 0x40, index);
                encode_string(dst, &field.value);
                self.table.insert(field.name.clone(), field.value.clone());
            }
            Lookup::Name(index) => {
                encode_integer(dst, 4, 0, index);
                encode_string(dst, &field.value);
            }
            Lookup::Miss if entry_size <= self.table.max_size => {
                encode_integer(dst, 6, 0x40, 0);
                encode_string(dst, &field.name);
                encode_string(dst, &field.value);
                self.table.insert(field.name.clone(), field.value.clone());
            }
            Lookup::Miss => {
                encode_integer(dst, 4, 0, 0);
                encode_string(dst, &field.name);
                encode_string(dst, &field.value);
            }
        }
    }

    #[must_use]
    pub fn dynamic_table_len(&self) -> usize {
        self.table.len()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::with_size(DEFAULT_TABLE_SIZE)
    }
}

/// Decompresses inbound header blocks.
#[derive(Debug, Clone)]
pub struct Decoder {
    table: Table,
    /// Ceiling the peer's size updates must respect: our advertised
    /// SETTINGS_HEADER_TABLE_SIZE.
    limit: usize,
    max_header_list_size: u32,
}

impl Decoder {
    #[must_use]
    pub fn with_size(dynamic_table_size: usize) -> Self {
        Self {
            table: Table::new(dynamic_table_size),
            limit: dynamic_table_size,
            max_header_list_size: u32::MAX,
        }
    }

    /// New ceiling after our HEADER_TABLE_SIZE setting was acknowledged.
    /// Shrinking takes effect immediately so the promise holds even before
    /// the peer's size-update directive arrives.
    pub fn set_max_table_size(&mut self, size: usize) {
        self.limit = size;
        if self.table.max_size > size {
            self.table.resize(size);
        }
    }

    pub fn set_max_header_list_size(&mut self, size: u32) {
        self.max_header_list_size = size;
    }

    /// Decodes one complete header block.
    ///
    /// A list-size overflow is reported only after the whole block has been
    /// processed, so the dynamic table still advances and the compression
    /// context survives; the caller resets the stream, not the connection.
    pub fn decode(&mut self, src: &[u8]) -> Result<Vec<HeaderField>, HpackError> {
        let mut pos = 0;
        let mut fields = Vec::new();
        let mut seen_field = false;
        let mut list_size: u64 = 0;

        while pos < src.len() {
            let first = src[pos];
            let field = if first & 0x80 != 0 {
                let index = decode_integer(src, &mut pos, 7)?;
                let entry = self.table.get(index).ok_or(HpackError::InvalidIndex(index))?;
                HeaderField::new(entry.name.clone(), entry.value.clone())
            } else if first & 0x40 != 0 {
                let (name, value) = self.read_name_value(src, &mut pos, 6)?;
                self.table.insert(name.clone(), value.clone());
                HeaderField::new(name, value)
            } else if first & 0x20 != 0 {
                if seen_field {
                    return Err(HpackError::LateTableSizeUpdate);
                }
                let size = decode_integer(src, &mut pos, 5)?;
                if size > self.limit {
                    return Err(HpackError::TableSizeUpdate {
                        size,
                        limit: self.limit,
                    });
                }
                self.table.resize(size);
                continue;
            } else {
                let sensitive = first & 0x10 != 0;
                let (name, value) = self.read_name_value(src, &mut pos, 4)?;
                HeaderField {
                    name,
                    value,
                    sensitive,
                }
            };

            seen_field = true;
            list_size += (field.name.len() + field.value.len() + ENTRY_OVERHEAD) as u64;
            fields.push(field);
        }

        if list_size > u64::from(self.max_header_list_size) {
            return Err(HpackError::HeaderListTooLarge(self.max_header_list_size));
        }
        Ok(fields)
    }

    fn read_name_value(
        &self,
        src: &[u8],
        pos: &mut usize,
        prefix_bits: u8,
    ) -> Result<(Bytes, Bytes), HpackError> {
        let index = decode_integer(src, pos, prefix_bits)?;
        let name = if index == 0 {
            decode_string(src, pos)?
        } else {
            self.table
                .get(index)
                .ok_or(HpackError::InvalidIndex(index))?
                .name
                .clone()
        };
        let value = decode_string(src, pos)?;
        Ok((name, value))
    }

    #[must_use]
    pub fn dynamic_table_len(&self) -> usize {
        self.table.len()
    }

    #[must_use]
    pub fn dynamic_table_size(&self) -> usize {
        self.table.current_size
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::with_size(DEFAULT_TABLE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ::hpack as reference;

    fn fields(pairs: &[(&str, &str)]) -> Vec<HeaderField> {
        pairs
            .iter()
            .map(|(name, value)| HeaderField::new(name.as_bytes().to_vec(), value.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn integer_examples_from_rfc7541_c1() {
        let mut dst = BytesMut::new();
        encode_integer(&mut dst, 5, 0, 10);
        assert_eq!(dst.as_ref(), &[0b0000_1010]);

        let mut dst = BytesMut::new();
        encode_integer(&mut dst, 5, 0, 1337);
        assert_eq!(dst.as_ref(), &[0x1f, 0x9a, 0x0a]);

        let mut dst = BytesMut::new();
        encode_integer(&mut dst, 8, 0, 42);
        assert_eq!(dst.as_ref(), &[0x2a]);

        let mut pos = 0;
        assert_eq!(decode_integer(&[0x1f, 0x9a, 0x0a], &mut pos, 5).unwrap(), 1337);
    }

    #[test]
    fn integer_overflow_is_rejected() {
        let src = [0x1f, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let mut pos = 0;
        assert_eq!(
            decode_integer(&src, &mut pos, 5),
            Err(HpackError::IntegerOverflow)
        );
    }

    #[test]
    fn encode_is_readable_by_the_reference_decoder() {
        let mut encoder = Encoder::default();
        let mut decoder = reference::Decoder::new();

        let headers = fields(&[(":method", "GET"), (":path", "/"), ("x-trace", "abc123")]);
        let block = encoder.encode(&headers);
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(
            decoded,
            headers
                .iter()
                .map(|f| (f.name.to_vec(), f.value.to_vec()))
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn decode_handles_the_reference_encoder() {
        let mut decoder = Decoder::default();
        let mut encoder = reference::Encoder::new();

        let headers = vec![(&b":method"[..], &b"GET"[..]), (&b":path"[..], &b"/"[..])];
        let block = encoder.encode(headers.clone());
        let decoded = decoder.decode(&block).unwrap();
        assert_eq!(
            decoded
                .iter()
                .map(|f| (f.name.as_ref(), f.value.as_ref()))
                .collect::<Vec<_>>(),
            headers
        );
    }

    #[test]
    fn repeated_fields_move_to_the_dynamic_table() {
        let mut encoder = Encoder::default();
        let headers = fields(&[("x-custom", "v1")]);
        let first = encoder.encode(&headers);
        let second = encoder.encode(&headers);
        assert!(first.len() > second.len());
        // 62 = first dynamic entry
        assert_eq!(second.as_ref(), &[0x80 | 62]);
    }

    #[test]
    fn oversized_entries_clear_the_table() {
        let mut table = Table::new(64);
        table.insert(Bytes::from_static(b"a"), Bytes::from_static(b"b"));
        assert_eq!(table.len(), 1);
        table.insert(Bytes::from_static(b"x"), Bytes::from(vec![b'y'; 100]));
        assert_eq!(table.len(), 0);
        assert_eq!(table.current_size, 0);
    }

    #[test]
    fn size_update_above_the_limit_is_rejected() {
        let mut decoder = Decoder::with_size(256);
        // 0x3f 0xe1 0x1f = size update to 4096
        assert_eq!(
            decoder.decode(&[0x3f, 0xe1, 0x1f]),
            Err(HpackError::TableSizeUpdate {
                size: 4096,
                limit: 256
            })
        );
    }

    #[test]
    fn size_update_after_a_field_is_rejected() {
        let mut decoder = Decoder::default();
        // indexed :method GET, then size update to 0
        assert_eq!(
            decoder.decode(&[0x82, 0x20]),
            Err(HpackError::LateTableSizeUpdate)
        );
    }
}
