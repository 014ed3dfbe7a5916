use std::fmt;

/// A stream identifier, as described in [Section 5.1.1] of RFC 7540.
///
/// Client-initiated streams use odd identifiers; 0 addresses the connection
/// itself.
///
/// [Section 5.1.1]: https://tools.ietf.org/html/rfc7540#section-5.1.1
#[derive(Debug, Clone, Copy, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct StreamId(u32);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamIdOverflow;

const STREAM_ID_MASK: u32 = 1 << 31;

impl StreamId {
    pub const ZERO: StreamId = StreamId(0);

    pub const MAX: StreamId = StreamId(u32::MAX >> 1);

    /// Parse the stream ID field found in a frame header, returning the ID
    /// and the value of the leading reserved bit.
    pub fn parse(buf: &[u8]) -> (StreamId, bool) {
        let unpacked = unpack_octets_4!(buf, 0, u32);
        let flag = unpacked & STREAM_ID_MASK == STREAM_ID_MASK;

        (StreamId(unpacked & !STREAM_ID_MASK), flag)
    }

    pub fn is_client_initiated(&self) -> bool {
        let id = self.0;
        id != 0 && id % 2 == 1
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub fn next_id(&self) -> Result<StreamId, StreamIdOverflow> {
        let next = self.0 + 2;
        if next > StreamId::MAX.0 {
            Err(StreamIdOverflow)
        } else {
            Ok(StreamId(next))
        }
    }
}

impl From<u32> for StreamId {
    fn from(src: u32) -> Self {
        assert_eq!(src & STREAM_ID_MASK, 0, "invalid stream ID: MSB is set");
        StreamId(src)
    }
}

impl From<StreamId> for u32 {
    fn from(src: StreamId) -> Self {
        src.0
    }
}

impl PartialEq<u32> for StreamId {
    fn eq(&self, other: &u32) -> bool {
        self.0 == *other
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, fmt)
    }
}
