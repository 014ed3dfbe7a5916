use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::frame::{util, Error, Head, Kind, StreamId};

/// A HEADERS frame carrying an opaque header block fragment.
///
/// Compression and decompression of the fragment is the header codec
/// adapter's business; at this layer the block is just bytes.
#[derive(Eq, PartialEq)]
pub struct Headers {
    stream_id: StreamId,
    fragment: Bytes,
    flags: HeadersFlag,
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct HeadersFlag(u8);

/// A CONTINUATION frame, extending the header block of the preceding
/// HEADERS frame on the connection.
#[derive(Eq, PartialEq)]
pub struct Continuation {
    stream_id: StreamId,
    fragment: Bytes,
    end_headers: bool,
}

const END_STREAM: u8 = 0x1;
const END_HEADERS: u8 = 0x4;
const PADDED: u8 = 0x8;
const PRIORITY: u8 = 0x20;

impl Headers {
    pub fn new(stream_id: StreamId, fragment: Bytes) -> Self {
        Headers {
            stream_id,
            fragment,
            flags: HeadersFlag(0),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn fragment(&self) -> &Bytes {
        &self.fragment
    }

    pub fn into_fragment(self) -> Bytes {
        self.fragment
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags.0 & END_HEADERS == END_HEADERS
    }

    pub fn set_end_headers(&mut self) {
        self.flags.0 |= END_HEADERS;
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self) {
        self.flags.0 |= END_STREAM;
    }

    /// Append a continuation's fragment to this header block.
    pub fn extend(&mut self, cont: Continuation) {
        debug_assert_eq!(self.stream_id, cont.stream_id);

        let mut buf = BytesMut::with_capacity(self.fragment.len() + cont.fragment.len());
        buf.put_slice(&self.fragment);
        buf.put_slice(&cont.fragment);
        self.fragment = buf.freeze();

        if cont.end_headers {
            self.set_end_headers();
        }
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Self, Error> {
        let flags = HeadersFlag(head.flag());

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if flags.0 & PADDED == PADDED {
            let _ = util::strip_padding(&mut payload)?;
        }

        // A priority section may precede the fragment; the priority tree is
        // not implemented, so it is dropped here.
        if flags.0 & PRIORITY == PRIORITY {
            if payload.len() < 5 {
                return Err(Error::MalformedMessage);
            }
            let _ = payload.split_to(5);
        }

        Ok(Headers {
            stream_id: head.stream_id(),
            fragment: payload,
            flags,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Headers, self.flags.0 & !PADDED & !PRIORITY, self.stream_id);
        head.encode(self.fragment.len(), dst);
        dst.put_slice(&self.fragment);
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Headers")
            .field("stream_id", &self.stream_id)
            .field("fragment_len", &self.fragment.len())
            .field("end_headers", &self.is_end_headers())
            .field("end_stream", &self.is_end_stream())
            .finish()
    }
}

impl Continuation {
    pub fn new(stream_id: StreamId, fragment: Bytes, end_headers: bool) -> Self {
        Continuation {
            stream_id,
            fragment,
            end_headers,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_headers(&self) -> bool {
        self.end_headers
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Self, Error> {
        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        Ok(Continuation {
            stream_id: head.stream_id(),
            fragment: payload,
            end_headers: head.flag() & END_HEADERS == END_HEADERS,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flag = if self.end_headers { END_HEADERS } else { 0 };
        let head = Head::new(Kind::Continuation, flag, self.stream_id);
        head.encode(self.fragment.len(), dst);
        dst.put_slice(&self.fragment);
    }
}

impl fmt::Debug for Continuation {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Continuation")
            .field("stream_id", &self.stream_id)
            .field("fragment_len", &self.fragment.len())
            .field("end_headers", &self.end_headers)
            .finish()
    }
}
