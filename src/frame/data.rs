use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::frame::{util, Error, Head, Kind, StreamId};

/// A DATA frame: a chunk of a request or response body.
#[derive(Eq, PartialEq)]
pub struct Data {
    stream_id: StreamId,
    data: Bytes,
    flags: DataFlags,
    pad_len: Option<u8>,
}

#[derive(Copy, Clone, Default, Eq, PartialEq)]
struct DataFlags(u8);

const END_STREAM: u8 = 0x1;
const PADDED: u8 = 0x8;

impl Data {
    pub fn new(stream_id: StreamId, payload: Bytes) -> Self {
        assert!(!stream_id.is_zero());

        Data {
            stream_id,
            data: payload,
            flags: DataFlags::default(),
            pad_len: None,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn is_end_stream(&self) -> bool {
        self.flags.0 & END_STREAM == END_STREAM
    }

    pub fn set_end_stream(&mut self, val: bool) {
        if val {
            self.flags.0 |= END_STREAM;
        } else {
            self.flags.0 &= !END_STREAM;
        }
    }

    pub fn payload(&self) -> &Bytes {
        &self.data
    }

    pub fn into_payload(self) -> Bytes {
        self.data
    }

    /// The number of octets this frame counts against flow-control windows:
    /// the data plus any padding, including the pad-length octet.
    pub fn flow_len(&self) -> u32 {
        let padding = match self.pad_len {
            Some(len) => len as usize + 1,
            None => 0,
        };
        (self.data.len() + padding) as u32
    }

    pub(crate) fn load(head: Head, mut payload: Bytes) -> Result<Self, Error> {
        let flags = DataFlags(head.flag());

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        let pad_len = if flags.0 & PADDED == PADDED {
            Some(util::strip_padding(&mut payload)?)
        } else {
            None
        };

        Ok(Data {
            stream_id: head.stream_id(),
            data: payload,
            flags,
            pad_len,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Data, self.flags.0, self.stream_id);
        head.encode(self.data.len(), dst);
        dst.put_slice(&self.data);
    }
}

impl fmt::Debug for Data {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Data")
            .field("stream_id", &self.stream_id)
            .field("len", &self.data.len())
            .field("end_stream", &self.is_end_stream())
            .finish()
    }
}
