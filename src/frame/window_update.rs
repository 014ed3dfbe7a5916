use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Error, Head, Kind, StreamId};

/// A WINDOW_UPDATE frame: replenishes flow-control credit for one stream,
/// or for the connection when addressed to stream 0.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct WindowUpdate {
    stream_id: StreamId,
    size_increment: u32,
}

const SIZE_INCREMENT_MASK: u32 = 1 << 31;

impl WindowUpdate {
    pub fn new(stream_id: StreamId, size_increment: u32) -> Self {
        WindowUpdate {
            stream_id,
            size_increment,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn size_increment(&self) -> u32 {
        self.size_increment
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<WindowUpdate, Error> {
        debug_assert_eq!(head.kind(), Kind::WindowUpdate);

        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        let size_increment = unpack_octets_4!(payload, 0, u32) & !SIZE_INCREMENT_MASK;

        Ok(WindowUpdate {
            stream_id: head.stream_id(),
            size_increment,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::WindowUpdate, 0, self.stream_id);

        head.encode(4, dst);
        dst.put_u32(self.size_increment);
    }
}
