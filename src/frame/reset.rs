use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Error, Head, Kind, Reason, StreamId};

/// An RST_STREAM frame: immediate termination of one stream.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Reset {
    stream_id: StreamId,
    error_code: Reason,
}

impl Reset {
    pub fn new(stream_id: StreamId, error: Reason) -> Self {
        Reset {
            stream_id,
            error_code: error,
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Reset, Error> {
        debug_assert_eq!(head.kind(), Kind::Reset);

        if head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if payload.len() != 4 {
            return Err(Error::BadFrameSize);
        }

        let error_code = unpack_octets_4!(payload, 0, u32);

        Ok(Reset {
            stream_id: head.stream_id(),
            error_code: error_code.into(),
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::Reset, 0, self.stream_id);

        head.encode(4, dst);
        dst.put_u32(self.error_code.into());
    }
}
