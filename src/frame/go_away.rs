use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::frame::{Error, Head, Kind, Reason, StreamId};

/// A GOAWAY frame: the peer will not process streams above
/// `last_stream_id`.
#[derive(Clone, Eq, PartialEq)]
pub struct GoAway {
    last_stream_id: StreamId,
    error_code: Reason,
    debug_data: Bytes,
}

impl GoAway {
    pub fn new(last_stream_id: StreamId, reason: Reason) -> Self {
        GoAway {
            last_stream_id,
            error_code: reason,
            debug_data: Bytes::new(),
        }
    }

    pub fn last_stream_id(&self) -> StreamId {
        self.last_stream_id
    }

    pub fn reason(&self) -> Reason {
        self.error_code
    }

    pub fn debug_data(&self) -> &Bytes {
        &self.debug_data
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<GoAway, Error> {
        debug_assert_eq!(head.kind(), Kind::GoAway);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if payload.len() < 8 {
            return Err(Error::BadFrameSize);
        }

        let (last_stream_id, _) = StreamId::parse(&payload[..4]);
        let error_code = unpack_octets_4!(payload, 4, u32);
        let debug_data = payload.slice(8..);

        Ok(GoAway {
            last_stream_id,
            error_code: error_code.into(),
            debug_data,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let head = Head::new(Kind::GoAway, 0, StreamId::ZERO);

        head.encode(8 + self.debug_data.len(), dst);
        dst.put_u32(u32::from(self.last_stream_id));
        dst.put_u32(self.error_code.into());
        dst.put_slice(&self.debug_data);
    }
}

impl fmt::Debug for GoAway {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("GoAway")
            .field("last_stream_id", &self.last_stream_id)
            .field("error_code", &self.error_code)
            .finish()
    }
}
