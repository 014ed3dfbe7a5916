use bytes::{BufMut, Bytes, BytesMut};

use crate::frame::{Error, Head, Kind, StreamId};

pub type PingPayload = [u8; 8];

/// A PING frame, used for keepalive and round-trip measurement.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Ping {
    ack: bool,
    payload: PingPayload,
}

const ACK: u8 = 0x1;

impl Ping {
    /// Payload used by keepalive pings issued on read-idle timeout.
    pub const KEEPALIVE: PingPayload = *b"\x0b\x7e\x57\x5c\x2e\x2a\x77\x04";

    pub fn new(payload: PingPayload) -> Ping {
        Ping {
            ack: false,
            payload,
        }
    }

    pub fn pong(payload: PingPayload) -> Ping {
        Ping { ack: true, payload }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn payload(&self) -> &PingPayload {
        &self.payload
    }

    pub fn into_payload(self) -> PingPayload {
        self.payload
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Ping, Error> {
        debug_assert_eq!(head.kind(), Kind::Ping);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if payload.len() != 8 {
            return Err(Error::BadFrameSize);
        }

        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&payload);

        Ok(Ping {
            ack: head.flag() & ACK == ACK,
            payload: bytes,
        })
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let flag = if self.ack { ACK } else { 0 };
        let head = Head::new(Kind::Ping, flag, StreamId::ZERO);

        head.encode(8, dst);
        dst.put_slice(&self.payload);
    }
}
