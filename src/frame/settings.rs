use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

use crate::frame::{Error, Head, Kind, StreamId};

pub const DEFAULT_SETTINGS_HEADER_TABLE_SIZE: usize = 4_096;
pub const DEFAULT_INITIAL_WINDOW_SIZE: u32 = 65_535;
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = (1 << 24) - 1;
pub const MAX_INITIAL_WINDOW_SIZE: u32 = (1 << 31) - 1;

/// A SETTINGS frame: connection-level parameters, or an acknowledgement of
/// the peer's.
#[derive(Clone, Default, Eq, PartialEq)]
pub struct Settings {
    ack: bool,
    header_table_size: Option<u32>,
    enable_push: Option<u32>,
    max_concurrent_streams: Option<u32>,
    initial_window_size: Option<u32>,
    max_frame_size: Option<u32>,
    max_header_list_size: Option<u32>,
}

const HEADER_TABLE_SIZE: u16 = 1;
const ENABLE_PUSH: u16 = 2;
const MAX_CONCURRENT_STREAMS: u16 = 3;
const INITIAL_WINDOW_SIZE: u16 = 4;
const MAX_FRAME_SIZE: u16 = 5;
const MAX_HEADER_LIST_SIZE: u16 = 6;

const ACK: u8 = 0x1;

impl Settings {
    pub fn ack() -> Settings {
        Settings {
            ack: true,
            ..Settings::default()
        }
    }

    pub fn is_ack(&self) -> bool {
        self.ack
    }

    pub fn header_table_size(&self) -> Option<u32> {
        self.header_table_size
    }

    pub fn set_header_table_size(&mut self, size: Option<u32>) {
        self.header_table_size = size;
    }

    pub fn is_push_enabled(&self) -> Option<bool> {
        self.enable_push.map(|val| val != 0)
    }

    pub fn set_enable_push(&mut self, enable: bool) {
        self.enable_push = Some(enable as u32);
    }

    pub fn max_concurrent_streams(&self) -> Option<u32> {
        self.max_concurrent_streams
    }

    pub fn set_max_concurrent_streams(&mut self, max: Option<u32>) {
        self.max_concurrent_streams = max;
    }

    pub fn initial_window_size(&self) -> Option<u32> {
        self.initial_window_size
    }

    pub fn set_initial_window_size(&mut self, size: Option<u32>) {
        self.initial_window_size = size;
    }

    pub fn max_frame_size(&self) -> Option<u32> {
        self.max_frame_size
    }

    pub fn set_max_frame_size(&mut self, size: Option<u32>) {
        if let Some(val) = size {
            assert!(DEFAULT_MAX_FRAME_SIZE <= val && val <= MAX_MAX_FRAME_SIZE);
        }
        self.max_frame_size = size;
    }

    pub fn max_header_list_size(&self) -> Option<u32> {
        self.max_header_list_size
    }

    pub fn set_max_header_list_size(&mut self, size: Option<u32>) {
        self.max_header_list_size = size;
    }

    pub(crate) fn load(head: Head, payload: Bytes) -> Result<Settings, Error> {
        debug_assert_eq!(head.kind(), Kind::Settings);

        if !head.stream_id().is_zero() {
            return Err(Error::InvalidStreamId);
        }

        if head.flag() & ACK == ACK {
            if payload.is_empty() {
                return Ok(Settings::ack());
            }
            return Err(Error::InvalidPayloadAckSettings);
        }

        if payload.len() % 6 != 0 {
            return Err(Error::BadFrameSize);
        }

        let mut settings = Settings::default();

        for raw in payload.chunks(6) {
            let id = ((raw[0] as u16) << 8) | (raw[1] as u16);
            let value = unpack_octets_4!(raw, 2, u32);

            match id {
                HEADER_TABLE_SIZE => settings.header_table_size = Some(value),
                ENABLE_PUSH => {
                    if value > 1 {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.enable_push = Some(value);
                }
                MAX_CONCURRENT_STREAMS => settings.max_concurrent_streams = Some(value),
                INITIAL_WINDOW_SIZE => {
                    if value > MAX_INITIAL_WINDOW_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.initial_window_size = Some(value);
                }
                MAX_FRAME_SIZE => {
                    if value < DEFAULT_MAX_FRAME_SIZE || value > MAX_MAX_FRAME_SIZE {
                        return Err(Error::InvalidSettingValue);
                    }
                    settings.max_frame_size = Some(value);
                }
                MAX_HEADER_LIST_SIZE => settings.max_header_list_size = Some(value),
                // Unknown settings must be ignored.
                _ => {}
            }
        }

        Ok(settings)
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        let payload_len = self.len();
        let flag = if self.ack { ACK } else { 0 };
        let head = Head::new(Kind::Settings, flag, StreamId::ZERO);

        head.encode(payload_len, dst);

        self.for_each(|id, value| {
            dst.put_u16(id);
            dst.put_u32(value);
        });
    }

    fn len(&self) -> usize {
        let mut count = 0;
        self.for_each(|_, _| count += 6);
        count
    }

    fn for_each<F: FnMut(u16, u32)>(&self, mut f: F) {
        if let Some(v) = self.header_table_size {
            f(HEADER_TABLE_SIZE, v);
        }
        if let Some(v) = self.enable_push {
            f(ENABLE_PUSH, v);
        }
        if let Some(v) = self.max_concurrent_streams {
            f(MAX_CONCURRENT_STREAMS, v);
        }
        if let Some(v) = self.initial_window_size {
            f(INITIAL_WINDOW_SIZE, v);
        }
        if let Some(v) = self.max_frame_size {
            f(MAX_FRAME_SIZE, v);
        }
        if let Some(v) = self.max_header_list_size {
            f(MAX_HEADER_LIST_SIZE, v);
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut builder = fmt.debug_struct("Settings");
        builder.field("ack", &self.ack);

        self.for_each(|id, value| {
            let name = match id {
                HEADER_TABLE_SIZE => "header_table_size",
                ENABLE_PUSH => "enable_push",
                MAX_CONCURRENT_STREAMS => "max_concurrent_streams",
                INITIAL_WINDOW_SIZE => "initial_window_size",
                MAX_FRAME_SIZE => "max_frame_size",
                MAX_HEADER_LIST_SIZE => "max_header_list_size",
                _ => "unknown",
            };
            builder.field(name, &value);
        });

        builder.finish()
    }
}
