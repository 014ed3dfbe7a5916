//! Typed HTTP/2 frames.
//!
//! One discrete protocol message per value, tagged by type and addressed to
//! a stream (or to the connection via stream 0). Wire-level concerns like
//! frame heads, padding, and reserved bits stop at this boundary; the
//! connection coordinator only ever sees these types.

use std::fmt;

macro_rules! unpack_octets_4 {
    ($buf:expr, $offset:expr, $tip:ty) => {
        (($buf[$offset + 0] as $tip) << 24)
            | (($buf[$offset + 1] as $tip) << 16)
            | (($buf[$offset + 2] as $tip) << 8)
            | (($buf[$offset + 3] as $tip) << 0)
    };
}

mod data;
mod go_away;
mod head;
mod headers;
mod ping;
mod reason;
mod reset;
mod settings;
mod stream_id;
mod util;
mod window_update;

pub use self::data::Data;
pub use self::go_away::GoAway;
pub use self::head::{Head, Kind};
pub use self::headers::{Continuation, Headers};
pub use self::ping::{Ping, PingPayload};
pub use self::reason::Reason;
pub use self::reset::Reset;
pub use self::settings::Settings;
pub use self::stream_id::{StreamId, StreamIdOverflow};
pub use self::window_update::WindowUpdate;

pub use self::settings::{
    DEFAULT_INITIAL_WINDOW_SIZE, DEFAULT_MAX_FRAME_SIZE, DEFAULT_SETTINGS_HEADER_TABLE_SIZE,
    MAX_INITIAL_WINDOW_SIZE, MAX_MAX_FRAME_SIZE,
};

pub type FrameSize = u32;

pub const HEADER_LEN: usize = 9;

#[derive(Eq, PartialEq)]
pub enum Frame {
    Data(Data),
    Headers(Headers),
    Continuation(Continuation),
    Settings(Settings),
    Ping(Ping),
    GoAway(GoAway),
    WindowUpdate(WindowUpdate),
    Reset(Reset),
}

impl Frame {
    pub fn stream_id(&self) -> StreamId {
        use self::Frame::*;

        match self {
            Data(frame) => frame.stream_id(),
            Headers(frame) => frame.stream_id(),
            Continuation(frame) => frame.stream_id(),
            Reset(frame) => frame.stream_id(),
            WindowUpdate(frame) => frame.stream_id(),
            Settings(..) | Ping(..) | GoAway(..) => StreamId::ZERO,
        }
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::Frame::*;

        match *self {
            Data(ref frame) => fmt::Debug::fmt(frame, fmt),
            Headers(ref frame) => fmt::Debug::fmt(frame, fmt),
            Continuation(ref frame) => fmt::Debug::fmt(frame, fmt),
            Settings(ref frame) => fmt::Debug::fmt(frame, fmt),
            Ping(ref frame) => fmt::Debug::fmt(frame, fmt),
            GoAway(ref frame) => fmt::Debug::fmt(frame, fmt),
            WindowUpdate(ref frame) => fmt::Debug::fmt(frame, fmt),
            Reset(ref frame) => fmt::Debug::fmt(frame, fmt),
        }
    }
}

/// Errors raised while parsing a frame off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("frame with invalid size")]
    BadFrameSize,

    #[error("frame padding exceeds remaining payload")]
    TooMuchPadding,

    #[error("setting has an invalid value")]
    InvalidSettingValue,

    #[error("frame payload exceeds the advertised maximum frame size")]
    InvalidPayloadLength,

    #[error("SETTINGS acknowledgement with a non-empty payload")]
    InvalidPayloadAckSettings,

    #[error("frame addressed to an invalid stream identifier")]
    InvalidStreamId,

    #[error("malformed frame payload")]
    MalformedMessage,

    #[error("received PUSH_PROMISE with push disabled")]
    UnexpectedPushPromise,

    #[error("CONTINUATION without a preceding HEADERS")]
    UnexpectedContinuation,
}
