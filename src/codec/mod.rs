//! Blocking frame I/O over an ordered byte-stream.
//!
//! [`FramedRead`] turns raw bytes into typed [`Frame`] values, merging
//! CONTINUATION frames into their HEADERS so downstream code always sees a
//! complete header block. [`FramedWrite`] serializes typed frames; callers
//! provide the frame-atomicity guarantee (one writer at a time) and this
//! layer guarantees a frame's bytes are never interleaved with another's.

use bytes::{Bytes, BytesMut};
use std::io;

use crate::frame::{self, Continuation, Data, Frame, GoAway, Head, Headers, Kind, Ping, Reset,
                   Settings, StreamId, WindowUpdate, HEADER_LEN};

/// The client connection preface, sent before any frames.
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

/// Upper bound on an accumulated header block across CONTINUATION frames.
const MAX_HEADER_BLOCK_SIZE: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Proto(#[from] frame::Error),
}

pub struct FramedRead<R> {
    io: R,
    max_frame_size: u32,
}

impl<R: io::Read> FramedRead<R> {
    pub fn new(io: R) -> FramedRead<R> {
        FramedRead {
            io,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Raise the frame size this side is willing to accept, after the peer
    /// acknowledges our SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Read the next frame, or `None` on clean end-of-stream at a frame
    /// boundary. PRIORITY and unknown frame types are skipped; HEADERS are
    /// returned only once their block is complete.
    pub fn read_frame(&mut self) -> Result<Option<Frame>, RecvError> {
        loop {
            let (head, payload) = match self.read_raw()? {
                Some(raw) => raw,
                None => return Ok(None),
            };

            let frame = match head.kind() {
                Kind::Data => Frame::Data(Data::load(head, payload)?),
                Kind::Headers => {
                    let mut headers = Headers::load(head, payload)?;
                    while !headers.is_end_headers() {
                        headers.extend(self.read_continuation(headers.stream_id())?);
                        if headers.fragment().len() > MAX_HEADER_BLOCK_SIZE {
                            return Err(frame::Error::MalformedMessage.into());
                        }
                    }
                    Frame::Headers(headers)
                }
                Kind::Settings => Frame::Settings(Settings::load(head, payload)?),
                Kind::Ping => Frame::Ping(Ping::load(head, payload)?),
                Kind::GoAway => Frame::GoAway(GoAway::load(head, payload)?),
                Kind::WindowUpdate => Frame::WindowUpdate(WindowUpdate::load(head, payload)?),
                Kind::Reset => Frame::Reset(Reset::load(head, payload)?),
                Kind::Continuation => {
                    // CONTINUATION is only legal directly after a HEADERS
                    // frame, which read_continuation consumes.
                    return Err(frame::Error::UnexpectedContinuation.into());
                }
                Kind::PushPromise => {
                    return Err(frame::Error::UnexpectedPushPromise.into());
                }
                Kind::Priority | Kind::Unknown => continue,
            };

            tracing::trace!("recv frame: {:?}", frame);
            return Ok(Some(frame));
        }
    }

    /// Header blocks must be contiguous on the wire: the frame after an
    /// unterminated HEADERS must be a CONTINUATION for the same stream.
    fn read_continuation(&mut self, stream_id: StreamId) -> Result<Continuation, RecvError> {
        let (head, payload) = match self.read_raw()? {
            Some(raw) => raw,
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed inside a header block",
                )
                .into())
            }
        };

        if head.kind() != Kind::Continuation {
            return Err(frame::Error::UnexpectedContinuation.into());
        }

        let cont = Continuation::load(head, payload)?;
        if cont.stream_id() != stream_id {
            return Err(frame::Error::UnexpectedContinuation.into());
        }

        Ok(cont)
    }

    fn read_raw(&mut self) -> Result<Option<(Head, Bytes)>, RecvError> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill(&mut header)? {
            return Ok(None);
        }

        let len = ((header[0] as usize) << 16) | ((header[1] as usize) << 8) | header[2] as usize;
        if len > self.max_frame_size as usize {
            return Err(frame::Error::InvalidPayloadLength.into());
        }

        let head = Head::parse(&header);

        let mut payload = vec![0u8; len];
        self.io.read_exact(&mut payload)?;

        Ok(Some((head, Bytes::from(payload))))
    }

    /// Like `read_exact`, except a clean end-of-stream before the first
    /// byte yields `false` instead of an error.
    fn fill(&mut self, buf: &mut [u8]) -> Result<bool, io::Error> {
        let mut read = 0;
        while read < buf.len() {
            match self.io.read(&mut buf[read..]) {
                Ok(0) if read == 0 => return Ok(false),
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed mid-frame",
                    ))
                }
                Ok(n) => read += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }
}

pub struct FramedWrite<W> {
    io: W,
    buf: BytesMut,
    max_frame_size: u32,
}

impl<W: io::Write> FramedWrite<W> {
    pub fn new(io: W) -> FramedWrite<W> {
        FramedWrite {
            io,
            buf: BytesMut::with_capacity(1024),
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Cap outgoing frame payloads at the peer's advertised maximum.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn write_preface(&mut self) -> io::Result<()> {
        tracing::debug!("send preface");
        self.io.write_all(PREFACE)?;
        self.io.flush()
    }

    /// Serialize one header block as a HEADERS frame plus as many
    /// CONTINUATION frames as the peer's frame-size limit requires. The
    /// caller holds the write lock for the whole call, keeping the block
    /// contiguous on the wire.
    pub fn write_headers(
        &mut self,
        stream_id: StreamId,
        fragment: Bytes,
        end_stream: bool,
    ) -> io::Result<()> {
        let max = self.max_frame_size as usize;

        let mut rest = fragment;
        let first = rest.split_to(rest.len().min(max));

        let mut headers = Headers::new(stream_id, first);
        if end_stream {
            headers.set_end_stream();
        }
        if rest.is_empty() {
            headers.set_end_headers();
        }

        tracing::trace!("send frame: {:?}", headers);
        headers.encode(&mut self.buf);

        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            let cont = Continuation::new(stream_id, chunk, rest.is_empty());
            tracing::trace!("send frame: {:?}", cont);
            cont.encode(&mut self.buf);
        }

        self.flush_buf()
    }

    pub fn write_data(
        &mut self,
        stream_id: StreamId,
        payload: Bytes,
        end_stream: bool,
    ) -> io::Result<()> {
        debug_assert!(payload.len() <= self.max_frame_size as usize);

        let mut data = Data::new(stream_id, payload);
        data.set_end_stream(end_stream);

        tracing::trace!("send frame: {:?}", data);
        data.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_settings(&mut self, settings: &Settings) -> io::Result<()> {
        tracing::trace!("send frame: {:?}", settings);
        settings.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_settings_ack(&mut self) -> io::Result<()> {
        tracing::trace!("send frame: Settings ACK");
        Settings::ack().encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_ping(&mut self, ping: Ping) -> io::Result<()> {
        tracing::trace!("send frame: {:?}", ping);
        ping.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_window_update(&mut self, update: WindowUpdate) -> io::Result<()> {
        tracing::trace!("send frame: {:?}", update);
        update.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_reset(&mut self, reset: Reset) -> io::Result<()> {
        tracing::trace!("send frame: {:?}", reset);
        reset.encode(&mut self.buf);
        self.flush_buf()
    }

    pub fn write_go_away(&mut self, go_away: &GoAway) -> io::Result<()> {
        tracing::trace!("send frame: {:?}", go_away);
        go_away.encode(&mut self.buf);
        self.flush_buf()
    }

    fn flush_buf(&mut self) -> io::Result<()> {
        let frame = self.buf.split().freeze();
        self.io.write_all(&frame)?;
        self.io.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pipe(Vec<u8>);

    impl io::Write for Pipe {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn round_trip(write: impl FnOnce(&mut FramedWrite<Pipe>)) -> Vec<Frame> {
        let mut out = FramedWrite::new(Pipe(Vec::new()));
        write(&mut out);

        let mut input = FramedRead::new(io::Cursor::new(out.io.0));
        let mut frames = Vec::new();
        while let Some(frame) = input.read_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn settings_round_trip() {
        let mut settings = Settings::default();
        settings.set_enable_push(false);
        settings.set_initial_window_size(Some(12345));

        let frames = round_trip(|w| w.write_settings(&settings).unwrap());
        match &frames[..] {
            [Frame::Settings(got)] => {
                assert_eq!(got.initial_window_size(), Some(12345));
                assert_eq!(got.is_push_enabled(), Some(false));
                assert!(!got.is_ack());
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn oversized_header_block_splits_into_continuations() {
        let fragment = Bytes::from(vec![0x42u8; 40_000]);

        let frames = round_trip(|w| {
            w.write_headers(1.into(), fragment.clone(), true).unwrap()
        });

        // The reader merges HEADERS + CONTINUATION back into one block.
        match &frames[..] {
            [Frame::Headers(got)] => {
                assert_eq!(got.fragment(), &fragment);
                assert!(got.is_end_stream());
                assert!(got.is_end_headers());
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn data_end_stream_round_trip() {
        let frames = round_trip(|w| {
            w.write_data(3.into(), Bytes::from_static(b"hello"), true).unwrap()
        });

        match &frames[..] {
            [Frame::Data(got)] => {
                assert_eq!(&got.payload()[..], b"hello");
                assert!(got.is_end_stream());
                assert_eq!(got.flow_len(), 5);
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }

    #[test]
    fn bare_continuation_is_an_error() {
        let mut out = FramedWrite::new(Pipe(Vec::new()));
        Continuation::new(1.into(), Bytes::from_static(b"x"), true).encode(&mut out.buf);
        out.flush_buf().unwrap();

        let mut input = FramedRead::new(io::Cursor::new(out.io.0));
        assert!(matches!(
            input.read_frame(),
            Err(RecvError::Proto(frame::Error::UnexpectedContinuation))
        ));
    }

    #[test]
    fn padded_data_accounts_padding_in_flow_len() {
        // Hand-build: DATA, PADDED flag, 3-byte payload "abc", 2 bytes padding.
        let mut wire = vec![0, 0, 6, 0, 0x8, 0, 0, 0, 1];
        wire.extend_from_slice(&[2, b'a', b'b', b'c', 0, 0]);

        let mut input = FramedRead::new(io::Cursor::new(wire));
        match input.read_frame().unwrap() {
            Some(Frame::Data(data)) => {
                assert_eq!(&data.payload()[..], b"abc");
                assert_eq!(data.flow_len(), 6);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn eof_at_frame_boundary_is_clean() {
        let mut input = FramedRead::new(io::Cursor::new(Vec::<u8>::new()));
        assert!(input.read_frame().unwrap().is_none());
    }
}
