//! Test-side half of a connection: an in-memory duplex wire plus a mock
//! peer that speaks raw frames, with its own HPACK context.

#![allow(dead_code)]

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use plait::client::Builder;
use plait::rt::sync::Watch;
use plait::Connection;

pub const DATA: u8 = 0x0;
pub const HEADERS: u8 = 0x1;
pub const RST_STREAM: u8 = 0x3;
pub const SETTINGS: u8 = 0x4;
pub const PING: u8 = 0x6;
pub const GOAWAY: u8 = 0x7;
pub const WINDOW_UPDATE: u8 = 0x8;
pub const CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;

pub const SETTING_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTING_INITIAL_WINDOW_SIZE: u16 = 0x4;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

// ===== an in-memory half-duplex byte channel =====

struct ChanState {
    buf: Vec<u8>,
    closed: bool,
}

pub struct ChanWriter {
    shared: Arc<Watch<ChanState>>,
}

pub struct ChanReader {
    shared: Arc<Watch<ChanState>>,
}

pub fn chan() -> (ChanWriter, ChanReader) {
    let shared = Arc::new(Watch::new(ChanState {
        buf: Vec::new(),
        closed: false,
    }));
    (
        ChanWriter {
            shared: Arc::clone(&shared),
        },
        ChanReader { shared },
    )
}

impl ChanWriter {
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify_all();
    }
}

impl io::Write for ChanWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }
        state.buf.extend_from_slice(buf);
        drop(state);
        self.shared.notify_all();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ChanWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl ChanReader {
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.notify_all();
    }

    /// Whether any bytes become available within `timeout`.
    pub fn wait_nonempty(&self, timeout: Duration) -> bool {
        let guard = self.shared.lock();
        let (state, _) = self
            .shared
            .wait_timeout_while(guard, timeout, |s| s.buf.is_empty() && !s.closed);
        !state.buf.is_empty()
    }

    fn read_exact_timeout(&self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        let deadline = Instant::now() + timeout;
        let mut filled = 0;

        while filled < buf.len() {
            let guard = self.shared.lock();
            let remaining = deadline.saturating_duration_since(Instant::now());
            let (mut state, timed_out) = self
                .shared
                .wait_timeout_while(guard, remaining, |s| s.buf.is_empty() && !s.closed);

            if !state.buf.is_empty() {
                let n = state.buf.len().min(buf.len() - filled);
                buf[filled..filled + n].copy_from_slice(&state.buf[..n]);
                state.buf.drain(..n);
                filled += n;
                drop(state);
                self.shared.notify_all();
                continue;
            }
            if state.closed {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed",
                ));
            }
            if timed_out {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no bytes arrived"));
            }
        }
        Ok(())
    }
}

impl io::Read for ChanReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let guard = self.shared.lock();
        let mut state = self
            .shared
            .wait_while(guard, |s| s.buf.is_empty() && !s.closed);

        if state.buf.is_empty() {
            return Ok(0);
        }
        let n = state.buf.len().min(buf.len());
        buf[..n].copy_from_slice(&state.buf[..n]);
        state.buf.drain(..n);
        drop(state);
        self.shared.notify_all();
        Ok(n)
    }
}

// ===== raw frames =====

#[derive(Debug)]
pub struct RawFrame {
    pub kind: u8,
    pub flags: u8,
    pub stream_id: u32,
    pub payload: Vec<u8>,
}

impl RawFrame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }

    pub fn is_end_headers(&self) -> bool {
        self.flags & FLAG_END_HEADERS != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & FLAG_ACK != 0
    }
}

// ===== the mock peer =====

pub struct MockPeer {
    rd: ChanReader,
    wr: ChanWriter,
    enc: loona_hpack::Encoder<'static>,
    dec: loona_hpack::Decoder<'static>,
}

/// Establish a connection against a mock peer over in-memory channels.
pub fn connect(builder: &Builder) -> (Connection, MockPeer) {
    let (client_wr, server_rd) = chan();
    let (server_wr, client_rd) = chan();

    let conn = builder
        .handshake(client_rd, client_wr)
        .expect("handshake failed");

    (
        conn,
        MockPeer {
            rd: server_rd,
            wr: server_wr,
            enc: loona_hpack::Encoder::new(),
            dec: loona_hpack::Decoder::new(),
        },
    )
}

impl MockPeer {
    /// Consume the client's opening sequence (preface, SETTINGS, the
    /// connection WINDOW_UPDATE), answer with our own SETTINGS, and
    /// exchange acknowledgements.
    pub fn greet(&mut self, settings: &[(u16, u32)]) {
        let mut preface = [0u8; 24];
        self.rd
            .read_exact_timeout(&mut preface, READ_TIMEOUT)
            .expect("no preface");
        assert_eq!(&preface[..], &b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n"[..]);

        let frame = self.recv_frame();
        assert_eq!(frame.kind, SETTINGS);
        assert!(!frame.is_ack());

        let frame = self.recv_frame();
        assert_eq!(frame.kind, WINDOW_UPDATE);
        assert_eq!(frame.stream_id, 0);

        self.send_settings(settings);
        self.send_frame(SETTINGS, FLAG_ACK, 0, &[]);

        let frame = self.recv_frame();
        assert_eq!(frame.kind, SETTINGS);
        assert!(frame.is_ack());
    }

    pub fn recv_frame(&mut self) -> RawFrame {
        let mut head = [0u8; 9];
        self.rd
            .read_exact_timeout(&mut head, READ_TIMEOUT)
            .expect("timed out waiting for a frame");

        let len = ((head[0] as usize) << 16) | ((head[1] as usize) << 8) | head[2] as usize;
        let mut payload = vec![0u8; len];
        self.rd
            .read_exact_timeout(&mut payload, READ_TIMEOUT)
            .expect("timed out reading a frame payload");

        RawFrame {
            kind: head[3],
            flags: head[4],
            stream_id: u32::from_be_bytes([head[5], head[6], head[7], head[8]]) & 0x7fff_ffff,
            payload,
        }
    }

    /// Receive the next frame that is not a SETTINGS (ack) frame.
    pub fn recv_frame_skipping_settings(&mut self) -> RawFrame {
        loop {
            let frame = self.recv_frame();
            if frame.kind != SETTINGS {
                return frame;
            }
        }
    }

    /// Receive a HEADERS frame and decode its block.
    pub fn recv_headers(&mut self) -> (RawFrame, Vec<(String, String)>) {
        let frame = self.recv_frame();
        assert_eq!(frame.kind, HEADERS, "expected HEADERS, got {:?}", frame);
        assert!(frame.is_end_headers());
        let fields = self.decode_block(&frame.payload);
        (frame, fields)
    }

    /// Whether the client stays silent for `dur`.
    pub fn quiet_for(&self, dur: Duration) -> bool {
        !self.rd.wait_nonempty(dur)
    }

    pub fn close(&self) {
        self.wr.close();
        self.rd.close();
    }

    // ----- sending -----

    pub fn send_frame(&mut self, kind: u8, flags: u8, stream_id: u32, payload: &[u8]) {
        use io::Write;

        let len = payload.len();
        let mut buf = Vec::with_capacity(9 + len);
        buf.extend_from_slice(&[(len >> 16) as u8, (len >> 8) as u8, len as u8, kind, flags]);
        buf.extend_from_slice(&stream_id.to_be_bytes());
        buf.extend_from_slice(payload);
        self.wr.write_all(&buf).expect("client hung up");
    }

    pub fn send_settings(&mut self, settings: &[(u16, u32)]) {
        let mut payload = Vec::new();
        for (id, value) in settings {
            payload.extend_from_slice(&id.to_be_bytes());
            payload.extend_from_slice(&value.to_be_bytes());
        }
        self.send_frame(SETTINGS, 0, 0, &payload);
    }

    pub fn send_data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) {
        let flags = if end_stream { FLAG_END_STREAM } else { 0 };
        self.send_frame(DATA, flags, stream_id, payload);
    }

    /// Send a PADDED DATA frame: `pad` zero octets plus the pad-length
    /// octet count against flow control on top of the payload.
    pub fn send_padded_data(&mut self, stream_id: u32, payload: &[u8], pad: u8, end_stream: bool) {
        let mut flags = FLAG_PADDED;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        let mut framed = Vec::with_capacity(1 + payload.len() + pad as usize);
        framed.push(pad);
        framed.extend_from_slice(payload);
        framed.extend_from_slice(&vec![0u8; pad as usize]);
        self.send_frame(DATA, flags, stream_id, &framed);
    }

    pub fn send_response_headers(
        &mut self,
        stream_id: u32,
        status: u16,
        extra: &[(&str, &str)],
        end_stream: bool,
    ) {
        let status = status.to_string();
        let mut fields: Vec<(&str, &str)> = vec![(":status", status.as_str())];
        fields.extend_from_slice(extra);
        let block = self.encode_block(&fields);

        let mut flags = FLAG_END_HEADERS;
        if end_stream {
            flags |= FLAG_END_STREAM;
        }
        self.send_frame(HEADERS, flags, stream_id, &block);
    }

    pub fn send_trailers(&mut self, stream_id: u32, fields: &[(&str, &str)]) {
        let block = self.encode_block(fields);
        self.send_frame(
            HEADERS,
            FLAG_END_HEADERS | FLAG_END_STREAM,
            stream_id,
            &block,
        );
    }

    pub fn send_window_update(&mut self, stream_id: u32, increment: u32) {
        self.send_frame(WINDOW_UPDATE, 0, stream_id, &increment.to_be_bytes());
    }

    pub fn send_reset(&mut self, stream_id: u32, code: u32) {
        self.send_frame(RST_STREAM, 0, stream_id, &code.to_be_bytes());
    }

    pub fn send_goaway(&mut self, last_stream_id: u32, code: u32) {
        let mut payload = Vec::new();
        payload.extend_from_slice(&last_stream_id.to_be_bytes());
        payload.extend_from_slice(&code.to_be_bytes());
        self.send_frame(GOAWAY, 0, 0, &payload);
    }

    pub fn send_ping_ack(&mut self, payload: &[u8]) {
        assert_eq!(payload.len(), 8);
        self.send_frame(PING, FLAG_ACK, 0, payload);
    }

    // ----- header blocks -----

    pub fn encode_block(&mut self, fields: &[(&str, &str)]) -> Vec<u8> {
        let raw: Vec<(&[u8], &[u8])> = fields
            .iter()
            .map(|(name, value)| (name.as_bytes(), value.as_bytes()))
            .collect();
        let mut block = Vec::new();
        self.enc.encode_into(raw, &mut block).unwrap();
        block
    }

    pub fn decode_block(&mut self, payload: &[u8]) -> Vec<(String, String)> {
        self.dec
            .decode(payload)
            .expect("undecodable header block")
            .into_iter()
            .map(|(name, value)| {
                (
                    String::from_utf8(name).unwrap(),
                    String::from_utf8(value).unwrap(),
                )
            })
            .collect()
    }
}

/// Look a field up in a decoded block.
pub fn field<'a>(fields: &'a [(String, String)], name: &str) -> &'a str {
    fields
        .iter()
        .find(|(n, _)| n == name)
        .unwrap_or_else(|| panic!("field {:?} not present in {:?}", name, fields))
        .1
        .as_str()
}
