//! The connection coordinator.
//!
//! One [`Connection`] owns one ordered byte-stream and multiplexes every
//! in-flight exchange over it. It is the single authority for stream-ID
//! allocation, the single read loop, and the single write serialization
//! point; shared state (stream table, flow windows, settings, GOAWAY
//! bookkeeping) lives behind one monitor and is only ever touched through
//! the operations here.
//!
//! Lock discipline: the write path mutex may be taken first and the state
//! monitor acquired briefly inside it; the reverse order never happens --
//! code that holds the state monitor drops it before touching the write
//! path. Blocking waits (admission, flow-control reserve, result delivery)
//! are predicate waits on the state monitor and never hold the write path.

use bytes::Bytes;
use fnv::FnvHashMap;
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::client::{RecvBody, Request, SendBody};
use crate::codec::{FramedRead, FramedWrite, RecvError};
use crate::error::Error;
use crate::frame::{
    self, Frame, GoAway, Ping, PingPayload, Reason, Reset, Settings, StreamId, WindowUpdate,
};
use crate::hpack;
use crate::proto::flow::FlowControl;
use crate::proto::stream::{ResponseHead, ResultSlot, Stream};
use crate::rt::sync::Watch;
use crate::rt::{Runtime, Timer};

/// Negotiable knobs, filled in by `client::Builder`.
#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub initial_stream_window: u32,
    pub initial_conn_window: u32,
    pub max_frame_size: u32,
    pub header_table_size: u32,
    pub reset_stream_max: usize,
    pub reset_stream_grace_frames: u32,
    pub read_idle_timeout: Option<Duration>,
    pub ping_timeout: Duration,
}

/// A handle to one HTTP/2 client connection.
///
/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnShared>,
}

pub(crate) struct ConnShared {
    rt: Arc<dyn Runtime>,
    cfg: Config,
    state: Watch<ConnInner>,
    writer: Mutex<WritePath>,
}

struct WritePath {
    framed: FramedWrite<Box<dyn io::Write + Send>>,
    encoder: hpack::Encoder,
}

struct PeerSettings {
    initial_window_size: u32,
    max_frame_size: u32,
    max_concurrent_streams: Option<u32>,
}

struct ConnInner {
    streams: FnvHashMap<StreamId, Stream>,
    next_stream_id: StreamId,
    /// Round trips admitted but not yet holding a table entry.
    reserved: usize,

    send_flow: FlowControl,
    recv_flow: FlowControl,

    peer: PeerSettings,
    local_settings_acked: bool,

    goaway: Option<(StreamId, Reason)>,
    closed: Option<Error>,

    /// Recently retired stream IDs with their remaining in-flight frame
    /// tolerance; see `tolerate_stray`.
    retired: VecDeque<(StreamId, u32)>,
    grace_frames: u32,
    retired_max: usize,

    pending_ping: Option<PingPayload>,
    last_frame_at: Instant,
    idle_timer: Option<Timer>,
    pong_timer: Option<Timer>,
}

impl Connection {
    /// Perform the client side of the connection handshake over an
    /// already-established byte-stream: send the preface, our SETTINGS,
    /// and a WINDOW_UPDATE raising the connection receive window, then
    /// start the read loop.
    pub(crate) fn handshake<R, W>(
        cfg: Config,
        rt: Arc<dyn Runtime>,
        reader: R,
        writer: W,
    ) -> Result<Connection, Error>
    where
        R: io::Read + Send + 'static,
        W: io::Write + Send + 'static,
    {
        let mut framed_write = FramedWrite::new(Box::new(writer) as Box<dyn io::Write + Send>);

        let mut settings = Settings::default();
        settings.set_enable_push(false);
        settings.set_header_table_size(Some(cfg.header_table_size));
        settings.set_initial_window_size(Some(cfg.initial_stream_window));
        settings.set_max_frame_size(Some(cfg.max_frame_size));

        framed_write.write_preface().map_err(Error::from_io)?;
        framed_write
            .write_settings(&settings)
            .map_err(Error::from_io)?;

        let mut recv_flow = FlowControl::with_initial(frame::DEFAULT_INITIAL_WINDOW_SIZE);
        if cfg.initial_conn_window > frame::DEFAULT_INITIAL_WINDOW_SIZE {
            let delta = cfg.initial_conn_window - frame::DEFAULT_INITIAL_WINDOW_SIZE;
            framed_write
                .write_window_update(WindowUpdate::new(StreamId::ZERO, delta))
                .map_err(Error::from_io)?;
            recv_flow
                .inc_window(delta)
                .expect("initial window within bounds");
        }

        let now = rt.now();
        let shared = Arc::new(ConnShared {
            rt: Arc::clone(&rt),
            state: Watch::new(ConnInner {
                streams: FnvHashMap::default(),
                next_stream_id: StreamId::from(1),
                reserved: 0,
                send_flow: FlowControl::with_initial(frame::DEFAULT_INITIAL_WINDOW_SIZE),
                recv_flow,
                peer: PeerSettings {
                    initial_window_size: frame::DEFAULT_INITIAL_WINDOW_SIZE,
                    max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
                    max_concurrent_streams: None,
                },
                local_settings_acked: false,
                goaway: None,
                closed: None,
                retired: VecDeque::new(),
                grace_frames: cfg.reset_stream_grace_frames,
                retired_max: cfg.reset_stream_max,
                pending_ping: None,
                last_frame_at: now,
                idle_timer: None,
                pong_timer: None,
            }),
            writer: Mutex::new(WritePath {
                framed: framed_write,
                encoder: hpack::Encoder::new(),
            }),
            cfg,
        });

        let mut framed_read = FramedRead::new(Box::new(reader) as Box<dyn io::Read + Send>);
        framed_read.set_max_frame_size(shared.cfg.max_frame_size);
        let decoder = hpack::Decoder::new(shared.cfg.header_table_size as usize);

        let loop_shared = Arc::clone(&shared);
        shared.rt.spawn(
            "plait-read-loop",
            Box::new(move || loop_shared.read_loop(framed_read, decoder)),
        );

        if shared.cfg.read_idle_timeout.is_some() {
            ConnShared::arm_idle_timer(&shared);
        }

        Ok(Connection { shared })
    }

    /// Issue one request/response exchange, blocking until response
    /// headers are available or the exchange fails.
    pub fn round_trip(&self, req: Request) -> Result<http::Response<RecvBody>, Error> {
        self.shared.round_trip(req)
    }

    /// Close the connection: emit GOAWAY(NO_ERROR) and fail whatever is
    /// still in flight.
    pub fn close(&self) {
        let go_away = GoAway::new(StreamId::ZERO, Reason::NO_ERROR);
        {
            let mut writer = self.shared.lock_writer();
            let _ = writer.framed.write_go_away(&go_away);
        }
        self.shared.fatal(Error::Closed);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed.is_some()
    }

    /// Streams currently holding a table entry.
    pub fn num_active_streams(&self) -> usize {
        self.shared.state.lock().streams.len()
    }

    /// Whether the peer has acknowledged our initial SETTINGS.
    pub fn settings_acked(&self) -> bool {
        self.shared.state.lock().local_settings_acked
    }
}

impl ConnShared {
    fn lock_writer(&self) -> MutexGuard<'_, WritePath> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== the request path =====

    fn round_trip(self: &Arc<Self>, req: Request) -> Result<http::Response<RecvBody>, Error> {
        let (parts, body, timeout, cancel) = req.into_parts();
        let list = crate::client::build_field_list(&parts)?;
        let eos = body.is_empty();

        self.admit()?;

        // The write lock is held across ID allocation and the HEADERS
        // write so new stream IDs appear on the wire in increasing order,
        // and so the header block stays contiguous.
        let (id, result, handles) = {
            let mut writer = self.lock_writer();

            let (id, result, handles) = match self.register_stream(eos, &body) {
                Ok(entry) => entry,
                Err(err) => {
                    drop(writer);
                    // The reservation was returned; admission waiters may
                    // now proceed.
                    self.state.notify_all();
                    return Err(err);
                }
            };

            let fragment = writer.encoder.encode(&list);
            if let Err(err) = writer.framed.write_headers(id, fragment, eos) {
                drop(writer);
                let err = Error::from_io(err);
                self.fatal(err.clone());
                return Err(err);
            }
            (id, result, handles)
        };
        tracing::debug!("opened stream {}", id);

        let mut deadline_timer = None;
        if let Some(timeout) = timeout {
            let weak = Arc::downgrade(self);
            deadline_timer = Some(self.rt.timer(
                timeout,
                Box::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.reset_stream(id, Reason::CANCEL, Error::Canceled);
                    }
                }),
            ));
        }

        if let Some(token) = cancel {
            if !token.attach(Arc::downgrade(self), id) {
                self.reset_stream(id, Reason::CANCEL, Error::Canceled);
            }
        }

        if !eos {
            let pump_shared = Arc::clone(self);
            self.rt.spawn(
                "plait-body-pump",
                Box::new(move || pump_shared.pump_body(id, body)),
            );
        }

        let outcome = result.wait();
        if let Some(timer) = deadline_timer.take() {
            timer.cancel();
        }

        let head = outcome?;
        let (recv_body, trailers) = handles;
        let body = RecvBody::new(Arc::downgrade(self), id, recv_body, trailers);

        let mut response = http::Response::new(body);
        *response.status_mut() = head.status;
        *response.headers_mut() = head.fields;
        *response.version_mut() = http::Version::HTTP_2;
        Ok(response)
    }

    /// Wait for a concurrency slot, honoring the peer's
    /// SETTINGS_MAX_CONCURRENT_STREAMS. Excess requests queue here.
    fn admit(&self) -> Result<(), Error> {
        let guard = self.state.lock();
        let mut inner = self.state.wait_while(guard, |inner| {
            if inner.closed.is_some() || inner.goaway.is_some() {
                return false;
            }
            match inner.peer.max_concurrent_streams {
                Some(max) => inner.streams.len() + inner.reserved >= max as usize,
                None => false,
            }
        });

        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if let Some((last, reason)) = inner.goaway {
            return Err(Error::GoAway {
                last_stream_id: last,
                reason,
            });
        }

        inner.reserved += 1;
        Ok(())
    }

    /// Allocate the next odd stream ID and install the table entry.
    /// Caller holds the write lock; the state monitor is taken briefly.
    #[allow(clippy::type_complexity)]
    fn register_stream(
        &self,
        eos: bool,
        body: &SendBody,
    ) -> Result<
        (
            StreamId,
            Arc<ResultSlot>,
            (Arc<crate::pipe::BodyPipe>, Arc<Watch<Option<http::HeaderMap>>>),
        ),
        Error,
    > {
        let mut inner = self.state.lock();
        inner.reserved -= 1;

        if let Some(err) = &inner.closed {
            return Err(err.clone());
        }
        if let Some((last, reason)) = inner.goaway {
            return Err(Error::GoAway {
                last_stream_id: last,
                reason,
            });
        }

        let id = inner.next_stream_id;
        inner.next_stream_id = match id.next_id() {
            Ok(next) => next,
            Err(frame::StreamIdOverflow) => return Err(Error::StreamIdExhausted),
        };

        let result = ResultSlot::new();
        let mut stream = Stream::new(
            id,
            inner.peer.initial_window_size,
            self.cfg.initial_stream_window,
            Arc::clone(&result),
        );
        stream.state.send_open(eos);
        if let Some(pipe) = body.pipe_handle() {
            stream.send_body = Some(pipe);
        }

        let handles = (Arc::clone(&stream.recv_body), Arc::clone(&stream.trailers));
        inner.streams.insert(id, stream);
        Ok((id, result, handles))
    }

    /// Drain the request body into DATA frames, gated by both flow-control
    /// windows and the peer's frame-size limit, with END_STREAM on the
    /// final frame.
    fn pump_body(self: &Arc<Self>, id: StreamId, mut body: SendBody) {
        let mut pending: Option<Bytes> = None;

        loop {
            let max_chunk = self.state.lock().peer.max_frame_size as usize;
            let next = match body.next_chunk(max_chunk) {
                Ok(next) => next,
                Err(err) => {
                    tracing::debug!("request body failed on stream {}: {}", id, err);
                    self.reset_stream(id, Reason::INTERNAL_ERROR, Error::from_body_io(err));
                    return;
                }
            };

            match (pending.take(), next) {
                (None, None) => {
                    // Empty body after all; END_STREAM rides an empty frame.
                    if !self.send_data(id, Bytes::new(), true) {
                        return;
                    }
                    break;
                }
                (Some(buf), None) => {
                    if !self.send_data(id, buf, true) {
                        return;
                    }
                    break;
                }
                (None, Some(chunk)) => pending = Some(chunk),
                (Some(buf), Some(chunk)) => {
                    if !self.send_data(id, buf, false) {
                        return;
                    }
                    pending = Some(chunk);
                }
            }
        }

        let mut inner = self.state.lock();
        if let Some(stream) = inner.streams.get_mut(&id) {
            stream.state.send_close();
            inner.retire_if_closed(id);
        }
        drop(inner);
        self.state.notify_all();
    }

    /// Send one logical chunk as one or more DATA frames, reserving credit
    /// for each. Returns `false` once the stream or connection is gone.
    fn send_data(self: &Arc<Self>, id: StreamId, mut buf: Bytes, end_stream: bool) -> bool {
        loop {
            let claimed = match self.reserve(id, buf.len()) {
                Some(n) => n,
                None => return false,
            };

            let chunk = buf.split_to(claimed);
            let last = buf.is_empty();

            let mut writer = self.lock_writer();
            if let Err(err) = writer.framed.write_data(id, chunk, end_stream && last) {
                drop(writer);
                self.fatal(Error::from_io(err));
                return false;
            }
            drop(writer);

            if last {
                return true;
            }
        }
    }

    /// Block until some send credit is available at both the connection
    /// and stream level, then claim up to `want` bytes of it.
    ///
    /// An empty claim is granted for `want == 0` (an END_STREAM-only
    /// frame costs no credit).
    fn reserve(&self, id: StreamId, want: usize) -> Option<usize> {
        let guard = self.state.lock();
        let mut inner = self.state.wait_while(guard, |inner| {
            if inner.closed.is_some() || !inner.streams.contains_key(&id) {
                return false;
            }
            if want == 0 {
                return false;
            }
            let stream = &inner.streams[&id];
            let allow = inner
                .send_flow
                .usable()
                .min(stream.send_flow.usable())
                .min(inner.peer.max_frame_size);
            allow == 0
        });

        if inner.closed.is_some() {
            return None;
        }

        let conn_allow = inner.send_flow.usable().min(inner.peer.max_frame_size);
        let stream = inner.streams.get_mut(&id)?;

        if want == 0 {
            return Some(0);
        }

        let allow = conn_allow.min(stream.send_flow.usable());
        let claimed = (want as u32).min(allow);
        debug_assert!(claimed > 0);

        stream.send_flow.send_data(claimed);
        inner.send_flow.send_data(claimed);
        Some(claimed as usize)
    }

    // ===== the read loop =====

    fn read_loop(
        self: Arc<Self>,
        mut framed: FramedRead<Box<dyn io::Read + Send>>,
        mut decoder: hpack::Decoder,
    ) {
        loop {
            match framed.read_frame() {
                Ok(Some(frame)) => {
                    {
                        let mut inner = self.state.lock();
                        if inner.closed.is_some() {
                            return;
                        }
                        inner.last_frame_at = self.rt.now();
                    }
                    if let Err(err) = self.recv_frame(frame, &mut decoder) {
                        self.conn_error(err);
                        return;
                    }
                }
                Ok(None) => {
                    self.fatal(Error::from_io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                    return;
                }
                Err(RecvError::Io(err)) => {
                    self.fatal(Error::from_io(err));
                    return;
                }
                Err(RecvError::Proto(err)) => {
                    tracing::debug!("malformed frame: {}", err);
                    self.conn_error(Error::Connection(frame_error_reason(err)));
                    return;
                }
            }
        }
    }

    fn recv_frame(self: &Arc<Self>, frame: Frame, decoder: &mut hpack::Decoder) -> Result<(), Error> {
        match frame {
            Frame::Headers(headers) => self.recv_headers(headers, decoder),
            Frame::Data(data) => self.recv_data(data),
            Frame::WindowUpdate(update) => self.recv_window_update(update),
            Frame::Reset(reset) => self.recv_reset(reset),
            Frame::Settings(settings) => self.recv_settings(settings),
            Frame::GoAway(go_away) => self.recv_go_away(go_away),
            Frame::Ping(ping) => self.recv_ping(ping),
            // The codec merges CONTINUATION into HEADERS; a bare one never
            // gets here.
            Frame::Continuation(..) => Err(Error::Connection(Reason::PROTOCOL_ERROR)),
        }
    }

    fn recv_headers(
        self: &Arc<Self>,
        headers: frame::Headers,
        decoder: &mut hpack::Decoder,
    ) -> Result<(), Error> {
        let id = headers.stream_id();
        let eos = headers.is_end_stream();

        // Decode before looking the stream up: the compression table must
        // advance for every block on the wire, including blocks for
        // streams we have already forgotten.
        let list = match decoder.decode(headers.fragment()) {
            Ok(list) => list,
            Err(hpack::DecodeError::Compression(reason)) => {
                return Err(Error::Connection(reason));
            }
            Err(hpack::DecodeError::Malformed(msg)) => {
                tracing::debug!("malformed header block on stream {}: {}", id, msg);
                self.reset_stream(id, Reason::PROTOCOL_ERROR, Error::Stream(Reason::PROTOCOL_ERROR));
                return Ok(());
            }
        };

        let mut inner = self.state.lock();

        let stream = match inner.streams.get_mut(&id) {
            Some(stream) => stream,
            None => return inner.tolerate_stray(id),
        };

        // 1xx responses are interim; the exchange stays open. An interim
        // status cannot also end the stream.
        if list.pseudo.status.map_or(false, |s| s.is_informational()) {
            if eos {
                drop(inner);
                self.reset_stream(
                    id,
                    Reason::PROTOCOL_ERROR,
                    Error::MalformedResponse("informational response with END_STREAM"),
                );
                return Ok(());
            }
            tracing::debug!("interim response {:?} on stream {}", list.pseudo.status, id);
            return Ok(());
        }

        let initial = match stream.state.recv_headers(eos) {
            Ok(initial) => initial,
            Err(reason) => {
                drop(inner);
                self.reset_stream(id, reason, Error::Stream(reason));
                return Ok(());
            }
        };

        if initial {
            let status = match list.pseudo.status {
                Some(status) => status,
                None => {
                    drop(inner);
                    self.reset_stream(
                        id,
                        Reason::PROTOCOL_ERROR,
                        Error::MalformedResponse("response without :status"),
                    );
                    return Ok(());
                }
            };
            stream.result.resolve(Ok(ResponseHead {
                status,
                fields: list.fields,
            }));
        } else {
            *stream.trailers.lock() = Some(list.fields);
            stream.trailers.notify_all();
        }

        if eos {
            stream.recv_body.close();
            inner.retire_if_closed(id);
        }

        drop(inner);
        self.state.notify_all();
        Ok(())
    }

    fn recv_data(self: &Arc<Self>, data: frame::Data) -> Result<(), Error> {
        let id = data.stream_id();
        let len = data.flow_len();
        // Pad octets count against the windows but never reach the
        // application, so note_consumed cannot return their credit.
        let padding = len - data.payload().len() as u32;

        let mut inner = self.state.lock();

        // Connection-level accounting covers every DATA frame, stray or
        // not; overflow here is fatal.
        if let Err(reason) = inner.recv_flow.recv_data(len) {
            return Err(Error::Connection(reason));
        }

        let mut conn_update = None;
        let mut stream_update = None;

        if !inner.streams.contains_key(&id) {
            inner.tolerate_stray(id)?;
            // The bytes will never reach an application; hand the credit
            // straight back.
            inner.recv_flow.release(len);
            conn_update = inner.recv_flow.unclaimed_capacity();
        } else {
            let stream = inner.streams.get_mut(&id).expect("stream just checked");

            if let Err(reason) = stream.state.ensure_recv_streaming() {
                drop(inner);
                self.reset_stream(id, reason, Error::Stream(reason));
                return Ok(());
            }

            if let Err(reason) = stream.recv_flow.recv_data(len) {
                drop(inner);
                self.reset_stream(id, reason, Error::Stream(reason));
                return Ok(());
            }

            if let Err(err) = stream.recv_body.push(data.payload()) {
                tracing::trace!("dropping DATA for stream {}: {}", id, err);
            }

            // Padding credit is refunded on receipt. The stream window
            // only matters while the stream is still open.
            if padding > 0 && !data.is_end_stream() {
                stream.recv_flow.release(padding);
                stream_update = stream.recv_flow.unclaimed_capacity();
            }

            if data.is_end_stream() {
                stream.state.recv_close();
                stream.recv_body.close();
                inner.retire_if_closed(id);
            }

            if padding > 0 {
                inner.recv_flow.release(padding);
                conn_update = inner.recv_flow.unclaimed_capacity();
            }
        }

        drop(inner);
        self.state.notify_all();

        if conn_update.is_some() || stream_update.is_some() {
            let mut writer = self.lock_writer();
            let mut res = Ok(());
            if let Some(increment) = conn_update {
                res = writer
                    .framed
                    .write_window_update(WindowUpdate::new(StreamId::ZERO, increment));
            }
            if res.is_ok() {
                if let Some(increment) = stream_update {
                    res = writer.framed.write_window_update(WindowUpdate::new(id, increment));
                }
            }
            drop(writer);
            if let Err(err) = res {
                self.fatal(Error::from_io(err));
            }
        }
        Ok(())
    }

    fn recv_window_update(self: &Arc<Self>, update: WindowUpdate) -> Result<(), Error> {
        let id = update.stream_id();
        let increment = update.size_increment();

        let mut inner = self.state.lock();

        if id.is_zero() {
            if increment == 0 {
                return Err(Error::Connection(Reason::PROTOCOL_ERROR));
            }
            if let Err(reason) = inner.send_flow.inc_window(increment) {
                return Err(Error::Connection(reason));
            }
        } else {
            match inner.streams.get_mut(&id) {
                None => {
                    // WINDOW_UPDATE for a finished stream is routine.
                    return Ok(());
                }
                Some(stream) => {
                    if increment == 0 {
                        drop(inner);
                        self.reset_stream(
                            id,
                            Reason::PROTOCOL_ERROR,
                            Error::Stream(Reason::PROTOCOL_ERROR),
                        );
                        return Ok(());
                    }
                    if let Err(reason) = stream.send_flow.inc_window(increment) {
                        drop(inner);
                        self.reset_stream(id, reason, Error::Stream(reason));
                        return Ok(());
                    }
                }
            }
        }

        drop(inner);
        self.state.notify_all();
        Ok(())
    }

    fn recv_reset(self: &Arc<Self>, reset: Reset) -> Result<(), Error> {
        let id = reset.stream_id();
        let reason = reset.reason();
        tracing::debug!("peer reset stream {}: {:?}", id, reason);

        let mut inner = self.state.lock();
        if let Some(mut stream) = inner.streams.remove(&id) {
            let buffered = stream.recv_body.buffered_len() as u32;
            inner.recv_flow.release(buffered);
            stream.state.recv_reset(reason);
            stream.fail(Error::Stream(reason));
            inner.remember_retired(id);
        }
        drop(inner);
        self.state.notify_all();
        Ok(())
    }

    fn recv_settings(self: &Arc<Self>, settings: Settings) -> Result<(), Error> {
        if settings.is_ack() {
            let mut inner = self.state.lock();
            inner.local_settings_acked = true;
            drop(inner);
            self.state.notify_all();
            return Ok(());
        }

        let mut inner = self.state.lock();

        if let Some(new_size) = settings.initial_window_size() {
            let old = inner.peer.initial_window_size;
            // Re-base every live stream's send window by the delta. The
            // connection-level window is not affected by this setting.
            if new_size > old {
                let delta = new_size - old;
                for stream in inner.streams.values_mut() {
                    if stream.send_flow.inc_window(delta).is_err() {
                        return Err(Error::Connection(Reason::FLOW_CONTROL_ERROR));
                    }
                }
            } else if new_size < old {
                let delta = old - new_size;
                for stream in inner.streams.values_mut() {
                    stream.send_flow.dec_window(delta);
                }
            }
            inner.peer.initial_window_size = new_size;
        }

        if let Some(max) = settings.max_frame_size() {
            inner.peer.max_frame_size = max;
        }
        if let Some(max) = settings.max_concurrent_streams() {
            inner.peer.max_concurrent_streams = Some(max);
        }

        let frame_size = inner.peer.max_frame_size;
        let table_size = settings.header_table_size();
        drop(inner);
        self.state.notify_all();

        let mut writer = self.lock_writer();
        writer.framed.set_max_frame_size(frame_size);
        if let Some(size) = table_size {
            writer.encoder.set_max_table_size(size as usize);
        }
        if let Err(err) = writer.framed.write_settings_ack() {
            drop(writer);
            return Err(Error::from_io(err));
        }
        Ok(())
    }

    fn recv_go_away(self: &Arc<Self>, go_away: GoAway) -> Result<(), Error> {
        let last = go_away.last_stream_id();
        let reason = go_away.reason();

        if reason != Reason::NO_ERROR {
            tracing::warn!("received GOAWAY: last_stream_id={}, {:?}", last, reason);
        } else {
            tracing::debug!("received GOAWAY: last_stream_id={}", last);
        }

        let mut inner = self.state.lock();
        inner.goaway = Some((last, reason));

        // Streams above the announced maximum were never processed; they
        // are safe to retry on another connection. Streams at or below it
        // proceed undisturbed.
        let abandoned: Vec<StreamId> = inner
            .streams
            .keys()
            .copied()
            .filter(|id| *id > last)
            .collect();
        for id in abandoned {
            if let Some(mut stream) = inner.streams.remove(&id) {
                let buffered = stream.recv_body.buffered_len() as u32;
                inner.recv_flow.release(buffered);
                stream.fail(Error::GoAway {
                    last_stream_id: last,
                    reason,
                });
                inner.remember_retired(id);
            }
        }

        drop(inner);
        self.state.notify_all();
        Ok(())
    }

    fn recv_ping(self: &Arc<Self>, ping: Ping) -> Result<(), Error> {
        if ping.is_ack() {
            let mut inner = self.state.lock();
            if inner.pending_ping == Some(*ping.payload()) {
                inner.pending_ping = None;
                if let Some(timer) = inner.pong_timer.take() {
                    timer.cancel();
                }
            } else {
                tracing::warn!("received PING ack we never sent: {:?}", ping);
            }
            return Ok(());
        }

        let mut writer = self.lock_writer();
        writer
            .framed
            .write_ping(Ping::pong(ping.into_payload()))
            .map_err(|err| Error::from_io(err))
    }

    // ===== window bookkeeping for consumed response bytes =====

    /// The application consumed `n` response-body bytes on `id`; hand the
    /// credit back and emit WINDOW_UPDATE frames once past the threshold.
    pub(crate) fn note_consumed(self: &Arc<Self>, id: StreamId, n: usize) {
        if n == 0 {
            return;
        }

        let mut inner = self.state.lock();
        inner.recv_flow.release(n as u32);
        let conn_update = inner.recv_flow.unclaimed_capacity();

        let stream_update = match inner.streams.get_mut(&id) {
            Some(stream) => {
                stream.recv_flow.release(n as u32);
                stream.recv_flow.unclaimed_capacity()
            }
            None => None,
        };
        drop(inner);

        if conn_update.is_none() && stream_update.is_none() {
            return;
        }

        let mut writer = self.lock_writer();
        let mut res = Ok(());
        if let Some(increment) = conn_update {
            res = writer
                .framed
                .write_window_update(WindowUpdate::new(StreamId::ZERO, increment));
        }
        if res.is_ok() {
            if let Some(increment) = stream_update {
                res = writer
                    .framed
                    .write_window_update(WindowUpdate::new(id, increment));
            }
        }
        drop(writer);

        if let Err(err) = res {
            self.fatal(Error::from_io(err));
        }
    }

    // ===== teardown =====

    /// Reset one stream: resolve it with `err`, emit RST_STREAM, leave the
    /// connection running.
    pub(crate) fn reset_stream(self: &Arc<Self>, id: StreamId, reason: Reason, err: Error) {
        let mut inner = self.state.lock();
        if inner.closed.is_some() {
            return;
        }
        let stream = match inner.streams.remove(&id) {
            Some(stream) => stream,
            None => return,
        };
        tracing::debug!("resetting stream {}: {:?}", id, reason);

        let mut stream = stream;
        let buffered = stream.recv_body.buffered_len() as u32;
        inner.recv_flow.release(buffered);
        stream.state.set_reset(reason);
        stream.fail(err);
        inner.remember_retired(id);
        drop(inner);
        self.state.notify_all();

        // Informing the peer is best effort and never waits for an ack.
        let mut writer = self.lock_writer();
        if let Err(io_err) = writer.framed.write_reset(Reset::new(id, reason)) {
            drop(writer);
            self.fatal(Error::from_io(io_err));
        }
    }

    /// A connection-level protocol error: tell the peer, then tear down.
    fn conn_error(self: &Arc<Self>, err: Error) {
        if let Some(reason) = err.reason() {
            let mut writer = self.lock_writer();
            let _ = writer.framed.write_go_away(&GoAway::new(StreamId::ZERO, reason));
        }
        self.fatal(err);
    }

    /// Terminate the connection: every live stream resolves with `err`,
    /// every blocked unit wakes, and nothing new is admitted.
    pub(crate) fn fatal(self: &Arc<Self>, err: Error) {
        let mut inner = self.state.lock();
        if inner.closed.is_some() {
            return;
        }
        tracing::debug!("connection failed: {}", err);
        inner.closed = Some(err.clone());

        if let Some(timer) = inner.idle_timer.take() {
            timer.cancel();
        }
        if let Some(timer) = inner.pong_timer.take() {
            timer.cancel();
        }

        let ids: Vec<StreamId> = inner.streams.keys().copied().collect();
        for id in ids {
            if let Some(mut stream) = inner.streams.remove(&id) {
                stream.fail(err.clone());
            }
        }

        drop(inner);
        self.state.notify_all();
    }

    // ===== keepalive =====

    /// Arm (or re-arm) the read-idle timer. When the connection has been
    /// quiet for the configured interval, a keepalive PING goes out; a
    /// missing acknowledgement within the ping timeout kills the
    /// connection.
    fn arm_idle_timer(shared: &Arc<Self>) {
        let idle = match shared.cfg.read_idle_timeout {
            Some(idle) => idle,
            None => return,
        };

        let weak = Arc::downgrade(shared);
        let timer = shared.rt.timer(
            idle,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    shared.idle_timer_fired();
                }
            }),
        );
        shared.state.lock().idle_timer = Some(timer);
    }

    fn idle_timer_fired(self: &Arc<Self>) {
        let idle = match self.cfg.read_idle_timeout {
            Some(idle) => idle,
            None => return,
        };

        let mut inner = self.state.lock();
        if inner.closed.is_some() {
            return;
        }

        let quiet_for = self.rt.now().duration_since(inner.last_frame_at);
        if quiet_for < idle || inner.pending_ping.is_some() {
            drop(inner);
            Self::arm_idle_timer(self);
            return;
        }

        inner.pending_ping = Some(Ping::KEEPALIVE);

        let weak = Arc::downgrade(self);
        let pong_timer = self.rt.timer(
            self.cfg.ping_timeout,
            Box::new(move || {
                if let Some(shared) = weak.upgrade() {
                    let stalled = shared.state.lock().pending_ping.is_some();
                    if stalled {
                        shared.fatal(Error::KeepaliveTimeout);
                    }
                }
            }),
        );
        inner.pong_timer = Some(pong_timer);
        drop(inner);

        tracing::debug!("connection idle for {:?}; sending keepalive ping", quiet_for);
        let mut writer = self.lock_writer();
        if let Err(err) = writer.framed.write_ping(Ping::new(Ping::KEEPALIVE)) {
            drop(writer);
            self.fatal(Error::from_io(err));
            return;
        }
        drop(writer);

        Self::arm_idle_timer(self);
    }
}

impl ConnInner {
    /// A stream reached `closed` with its table entry still present:
    /// retire it and remember the ID for the stray-frame grace window.
    fn retire_if_closed(&mut self, id: StreamId) {
        let done = self
            .streams
            .get(&id)
            .map_or(false, |stream| stream.state.is_closed());
        if done {
            tracing::trace!("retiring stream {}", id);
            self.streams.remove(&id);
            self.remember_retired(id);
        }
    }

    fn remember_retired(&mut self, id: StreamId) {
        self.retired.push_back((id, self.grace_frames));
        while self.retired.len() > self.retired_max {
            self.retired.pop_front();
        }
    }

    /// Frames may legitimately arrive for a stream we just reset or
    /// retired, already in flight when the RST_STREAM went out. A
    /// small per-stream budget of such frames is tolerated; anything
    /// beyond it, or a frame for a stream that never existed, is a
    /// connection error.
    fn tolerate_stray(&mut self, id: StreamId) -> Result<(), Error> {
        if id >= self.next_stream_id || !id.is_client_initiated() {
            tracing::debug!("frame for idle stream {}", id);
            return Err(Error::Connection(Reason::PROTOCOL_ERROR));
        }

        for entry in self.retired.iter_mut() {
            if entry.0 == id {
                if entry.1 == 0 {
                    tracing::debug!("stray-frame budget exhausted for stream {}", id);
                    return Err(Error::Connection(Reason::PROTOCOL_ERROR));
                }
                entry.1 -= 1;
                return Ok(());
            }
        }

        tracing::debug!("frame for long-closed stream {}", id);
        Err(Error::Connection(Reason::STREAM_CLOSED))
    }
}

fn frame_error_reason(err: frame::Error) -> Reason {
    match err {
        frame::Error::BadFrameSize
        | frame::Error::InvalidPayloadLength
        | frame::Error::InvalidPayloadAckSettings => Reason::FRAME_SIZE_ERROR,
        _ => Reason::PROTOCOL_ERROR,
    }
}
