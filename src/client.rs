//! The public client surface: connection setup, requests, and bodies.
//!
//! A [`Builder`] negotiates one [`Connection`] over a caller-provided
//! byte-stream; [`Connection::round_trip`] then issues exchanges built from
//! [`Request`] values carrying a [`SendBody`] and yields responses whose
//! body is a blocking [`RecvBody`] reader.

use bytes::Bytes;
use http::HeaderMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use crate::error::Error;
use crate::frame::{self, Reason, StreamId};
use crate::hpack::{FieldList, Pseudo};
use crate::pipe::BodyPipe;
use crate::proto::conn::{Config, ConnShared, Connection};
use crate::proto::{DEFAULT_RESET_STREAM_GRACE_FRAMES, DEFAULT_RESET_STREAM_MAX, MAX_WINDOW_SIZE};
use crate::rt::sync::Watch;
use crate::rt::{Runtime, SystemRuntime};

const DEFAULT_STREAM_WINDOW: u32 = 1 << 20;
const DEFAULT_CONN_WINDOW: u32 = 1 << 20;
const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(15);

/// Establish a connection with default settings over `reader`/`writer`.
pub fn handshake<R, W>(reader: R, writer: W) -> Result<Connection, Error>
where
    R: io::Read + Send + 'static,
    W: io::Write + Send + 'static,
{
    Builder::new().handshake(reader, writer)
}

/// Configures new connections.
///
/// ```no_run
/// # use std::net::TcpStream;
/// # fn doc(tcp: TcpStream) -> Result<(), plait::Error> {
/// let conn = plait::client::Builder::new()
///     .initial_window_size(1024 * 1024)
///     .handshake(tcp.try_clone().unwrap(), tcp)?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Builder {
    initial_stream_window: u32,
    initial_conn_window: u32,
    max_frame_size: u32,
    header_table_size: u32,
    reset_stream_max: usize,
    reset_stream_grace_frames: u32,
    read_idle_timeout: Option<Duration>,
    ping_timeout: Duration,
    runtime: Arc<dyn Runtime>,
}

impl Builder {
    pub fn new() -> Builder {
        Builder {
            initial_stream_window: DEFAULT_STREAM_WINDOW,
            initial_conn_window: DEFAULT_CONN_WINDOW,
            max_frame_size: frame::DEFAULT_MAX_FRAME_SIZE,
            header_table_size: frame::DEFAULT_SETTINGS_HEADER_TABLE_SIZE as u32,
            reset_stream_max: DEFAULT_RESET_STREAM_MAX,
            reset_stream_grace_frames: DEFAULT_RESET_STREAM_GRACE_FRAMES,
            read_idle_timeout: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            runtime: Arc::new(SystemRuntime::new()),
        }
    }

    /// The flow-control window granted to the peer per stream, in bytes.
    ///
    /// # Panics
    ///
    /// Panics if `size` exceeds the protocol maximum of 2^31 - 1.
    pub fn initial_window_size(&mut self, size: u32) -> &mut Builder {
        assert!(size <= MAX_WINDOW_SIZE);
        self.initial_stream_window = size;
        self
    }

    /// The connection-level flow-control window granted to the peer, in
    /// bytes. Values above the protocol default are announced with a
    /// WINDOW_UPDATE during the handshake.
    ///
    /// # Panics
    ///
    /// Panics if `size` is below the protocol default or exceeds 2^31 - 1.
    pub fn initial_connection_window_size(&mut self, size: u32) -> &mut Builder {
        assert!(size >= frame::DEFAULT_INITIAL_WINDOW_SIZE && size <= MAX_WINDOW_SIZE);
        self.initial_conn_window = size;
        self
    }

    /// The largest frame payload this side is willing to receive.
    ///
    /// # Panics
    ///
    /// Panics if `size` is outside `[2^14, 2^24 - 1]`.
    pub fn max_frame_size(&mut self, size: u32) -> &mut Builder {
        assert!(size >= frame::DEFAULT_MAX_FRAME_SIZE && size <= frame::MAX_MAX_FRAME_SIZE);
        self.max_frame_size = size;
        self
    }

    /// The HPACK dynamic table size offered to the peer's encoder.
    pub fn header_table_size(&mut self, size: u32) -> &mut Builder {
        self.header_table_size = size;
        self
    }

    /// How many recently reset streams to remember for the post-RST_STREAM
    /// grace window.
    pub fn max_concurrent_reset_streams(&mut self, max: usize) -> &mut Builder {
        self.reset_stream_max = max;
        self
    }

    /// How many in-flight frames each recently reset stream tolerates
    /// before a stray frame becomes a connection error.
    pub fn reset_stream_grace_frames(&mut self, frames: u32) -> &mut Builder {
        self.reset_stream_grace_frames = frames;
        self
    }

    /// Send a keepalive PING when no frame has arrived for `interval`.
    /// Disabled by default.
    pub fn read_idle_timeout(&mut self, interval: Duration) -> &mut Builder {
        self.read_idle_timeout = Some(interval);
        self
    }

    /// How long an unanswered keepalive PING is tolerated before the
    /// connection is declared dead.
    pub fn ping_timeout(&mut self, timeout: Duration) -> &mut Builder {
        self.ping_timeout = timeout;
        self
    }

    /// Replace the scheduling runtime. Tests substitute a virtual clock
    /// here; production code rarely needs this.
    pub fn runtime(&mut self, rt: Arc<dyn Runtime>) -> &mut Builder {
        self.runtime = rt;
        self
    }

    /// Perform the connection handshake over `reader`/`writer`, which must
    /// be the two halves of one ordered byte-stream.
    pub fn handshake<R, W>(&self, reader: R, writer: W) -> Result<Connection, Error>
    where
        R: io::Read + Send + 'static,
        W: io::Write + Send + 'static,
    {
        let cfg = Config {
            initial_stream_window: self.initial_stream_window,
            initial_conn_window: self.initial_conn_window,
            max_frame_size: self.max_frame_size,
            header_table_size: self.header_table_size,
            reset_stream_max: self.reset_stream_max,
            reset_stream_grace_frames: self.reset_stream_grace_frames,
            read_idle_timeout: self.read_idle_timeout,
            ping_timeout: self.ping_timeout,
        };
        Connection::handshake(cfg, Arc::clone(&self.runtime), reader, writer)
    }
}

impl Default for Builder {
    fn default() -> Builder {
        Builder::new()
    }
}

impl fmt::Debug for Builder {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("Builder")
            .field("initial_stream_window", &self.initial_stream_window)
            .field("initial_conn_window", &self.initial_conn_window)
            .field("max_frame_size", &self.max_frame_size)
            .field("read_idle_timeout", &self.read_idle_timeout)
            .finish()
    }
}

/// One request, ready to be issued via [`Connection::round_trip`].
pub struct Request {
    inner: http::Request<SendBody>,
    timeout: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl Request {
    pub fn new(inner: http::Request<SendBody>) -> Request {
        Request {
            inner,
            timeout: None,
            cancel: None,
        }
    }

    /// Bound the whole exchange up to response headers. On expiry the
    /// stream is reset and the caller observes [`Error::Canceled`].
    pub fn timeout(mut self, timeout: Duration) -> Request {
        self.timeout = Some(timeout);
        self
    }

    /// Attach a token that can cancel the exchange from another thread.
    pub fn cancel_token(mut self, token: CancelToken) -> Request {
        self.cancel = Some(token);
        self
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        http::request::Parts,
        SendBody,
        Option<Duration>,
        Option<CancelToken>,
    ) {
        let (parts, body) = self.inner.into_parts();
        (parts, body, self.timeout, self.cancel)
    }
}

impl From<http::Request<SendBody>> for Request {
    fn from(inner: http::Request<SendBody>) -> Request {
        Request::new(inner)
    }
}

/// A request body.
pub enum SendBody {
    /// No body; END_STREAM rides the request HEADERS.
    Empty,
    /// A body fully buffered up front.
    Buf(Bytes),
    /// A body streamed from a blocking reader.
    Reader(Box<dyn io::Read + Send>),
    /// A body streamed through a bounded pipe; see [`SendBody::pipe`].
    Pipe(Arc<BodyPipe>),
}

impl SendBody {
    /// A bounded pipe body: the request goes out while the application is
    /// still producing. Returns the body plus the application's writer.
    pub fn pipe(capacity: usize) -> (SendBody, BodyWriter) {
        let pipe = BodyPipe::new(capacity);
        let body = SendBody::Pipe(Arc::clone(&pipe));
        (body, BodyWriter { pipe })
    }

    pub fn from_reader<R: io::Read + Send + 'static>(reader: R) -> SendBody {
        SendBody::Reader(Box::new(reader))
    }

    /// Whether the request carries no body at all.
    pub(crate) fn is_empty(&self) -> bool {
        match self {
            SendBody::Empty => true,
            SendBody::Buf(buf) => buf.is_empty(),
            SendBody::Reader(..) | SendBody::Pipe(..) => false,
        }
    }

    pub(crate) fn pipe_handle(&self) -> Option<Arc<BodyPipe>> {
        match self {
            SendBody::Pipe(pipe) => Some(Arc::clone(pipe)),
            _ => None,
        }
    }

    /// Produce the next chunk, at most `max` bytes, blocking as the source
    /// requires. `None` means the body is exhausted.
    pub(crate) fn next_chunk(&mut self, max: usize) -> io::Result<Option<Bytes>> {
        match self {
            SendBody::Empty => Ok(None),
            SendBody::Buf(buf) => {
                if buf.is_empty() {
                    Ok(None)
                } else {
                    let n = buf.len().min(max);
                    Ok(Some(buf.split_to(n)))
                }
            }
            SendBody::Reader(reader) => {
                let mut chunk = vec![0u8; max];
                loop {
                    match reader.read(&mut chunk) {
                        Ok(0) => return Ok(None),
                        Ok(n) => {
                            chunk.truncate(n);
                            return Ok(Some(Bytes::from(chunk)));
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                        Err(e) => return Err(e),
                    }
                }
            }
            SendBody::Pipe(pipe) => match pipe.read(max) {
                Ok(chunk) if chunk.is_empty() => Ok(None),
                Ok(chunk) => Ok(Some(chunk)),
                Err(err) => Err(err.into()),
            },
        }
    }
}

impl Default for SendBody {
    fn default() -> SendBody {
        SendBody::Empty
    }
}

impl From<Bytes> for SendBody {
    fn from(src: Bytes) -> SendBody {
        SendBody::Buf(src)
    }
}

impl From<Vec<u8>> for SendBody {
    fn from(src: Vec<u8>) -> SendBody {
        SendBody::Buf(Bytes::from(src))
    }
}

impl From<&'static str> for SendBody {
    fn from(src: &'static str) -> SendBody {
        SendBody::Buf(Bytes::from_static(src.as_bytes()))
    }
}

impl From<String> for SendBody {
    fn from(src: String) -> SendBody {
        SendBody::Buf(Bytes::from(src))
    }
}

impl fmt::Debug for SendBody {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendBody::Empty => fmt.write_str("SendBody::Empty"),
            SendBody::Buf(buf) => write!(fmt, "SendBody::Buf({} bytes)", buf.len()),
            SendBody::Reader(..) => fmt.write_str("SendBody::Reader"),
            SendBody::Pipe(..) => fmt.write_str("SendBody::Pipe"),
        }
    }
}

/// The application's writing end of a [`SendBody::pipe`] body.
///
/// Writes block while the pipe is at capacity. Dropping the writer closes
/// the body cleanly; use [`abort`](BodyWriter::abort) to fail the request
/// instead.
pub struct BodyWriter {
    pipe: Arc<BodyPipe>,
}

impl BodyWriter {
    /// Finish the body; the stream's final DATA frame carries END_STREAM.
    pub fn close(&self) {
        self.pipe.close();
    }

    /// Fail the body. The stream is reset rather than terminated cleanly.
    pub fn abort(&self, err: io::Error) {
        self.pipe.close_with_error(Error::from_body_io(err));
    }
}

impl io::Write for BodyWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pipe.write(buf).map_err(Into::into)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for BodyWriter {
    fn drop(&mut self) {
        self.pipe.close();
    }
}

impl fmt::Debug for BodyWriter {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.write_str("BodyWriter")
    }
}

/// A blocking reader over a response body.
///
/// Reading drives receive flow control: consumed bytes are credited back
/// to the peer via WINDOW_UPDATE once past the announcement threshold.
/// Dropping the body before end-of-stream resets the stream.
pub struct RecvBody {
    conn: Weak<ConnShared>,
    id: StreamId,
    pipe: Arc<BodyPipe>,
    trailers: Arc<Watch<Option<HeaderMap>>>,
}

impl RecvBody {
    pub(crate) fn new(
        conn: Weak<ConnShared>,
        id: StreamId,
        pipe: Arc<BodyPipe>,
        trailers: Arc<Watch<Option<HeaderMap>>>,
    ) -> RecvBody {
        RecvBody {
            conn,
            id,
            pipe,
            trailers,
        }
    }

    /// Trailing fields, if the peer sent any. Only populated once the body
    /// has been read to end-of-stream.
    pub fn trailers(&self) -> Option<HeaderMap> {
        self.trailers.lock().clone()
    }
}

impl io::Read for RecvBody {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        let chunk = self.pipe.read(buf.len()).map_err(io::Error::from)?;
        if chunk.is_empty() {
            return Ok(0);
        }

        buf[..chunk.len()].copy_from_slice(&chunk);
        if let Some(conn) = self.conn.upgrade() {
            conn.note_consumed(self.id, chunk.len());
        }
        Ok(chunk.len())
    }
}

impl Drop for RecvBody {
    fn drop(&mut self) {
        // Settle credit for anything buffered but never read, then reset
        // the stream if it is still live.
        let leftover = self.pipe.drain();
        self.pipe.close_with_error(Error::Canceled);

        if let Some(conn) = self.conn.upgrade() {
            if leftover > 0 {
                conn.note_consumed(self.id, leftover);
            }
            conn.reset_stream(self.id, Reason::CANCEL, Error::Canceled);
        }
    }
}

impl fmt::Debug for RecvBody {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("RecvBody").field("id", &self.id).finish()
    }
}

/// Cancels an in-flight exchange from any thread.
///
/// Cloneable; canceling any clone resets the attached stream with
/// RST_STREAM(CANCEL) and resolves the caller with [`Error::Canceled`].
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Watch<CancelState>>,
}

struct CancelState {
    canceled: bool,
    target: Option<(Weak<ConnShared>, StreamId)>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken {
            inner: Arc::new(Watch::new(CancelState {
                canceled: false,
                target: None,
            })),
        }
    }

    pub fn cancel(&self) {
        let mut state = self.inner.lock();
        state.canceled = true;
        let target = state.target.take();
        drop(state);
        self.inner.notify_all();

        if let Some((conn, id)) = target {
            if let Some(conn) = conn.upgrade() {
                conn.reset_stream(id, Reason::CANCEL, Error::Canceled);
            }
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.lock().canceled
    }

    /// Bind the token to a live stream. Returns `false` if cancellation
    /// already happened, in which case the caller must reset the stream
    /// itself.
    pub(crate) fn attach(&self, conn: Weak<ConnShared>, id: StreamId) -> bool {
        let mut state = self.inner.lock();
        if state.canceled {
            return false;
        }
        state.target = Some((conn, id));
        true
    }
}

impl Default for CancelToken {
    fn default() -> CancelToken {
        CancelToken::new()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("CancelToken")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// Map a request head onto the HTTP/2 field list: pseudo fields derived
/// from the method and URI, hop-by-hop fields dropped.
pub(crate) fn build_field_list(parts: &http::request::Parts) -> Result<FieldList, Error> {
    if parts.method == http::Method::CONNECT {
        return Err(Error::InvalidRequest("CONNECT is not supported"));
    }

    let uri = &parts.uri;
    let scheme = uri.scheme_str().unwrap_or("https").to_string();

    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or(Error::InvalidRequest("request has no authority"))?;

    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut fields = HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        match name.as_str() {
            // Connection-scoped fields have no place on an HTTP/2 stream;
            // host is carried as :authority instead.
            "connection" | "proxy-connection" | "keep-alive" | "transfer-encoding"
            | "upgrade" | "host" => continue,
            "te" => {
                if value != "trailers" {
                    continue;
                }
            }
            _ => {}
        }
        fields.append(name.clone(), value.clone());
    }

    Ok(FieldList {
        pseudo: Pseudo {
            method: Some(parts.method.clone()),
            scheme: Some(scheme),
            authority: Some(authority),
            path: Some(path),
            status: None,
        },
        fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts(req: http::Request<()>) -> http::request::Parts {
        req.into_parts().0
    }

    #[test]
    fn field_list_from_uri() {
        let req = http::Request::get("https://example.com/search?q=1")
            .header("accept", "*/*")
            .body(())
            .unwrap();

        let list = build_field_list(&parts(req)).unwrap();
        assert_eq!(list.pseudo.method, Some(http::Method::GET));
        assert_eq!(list.pseudo.scheme.as_deref(), Some("https"));
        assert_eq!(list.pseudo.authority.as_deref(), Some("example.com"));
        assert_eq!(list.pseudo.path.as_deref(), Some("/search?q=1"));
        assert_eq!(list.fields["accept"], "*/*");
    }

    #[test]
    fn host_header_backfills_authority() {
        let req = http::Request::get("/local")
            .header("host", "fallback.example")
            .body(())
            .unwrap();

        let list = build_field_list(&parts(req)).unwrap();
        assert_eq!(list.pseudo.authority.as_deref(), Some("fallback.example"));
        // Carried as :authority, not as a field.
        assert!(list.fields.get("host").is_none());
    }

    #[test]
    fn hop_by_hop_fields_are_dropped() {
        let req = http::Request::get("https://example.com/")
            .header("connection", "keep-alive")
            .header("transfer-encoding", "chunked")
            .header("te", "gzip")
            .header("x-keep", "yes")
            .body(())
            .unwrap();

        let list = build_field_list(&parts(req)).unwrap();
        assert!(list.fields.get("connection").is_none());
        assert!(list.fields.get("transfer-encoding").is_none());
        assert!(list.fields.get("te").is_none());
        assert_eq!(list.fields["x-keep"], "yes");
    }

    #[test]
    fn te_trailers_survives() {
        let req = http::Request::get("https://example.com/")
            .header("te", "trailers")
            .body(())
            .unwrap();

        let list = build_field_list(&parts(req)).unwrap();
        assert_eq!(list.fields["te"], "trailers");
    }

    #[test]
    fn connect_is_rejected() {
        let req = http::Request::connect("example.com:443").body(()).unwrap();
        assert!(matches!(
            build_field_list(&parts(req)),
            Err(Error::InvalidRequest(..))
        ));
    }

    #[test]
    fn missing_authority_is_rejected() {
        let req = http::Request::get("/no-host").body(()).unwrap();
        assert!(matches!(
            build_field_list(&parts(req)),
            Err(Error::InvalidRequest(..))
        ));
    }

    #[test]
    fn buffered_body_chunks_at_max() {
        let mut body = SendBody::from(vec![7u8; 10]);
        assert!(!body.is_empty());

        assert_eq!(body.next_chunk(4).unwrap().unwrap().len(), 4);
        assert_eq!(body.next_chunk(4).unwrap().unwrap().len(), 4);
        assert_eq!(body.next_chunk(4).unwrap().unwrap().len(), 2);
        assert!(body.next_chunk(4).unwrap().is_none());
    }

    #[test]
    fn reader_body_ends_on_eof() {
        let mut body = SendBody::from_reader(io::Cursor::new(b"abcdef".to_vec()));
        assert_eq!(&body.next_chunk(16).unwrap().unwrap()[..], b"abcdef");
        assert!(body.next_chunk(16).unwrap().is_none());
    }

    #[test]
    fn pipe_body_delivers_writes_then_eof() {
        let (mut body, writer) = SendBody::pipe(64);
        {
            use io::Write;
            let mut writer = writer;
            writer.write_all(b"streamed").unwrap();
            writer.close();
        }

        assert_eq!(&body.next_chunk(64).unwrap().unwrap()[..], b"streamed");
        assert!(body.next_chunk(64).unwrap().is_none());
    }

    #[test]
    fn canceled_token_refuses_attach() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.is_canceled());
        assert!(!token.attach(Weak::new(), StreamId::from(1)));
    }
}
