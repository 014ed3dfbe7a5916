use crate::error::Error;
use crate::frame::Reason;

use self::Inner::*;
use self::Remote::*;

/// Per-stream protocol state, client-side projection.
///
/// The local half is driven by our own sends and the remote half by frames
/// off the wire; `Remote` additionally distinguishes "response headers not
/// seen yet" from "streaming the body", which is what separates response
/// headers from trailers.
#[derive(Debug, Clone)]
pub struct State {
    inner: Inner,
}

#[derive(Debug, Clone, Copy)]
enum Inner {
    Idle,
    Open { remote: Remote },
    HalfClosedLocal(Remote),
    HalfClosedRemote,
    Closed(Cause),
}

#[derive(Debug, Copy, Clone)]
enum Remote {
    AwaitingHeaders,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
enum Cause {
    EndStream,
    Proto(Reason),
    LocallyReset(Reason),
    Io,
}

impl State {
    /// The initial HEADERS frame for the request is going out; `eos` when
    /// the request has no body.
    pub fn send_open(&mut self, eos: bool) {
        self.inner = match self.inner {
            Idle => {
                if eos {
                    HalfClosedLocal(AwaitingHeaders)
                } else {
                    Open {
                        remote: AwaitingHeaders,
                    }
                }
            }
            state => panic!("send_open: unexpected state {:?}", state),
        };
    }

    /// The local side sent END_STREAM.
    pub fn send_close(&mut self) {
        match self.inner {
            Open { remote } => {
                tracing::trace!("send_close: Open => HalfClosedLocal({:?})", remote);
                self.inner = HalfClosedLocal(remote);
            }
            HalfClosedRemote => {
                tracing::trace!("send_close: HalfClosedRemote => Closed");
                self.inner = Closed(Cause::EndStream);
            }
            Closed(..) => {}
            state => panic!("send_close: unexpected state {:?}", state),
        }
    }

    /// A complete header block arrived. Returns whether it is the initial
    /// response (`true`) or trailers (`false`).
    pub fn recv_headers(&mut self, eos: bool) -> Result<bool, Reason> {
        let initial = match self.inner {
            Open {
                remote: AwaitingHeaders,
            }
            | HalfClosedLocal(AwaitingHeaders) => true,
            Open { remote: Streaming } | HalfClosedLocal(Streaming) => {
                // Trailers must terminate the stream.
                if !eos {
                    return Err(Reason::PROTOCOL_ERROR);
                }
                false
            }
            ref state => {
                tracing::debug!("recv_headers: in unexpected state {:?}", state);
                return Err(Reason::STREAM_CLOSED);
            }
        };

        if eos {
            self.recv_close();
        } else {
            self.inner = match self.inner {
                Open { .. } => Open { remote: Streaming },
                HalfClosedLocal(..) => HalfClosedLocal(Streaming),
                ref state => panic!("recv_headers: unexpected state {:?}", state),
            };
        }

        Ok(initial)
    }

    /// Whether DATA frames are currently legal from the peer.
    pub fn ensure_recv_streaming(&self) -> Result<(), Reason> {
        match self.inner {
            Open { remote: Streaming } | HalfClosedLocal(Streaming) => Ok(()),
            _ => Err(Reason::STREAM_CLOSED),
        }
    }

    /// The peer sent END_STREAM.
    pub fn recv_close(&mut self) {
        match self.inner {
            Open { .. } => {
                tracing::trace!("recv_close: Open => HalfClosedRemote");
                self.inner = HalfClosedRemote;
            }
            HalfClosedLocal(..) => {
                tracing::trace!("recv_close: HalfClosedLocal => Closed");
                self.inner = Closed(Cause::EndStream);
            }
            Closed(..) => {}
            state => panic!("recv_close: unexpected state {:?}", state),
        }
    }

    /// RST_STREAM arrived from the peer.
    pub fn recv_reset(&mut self, reason: Reason) {
        match self.inner {
            Closed(..) => {}
            ref state => {
                tracing::trace!("recv_reset: {:?} => Closed({:?})", state, reason);
                self.inner = Closed(Cause::Proto(reason));
            }
        }
    }

    /// The connection died underneath this stream.
    pub fn recv_err(&mut self, err: &Error) {
        match self.inner {
            Closed(..) => {}
            _ => {
                tracing::trace!("recv_err; err={}", err);
                self.inner = Closed(match err {
                    Error::Io(..) => Cause::Io,
                    other => Cause::LocallyReset(
                        other.reason().unwrap_or(Reason::INTERNAL_ERROR),
                    ),
                });
            }
        }
    }

    /// The local side is resetting the stream (cancellation, body failure,
    /// stream-scoped protocol violation).
    pub fn set_reset(&mut self, reason: Reason) {
        self.inner = Closed(Cause::LocallyReset(reason));
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner, Closed(..))
    }

    pub fn is_send_closed(&self) -> bool {
        matches!(self.inner, Closed(..) | HalfClosedLocal(..))
    }

    pub fn is_recv_closed(&self) -> bool {
        matches!(self.inner, Closed(..) | HalfClosedRemote)
    }
}

impl Default for State {
    fn default() -> State {
        State { inner: Inner::Idle }
    }
}
