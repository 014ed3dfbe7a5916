//! Bounded, blocking byte conduits between the application and the
//! connection.
//!
//! The response path pushes DATA payloads in from the read loop and the
//! application reads them out; the request path lets the application write
//! body bytes that a per-stream pump drains into DATA frames. Either end
//! can close the pipe, with or without a terminal error, and a terminal
//! error fails all current and future operations instead of leaving them
//! blocked.

use bytes::{Buf, Bytes, BytesMut};
use std::sync::Arc;

use crate::error::Error;
use crate::rt::sync::Watch;

#[derive(Debug)]
pub(crate) struct BodyPipe {
    shared: Watch<State>,
    capacity: usize,
}

#[derive(Debug)]
struct State {
    buf: BytesMut,
    eof: bool,
    err: Option<Error>,
}

impl BodyPipe {
    pub(crate) fn new(capacity: usize) -> Arc<BodyPipe> {
        Arc::new(BodyPipe {
            shared: Watch::new(State {
                buf: BytesMut::new(),
                eof: false,
                err: None,
            }),
            capacity,
        })
    }

    /// Append bytes without blocking. Used by the read loop, where the
    /// bound is enforced upstream by the receive flow-control window.
    pub(crate) fn push(&self, data: &[u8]) -> Result<(), Error> {
        let mut state = self.shared.lock();
        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if state.eof {
            return Err(Error::Stream(crate::frame::Reason::STREAM_CLOSED));
        }
        state.buf.extend_from_slice(data);
        drop(state);
        self.shared.notify_all();
        Ok(())
    }

    /// Blocking bounded write from the application side of a request body.
    /// Suspends while the buffer is at capacity and no terminal state has
    /// been reached.
    pub(crate) fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let guard = self.shared.lock();
        let capacity = self.capacity;
        let mut state = self.shared.wait_while(guard, |s| {
            s.err.is_none() && !s.eof && s.buf.len() >= capacity
        });

        if let Some(err) = &state.err {
            return Err(err.clone());
        }
        if state.eof {
            return Err(Error::Stream(crate::frame::Reason::STREAM_CLOSED));
        }

        let n = data.len().min(self.capacity - state.buf.len());
        state.buf.extend_from_slice(&data[..n]);
        drop(state);
        self.shared.notify_all();
        Ok(n)
    }

    /// Blocking read. Returns bytes if available, an empty buffer at
    /// end-of-stream, or the terminal error.
    pub(crate) fn read(&self, max: usize) -> Result<Bytes, Error> {
        let guard = self.shared.lock();
        let mut state = self
            .shared
            .wait_while(guard, |s| s.buf.is_empty() && !s.eof && s.err.is_none());

        if !state.buf.is_empty() {
            let n = state.buf.len().min(max);
            let chunk = state.buf.split_to(n).freeze();
            drop(state);
            self.shared.notify_all();
            return Ok(chunk);
        }

        if let Some(err) = &state.err {
            return Err(err.clone());
        }

        debug_assert!(state.eof);
        Ok(Bytes::new())
    }

    /// Close the producer side cleanly; readers drain what is buffered and
    /// then observe end-of-stream.
    pub(crate) fn close(&self) {
        let mut state = self.shared.lock();
        state.eof = true;
        drop(state);
        self.shared.notify_all();
    }

    /// Terminate with an error. Buffered bytes are discarded; outstanding
    /// and future reads and writes observe the error.
    pub(crate) fn close_with_error(&self, err: Error) {
        let mut state = self.shared.lock();
        if state.err.is_none() && !state.eof {
            tracing::trace!("pipe closed with error: {}", err);
            state.err = Some(err);
            let n = state.buf.remaining();
            state.buf.advance(n);
        }
        drop(state);
        self.shared.notify_all();
    }

    pub(crate) fn is_closed(&self) -> bool {
        let state = self.shared.lock();
        state.eof || state.err.is_some()
    }

    /// Bytes buffered but not yet read out.
    pub(crate) fn buffered_len(&self) -> usize {
        self.shared.lock().buf.len()
    }

    /// Discard everything buffered, returning how much was dropped. Used
    /// when a body is abandoned, so its flow-control credit can be settled.
    pub(crate) fn drain(&self) -> usize {
        let mut state = self.shared.lock();
        let n = state.buf.len();
        state.buf.advance(n);
        drop(state);
        self.shared.notify_all();
        n
    }
}
