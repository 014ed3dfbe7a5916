use http::{HeaderMap, StatusCode};
use std::sync::Arc;

use crate::error::Error;
use crate::frame::StreamId;
use crate::pipe::BodyPipe;
use crate::proto::flow::FlowControl;
use crate::proto::state::State;
use crate::rt::sync::Watch;

/// The response head handed to the caller when the stream resolves.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub fields: HeaderMap,
}

/// Single-assignment delivery of a stream's final outcome.
///
/// Both the read loop (response, reset, teardown) and the local side
/// (cancellation, body failure) may race to resolve; the first wins and
/// later attempts are dropped, so the caller observes exactly one result.
#[derive(Debug)]
pub struct ResultSlot {
    slot: Watch<Option<Result<ResponseHead, Error>>>,
}

impl ResultSlot {
    pub fn new() -> Arc<ResultSlot> {
        Arc::new(ResultSlot {
            slot: Watch::new(None),
        })
    }

    pub fn resolve(&self, result: Result<ResponseHead, Error>) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            tracing::trace!(
                "resolving stream result; ok={}",
                result.is_ok()
            );
            *slot = Some(result);
            drop(slot);
            self.slot.notify_all();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Block until the slot resolves. The response head moves out; waiting
    /// a second time yields the stream's terminal error instead.
    pub fn wait(&self) -> Result<ResponseHead, Error> {
        let guard = self.slot.lock();
        let mut slot = self.slot.wait_while(guard, |slot| slot.is_none());

        match slot.take() {
            Some(Ok(head)) => Ok(head),
            Some(Err(err)) => {
                // Keep the terminal error for any later observer.
                *slot = Some(Err(err.clone()));
                Err(err)
            }
            None => unreachable!("slot resolved yet empty"),
        }
    }
}

/// One logical request/response exchange, as tracked by the connection's
/// stream table.
#[derive(Debug)]
pub(crate) struct Stream {
    pub id: StreamId,
    pub state: State,

    /// Send credit granted by the peer for this stream.
    pub send_flow: FlowControl,
    /// Receive credit we granted the peer for this stream.
    pub recv_flow: FlowControl,

    /// Response body conduit: read loop in, application out.
    pub recv_body: Arc<BodyPipe>,
    /// Request body conduit, when the application streams the body through
    /// a pipe. Held so teardown can unblock a writer mid-request.
    pub send_body: Option<Arc<BodyPipe>>,
    /// Trailing fields, delivered after the body reaches end-of-stream.
    pub trailers: Arc<Watch<Option<HeaderMap>>>,

    pub result: Arc<ResultSlot>,
}

impl Stream {
    pub(crate) fn new(
        id: StreamId,
        send_window: u32,
        recv_window: u32,
        result: Arc<ResultSlot>,
    ) -> Stream {
        Stream {
            id,
            state: State::default(),
            send_flow: FlowControl::with_initial(send_window),
            recv_flow: FlowControl::with_initial(recv_window),
            recv_body: BodyPipe::new(recv_window as usize),
            send_body: None,
            trailers: Arc::new(Watch::new(None)),
            result,
        }
    }

    /// Tear the stream down with `err`: resolve the caller, fail the body
    /// conduit, and mark the state closed.
    pub(crate) fn fail(&mut self, err: Error) {
        self.state.recv_err(&err);
        self.result.resolve(Err(err.clone()));
        if let Some(send_body) = &self.send_body {
            send_body.close_with_error(err.clone());
        }
        self.recv_body.close_with_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Reason;

    fn head() -> ResponseHead {
        ResponseHead {
            status: StatusCode::OK,
            fields: HeaderMap::new(),
        }
    }

    #[test]
    fn first_resolution_wins() {
        let slot = ResultSlot::new();
        slot.resolve(Ok(head()));
        slot.resolve(Err(Error::Stream(Reason::CANCEL)));

        assert!(slot.wait().is_ok());
    }

    #[test]
    fn error_resolution_is_sticky() {
        let slot = ResultSlot::new();
        slot.resolve(Err(Error::Canceled));

        assert!(matches!(slot.wait(), Err(Error::Canceled)));
        assert!(matches!(slot.wait(), Err(Error::Canceled)));
    }

    #[test]
    fn failing_a_stream_resolves_and_poisons_the_body() {
        let mut stream = Stream::new(1.into(), 100, 100, ResultSlot::new());
        stream.fail(Error::Canceled);

        assert!(stream.state.is_closed());
        assert!(matches!(stream.result.wait(), Err(Error::Canceled)));
        assert!(stream.recv_body.read(16).is_err());
    }
}
