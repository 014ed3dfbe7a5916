mod support;

use std::convert::TryInto;
use std::io::Read;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use plait::client::Builder;
use plait::rt::virt::VirtualRuntime;
use plait::{Error, Request, SendBody};

use support::*;

fn get(uri: &str) -> http::Request<SendBody> {
    http::Request::get(uri).body(SendBody::Empty).unwrap()
}

fn increment(frame: &RawFrame) -> u32 {
    u32::from_be_bytes(frame.payload[..4].try_into().unwrap())
}

#[test]
fn get_round_trip() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let mut resp = conn.round_trip(get("https://example.com/").into()).unwrap();
        assert_eq!(resp.status(), 200);
        let mut body = String::new();
        resp.body_mut().read_to_string(&mut body).unwrap();
        body
    });

    let (frame, fields) = peer.recv_headers();
    assert_eq!(frame.stream_id, 1);
    assert!(frame.is_end_stream());
    assert_eq!(field(&fields, ":method"), "GET");
    assert_eq!(field(&fields, ":scheme"), "https");
    assert_eq!(field(&fields, ":authority"), "example.com");
    assert_eq!(field(&fields, ":path"), "/");

    peer.send_response_headers(1, 200, &[], false);
    peer.send_data(1, b"hello", true);

    assert_eq!(client.join().unwrap(), "hello");
}

#[test]
fn request_body_is_framed_with_end_stream() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let req = http::Request::post("https://example.com/upload")
            .body(SendBody::from("some request payload"))
            .unwrap();
        conn.round_trip(req.into()).unwrap().status()
    });

    let (frame, fields) = peer.recv_headers();
    assert!(!frame.is_end_stream());
    assert_eq!(field(&fields, ":method"), "POST");

    let mut body = Vec::new();
    loop {
        let frame = peer.recv_frame();
        assert_eq!(frame.kind, DATA);
        body.extend_from_slice(&frame.payload);
        if frame.is_end_stream() {
            break;
        }
    }
    assert_eq!(body, b"some request payload");

    peer.send_response_headers(1, 204, &[], true);
    assert_eq!(client.join().unwrap(), 204);
}

#[test]
fn stream_ids_are_odd_and_increasing() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    for expected_id in [1u32, 3, 5] {
        let c = conn.clone();
        let client =
            thread::spawn(move || c.round_trip(get("https://example.com/").into()).unwrap());

        let (frame, _) = peer.recv_headers();
        assert_eq!(frame.stream_id, expected_id);

        peer.send_response_headers(expected_id, 200, &[], true);
        client.join().unwrap();
    }
}

#[test]
fn goaway_fails_unprocessed_streams_as_retryable() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let c = conn.clone();
    let client = thread::spawn(move || c.round_trip(get("https://example.com/").into()));

    let _ = peer.recv_headers();
    peer.send_goaway(0, 0);

    let err = client.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::GoAway { .. }));
    assert!(err.is_retryable());

    // Nothing new is admitted once the peer is going away.
    let err = conn
        .round_trip(get("https://example.com/").into())
        .unwrap_err();
    assert!(err.is_retryable());
}

#[test]
fn response_headers_split_across_continuation() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let resp = conn.round_trip(get("https://example.com/").into()).unwrap();
        (
            resp.status(),
            resp.headers()["x-big"].to_str().unwrap().to_string(),
        )
    });

    let _ = peer.recv_headers();

    let big = "v".repeat(300);
    let block = peer.encode_block(&[(":status", "200"), ("x-big", big.as_str())]);
    let mid = block.len() / 2;
    peer.send_frame(HEADERS, 0, 1, &block[..mid]);
    peer.send_frame(CONTINUATION, FLAG_END_HEADERS, 1, &block[mid..]);
    peer.send_data(1, b"", true);

    let (status, got) = client.join().unwrap();
    assert_eq!(status, 200);
    assert_eq!(got, big);
}

#[test]
fn deadline_resets_the_stream() {
    let rt = Arc::new(VirtualRuntime::new());
    let mut builder = Builder::new();
    builder.runtime(rt.clone());

    let (conn, mut peer) = connect(&builder);
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let req = Request::new(get("https://example.com/slow")).timeout(Duration::from_secs(2));
        conn.round_trip(req)
    });

    let _ = peer.recv_headers();

    // The deadline timer is armed right after HEADERS goes out.
    while rt.pending_timers() == 0 {
        thread::sleep(Duration::from_millis(5));
    }
    rt.advance(Duration::from_secs(2));

    assert!(matches!(client.join().unwrap(), Err(Error::Canceled)));

    let frame = peer.recv_frame();
    assert_eq!(frame.kind, RST_STREAM);
    assert_eq!(frame.stream_id, 1);
    // CANCEL
    assert_eq!(increment(&frame), 0x8);
}

#[test]
fn send_respects_peer_flow_control_windows() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[(SETTING_INITIAL_WINDOW_SIZE, 4)]);

    let client = thread::spawn(move || {
        let req = http::Request::post("https://example.com/up")
            .body(SendBody::from("0123456789"))
            .unwrap();
        conn.round_trip(req.into()).unwrap().status()
    });

    let _ = peer.recv_headers();

    let frame = peer.recv_frame();
    assert_eq!(frame.kind, DATA);
    assert_eq!(frame.payload, b"0123");
    assert!(!frame.is_end_stream());

    // Window exhausted; the body pump stalls.
    assert!(peer.quiet_for(Duration::from_millis(100)));

    peer.send_window_update(1, 4);
    let frame = peer.recv_frame();
    assert_eq!(frame.payload, b"4567");
    assert!(!frame.is_end_stream());

    peer.send_window_update(1, 4);
    let frame = peer.recv_frame();
    assert_eq!(frame.payload, b"89");
    assert!(frame.is_end_stream());

    peer.send_response_headers(1, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn settings_rebase_extends_stream_windows() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[(SETTING_INITIAL_WINDOW_SIZE, 4)]);

    let client = thread::spawn(move || {
        let req = http::Request::post("https://example.com/up")
            .body(SendBody::from("0123456789"))
            .unwrap();
        conn.round_trip(req.into()).unwrap().status()
    });

    let _ = peer.recv_headers();
    let frame = peer.recv_frame();
    assert_eq!(frame.payload, b"0123");

    // Raising the initial window re-bases the live stream's window by the
    // delta, releasing the stalled pump.
    peer.send_settings(&[(SETTING_INITIAL_WINDOW_SIZE, 10)]);

    let frame = peer.recv_frame_skipping_settings();
    assert_eq!(frame.kind, DATA);
    assert_eq!(frame.payload, b"456789");
    assert!(frame.is_end_stream());

    peer.send_response_headers(1, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn consumed_body_bytes_are_credited_back() {
    let mut builder = Builder::new();
    builder.initial_window_size(16);
    let (conn, mut peer) = connect(&builder);
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let mut resp = conn.round_trip(get("https://example.com/").into()).unwrap();
        let mut body = Vec::new();
        resp.body_mut().read_to_end(&mut body).unwrap();
        body
    });

    let _ = peer.recv_headers();
    peer.send_response_headers(1, 200, &[], false);

    // Fill the 16-byte stream window completely.
    peer.send_data(1, b"0123456789abcdef", false);

    // As the application drains the body, the credit comes back.
    let mut credited = 0;
    while credited < 16 {
        let frame = peer.recv_frame();
        assert_eq!(frame.kind, WINDOW_UPDATE);
        assert_eq!(frame.stream_id, 1);
        credited += increment(&frame);
    }
    assert_eq!(credited, 16);

    peer.send_data(1, b"tail", true);
    assert_eq!(client.join().unwrap(), b"0123456789abcdeftail");
}

#[test]
fn keepalive_ping_and_timeout() {
    let rt = Arc::new(VirtualRuntime::new());
    let mut builder = Builder::new();
    builder
        .runtime(rt.clone())
        .read_idle_timeout(Duration::from_secs(10))
        .ping_timeout(Duration::from_secs(5));

    let (conn, mut peer) = connect(&builder);
    peer.greet(&[]);

    rt.advance(Duration::from_secs(10));
    let frame = peer.recv_frame();
    assert_eq!(frame.kind, PING);
    assert!(!frame.is_ack());

    // Acknowledged in time; the connection lives on.
    peer.send_ping_ack(&frame.payload);
    thread::sleep(Duration::from_millis(100));
    rt.advance(Duration::from_secs(5));
    assert!(!conn.is_closed());

    // A second idle interval elapses; this ping goes unanswered.
    rt.advance(Duration::from_secs(10));
    let frame = peer.recv_frame();
    assert_eq!(frame.kind, PING);

    rt.advance(Duration::from_secs(5));
    assert!(conn.is_closed());
}

#[test]
fn peer_disconnect_fails_everything_and_winds_down() {
    let rt = Arc::new(VirtualRuntime::new());
    let mut builder = Builder::new();
    builder.runtime(rt.clone());

    let (conn, mut peer) = connect(&builder);
    peer.greet(&[]);

    let c = conn.clone();
    let client = thread::spawn(move || c.round_trip(get("https://example.com/").into()));
    let _ = peer.recv_headers();

    peer.close();

    let err = client.join().unwrap().unwrap_err();
    assert!(err.is_io());
    assert!(conn.is_closed());

    // No unit is left blocked.
    assert!(rt.wait_idle(Duration::from_secs(5)));

    let err = conn
        .round_trip(get("https://example.com/").into())
        .unwrap_err();
    assert!(err.is_io());
}

#[test]
fn concurrency_cap_queues_excess_requests() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[(SETTING_MAX_CONCURRENT_STREAMS, 1)]);

    let c1 = conn.clone();
    let first = thread::spawn(move || {
        c1.round_trip(get("https://example.com/a").into())
            .unwrap()
            .status()
    });
    let (frame, _) = peer.recv_headers();
    assert_eq!(frame.stream_id, 1);

    let c2 = conn.clone();
    let second = thread::spawn(move || {
        c2.round_trip(get("https://example.com/b").into())
            .unwrap()
            .status()
    });

    // The second request queues behind the concurrency cap.
    assert!(peer.quiet_for(Duration::from_millis(100)));

    peer.send_response_headers(1, 200, &[], true);
    assert_eq!(first.join().unwrap(), 200);

    let (frame, _) = peer.recv_headers();
    assert_eq!(frame.stream_id, 3);
    peer.send_response_headers(3, 200, &[], true);
    assert_eq!(second.join().unwrap(), 200);
}

#[test]
fn frames_after_close_are_tolerated_within_grace() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let c = conn.clone();
    let client = thread::spawn(move || {
        c.round_trip(get("https://example.com/").into())
            .unwrap()
            .status()
    });
    let _ = peer.recv_headers();
    peer.send_response_headers(1, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);

    // In-flight frames for the finished stream are forgiven...
    for _ in 0..10 {
        peer.send_data(1, b"late", false);
    }

    // ...and the connection still works.
    let c = conn.clone();
    let client = thread::spawn(move || {
        c.round_trip(get("https://example.com/").into())
            .unwrap()
            .status()
    });
    let _ = peer.recv_headers();
    peer.send_response_headers(3, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);

    // The grace budget is finite; one more stray frame is fatal.
    peer.send_data(1, b"late", false);
    let frame = peer.recv_frame();
    assert_eq!(frame.kind, GOAWAY);
    assert!(conn
        .round_trip(get("https://example.com/").into())
        .is_err());
}

#[test]
fn peer_reset_fails_only_that_stream() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let c = conn.clone();
    let client = thread::spawn(move || c.round_trip(get("https://example.com/").into()));
    let _ = peer.recv_headers();

    // REFUSED_STREAM
    peer.send_reset(1, 0x7);

    let err = client.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::Stream(..)));

    // The connection survives for other streams.
    let c = conn.clone();
    let client = thread::spawn(move || {
        c.round_trip(get("https://example.com/").into())
            .unwrap()
            .status()
    });
    let _ = peer.recv_headers();
    peer.send_response_headers(3, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn trailers_are_delivered_after_body() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let mut resp = conn.round_trip(get("https://example.com/").into()).unwrap();
        let mut body = Vec::new();
        resp.body_mut().read_to_end(&mut body).unwrap();
        (body, resp.body().trailers())
    });

    let _ = peer.recv_headers();
    peer.send_response_headers(1, 200, &[], false);
    peer.send_data(1, b"payload", false);
    peer.send_trailers(1, &[("x-checksum", "abc123")]);

    let (body, trailers) = client.join().unwrap();
    assert_eq!(body, b"payload");
    assert_eq!(trailers.unwrap()["x-checksum"], "abc123");
}

#[test]
fn interim_responses_are_skipped() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let client = thread::spawn(move || {
        conn.round_trip(get("https://example.com/").into())
            .unwrap()
            .status()
    });

    let _ = peer.recv_headers();
    peer.send_response_headers(1, 103, &[("link", "</style.css>; rel=preload")], false);
    peer.send_response_headers(1, 200, &[], true);

    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn interim_response_ending_the_stream_is_rejected() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let c = conn.clone();
    let client = thread::spawn(move || c.round_trip(get("https://example.com/").into()));

    let _ = peer.recv_headers();
    peer.send_response_headers(1, 103, &[], true);

    let err = client.join().unwrap().unwrap_err();
    assert!(matches!(err, Error::MalformedResponse(..)));

    let frame = peer.recv_frame();
    assert_eq!(frame.kind, RST_STREAM);
    assert_eq!(frame.stream_id, 1);
    // PROTOCOL_ERROR
    assert_eq!(increment(&frame), 0x1);

    // Only the stream is torn down.
    let client = thread::spawn(move || {
        conn.round_trip(get("https://example.com/").into())
            .unwrap()
            .status()
    });
    let _ = peer.recv_headers();
    peer.send_response_headers(3, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn padding_credit_is_returned_on_receipt() {
    let mut builder = Builder::new();
    builder.initial_window_size(8);
    let (conn, mut peer) = connect(&builder);
    peer.greet(&[]);

    let client = thread::spawn(move || {
        let mut resp = conn.round_trip(get("https://example.com/").into()).unwrap();
        let mut body = Vec::new();
        resp.body_mut().read_to_end(&mut body).unwrap();
        body
    });

    let _ = peer.recv_headers();
    peer.send_response_headers(1, 200, &[], false);

    // A 4-byte payload plus 4 flow-controlled pad octets (three of
    // padding and the pad-length octet) fills the 8-byte stream window.
    peer.send_padded_data(1, b"abcd", 3, false);

    // The padding is refunded on receipt and the payload as it is read;
    // the whole window comes back even though only 4 bytes reached the
    // application.
    let mut credited = 0;
    while credited < 8 {
        let frame = peer.recv_frame();
        assert_eq!(frame.kind, WINDOW_UPDATE);
        assert_eq!(frame.stream_id, 1);
        credited += increment(&frame);
    }
    assert_eq!(credited, 8);

    peer.send_data(1, b"", true);
    assert_eq!(client.join().unwrap(), b"abcd");
}

#[test]
fn streamed_request_body_through_a_pipe() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let (body, mut writer) = SendBody::pipe(64);
    let client = thread::spawn(move || {
        let req = http::Request::post("https://example.com/stream")
            .body(body)
            .unwrap();
        conn.round_trip(req.into()).unwrap().status()
    });

    let _ = peer.recv_headers();

    {
        use std::io::Write;
        writer.write_all(b"first ").unwrap();
        writer.write_all(b"second").unwrap();
        writer.close();
    }

    let mut got = Vec::new();
    loop {
        let frame = peer.recv_frame();
        assert_eq!(frame.kind, DATA);
        got.extend_from_slice(&frame.payload);
        if frame.is_end_stream() {
            break;
        }
    }
    assert_eq!(got, b"first second");

    peer.send_response_headers(1, 200, &[], true);
    assert_eq!(client.join().unwrap(), 200);
}

#[test]
fn cancel_token_resets_the_stream() {
    let (conn, mut peer) = connect(&Builder::new());
    peer.greet(&[]);

    let token = plait::CancelToken::new();
    let t = token.clone();
    let client = thread::spawn(move || {
        let req = Request::new(get("https://example.com/slow")).cancel_token(t);
        conn.round_trip(req)
    });

    let _ = peer.recv_headers();
    token.cancel();

    assert!(matches!(client.join().unwrap(), Err(Error::Canceled)));

    let frame = peer.recv_frame();
    assert_eq!(frame.kind, RST_STREAM);
    assert_eq!(frame.stream_id, 1);
}
