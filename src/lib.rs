//! A blocking HTTP/2 client connection engine.
//!
//! `plait` multiplexes request/response exchanges over a single ordered
//! byte-stream it is handed: it owns stream lifecycle, HPACK header
//! compression, both levels of flow control, SETTINGS negotiation,
//! keepalive, and GOAWAY handling, and exposes each exchange as a plain
//! blocking call. Connection management, TLS, redirects, and retries
//! belong to the caller; [`Error::is_retryable`] says when a failed
//! request is safe to replay on another connection.
//!
//! # Getting started
//!
//! ```no_run
//! use std::io::Read;
//! use std::net::TcpStream;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let tcp = TcpStream::connect("example.com:80")?;
//!     let conn = plait::client::handshake(tcp.try_clone()?, tcp)?;
//!
//!     let req = http::Request::get("http://example.com/")
//!         .body(plait::SendBody::Empty)?;
//!
//!     let mut resp = conn.round_trip(req.into())?;
//!     println!("status: {}", resp.status());
//!
//!     let mut body = Vec::new();
//!     resp.body_mut().read_to_end(&mut body)?;
//!     Ok(())
//! }
//! ```
//!
//! Scheduling is abstracted behind [`rt::Runtime`], so the same engine
//! runs against real threads in production and a virtual clock in tests.

#![deny(rust_2018_idioms)]

pub mod client;
pub mod frame;
pub mod rt;

mod codec;
mod error;
mod hpack;
mod pipe;
mod proto;

pub use crate::client::{BodyWriter, CancelToken, RecvBody, Request, SendBody};
pub use crate::error::Error;
pub use crate::frame::Reason;
pub use crate::proto::conn::Connection;
