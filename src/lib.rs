//! sprocket - multi-threaded HTTP/1.x server for synchronous applications
//!
//! Listener threads accept connections onto a shared queue served by a
//! dynamically sized pool of worker threads. Keep-alive connections that go
//! quiet between requests are parked with a monitor thread instead of
//! holding a worker, so the pool is sized by active work rather than by
//! open sockets.
//!
//! # Protocol Support
//!
//! - **HTTP/1.1**: persistent connections, chunked request and response bodies
//! - **HTTP/1.0**: `Connection: keep-alive` opt-in, close-delimited streamed bodies
//! - **TLS**: per interface, from PEM key and certificate files
//!
//! # Application contract
//!
//! An [`App`] receives the parsed [`Request`] and a [`StartResponse`]. It sets
//! the status and headers through `start_response` and returns a
//! [`ResponseBody`]. Nothing is written before the body yields its first
//! non-empty chunk, a body of one chunk is sent with `Content-Length`, longer
//! bodies are chunked.
//!
//! # Examples
//!
//! Quick start:
//! ```no_run
//! use sprocket::{body, AppError, Interface, Request, ResponseBody, Server, StartResponse};
//!
//! fn hello(
//!     _: &mut Request<'_>,
//!     start_response: &StartResponse,
//! ) -> Result<Box<dyn ResponseBody>, AppError> {
//!     start_response.start("200 OK", [("Content-Type", "text/plain")])?;
//!     Ok(body::full("Hello World!"))
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
//!         .app(hello)
//!         .build()
//!         .run()
//! }
//! ```
//! Streaming the request body back, with TLS on a second port:
//! ```no_run
//! use sprocket::{
//!     body, limits::{ConnLimits, PoolLimits}, AppError, Interface, Request, ResponseBody,
//!     Server, StartResponse,
//! };
//! use std::{io::Read, time::Duration};
//!
//! fn echo(
//!     req: &mut Request<'_>,
//!     start_response: &StartResponse,
//! ) -> Result<Box<dyn ResponseBody>, AppError> {
//!     let mut chunks = Vec::new();
//!     let mut buf = [0u8; 1024];
//!     loop {
//!         let read = req.body().read(&mut buf)?;
//!         if read == 0 {
//!             break;
//!         }
//!         chunks.push(buf[..read].to_vec());
//!     }
//!
//!     start_response.start("200 OK", [("Content-Type", "application/octet-stream")])?;
//!     Ok(body::chunks(chunks))
//! }
//!
//! fn main() -> std::io::Result<()> {
//!     Server::builder()
//!         .interface(Interface::plain("0.0.0.0:8080".parse().unwrap()))
//!         .interface(Interface::secure("0.0.0.0:8443".parse().unwrap(), "key.pem", "cert.pem"))
//!         .app(echo)
//!         .pool_limits(PoolLimits {
//!             min_threads: 4,
//!             max_threads: 64,
//!         })
//!         .connection_limits(ConnLimits {
//!             socket_read_timeout: Duration::from_secs(2),
//!             idle_timeout: Some(Duration::from_secs(60)),
//!         })
//!         .build()
//!         .run()
//! }
//! ```
//!
//! # Logging
//!
//! Diagnostics go through the [`log`](https://docs.rs/log) facade. One line
//! per request is logged at `info` level under the `sprocket::requests`
//! target:
//!
//! ```text
//! 127.0.0.1 - "GET /index.html HTTP/1.1" - 200 1024
//! ```

pub(crate) mod http {
    pub(crate) mod chunked;
    pub(crate) mod request;
    pub(crate) mod response;
    pub(crate) mod types;
}
pub(crate) mod server {
    pub(crate) mod connection;
    pub(crate) mod listener;
    pub(crate) mod monitor;
    pub(crate) mod server_impl;
    pub(crate) mod sys;
    pub(crate) mod threadpool;
    pub(crate) mod worker;
}
pub(crate) mod errors;
pub mod limits;

pub use crate::{
    errors::AppError,
    http::{
        chunked::ChunkedReader,
        request::{Request, RequestBody},
        response::{body, App, ResponseBody, StartResponse},
        types::{normalize_header_name, Headers, Method, Version},
    },
    server::{
        listener::{Interface, TlsFiles},
        server_impl::{Server, ServerBuilder, ServerHandle},
    },
};

#[doc(hidden)]
#[macro_export]
macro_rules! impt_default_app {
    ($name:ident) => {
        fn $name(
            _: &mut $crate::Request<'_>,
            start_response: &$crate::StartResponse,
        ) -> Result<Box<dyn $crate::ResponseBody>, $crate::AppError> {
            start_response.start("200 OK", [("Content-Type", "text/plain")])?;
            Ok($crate::body::full("Hello world!"))
        }
    };
}
