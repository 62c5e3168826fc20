//! Application contract and response serialization.

use crate::{
    errors::{AppError, ErrorKind},
    http::{
        request::Request,
        types::{has_token, is_token, Headers, Method, Version},
    },
};
use std::{
    cell::RefCell,
    error,
    io::{self, Write},
    rc::Rc,
    time::SystemTime,
};

/// A request handler run by the worker threads.
///
/// The application sets the status and headers through `start_response`
/// and returns the body. Nothing is written to the client until the body
/// yields its first non-empty chunk or ends, so `start_response` may also be
/// called from inside a lazily produced body.
///
/// Any `Fn(&mut Request, &StartResponse) -> Result<Box<dyn ResponseBody>, AppError>`
/// is an application.
///
/// # Examples
///
/// ```
/// use sprocket::{body, AppError, Request, ResponseBody, StartResponse};
///
/// fn hello(
///     req: &mut Request<'_>,
///     start_response: &StartResponse,
/// ) -> Result<Box<dyn ResponseBody>, AppError> {
///     start_response.start("200 OK", [("Content-Type", "text/plain")])?;
///     Ok(body::full(format!("Hello, {}!", req.path())))
/// }
/// ```
pub trait App
where
    Self: Send + Sync + 'static,
{
    /// Handles one request.
    ///
    /// # Errors
    ///
    /// An error before the response started is answered with
    /// `500 Server Error`; afterwards the connection is closed.
    fn call(
        &self,
        request: &mut Request<'_>,
        start_response: &StartResponse,
    ) -> Result<Box<dyn ResponseBody>, AppError>;
}

impl<F> App for F
where
    F: Fn(&mut Request<'_>, &StartResponse) -> Result<Box<dyn ResponseBody>, AppError>
        + Send
        + Sync
        + 'static,
{
    #[inline]
    fn call(
        &self,
        request: &mut Request<'_>,
        start_response: &StartResponse,
    ) -> Result<Box<dyn ResponseBody>, AppError> {
        self(request, start_response)
    }
}

/// Sets the status line and headers of the current response.
///
/// Cheap to clone; clones refer to the same response.
#[derive(Debug, Clone, Default)]
pub struct StartResponse {
    head: Rc<RefCell<Head>>,
}

#[derive(Debug, Default)]
struct Head {
    status: Option<String>,
    headers: Vec<(String, String)>,
    sent: bool,
}

impl StartResponse {
    #[inline]
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Stores the status (`"<code> <reason>"`) and headers.
    ///
    /// # Errors
    ///
    /// [`AppError::HeadersAlreadySet`] on a second call, or a validation
    /// error for a malformed status or header.
    pub fn start<I, K, V>(&self, status: &str, headers: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut head = self.head.borrow_mut();
        if head.status.is_some() {
            return Err(AppError::HeadersAlreadySet);
        }
        head.set(status, headers)
    }

    /// Replaces the status and headers after the application caught `error`.
    ///
    /// # Errors
    ///
    /// When the headers already went out, `error` comes back as
    /// [`AppError::HeadersSent`] and should be returned from the application.
    pub fn start_with_error<I, K, V, E>(
        &self,
        status: &str,
        headers: I,
        error: E,
    ) -> Result<(), AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        let mut head = self.head.borrow_mut();
        if head.sent {
            return Err(AppError::HeadersSent(error.into()));
        }
        head.set(status, headers)
    }

    /// `true` once the status line is on the wire.
    #[inline]
    pub fn headers_sent(&self) -> bool {
        self.head.borrow().sent
    }

    #[inline]
    pub fn status(&self) -> Option<String> {
        self.head.borrow().status.clone()
    }
}

impl Head {
    fn set<I, K, V>(&mut self, status: &str, headers: I) -> Result<(), AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let status = status.trim();
        if status_code(status).is_none() || status.contains(['\r', '\n']) {
            return Err(AppError::InvalidStatus(status.to_string()));
        }

        let mut list = Vec::new();
        for (name, value) in headers {
            let (name, value): (String, String) = (name.into(), value.into());
            let (name, value) = (name.trim(), value.trim());

            if !is_token(name) || value.contains(['\r', '\n']) {
                return Err(AppError::InvalidHeader(name.to_string()));
            }
            list.push((name.to_string(), value.to_string()));
        }

        self.status = Some(status.to_string());
        self.headers = list;
        Ok(())
    }
}

#[inline]
fn status_code(status: &str) -> Option<u16> {
    let (code, reason) = status.split_once(' ')?;
    if code.len() != 3 || !code.bytes().all(|b| b.is_ascii_digit()) || reason.trim().is_empty() {
        return None;
    }
    code.parse().ok()
}

/// Response body produced by an [`App`].
pub trait ResponseBody {
    /// Next body chunk, `None` at the end. Empty chunks are skipped.
    fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AppError>;

    /// Runs once after the response, whether it succeeded or not.
    fn close(&mut self) {}
}

/// Ready-made [`ResponseBody`] implementations.
pub mod body {
    use super::ResponseBody;
    use crate::errors::AppError;
    use std::collections::VecDeque;

    /// Body without content.
    #[inline]
    pub fn empty() -> Box<dyn ResponseBody> {
        Box::new(Chunks(VecDeque::new()))
    }

    /// Body of exactly one chunk, sent with `Content-Length`.
    #[inline]
    pub fn full<T: Into<Vec<u8>>>(data: T) -> Box<dyn ResponseBody> {
        Box::new(Chunks(VecDeque::from([data.into()])))
    }

    /// Body of several chunks known in advance.
    pub fn chunks<I, T>(chunks: I) -> Box<dyn ResponseBody>
    where
        I: IntoIterator<Item = T>,
        T: Into<Vec<u8>>,
    {
        Box::new(Chunks(chunks.into_iter().map(Into::into).collect()))
    }

    /// Lazily produced body.
    #[inline]
    pub fn stream<I>(iter: I) -> Box<dyn ResponseBody>
    where
        I: Iterator<Item = Result<Vec<u8>, AppError>> + 'static,
    {
        Box::new(Stream(iter))
    }

    /// Runs `hook` when the server is done with `body`.
    #[inline]
    pub fn on_close<F>(body: Box<dyn ResponseBody>, hook: F) -> Box<dyn ResponseBody>
    where
        F: FnOnce() + 'static,
    {
        Box::new(OnClose {
            inner: body,
            hook: Some(hook),
        })
    }

    pub struct Chunks(VecDeque<Vec<u8>>);

    impl ResponseBody for Chunks {
        #[inline]
        fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AppError> {
            Ok(self.0.pop_front())
        }
    }

    pub struct Stream<I>(I);

    impl<I> ResponseBody for Stream<I>
    where
        I: Iterator<Item = Result<Vec<u8>, AppError>>,
    {
        #[inline]
        fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AppError> {
            self.0.next().transpose()
        }
    }

    pub struct OnClose<F: FnOnce()> {
        inner: Box<dyn ResponseBody>,
        hook: Option<F>,
    }

    impl<F: FnOnce()> ResponseBody for OnClose<F> {
        #[inline]
        fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, AppError> {
            self.inner.next_chunk()
        }

        fn close(&mut self) {
            self.inner.close();
            if let Some(hook) = self.hook.take() {
                hook();
            }
        }
    }
}

// Serialization

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum ClientConnection {
    Close,
    KeepAlive,
    Unspecified,
}

/// Request facts that shape the response.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ResponseContext {
    pub(crate) version: Version,
    pub(crate) is_head: bool,
    pub(crate) client: ClientConnection,
}

impl ResponseContext {
    pub(crate) fn new(method: Method, version: Version, headers: &Headers) -> Self {
        let client = match headers.get("connection") {
            Some(value) if has_token(value, "close") => ClientConnection::Close,
            Some(value) if has_token(value, "keep-alive") => ClientConnection::KeepAlive,
            _ => ClientConnection::Unspecified,
        };

        Self {
            version,
            is_head: method == Method::Head,
            client,
        }
    }
}

pub(crate) struct ResponseWriter<'a, W: Write + ?Sized> {
    out: &'a mut W,
    ctx: ResponseContext,
    start: &'a StartResponse,
    server_software: &'a str,

    pub(crate) status: String,
    pub(crate) size: usize,
    pub(crate) chunked: bool,
    pub(crate) close_connection: bool,
    force_close: bool,
    bodyless: bool,
}

impl<'a, W: Write + ?Sized> ResponseWriter<'a, W> {
    pub(crate) fn new(
        out: &'a mut W,
        ctx: ResponseContext,
        start: &'a StartResponse,
        server_software: &'a str,
    ) -> Self {
        Self {
            out,
            ctx,
            start,
            server_software,

            status: String::new(),
            size: 0,
            chunked: false,
            close_connection: true,
            force_close: false,
            bodyless: false,
        }
    }

    /// Answers with `Connection: close` whatever both sides asked for.
    #[inline]
    pub(crate) fn force_close(&mut self) {
        self.force_close = true;
    }

    /// Writes the whole response.
    ///
    /// One chunk of the body is read ahead: a body that ends after its
    /// first chunk gets a `Content-Length`, longer ones are chunked.
    pub(crate) fn write_body(&mut self, body: &mut dyn ResponseBody) -> Result<(), ErrorKind> {
        let Some(first) = next_non_empty(body)? else {
            return self.send_headers(Some(0));
        };

        match next_non_empty(body)? {
            None => {
                self.send_headers(Some(first.len()))?;
                self.write_chunk(&first)?;
            }
            Some(second) => {
                self.send_headers(None)?;
                self.write_chunk(&first)?;
                self.write_chunk(&second)?;

                while let Some(chunk) = next_non_empty(body)? {
                    self.write_chunk(&chunk)?;
                }
            }
        }

        self.finish()?;
        Ok(())
    }

    fn send_headers(&mut self, known_len: Option<usize>) -> Result<(), ErrorKind> {
        let (status, mut headers) = {
            let mut head = self.start.head.borrow_mut();
            let Some(status) = head.status.clone() else {
                return Err(AppError::NotStarted.into());
            };
            head.sent = true;
            (status, std::mem::take(&mut head.headers))
        };

        let has = |headers: &[(String, String)], name: &str| {
            headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
        };

        let app_chunked = headers.iter().any(|(k, v)| {
            k.eq_ignore_ascii_case("transfer-encoding") && has_token(v, "chunked")
        });
        let app_close = headers
            .iter()
            .any(|(k, v)| k.eq_ignore_ascii_case("connection") && has_token(v, "close"));
        headers.retain(|(k, _)| !k.eq_ignore_ascii_case("connection"));

        if !has(&headers, "date") {
            headers.push(("Date".into(), httpdate::fmt_http_date(SystemTime::now())));
        }
        if !has(&headers, "server") {
            headers.push(("Server".into(), self.server_software.to_string()));
        }

        let code = status_code(&status).unwrap_or(500);
        self.bodyless = matches!(code, 100..=199 | 204 | 205 | 304);
        self.chunked = app_chunked && !self.bodyless;

        if !self.bodyless && !app_chunked && !has(&headers, "content-length") {
            match known_len {
                Some(len) => headers.push(("Content-Length".into(), len.to_string())),
                None if self.ctx.version == Version::Http11 => {
                    log::debug!("Adding header...Transfer-Encoding: chunked");
                    headers.push(("Transfer-Encoding".into(), "chunked".into()));
                    self.chunked = true;
                }
                None => self.force_close = true,
            }
        }

        self.close_connection = self.force_close
            || app_close
            || match self.ctx.client {
                ClientConnection::Close => true,
                ClientConnection::KeepAlive => false,
                ClientConnection::Unspecified => self.ctx.version == Version::Http10,
            };
        headers.push((
            "Connection".into(),
            match self.close_connection {
                true => "close".into(),
                false => "keep-alive".into(),
            },
        ));

        let mut head = Vec::with_capacity(256);
        write!(head, "HTTP/1.1 {status}\r\n")?;
        for (name, value) in &headers {
            write!(head, "{name}: {value}\r\n")?;
        }
        head.extend_from_slice(b"\r\n");

        log::debug!("Sending Headers: {:?}", String::from_utf8_lossy(&head));
        self.status = status;
        self.out.write_all(&head)?;
        Ok(())
    }

    fn write_chunk(&mut self, data: &[u8]) -> io::Result<()> {
        if self.ctx.is_head || self.bodyless {
            return Ok(());
        }

        if self.chunked {
            let mut framed = Vec::with_capacity(data.len() + 12);
            write!(framed, "{:x}\r\n", data.len())?;
            framed.extend_from_slice(data);
            framed.extend_from_slice(b"\r\n");
            self.out.write_all(&framed)?;
        } else {
            self.out.write_all(data)?;
        }

        self.size += data.len();
        Ok(())
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.chunked && !self.ctx.is_head {
            self.out.write_all(b"0\r\n\r\n")?;
        }
        Ok(())
    }
}

#[inline]
fn next_non_empty(body: &mut dyn ResponseBody) -> Result<Option<Vec<u8>>, AppError> {
    loop {
        match body.next_chunk()? {
            Some(chunk) if chunk.is_empty() => continue,
            other => return Ok(other),
        }
    }
}


#[cfg(test)]
mod body_tests {
    use super::*;
    use std::cell::Cell;

    fn run(ctx: ResponseContext, start: &StartResponse, body: &mut dyn ResponseBody) -> String {
        let mut out = Vec::new();
        ResponseWriter::new(&mut out, ctx, start, "Sprocket Test")
            .write_body(body)
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    fn get() -> ResponseContext {
        ResponseContext::new(Method::Get, Version::Http11, &Headers::default())
    }

    #[test]
    fn single_chunk_gets_length() {
        let start = StartResponse::new();
        start.start("200 OK", [("Content-Type", "text/plain")]).unwrap();

        let out = run(get(), &start, &mut *body::chunks(["", "hello", ""]));

        assert!(out.starts_with("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.contains("Date: "));
        assert!(out.contains("Server: Sprocket Test\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn app_headers_win() {
        let start = StartResponse::new();
        start
            .start("200 OK", [("Server", "custom"), ("Date", "yesterday")])
            .unwrap();

        let out = run(get(), &start, &mut *body::full("x"));

        assert!(out.contains("Server: custom\r\n"));
        assert!(out.contains("Date: yesterday\r\n"));
        assert_eq!(out.matches("Server:").count(), 1);
    }

    #[test]
    fn empty_body_flushes_headers() {
        let start = StartResponse::new();
        start.start("200 OK", Vec::<(String, String)>::new()).unwrap();

        let out = run(get(), &start, &mut *body::empty());

        assert!(out.contains("Content-Length: 0\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
        assert!(start.headers_sent());
    }

    #[test]
    fn head_suppresses_body() {
        let head = ResponseContext::new(Method::Head, Version::Http11, &Headers::default());

        let start = StartResponse::new();
        start.start("200 OK", [("Content-Type", "text/plain")]).unwrap();
        let out = run(head, &start, &mut *body::full("hello"));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\n"));

        let start = StartResponse::new();
        start.start("200 OK", [("Content-Type", "text/plain")]).unwrap();
        let out = run(head, &start, &mut *body::chunks(["a", "b"]));
        assert!(out.contains("Transfer-Encoding: chunked\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn bodyless_status() {
        let start = StartResponse::new();
        start.start("304 Not Modified", [("ETag", "\"v1\"")]).unwrap();

        let out = run(get(), &start, &mut *body::empty());

        assert!(!out.contains("Content-Length"));
        assert!(!out.contains("Transfer-Encoding"));
    }

    #[test]
    fn app_declared_chunked() {
        let start = StartResponse::new();
        start.start("200 OK", [("Transfer-Encoding", "chunked")]).unwrap();

        let out = run(get(), &start, &mut *body::full("hello"));

        assert!(!out.contains("Content-Length"));
        assert!(out.ends_with("\r\n\r\n5\r\nhello\r\n0\r\n\r\n"), "{out}");
    }

    #[test]
    fn start_inside_lazy_body() {
        let start = StartResponse::new();
        let inner = start.clone();
        let mut sent = false;

        let mut body = body::stream(std::iter::from_fn(move || {
            if sent {
                return None;
            }
            sent = true;
            Some(
                inner
                    .start("201 Created", [("X-Late", "yes")])
                    .map(|()| b"made".to_vec()),
            )
        }));

        assert!(!start.headers_sent());
        let out = run(get(), &start, &mut *body);

        assert!(out.starts_with("HTTP/1.1 201 Created\r\nX-Late: yes\r\n"));
        assert!(out.ends_with("made"));
    }

    #[test]
    fn start_response_contract() {
        let start = StartResponse::new();
        start.start("200 OK", [("A", "1")]).unwrap();

        assert!(matches!(
            start.start("500 Oops", [("A", "1")]),
            Err(AppError::HeadersAlreadySet)
        ));

        start
            .start_with_error("500 Server Error", [("A", "2")], "caught")
            .unwrap();
        assert_eq!(start.status().as_deref(), Some("500 Server Error"));

        let out = run(get(), &start, &mut *body::full("x"));
        assert!(out.starts_with("HTTP/1.1 500 Server Error\r\nA: 2\r\n"));

        match start.start_with_error("500 Server Error", [("A", "3")], "late") {
            Err(AppError::HeadersSent(err)) => assert_eq!(err.to_string(), "late"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn start_response_validation() {
        #[rustfmt::skip]
        let statuses = ["OK", "20 OK", "200", "2000 OK", "abc OK", "200 OK\r\nX: y"];
        for status in statuses {
            let start = StartResponse::new();
            assert!(
                matches!(
                    start.start(status, Vec::<(String, String)>::new()),
                    Err(AppError::InvalidStatus(_))
                ),
                "{status:?}"
            );
        }

        let start = StartResponse::new();
        assert!(matches!(
            start.start("200 OK", [("Bad Name", "x")]),
            Err(AppError::InvalidHeader(_))
        ));
        assert!(matches!(
            start.start("200 OK", [("X-Split", "a\r\nInjected: 1")]),
            Err(AppError::InvalidHeader(_))
        ));
    }

    #[test]
    fn body_before_start() {
        let start = StartResponse::new();
        let mut out = Vec::new();
        let result = ResponseWriter::new(&mut out, get(), &start, "Sprocket Test")
            .write_body(&mut *body::full("x"));

        assert!(matches!(result, Err(ErrorKind::App(AppError::NotStarted))));
        assert!(out.is_empty());
    }

    #[test]
    fn close_hook() {
        let closed = Rc::new(Cell::new(false));
        let flag = closed.clone();

        let mut body = body::on_close(body::full("x"), move || flag.set(true));
        assert!(!closed.get());
        body.close();
        assert!(closed.get());
    }
}
