use crate::{
    errors::{is_timeout, ErrorKind},
    http::{
        chunked::ChunkedReader,
        types::{has_token, is_token, slice_to_usize, Headers, Method, Version},
    },
    limits::ReqLimits,
};
use percent_encoding::percent_decode_str;
use std::{
    io::{self, BufRead, Read},
    net::SocketAddr,
};

/// Normalized view of one HTTP request handed to an [`App`](crate::App).
///
/// The body borrows the connection, so a `Request` only lives while the
/// application is being called.
pub struct Request<'a> {
    method: Method,
    path: String,
    query_string: String,
    scheme: Option<String>,
    host: Option<String>,
    version: Version,

    headers: Headers,
    body: RequestBody<'a>,

    remote_addr: SocketAddr,
    server_port: u16,
    server_name: &'a str,
    is_https: bool,
}

impl<'a> Request<'a> {
    pub(crate) fn new(
        line: RequestLine,
        headers: Headers,
        peer: Peer<'a>,
        reader: &'a mut dyn BufRead,
    ) -> Result<Self, ErrorKind> {
        let body = RequestBody::new(&headers, reader)?;

        Ok(Self {
            method: line.method,
            path: line.path,
            query_string: line.query_string,
            scheme: line.scheme,
            host: line.host,
            version: line.version,

            headers,
            body,

            remote_addr: peer.remote_addr,
            server_port: peer.server_port,
            server_name: peer.server_name,
            is_https: peer.is_https,
        })
    }
}

// Public API
impl<'a> Request<'a> {
    #[inline]
    pub const fn method(&self) -> Method {
        self.method
    }

    /// Percent-decoded path. An encoded `/` (`%2F`) is kept as `%2F`.
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Raw query string without the leading `?`.
    #[inline]
    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    /// Scheme of an absolute request target, otherwise the connection's.
    #[inline]
    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(self.url_scheme())
    }

    /// `https` for TLS connections, `http` otherwise.
    #[inline]
    pub fn url_scheme(&self) -> &'static str {
        match self.is_https {
            true => "https",
            false => "http",
        }
    }

    /// Host of an absolute request target, otherwise the `Host` header.
    #[inline]
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref().or_else(|| self.headers.get("host"))
    }

    #[inline]
    pub const fn version(&self) -> Version {
        self.version
    }

    #[inline]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Header value by name, see [`Headers::get`].
    #[inline]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    #[inline]
    pub fn content_length(&self) -> Option<&str> {
        self.headers.get("content-length")
    }

    #[inline]
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type")
    }

    #[inline]
    pub fn body(&mut self) -> &mut RequestBody<'a> {
        &mut self.body
    }

    #[inline]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    #[inline]
    pub const fn remote_port(&self) -> u16 {
        self.remote_addr.port()
    }

    #[inline]
    pub const fn server_port(&self) -> u16 {
        self.server_port
    }

    #[inline]
    pub fn server_name(&self) -> &str {
        self.server_name
    }

    #[inline]
    pub const fn is_https(&self) -> bool {
        self.is_https
    }
}

/// Connection facts copied into each [`Request`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Peer<'a> {
    pub(crate) remote_addr: SocketAddr,
    pub(crate) server_port: u16,
    pub(crate) server_name: &'a str,
    pub(crate) is_https: bool,
}

/// Request body stream.
///
/// Chunked bodies are decoded; other bodies end after `Content-Length`
/// bytes (no bytes when the header is absent).
pub enum RequestBody<'a> {
    Chunked(ChunkedReader<&'a mut dyn BufRead>),
    Sized(io::Take<&'a mut dyn BufRead>),
}

impl<'a> RequestBody<'a> {
    fn new(headers: &Headers, reader: &'a mut dyn BufRead) -> Result<Self, ErrorKind> {
        if headers
            .get("transfer-encoding")
            .is_some_and(|value| has_token(value, "chunked"))
        {
            return Ok(RequestBody::Chunked(ChunkedReader::new(reader)));
        }

        let len = match headers.get("content-length") {
            Some(value) => slice_to_usize(value.trim().as_bytes())
                .ok_or(ErrorKind::InvalidContentLength)?,
            None => 0,
        };

        Ok(RequestBody::Sized(reader.take(len as u64)))
    }

    /// Reads one line, newline included. Returns `0` at end of body.
    pub fn read_line(&mut self, buf: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            RequestBody::Chunked(reader) => reader.read_line(buf),
            RequestBody::Sized(reader) => reader.read_until(b'\n', buf),
        }
    }

    /// Discards what the application left unread.
    ///
    /// Returns `false` if more than `max` bytes were left or the chunked
    /// framing was broken, the connection cannot be reused then.
    pub(crate) fn drain(&mut self, max: usize) -> io::Result<bool> {
        let mut sink = [0u8; 4096];
        let mut total = 0;

        loop {
            let read = self.read(&mut sink)?;
            if read == 0 {
                return Ok(match self {
                    RequestBody::Chunked(reader) => !reader.is_malformed(),
                    RequestBody::Sized(_) => true,
                });
            }

            total += read;
            if total > max {
                return Ok(false);
            }
        }
    }
}

impl Read for RequestBody<'_> {
    #[inline]
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            RequestBody::Chunked(reader) => reader.read(buf),
            RequestBody::Sized(reader) => reader.read(buf),
        }
    }
}

// Parsing

pub(crate) enum Line {
    Complete,
    Eof,
    TooLong,
}

/// Appends bytes up to and including `\n` to `buf`, never more than `max`.
pub(crate) fn read_line<R: BufRead + ?Sized>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<Line> {
    loop {
        let available = match reader.fill_buf() {
            Ok(available) => available,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        };

        if available.is_empty() {
            return Ok(Line::Eof);
        }

        let (complete, used) = match memchr::memchr(b'\n', available) {
            Some(index) => (true, index + 1),
            None => (false, available.len()),
        };

        if buf.len() + used > max {
            return Ok(Line::TooLong);
        }

        buf.extend_from_slice(&available[..used]);
        reader.consume(used);

        if complete {
            return Ok(Line::Complete);
        }
    }
}

/// Reads the request line, tolerating one empty line before it.
pub(crate) fn read_request_line<R: BufRead + ?Sized>(
    reader: &mut R,
    limits: &ReqLimits,
) -> Result<String, ErrorKind> {
    let mut line = Vec::new();
    let mut blank_seen = false;

    loop {
        line.clear();

        let state = match read_line(reader, &mut line, limits.request_line_size) {
            Ok(state) => state,
            Err(err) if is_timeout(&err) && line.is_empty() => {
                return Err(ErrorKind::SocketTimeout)
            }
            Err(err) => return Err(err.into()),
        };

        match state {
            Line::Complete => {}
            Line::Eof => return Err(ErrorKind::SocketClosed),
            Line::TooLong => return Err(ErrorKind::UriTooLong),
        }

        let trimmed = line.trim_ascii();
        if trimmed.is_empty() {
            if blank_seen {
                log::debug!("Client did not send a recognizable request.");
                return Err(ErrorKind::SocketClosed);
            }

            log::debug!("Client sent newline");
            blank_seen = true;
            continue;
        }

        return simdutf8::basic::from_utf8(trimmed)
            .map(str::to_string)
            .map_err(|_| ErrorKind::BadRequest);
    }
}

#[derive(Debug, PartialEq)]
pub(crate) struct RequestLine {
    pub(crate) method: Method,
    pub(crate) path: String,
    pub(crate) query_string: String,
    pub(crate) scheme: Option<String>,
    pub(crate) host: Option<String>,
    pub(crate) version: Version,
}

pub(crate) fn parse_request_line(line: &str) -> Result<RequestLine, ErrorKind> {
    let mut parts = line.split(' ');

    let (Some(method), Some(target), Some(protocol), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(ErrorKind::BadRequest);
    };

    if !protocol.starts_with("HTTP/") {
        return Err(ErrorKind::BadRequest);
    }
    let version = Version::from_bytes(protocol.as_bytes())?;
    let method = Method::from_bytes(method.as_bytes())?;

    let (scheme, host, path) = if target == "*" || target.starts_with('/') {
        (None, None, target.to_string())
    } else if let Some((scheme, rest)) = target.split_once("://") {
        if !is_token(scheme) {
            return Err(ErrorKind::InvalidUrl);
        }

        let (host, path) = match memchr::memchr2(b'/', b'?', rest.as_bytes()) {
            Some(index) => rest.split_at(index),
            None => (rest, ""),
        };
        if host.is_empty() {
            return Err(ErrorKind::InvalidUrl);
        }

        let path = match path.starts_with('/') {
            true => path.to_string(),
            false => format!("/{path}"),
        };
        (Some(scheme.to_ascii_lowercase()), Some(host.to_string()), path)
    } else {
        return Err(ErrorKind::InvalidUrl);
    };

    let (path, query_string) = match path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (path.as_str(), ""),
    };

    Ok(RequestLine {
        method,
        path: decode_path(path),
        query_string: query_string.to_string(),
        scheme,
        host,
        version,
    })
}

/// Percent-decodes `path` segment by segment around every `%2F`.
fn decode_path(path: &str) -> String {
    let bytes = path.as_bytes();
    let mut result = String::with_capacity(path.len());
    let mut start = 0;

    for index in memchr::memchr_iter(b'%', bytes) {
        if index < start {
            continue;
        }

        if bytes[index + 1..].len() >= 2 && bytes[index + 1..index + 3].eq_ignore_ascii_case(b"2F")
        {
            result.push_str(&percent_decode_str(&path[start..index]).decode_utf8_lossy());
            result.push_str("%2F");
            start = index + 3;
        }
    }

    result.push_str(&percent_decode_str(&path[start..]).decode_utf8_lossy());
    result
}

/// Reads header lines up to the empty line ending the request head.
pub(crate) fn read_headers<R: BufRead + ?Sized>(
    reader: &mut R,
    limits: &ReqLimits,
) -> Result<Headers, ErrorKind> {
    let mut headers = Headers::default();
    let mut line = Vec::new();
    let mut count = 0;
    let mut skipping = false;

    loop {
        line.clear();

        match read_line(reader, &mut line, limits.header_line_size)? {
            Line::Complete => {}
            Line::Eof => return Err(ErrorKind::SocketClosed),
            Line::TooLong => return Err(ErrorKind::TooManyHeaders),
        }

        let raw = line.strip_suffix(b"\n").unwrap_or(&line);
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        if raw.is_empty() {
            return Ok(headers);
        }

        count += 1;
        if count > limits.header_count {
            return Err(ErrorKind::TooManyHeaders);
        }

        let Ok(text) = simdutf8::basic::from_utf8(raw) else {
            log::warn!(
                "Client sent invalid header: {:?}",
                String::from_utf8_lossy(raw)
            );
            skipping = true;
            continue;
        };

        if text.starts_with([' ', '\t']) {
            if skipping {
                continue;
            }
            if !headers.fold(text.trim()) {
                return Err(ErrorKind::InvalidHeader);
            }
            continue;
        }
        skipping = false;

        let Some((name, value)) = text.split_once(':') else {
            return Err(ErrorKind::InvalidHeader);
        };
        if !is_token(name) {
            return Err(ErrorKind::InvalidHeader);
        }

        headers.append(name, value.trim());
    }
}
