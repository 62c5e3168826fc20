use std::{error, fmt, io};

#[derive(Debug)]
pub(crate) enum ErrorKind {
    /// Read timed out before any byte of a request line arrived.
    SocketTimeout,
    /// Peer closed the connection between requests.
    SocketClosed,

    BadRequest,
    InvalidMethod,
    InvalidUrl,
    InvalidVersion,
    UnsupportedVersion,
    UriTooLong,

    InvalidHeader,
    TooManyHeaders,
    InvalidContentLength,

    App(AppError),
    /// The application panicked while serving the request.
    Panic,
    Io(IoError),
}

macro_rules! http_errors {
    ($($name:ident: $status_code:literal, $len:literal => $reason:literal; )*) => {
        /// Canned response for kinds answered by the server itself.
        pub(crate) const fn as_http(&self) -> Option<&'static [u8]> {
            match self {
                $(Self::$name { .. } => Some(concat!(
                    "HTTP/1.1 ", $status_code, "\r\n",
                    "Content-Length: ", $len, "\r\n",
                    "Content-Type: text/plain\r\n",
                    "Connection: close\r\n",
                    "\r\n",
                    $reason
                ).as_bytes()),)*
                _ => None,
            }
        }

        /// Status line reported in the access log.
        pub(crate) const fn status(&self) -> &'static str {
            match self {
                $(Self::$name { .. } => $status_code,)*
                Self::Io(_) => UTTER_FAILURE,
                _ => "",
            }
        }
    };
}

pub(crate) const UTTER_FAILURE: &str = "999 Utter Server Failure";

impl ErrorKind {
    http_errors! {
        BadRequest: "400 Bad Request", "11" => "Bad Request";
        InvalidMethod: "400 Bad Request", "11" => "Bad Request";
        InvalidUrl: "400 Bad Request", "11" => "Bad Request";
        InvalidVersion: "400 Bad Request", "11" => "Bad Request";
        UnsupportedVersion: "505 HTTP Version Not Supported", "26" => "HTTP Version Not Supported";
        UriTooLong: "414 URI Too Long", "12" => "URI Too Long";

        InvalidHeader: "400 Bad Request", "11" => "Bad Request";
        TooManyHeaders: "431 Request Header Fields Too Large", "31" => "Request Header Fields Too Large";
        InvalidContentLength: "400 Bad Request", "11" => "Bad Request";

        App: "500 Server Error", "12" => "Server Error";
        Panic: "500 Server Error", "12" => "Server Error";
    }

    #[inline]
    #[allow(dead_code)]
    pub(crate) fn is_bad_request(&self) -> bool {
        matches!(self.as_http(), Some(resp) if resp.starts_with(b"HTTP/1.1 4"))
    }
}

impl error::Error for ErrorKind {}
impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::App(err) => write!(f, "application error: {err}"),
            ErrorKind::Io(err) => write!(f, "socket error: {}", err.0),
            other => write!(f, "{:?}", other),
        }
    }
}

impl From<io::Error> for ErrorKind {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => ErrorKind::SocketClosed,
            _ => ErrorKind::Io(IoError(err)),
        }
    }
}
impl From<AppError> for ErrorKind {
    fn from(err: AppError) -> Self {
        ErrorKind::App(err)
    }
}

#[derive(Debug)]
pub(crate) struct IoError(pub(crate) io::Error);

impl IoError {
    /// Resets, aborts and timeouts in the middle of a request are closed quietly.
    #[inline]
    pub(crate) fn is_ignorable(&self) -> bool {
        matches!(
            self.0.kind(),
            io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::BrokenPipe
                | io::ErrorKind::TimedOut
                | io::ErrorKind::WouldBlock
                | io::ErrorKind::NotConnected
        )
    }
}

impl PartialEq for IoError {
    fn eq(&self, other: &Self) -> bool {
        self.0.kind() == other.0.kind()
    }
}

#[inline]
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Errors raised by an [`App`](crate::App) or by misuse of
/// [`StartResponse`](crate::StartResponse).
///
/// Any of these ends the current request with `500 Server Error` when no
/// response bytes were written yet, otherwise the connection is closed.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// `start_response` was called a second time without an error context.
    #[error("headers already set")]
    HeadersAlreadySet,
    /// The application reported an error after the response was committed.
    #[error("response already started: {0}")]
    HeadersSent(#[source] Box<dyn error::Error + Send + Sync>),
    /// A body chunk was produced before `start_response`.
    #[error("body chunk produced before start_response")]
    NotStarted,
    /// Status line is not `<3 digit code> <reason>`.
    #[error("invalid status line {0:?}")]
    InvalidStatus(String),
    /// Header name or value contains bytes that cannot go on the wire.
    #[error("invalid response header {0:?}")]
    InvalidHeader(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Other(Box<dyn error::Error + Send + Sync>),
}

impl AppError {
    /// Wraps any application error.
    pub fn other<E>(err: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync>>,
    {
        AppError::Other(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_lengths() {
        let kinds = [
            ErrorKind::BadRequest,
            ErrorKind::UnsupportedVersion,
            ErrorKind::UriTooLong,
            ErrorKind::TooManyHeaders,
            ErrorKind::App(AppError::NotStarted),
        ];

        for kind in kinds {
            let resp = std::str::from_utf8(kind.as_http().unwrap()).unwrap();
            let (head, body) = resp.split_once("\r\n\r\n").unwrap();
            let len = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .unwrap();

            assert_eq!(len.parse::<usize>().unwrap(), body.len(), "{resp}");
            assert!(head.starts_with(&format!("HTTP/1.1 {}", kind.status())));
        }
    }

    #[test]
    fn io_classification() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(ErrorKind::from(eof), ErrorKind::SocketClosed));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        match ErrorKind::from(reset) {
            ErrorKind::Io(err) => assert!(err.is_ignorable()),
            other => panic!("unexpected {other:?}"),
        }

        let other = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        match ErrorKind::from(other) {
            ErrorKind::Io(err) => assert!(!err.is_ignorable()),
            other => panic!("unexpected {other:?}"),
        }

        assert_eq!(ErrorKind::SocketTimeout.as_http(), None);
        assert_eq!(
            ErrorKind::Io(IoError(io::Error::other("x"))).status(),
            UTTER_FAILURE
        );
    }
}
