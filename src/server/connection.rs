use rustls::{ServerConnection, StreamOwned};
use std::{
    fmt,
    io::{self, BufRead, BufReader, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::fd::{AsRawFd, RawFd},
    time::{Duration, Instant},
};

/// Longest a closing connection may block on its final flush.
pub(crate) const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Byte stream a connection is served over.
///
/// Both the plain socket and the TLS session expose the TCP socket below
/// them, which is what timeouts, readiness polls and shutdowns act on.
pub(crate) trait Transport: Read + Write + Send {
    fn tcp(&self) -> &TcpStream;

    #[inline]
    fn is_tls(&self) -> bool {
        false
    }

    /// Queues the TLS `close_notify` alert; nothing for plain sockets.
    #[inline]
    fn close_notify(&mut self) {}
}

impl Transport for TcpStream {
    #[inline]
    fn tcp(&self) -> &TcpStream {
        self
    }
}

impl Transport for StreamOwned<ServerConnection, TcpStream> {
    #[inline]
    fn tcp(&self) -> &TcpStream {
        &self.sock
    }

    #[inline]
    fn is_tls(&self) -> bool {
        true
    }

    #[inline]
    fn close_notify(&mut self) {
        self.conn.send_close_notify();
    }
}

/// Socket fresh from `accept`, before a worker wraps it.
pub(crate) struct Accepted {
    pub(crate) stream: Box<dyn Transport>,
    pub(crate) client_addr: SocketAddr,
    pub(crate) server_port: u16,
    /// The listener was configured for TLS.
    pub(crate) secure: bool,
}

impl Accepted {
    #[inline]
    pub(crate) fn new(
        stream: Box<dyn Transport>,
        client_addr: SocketAddr,
        server_port: u16,
        secure: bool,
    ) -> Self {
        Self {
            stream,
            client_addr,
            server_port,
            secure,
        }
    }

    #[inline]
    pub(crate) fn close(self) {
        let _ = self.stream.tcp().shutdown(Shutdown::Both);
    }
}

/// Work item of the active queue.
pub(crate) enum Message {
    Accepted(Accepted),
    Resumed(Connection),
    Stop,
}

impl Message {
    /// Releases the socket carried by the message, if any.
    #[inline]
    pub(crate) fn close(self) {
        match self {
            Message::Accepted(accepted) => accepted.close(),
            Message::Resumed(conn) => conn.close(),
            Message::Stop => {}
        }
    }
}

/// A client connection between two requests.
///
/// Owned by exactly one of: a worker, the monitor or a queue.
pub(crate) struct Connection {
    stream: BufReader<Box<dyn Transport>>,

    pub(crate) client_addr: SocketAddr,
    pub(crate) server_port: u16,
    pub(crate) secure: bool,
    start_time: Instant,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_addr", &self.client_addr)
            .field("server_port", &self.server_port)
            .field("secure", &self.secure)
            .field("tls", &self.is_tls())
            .finish()
    }
}

impl Connection {
    /// Wraps an accepted socket; reads block for at most `read_timeout`.
    pub(crate) fn new(accepted: Accepted, read_timeout: Duration) -> io::Result<Self> {
        accepted.stream.tcp().set_read_timeout(Some(read_timeout))?;

        Ok(Self {
            stream: BufReader::new(accepted.stream),

            client_addr: accepted.client_addr,
            server_port: accepted.server_port,
            secure: accepted.secure,
            start_time: Instant::now(),
        })
    }

    #[inline]
    pub(crate) fn is_tls(&self) -> bool {
        self.stream.get_ref().is_tls()
    }

    #[inline]
    pub(crate) fn fd(&self) -> RawFd {
        self.stream.get_ref().tcp().as_raw_fd()
    }

    /// Handle that can shut the socket down from another thread.
    #[inline]
    pub(crate) fn shutdown_handle(&self) -> io::Result<ShutdownHandle> {
        self.stream.get_ref().tcp().try_clone().map(ShutdownHandle)
    }

    #[inline]
    pub(crate) fn reader(&mut self) -> &mut dyn BufRead {
        &mut self.stream
    }

    /// Restarts the idle clock.
    #[inline]
    pub(crate) fn touch(&mut self) {
        self.start_time = Instant::now();
    }

    #[inline]
    pub(crate) fn idle_for(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Sends `close_notify` on TLS, flushes and shuts the socket down.
    ///
    /// The flush gives up after [`CLOSE_TIMEOUT`] on a peer that stopped reading.
    pub(crate) fn close(self) {
        let mut stream = self.stream.into_inner();

        let _ = stream.tcp().set_write_timeout(Some(CLOSE_TIMEOUT));
        stream.close_notify();
        let _ = stream.flush();
        let _ = stream.tcp().shutdown(Shutdown::Both);
    }
}

impl Write for Connection {
    #[inline]
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.get_mut().write(buf)
    }

    #[inline]
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.stream.get_mut().write_all(buf)
    }

    #[inline]
    fn flush(&mut self) -> io::Result<()> {
        self.stream.get_mut().flush()
    }
}

/// Clone of a connection's socket used to abort a blocked read.
pub(crate) struct ShutdownHandle(TcpStream);

impl ShutdownHandle {
    #[inline]
    pub(crate) fn kill(&self) {
        let _ = self.0.shutdown(Shutdown::Both);
    }
}
