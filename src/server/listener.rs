use crate::{
    errors::is_timeout,
    server::{
        connection::{Accepted, Message, Transport},
        sys,
    },
};
use crossbeam::channel::{SendError, Sender};
use rustls::{ServerConfig, ServerConnection, StreamOwned};
use socket2::{Domain, Protocol, Socket, Type};
use std::{
    fs::File,
    io::{self, BufReader},
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// PEM files of a TLS interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
}

/// Address the server listens on, optionally with TLS.
///
/// # Examples
///
/// ```
/// use sprocket::Interface;
///
/// let http = Interface::plain("0.0.0.0:80".parse().unwrap());
/// let https = Interface::secure("0.0.0.0:443".parse().unwrap(), "key.pem", "cert.pem");
///
/// assert!(http.tls.is_none());
/// assert!(https.tls.is_some());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub addr: SocketAddr,
    pub tls: Option<TlsFiles>,
}

impl Interface {
    #[inline]
    pub fn plain(addr: SocketAddr) -> Self {
        Self { addr, tls: None }
    }

    #[inline]
    pub fn secure<K, C>(addr: SocketAddr, key_file: K, cert_file: C) -> Self
    where
        K: Into<PathBuf>,
        C: Into<PathBuf>,
    {
        Self {
            addr,
            tls: Some(TlsFiles {
                key_file: key_file.into(),
                cert_file: cert_file.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListenerState {
    Init,
    Ready,
    Running,
    Stopped,
}

/// Accepts connections on one interface and feeds the active queue.
pub(crate) struct Listener {
    addr: SocketAddr,
    socket: Option<TcpListener>,
    tls: Option<Arc<ServerConfig>>,

    active_tx: Sender<Message>,
    poll_interval: Duration,

    state: ListenerState,
    ready: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Listener {
    /// Binds `interface`. Failures are logged and leave the listener
    /// out of the `Ready` state.
    pub(crate) fn new(
        interface: &Interface,
        active_tx: Sender<Message>,
        poll_interval: Duration,
        backlog: i32,
    ) -> Self {
        let mut listener = Self {
            addr: interface.addr,
            socket: None,
            tls: None,

            active_tx,
            poll_interval,

            state: ListenerState::Init,
            ready: Arc::new(AtomicBool::new(false)),
            thread: None,
        };

        if let Some(files) = &interface.tls {
            match load_tls_config(files, interface.addr) {
                Ok(config) => listener.tls = Some(config),
                Err(err) => {
                    log::error!("{err}");
                    return listener;
                }
            }
        }

        match bind(interface.addr, backlog) {
            Ok(socket) => {
                if let Ok(addr) = socket.local_addr() {
                    listener.addr = addr;
                }
                listener.socket = Some(socket);
                listener.state = ListenerState::Ready;
                listener.ready.store(true, Ordering::SeqCst);
            }
            Err(err) => log::error!("Cannot bind to {}: {err}", interface.addr),
        }

        listener
    }

    #[inline]
    pub(crate) fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    #[inline]
    #[allow(dead_code)]
    pub(crate) fn state(&self) -> ListenerState {
        self.state
    }

    /// Bound address; the requested one until the bind succeeded.
    #[inline]
    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub(crate) fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    pub(crate) fn start(&mut self) -> io::Result<()> {
        let Some(socket) = self.socket.take().filter(|_| self.state == ListenerState::Ready)
        else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("listener on {} is not ready", self.addr),
            ));
        };

        let accept = AcceptLoop {
            socket,
            tls: self.tls.clone(),
            port: self.addr.port(),
            active_tx: self.active_tx.clone(),
            poll_interval: self.poll_interval,
            ready: self.ready.clone(),
        };

        self.thread = Some(
            thread::Builder::new()
                .name(format!("sprocket-listener-{}", self.addr.port()))
                .spawn(move || accept.run())?,
        );
        self.state = ListenerState::Running;
        Ok(())
    }

    /// Ends the accept loop within one poll interval and joins it.
    pub(crate) fn stop(&mut self) {
        self.ready.store(false, Ordering::SeqCst);
        self.socket = None;

        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Listener thread on {} panicked", self.addr);
            }
        }
        self.state = ListenerState::Stopped;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn bind(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    if let Err(err) = socket.set_reuse_address(true) {
        log::warn!("Cannot set SO_REUSEADDR on {addr}: {err}");
    }
    if let Err(err) = socket.set_tcp_nodelay(true) {
        log::warn!("Cannot disable Nagle's algorithm on {addr}: {err}");
    }

    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;

    Ok(socket.into())
}

fn load_tls_config(files: &TlsFiles, addr: SocketAddr) -> Result<Arc<ServerConfig>, String> {
    for (kind, path) in [("key", &files.key_file), ("certificate", &files.cert_file)] {
        if !path.exists() {
            return Err(format!(
                "Cannot find {kind} file '{}'. Cannot bind to {addr}.",
                path.display()
            ));
        }
    }

    let certs = open(&files.cert_file)
        .and_then(|mut reader| rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>())
        .map_err(|err| format!("Failed to parse certificate for {addr}: {err}"))?;

    let key = open(&files.key_file)
        .and_then(|mut reader| rustls_pemfile::private_key(&mut reader))
        .map_err(|err| format!("Failed to parse key for {addr}: {err}"))?
        .ok_or_else(|| format!("No private key found for {addr}"))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|err| format!("Failed to build TLS config for {addr}: {err}"))?;

    Ok(Arc::new(config))
}

#[inline]
fn open(path: &Path) -> io::Result<BufReader<File>> {
    File::open(path).map(BufReader::new)
}

struct AcceptLoop {
    socket: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    port: u16,
    active_tx: Sender<Message>,
    poll_interval: Duration,
    ready: Arc<AtomicBool>,
}

impl AcceptLoop {
    fn run(self) {
        log::debug!("Entering main loop on port {}.", self.port);

        while self.ready.load(Ordering::SeqCst) {
            let mut fds = [sys::pollfd(self.socket.as_raw_fd())];
            match sys::poll(&mut fds, self.poll_interval) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(err) => {
                    log::error!("Listener poll failed on port {}: {err}", self.port);
                    thread::sleep(self.poll_interval);
                    continue;
                }
            }

            loop {
                match self.socket.accept() {
                    Ok((stream, addr)) => self.dispatch(stream, addr),
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        log::warn!("Accept failed on port {}: {err}", self.port);
                        break;
                    }
                }
            }
        }

        log::debug!("Leaving main loop on port {}.", self.port);
    }

    fn dispatch(&self, stream: TcpStream, addr: SocketAddr) {
        if let Err(err) = stream.set_nonblocking(false) {
            log::warn!("Cannot prepare connection from {addr}: {err}");
            return;
        }
        let _ = stream.set_nodelay(true);

        let stream: Box<dyn Transport> = match &self.tls {
            None => Box::new(stream),
            Some(config) => match self.handshake(config, stream) {
                Some(stream) => stream,
                None => return,
            },
        };

        let accepted = Accepted::new(stream, addr, self.port, self.tls.is_some());
        if let Err(SendError(msg)) = self.active_tx.send(Message::Accepted(accepted)) {
            msg.close();
        }
    }

    /// Runs the server handshake for up to one poll interval per read.
    ///
    /// A stalled handshake is finished by the worker's first read. A failed
    /// one yields the bare socket, which the worker rejects with `400`.
    fn handshake(&self, config: &Arc<ServerConfig>, stream: TcpStream) -> Option<Box<dyn Transport>> {
        let conn = match ServerConnection::new(config.clone()) {
            Ok(conn) => conn,
            Err(err) => {
                log::error!("Cannot create TLS session: {err}");
                return None;
            }
        };

        if let Err(err) = stream.set_read_timeout(Some(self.poll_interval)) {
            log::warn!("Cannot prepare TLS connection: {err}");
            return None;
        }

        let mut tls = StreamOwned::new(conn, stream);
        while tls.conn.is_handshaking() {
            match tls.conn.complete_io(&mut tls.sock) {
                Ok(_) => {}
                Err(err) if is_timeout(&err) => break,
                Err(err) => {
                    log::warn!("ssl handshake failed: {err}");
                    return Some(Box::new(tls.sock));
                }
            }
        }

        Some(Box::new(tls))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{self, Receiver};
    use rustls::{pki_types::ServerName, ClientConfig, ClientConnection, RootCertStore};
    use std::io::{BufRead, Read, Write};

    fn listener(interface: &Interface) -> (Listener, Receiver<Message>) {
        let (active_tx, active_rx) = channel::unbounded();
        let listener = Listener::new(interface, active_tx, Duration::from_millis(50), 16);
        (listener, active_rx)
    }

    fn accepted(active: &Receiver<Message>) -> Accepted {
        match active.recv_timeout(Duration::from_secs(2)).unwrap() {
            Message::Accepted(accepted) => accepted,
            _ => panic!("expected an accepted socket"),
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn accepts_into_queue() {
        let (mut listener, active) = listener(&Interface::plain(loopback()));
        assert!(listener.is_ready());
        assert_eq!(listener.state(), ListenerState::Ready);
        assert!(!listener.is_secure());

        listener.start().unwrap();
        assert_eq!(listener.state(), ListenerState::Running);

        let client = TcpStream::connect(listener.local_addr()).unwrap();
        let accepted = accepted(&active);
        assert_eq!(accepted.client_addr, client.local_addr().unwrap());
        assert_eq!(accepted.server_port, listener.local_addr().port());
        assert!(!accepted.secure);
        assert!(!accepted.stream.is_tls());

        listener.stop();
        assert!(!listener.is_ready());
        assert_eq!(listener.state(), ListenerState::Stopped);
        assert!(TcpStream::connect(listener.local_addr()).is_err());
    }

    #[test]
    fn bind_failures_are_not_ready() {
        let (taken, _) = listener(&Interface::plain(loopback()));
        let (mut second, _) = listener(&Interface::plain(taken.local_addr()));
        assert!(!second.is_ready());
        assert_eq!(second.state(), ListenerState::Init);
        assert!(second.start().is_err());

        let missing = Interface::secure(loopback(), "/nonexistent/key.pem", "/nonexistent/cert.pem");
        let (missing, _) = listener(&missing);
        assert!(!missing.is_ready());
    }

    fn write_certificate(dir: &Path) -> (Interface, Vec<u8>) {
        let rcgen::CertifiedKey { cert, signing_key } =
            rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();

        let key_file = dir.join("key.pem");
        let cert_file = dir.join("cert.pem");
        std::fs::write(&key_file, signing_key.serialize_pem()).unwrap();
        std::fs::write(&cert_file, cert.pem()).unwrap();

        (
            Interface::secure(loopback(), key_file, cert_file),
            cert.der().to_vec(),
        )
    }

    #[test]
    fn tls_handshake() {
        let dir = tempfile::tempdir().unwrap();
        let (interface, der) = write_certificate(dir.path());

        let (mut listener, active) = listener(&interface);
        assert!(listener.is_ready());
        assert!(listener.is_secure());
        listener.start().unwrap();

        let addr = listener.local_addr();
        let client = thread::spawn(move || {
            let mut roots = RootCertStore::empty();
            roots.add(der.into()).unwrap();
            let config = ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();

            let name = ServerName::try_from("localhost").unwrap();
            let conn = ClientConnection::new(Arc::new(config), name).unwrap();
            let mut tls = StreamOwned::new(conn, TcpStream::connect(addr).unwrap());

            tls.write_all(b"ping\n").unwrap();
            let mut reply = String::new();
            BufReader::new(&mut tls).read_line(&mut reply).unwrap();
            reply
        });

        let accepted = accepted(&active);
        assert!(accepted.secure);
        assert!(accepted.stream.is_tls());

        let mut conn =
            crate::server::connection::Connection::new(accepted, Duration::from_secs(2)).unwrap();
        let mut line = String::new();
        conn.reader().read_line(&mut line).unwrap();
        assert_eq!(line, "ping\n");

        conn.write_all(b"pong\n").unwrap();
        conn.flush().unwrap();
        assert_eq!(client.join().unwrap(), "pong\n");

        conn.close();
        listener.stop();
    }

    #[test]
    fn plaintext_on_tls_interface() {
        let dir = tempfile::tempdir().unwrap();
        let (interface, _) = write_certificate(dir.path());

        let (mut listener, active) = listener(&interface);
        listener.start().unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).unwrap();
        client.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();

        let accepted = accepted(&active);
        assert!(accepted.secure);
        assert!(!accepted.stream.is_tls());

        accepted.close();
        let mut rest = Vec::new();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let _ = client.read_to_end(&mut rest);

        listener.stop();
    }
}
