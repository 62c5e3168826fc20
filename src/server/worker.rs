use crate::{
    errors::{ErrorKind, UTTER_FAILURE},
    http::{
        request::{parse_request_line, read_headers, read_request_line, Peer, Request},
        response::{App, ResponseBody, ResponseContext, ResponseWriter, StartResponse},
    },
    limits::{ConnLimits, ReqLimits},
    server::{
        connection::{Connection, Message, ShutdownHandle},
        monitor::MonitorMessage,
    },
};
use crossbeam::channel::{Receiver, SendError, Sender};
use std::{
    any::Any,
    io::{self, Write},
    net::SocketAddr,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

/// Unread request body left by the application that is still discarded
/// to keep the connection alive.
const MAX_DRAIN: usize = 64 * 1024;

/// Settings shared by every worker of a pool.
#[derive(Debug, Clone, Default)]
pub(crate) struct WorkerSettings {
    pub(crate) conn: ConnLimits,
    pub(crate) req: ReqLimits,
    pub(crate) server_software: String,
    pub(crate) server_name: String,
}

/// Connection a worker is serving, exposed so the pool can interrupt it.
pub(crate) type CurrentConnection = Arc<Mutex<Option<ShutdownHandle>>>;

enum Disposition {
    /// Hand the connection to the monitor until the client sends more.
    Park,
    Close,
}

/// State of one request/response exchange, rebuilt for every request.
struct Exchange {
    request_line: String,
    status: String,
    size: usize,
    start: StartResponse,
}

impl Exchange {
    #[inline]
    fn new() -> Self {
        Self {
            request_line: String::new(),
            status: String::new(),
            size: 0,
            start: StartResponse::new(),
        }
    }
}

/// Runs a body's close hook however the exchange ends.
struct CloseOnDrop(Box<dyn ResponseBody>);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

pub(crate) struct Worker<A: App> {
    app: Arc<A>,
    active_rx: Receiver<Message>,
    monitor_tx: Sender<MonitorMessage>,
    settings: Arc<WorkerSettings>,
    stop_server: Arc<AtomicBool>,
    current: CurrentConnection,
}

impl<A: App> Worker<A> {
    pub(crate) fn new(
        app: Arc<A>,
        active_rx: Receiver<Message>,
        monitor_tx: Sender<MonitorMessage>,
        settings: Arc<WorkerSettings>,
        stop_server: Arc<AtomicBool>,
    ) -> Self {
        Self {
            app,
            active_rx,
            monitor_tx,
            settings,
            stop_server,
            current: Arc::default(),
        }
    }

    #[inline]
    pub(crate) fn current(&self) -> CurrentConnection {
        self.current.clone()
    }

    pub(crate) fn spawn(self, name: String) -> io::Result<JoinHandle<()>> {
        thread::Builder::new().name(name).spawn(move || self.run())
    }

    pub(crate) fn run(self) {
        log::debug!("Entering main loop.");

        loop {
            let conn = match self.active_rx.recv() {
                Ok(Message::Accepted(accepted)) => {
                    match Connection::new(accepted, self.settings.conn.socket_read_timeout) {
                        Ok(conn) => conn,
                        Err(err) => {
                            log::warn!("Cannot prepare accepted socket: {err}");
                            continue;
                        }
                    }
                }
                Ok(Message::Resumed(conn)) => conn,
                Ok(Message::Stop) | Err(_) => {
                    log::debug!("Received a death threat.");
                    return;
                }
            };

            self.handle(conn);
        }
    }

    fn handle(&self, mut conn: Connection) {
        self.set_current(conn.shutdown_handle().ok());

        if self.stop_server.load(Ordering::SeqCst) {
            self.set_current(None);
            conn.close();
            return;
        }

        let disposition = if conn.is_tls() != conn.secure {
            log::info!("Received HTTP connection on HTTPS port.");
            send_canned(&mut conn, &ErrorKind::BadRequest);
            Disposition::Close
        } else {
            self.serve(&mut conn)
        };

        self.set_current(None);

        match disposition {
            Disposition::Park => {
                conn.touch();
                if let Err(SendError(MonitorMessage::Park(conn))) =
                    self.monitor_tx.send(MonitorMessage::Park(conn))
                {
                    conn.close();
                }
            }
            Disposition::Close => conn.close(),
        }
    }

    #[inline]
    fn set_current(&self, handle: Option<ShutdownHandle>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = handle;
    }

    /// Serves requests until the connection must be parked or closed.
    fn serve(&self, conn: &mut Connection) -> Disposition {
        loop {
            let mut exchange = Exchange::new();

            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                self.serve_request(conn, &mut exchange)
            }));

            match result {
                Ok(Ok(true)) if !self.stop_server.load(Ordering::SeqCst) => continue,
                Ok(Ok(_)) => return Disposition::Close,
                Ok(Err(err)) => return self.handle_error(conn, &mut exchange, err),
                Err(payload) => {
                    log::error!(
                        "Panic while serving {}: {}",
                        conn.client_addr,
                        panic_message(&*payload)
                    );

                    if !exchange.start.headers_sent() {
                        send_canned(conn, &ErrorKind::Panic);
                        exchange.status = ErrorKind::Panic.status().to_string();
                    }
                    self.log_request(conn.client_addr, &exchange, true);
                    return Disposition::Close;
                }
            }
        }
    }

    /// Reads one request, runs the application and writes its response.
    ///
    /// Returns whether the connection stays open for another request.
    fn serve_request(&self, conn: &mut Connection, ex: &mut Exchange) -> Result<bool, ErrorKind> {
        let settings = &*self.settings;

        let line = read_request_line(conn.reader(), &settings.req)?;
        let parsed = parse_request_line(&line);
        ex.request_line = line;
        let parsed = parsed?;

        let headers = read_headers(conn.reader(), &settings.req)?;
        let ctx = ResponseContext::new(parsed.method, parsed.version, &headers);

        let peer = Peer {
            remote_addr: conn.client_addr,
            server_port: conn.server_port,
            server_name: &settings.server_name,
            is_https: conn.is_tls(),
        };

        let (mut body, drained) = {
            let mut request = Request::new(parsed, headers, peer, conn.reader())?;
            let body = CloseOnDrop(self.app.call(&mut request, &ex.start)?);

            let drained = request.body().drain(MAX_DRAIN).unwrap_or(false);
            (body, drained)
        };

        let mut writer = ResponseWriter::new(conn, ctx, &ex.start, &settings.server_software);
        if !drained {
            writer.force_close();
        }

        let result = writer.write_body(&mut *body.0);
        ex.status = std::mem::take(&mut writer.status);
        ex.size = writer.size;
        let close = writer.close_connection;

        result?;
        drop(body);
        conn.flush()?;

        self.log_request(conn.client_addr, ex, false);
        Ok(!close)
    }

    fn handle_error(&self, conn: &mut Connection, ex: &mut Exchange, err: ErrorKind) -> Disposition {
        match err {
            ErrorKind::SocketTimeout => return Disposition::Park,
            ErrorKind::SocketClosed => return Disposition::Close,
            ErrorKind::Io(ref io) if io.is_ignorable() => {
                log::debug!("Socket error from {}: {}", conn.client_addr, io.0);
                return Disposition::Close;
            }
            ErrorKind::Io(io) => {
                ex.status = UTTER_FAILURE.to_string();
                log::error!("Unrecoverable error serving {}: {}", conn.client_addr, io.0);
            }
            ErrorKind::App(err) => {
                log::error!("Application error serving {}: {err}", conn.client_addr);
                if !ex.start.headers_sent() {
                    let kind = ErrorKind::App(err);
                    send_canned(conn, &kind);
                    ex.status = kind.status().to_string();
                }
            }
            kind => {
                log::debug!("Bad request from {}: {kind}", conn.client_addr);
                send_canned(conn, &kind);
                ex.status = kind.status().to_string();
            }
        }

        self.log_request(conn.client_addr, ex, true);
        Disposition::Close
    }

    fn log_request(&self, addr: SocketAddr, ex: &Exchange, failed: bool) {
        if ex.request_line.is_empty() {
            return;
        }

        let code = ex.status.split(' ').next().unwrap_or_default();
        log::info!(
            target: "sprocket::requests",
            "{} - \"{}\" - {} {}{}",
            addr.ip(),
            ex.request_line,
            code,
            ex.size,
            if failed { " - not stopping" } else { "" }
        );
    }
}

#[inline]
fn send_canned(conn: &mut Connection, kind: &ErrorKind) {
    if let Some(resp) = kind.as_http() {
        let _ = conn.write_all(resp).and_then(|()| conn.flush());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}
