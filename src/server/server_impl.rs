use crate::{
    http::response::App,
    limits::{ConnLimits, PoolLimits, ReqLimits, ServerLimits},
    server::{
        listener::{Interface, Listener},
        monitor::Monitor,
        threadpool::ThreadPool,
        worker::WorkerSettings,
    },
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::{io, net::SocketAddr, sync::Arc};

/// A multi-threaded HTTP server.
///
/// Listeners accept connections onto a shared active queue served by a
/// pool of worker threads. Keep-alive connections that go quiet are parked
/// with a monitor thread and return to the queue once the client sends
/// its next request.
///
/// # Examples
///
/// ```no_run
/// use sprocket::{body, AppError, Interface, Request, ResponseBody, Server, StartResponse};
///
/// fn hello(
///     _: &mut Request<'_>,
///     start_response: &StartResponse,
/// ) -> Result<Box<dyn ResponseBody>, AppError> {
///     start_response.start("200 OK", [("Content-Type", "text/plain")])?;
///     Ok(body::full("Hello world!"))
/// }
///
/// fn main() -> std::io::Result<()> {
///     Server::builder()
///         .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
///         .app(hello)
///         .build()
///         .run()
/// }
/// ```
pub struct Server<A: App> {
    app: Arc<A>,
    interfaces: Vec<Interface>,

    server_limits: ServerLimits,
    pool_limits: PoolLimits,
    conn_limits: ConnLimits,
    req_limits: ReqLimits,

    running: Option<Running<A>>,
    stop_tx: Sender<()>,
    stop_rx: Receiver<()>,
}

struct Running<A: App> {
    listeners: Vec<Listener>,
    pool: ThreadPool<A>,
    monitor: Monitor,
}

impl<A: App> Server<A> {
    /// Creates a new builder for configuring the server instance.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # sprocket::impt_default_app!{hello}
    /// use sprocket::{Interface, Server};
    ///
    /// let server = Server::builder()
    ///     .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
    ///     .app(hello)
    ///     .build();
    /// ```
    #[inline]
    pub fn builder() -> ServerBuilder<A> {
        ServerBuilder {
            interfaces: Vec::new(),
            app: None,

            server_limits: None,
            pool_limits: None,
            connection_limits: None,
            request_limits: None,
        }
    }

    /// Binds every interface and starts the worker, monitor and listener
    /// threads. Returns once they run.
    ///
    /// Interfaces that cannot be bound are logged and skipped.
    ///
    /// # Errors
    ///
    /// Fails when no interface could be bound or a thread could not be
    /// spawned.
    pub fn start(&mut self) -> io::Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        self.stop_rx.try_iter().for_each(drop);

        log::info!("Starting {}", self.server_limits.server_software);

        let (active_tx, active_rx) = channel::unbounded();
        let poll_interval = self.server_limits.poll_interval;

        let mut monitor = Monitor::new(
            active_tx.clone(),
            poll_interval,
            self.conn_limits.idle_timeout,
        );
        let pool = ThreadPool::new(
            self.app.clone(),
            (active_tx.clone(), active_rx),
            monitor.queue(),
            WorkerSettings {
                conn: self.conn_limits.clone(),
                req: self.req_limits.clone(),
                server_software: self.server_limits.server_software.clone(),
                server_name: self.server_limits.server_name.clone(),
            },
            self.pool_limits.clone(),
        );

        let backlog = self.server_limits.backlog(&self.pool_limits);
        let mut listeners: Vec<Listener> = self
            .interfaces
            .iter()
            .map(|interface| Listener::new(interface, active_tx.clone(), poll_interval, backlog))
            .filter(Listener::is_ready)
            .collect();

        if listeners.is_empty() {
            log::error!("No interfaces to listen on...closing.");
            return Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no interfaces to listen on",
            ));
        }

        let started = monitor
            .start()
            .and_then(|()| pool.start())
            .and_then(|()| listeners.iter_mut().try_for_each(Listener::start));

        if let Err(err) = started {
            log::error!("Cannot start server threads: {err}");
            listeners.iter_mut().for_each(Listener::stop);
            pool.stop();
            monitor.stop();
            return Err(err);
        }

        let sockets: Vec<String> = listeners
            .iter()
            .map(|listener| match listener.is_secure() {
                true => format!("{}*", listener.local_addr()),
                false => listener.local_addr().to_string(),
            })
            .collect();
        log::info!("Listening on sockets: {}", sockets.join(", "));

        self.running = Some(Running {
            listeners,
            pool,
            monitor,
        });
        Ok(())
    }

    /// Starts the server and resizes the worker pool every
    /// `resize_interval` until [`ServerHandle::stop`] is called.
    ///
    /// # Errors
    ///
    /// Same as [`Server::start`].
    pub fn run(&mut self) -> io::Result<()> {
        self.start()?;

        loop {
            match self.stop_rx.recv_timeout(self.server_limits.resize_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(running) = &self.running {
                        running.pool.dynamic_resize();
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.stop();
        Ok(())
    }

    /// Handle that ends [`Server::run`] from another thread.
    #[inline]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            stop_tx: self.stop_tx.clone(),
        }
    }

    /// Stops the listeners, then the workers, then the monitor.
    ///
    /// Connections still open are closed.
    pub fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };

        log::info!("Stopping Server");
        running.listeners.iter_mut().for_each(Listener::stop);
        running.pool.stop();
        running.monitor.stop();
        running.pool.drain();
    }

    /// Stops and starts again, rebinding every interface.
    ///
    /// # Errors
    ///
    /// Same as [`Server::start`].
    pub fn restart(&mut self) -> io::Result<()> {
        self.stop();
        self.start()
    }

    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Addresses bound by the running listeners.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.running
            .iter()
            .flat_map(|running| running.listeners.iter().map(Listener::local_addr))
            .collect()
    }

    /// Number of live worker threads, `0` when stopped.
    pub fn worker_count(&self) -> usize {
        self.running
            .as_ref()
            .map_or(0, |running| running.pool.live_count())
    }
}

impl<A: App> Drop for Server<A> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Stops a [`Server::run`] loop from any thread.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    stop_tx: Sender<()>,
}

impl ServerHandle {
    #[inline]
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

/// Builder for configuring and creating [`Server`] instances.
pub struct ServerBuilder<A: App> {
    interfaces: Vec<Interface>,
    app: Option<A>,

    server_limits: Option<ServerLimits>,
    pool_limits: Option<PoolLimits>,
    connection_limits: Option<ConnLimits>,
    request_limits: Option<ReqLimits>,
}

impl<A: App> ServerBuilder<A> {
    /// Adds an address to listen on. May be called more than once.
    #[inline(always)]
    pub fn interface(mut self, interface: Interface) -> Self {
        self.interfaces.push(interface);
        self
    }

    #[inline]
    pub fn interfaces<I>(mut self, interfaces: I) -> Self
    where
        I: IntoIterator<Item = Interface>,
    {
        self.interfaces.extend(interfaces);
        self
    }

    /// Sets the application that answers requests.
    ///
    /// **This is a required component.**
    #[inline(always)]
    pub fn app(mut self, app: A) -> Self {
        self.app = Some(app);
        self
    }

    /// Sets [`ServerLimits`]. Defaults apply when not called.
    #[inline(always)]
    pub fn server_limits(mut self, limits: ServerLimits) -> Self {
        self.server_limits = Some(limits);
        self
    }

    /// Sets [`PoolLimits`]. Defaults apply when not called.
    #[inline(always)]
    pub fn pool_limits(mut self, limits: PoolLimits) -> Self {
        self.pool_limits = Some(limits);
        self
    }

    /// Sets [`ConnLimits`]. Defaults apply when not called.
    #[inline(always)]
    pub fn connection_limits(mut self, limits: ConnLimits) -> Self {
        self.connection_limits = Some(limits);
        self
    }

    /// Sets [`ReqLimits`]. Defaults apply when not called.
    #[inline(always)]
    pub fn request_limits(mut self, limits: ReqLimits) -> Self {
        self.request_limits = Some(limits);
        self
    }

    /// Creates the [`Server`]. Nothing is bound until it starts.
    ///
    /// # Panics
    ///
    /// Error message: ``The `app` method must be called to create``
    #[inline]
    #[track_caller]
    pub fn build(self) -> Server<A> {
        let app = self
            .app
            .expect("The `app` method must be called to create");
        let (stop_tx, stop_rx) = channel::unbounded();

        Server {
            app: Arc::new(app),
            interfaces: self.interfaces,

            server_limits: self.server_limits.unwrap_or_default(),
            pool_limits: self.pool_limits.unwrap_or_default(),
            conn_limits: self.connection_limits.unwrap_or_default(),
            req_limits: self.request_limits.unwrap_or_default(),

            running: None,
            stop_tx,
            stop_rx,
        }
    }
}
