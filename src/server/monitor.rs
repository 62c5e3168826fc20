use crate::server::{
    connection::{Connection, Message},
    sys::{self, POLLHUP, POLLIN},
};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{
    collections::HashMap,
    io,
    os::fd::RawFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// Work item of the timeout queue.
pub(crate) enum MonitorMessage {
    /// A worker timed out waiting for the next request on this connection.
    Park(Connection),
    Stop,
}

/// Parks keep-alive connections until the client sends more data.
///
/// Parked sockets are polled for readiness and handed back to the active
/// queue as soon as they become readable. Connections silent for longer
/// than the idle timeout are closed.
pub(crate) struct Monitor {
    queue_tx: Sender<MonitorMessage>,
    queue_rx: Receiver<MonitorMessage>,
    active_tx: Sender<Message>,

    poll_interval: Duration,
    idle_timeout: Option<Duration>,

    active: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Monitor {
    pub(crate) fn new(
        active_tx: Sender<Message>,
        poll_interval: Duration,
        idle_timeout: Option<Duration>,
    ) -> Self {
        let (queue_tx, queue_rx) = channel::unbounded();

        Self {
            queue_tx,
            queue_rx,
            active_tx,

            poll_interval,
            idle_timeout,

            active: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    /// Sending half of the timeout queue, handed to the workers.
    #[inline]
    pub(crate) fn queue(&self) -> Sender<MonitorMessage> {
        self.queue_tx.clone()
    }

    #[inline]
    #[allow(dead_code)]
    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn start(&mut self) -> io::Result<()> {
        if self.thread.is_some() {
            return Ok(());
        }

        let mut waiting = Waiting {
            queue: self.queue_rx.clone(),
            active_tx: self.active_tx.clone(),
            poll_interval: self.poll_interval,
            idle_timeout: self.idle_timeout,
            connections: HashMap::new(),
        };
        let active = self.active.clone();

        self.active.store(true, Ordering::Release);
        let spawned = thread::Builder::new()
            .name("sprocket-monitor".into())
            .spawn(move || {
                waiting.run();
                active.store(false, Ordering::Release);
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(err) => {
                self.active.store(false, Ordering::Release);
                Err(err)
            }
        }
    }

    /// Closes every parked connection and joins the monitor thread.
    pub(crate) fn stop(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };

        let _ = self.queue_tx.send(MonitorMessage::Stop);
        if handle.join().is_err() {
            log::error!("Monitor thread panicked");
        }
        self.active.store(false, Ordering::Release);
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Waiting {
    queue: Receiver<MonitorMessage>,
    active_tx: Sender<Message>,
    poll_interval: Duration,
    idle_timeout: Option<Duration>,
    connections: HashMap<RawFd, Connection>,
}

impl Waiting {
    fn run(&mut self) {
        log::debug!("Entering monitor loop.");

        'outer: loop {
            if self.connections.is_empty() {
                match self.queue.recv_timeout(self.poll_interval) {
                    Ok(msg) => {
                        if !self.park(msg) {
                            break;
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }

            loop {
                match self.queue.try_recv() {
                    Ok(msg) => {
                        if !self.park(msg) {
                            break 'outer;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'outer,
                }
            }

            self.wake_readable();
            self.expire_idle();
        }

        self.close_all();
        log::debug!("Leaving monitor loop.");
    }

    /// Adds a parked connection; `false` on the stop signal.
    fn park(&mut self, msg: MonitorMessage) -> bool {
        match msg {
            MonitorMessage::Park(conn) => {
                let fd = conn.fd();
                debug_assert!(
                    !self.connections.contains_key(&fd),
                    "connection parked twice"
                );

                if let Some(stale) = self.connections.insert(fd, conn) {
                    log::error!("Connection on fd {fd} was parked twice");
                    stale.close();
                }
                true
            }
            MonitorMessage::Stop => false,
        }
    }

    fn wake_readable(&mut self) {
        if self.connections.is_empty() {
            return;
        }

        let mut fds: Vec<_> = self.connections.keys().map(|&fd| sys::pollfd(fd)).collect();

        match sys::poll(&mut fds, self.poll_interval) {
            Ok(0) => {}
            Ok(_) => {
                for pollfd in &fds {
                    self.handle_event(pollfd.fd, pollfd.revents);
                }
            }
            Err(err) => {
                log::warn!("Readiness poll failed: {err}");
                self.probe_each();
            }
        }
    }

    /// Polls every socket alone to find the ones that broke the batch poll.
    fn probe_each(&mut self) {
        let fds: Vec<RawFd> = self.connections.keys().copied().collect();

        for fd in fds {
            let mut single = [sys::pollfd(fd)];
            match sys::poll(&mut single, Duration::ZERO) {
                Ok(_) => self.handle_event(fd, single[0].revents),
                Err(_) => {
                    if let Some(conn) = self.connections.remove(&fd) {
                        conn.close();
                    }
                }
            }
        }
    }

    fn handle_event(&mut self, fd: RawFd, revents: libc::c_short) {
        if revents == 0 {
            return;
        }

        let Some(mut conn) = self.connections.remove(&fd) else {
            return;
        };

        if revents & (POLLIN | POLLHUP) == 0 {
            log::debug!("Dropping broken connection from {}", conn.client_addr);
            conn.close();
            return;
        }

        conn.touch();
        if let Err(channel::SendError(msg)) = self.active_tx.send(Message::Resumed(conn)) {
            msg.close();
        }
    }

    fn expire_idle(&mut self) {
        let Some(limit) = self.idle_timeout else {
            return;
        };

        let expired: Vec<RawFd> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.idle_for() >= limit)
            .map(|(&fd, _)| fd)
            .collect();

        for fd in expired {
            if let Some(conn) = self.connections.remove(&fd) {
                log::debug!("Flushing idle connection from {}", conn.client_addr);
                conn.close();
            }
        }
    }

    fn close_all(&mut self) {
        for (_, conn) in self.connections.drain() {
            conn.close();
        }

        for msg in self.queue.try_iter() {
            if let MonitorMessage::Park(conn) = msg {
                conn.close();
            }
        }
    }
}
