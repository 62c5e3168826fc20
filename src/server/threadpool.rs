use crate::{
    http::response::App,
    limits::PoolLimits,
    server::{
        connection::Message,
        monitor::MonitorMessage,
        worker::{CurrentConnection, Worker, WorkerSettings},
    },
};
use crossbeam::channel::{Receiver, Sender};
use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    thread::JoinHandle,
};

struct WorkerHandle {
    name: String,
    thread: Option<JoinHandle<()>>,
    current: CurrentConnection,
}

impl WorkerHandle {
    #[inline]
    fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Shuts down the connection the worker is blocked on, if any.
    fn kill(&self) {
        let current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = current.as_ref() {
            handle.kill();
        }
    }

    fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("{} panicked", self.name);
            }
        }
    }
}

struct Threads<A: App> {
    /// Created with the pool, spawned by `start`.
    idle: Vec<Worker<A>>,
    workers: Vec<WorkerHandle>,
    /// Stop messages queued by `shrink` and not consumed yet.
    pending_exits: usize,
    next_id: usize,
}

impl<A: App> Threads<A> {
    /// Workers that will keep running once the queued stop messages are consumed.
    #[inline]
    fn effective(&self) -> usize {
        self.workers.len().saturating_sub(self.pending_exits)
    }

    fn reap(&mut self) {
        let before = self.workers.len();

        let (finished, running) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition::<Vec<_>, _>(WorkerHandle::is_finished);
        self.workers = running;
        finished.into_iter().for_each(WorkerHandle::join);

        let reaped = before - self.workers.len();
        if reaped > 0 {
            log::debug!("Reaped {reaped} worker(s)");
        }
        self.pending_exits = self.pending_exits.saturating_sub(reaped);
    }
}

/// Worker threads consuming the active queue.
///
/// Grow, shrink and reap all run under one lock, so the number of queued
/// stop messages always matches the number of workers expected to exit.
pub(crate) struct ThreadPool<A: App> {
    app: Arc<A>,
    active_tx: Sender<Message>,
    active_rx: Receiver<Message>,
    monitor_tx: Sender<MonitorMessage>,
    settings: Arc<WorkerSettings>,

    limits: PoolLimits,
    grow_threshold: usize,
    stop_server: Arc<AtomicBool>,

    threads: Mutex<Threads<A>>,
}

impl<A: App> ThreadPool<A> {
    pub(crate) fn new(
        app: Arc<A>,
        active: (Sender<Message>, Receiver<Message>),
        monitor_tx: Sender<MonitorMessage>,
        settings: WorkerSettings,
        limits: PoolLimits,
    ) -> Self {
        let (active_tx, active_rx) = active;
        let mut pool = Self {
            app,
            active_tx,
            active_rx,
            monitor_tx,
            settings: Arc::new(settings),

            grow_threshold: limits.grow_threshold(),
            limits,
            stop_server: Arc::new(AtomicBool::new(false)),

            threads: Mutex::new(Threads {
                idle: Vec::new(),
                workers: Vec::new(),
                pending_exits: 0,
                next_id: 0,
            }),
        };

        let idle = (0..pool.limits.min_threads).map(|_| pool.worker()).collect();
        pool.threads.get_mut().unwrap_or_else(PoisonError::into_inner).idle = idle;
        pool
    }

    #[inline]
    fn worker(&self) -> Worker<A> {
        Worker::new(
            self.app.clone(),
            self.active_rx.clone(),
            self.monitor_tx.clone(),
            self.settings.clone(),
            self.stop_server.clone(),
        )
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, Threads<A>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawns the workers created with the pool.
    pub(crate) fn start(&self) -> io::Result<()> {
        let mut threads = self.lock();

        let idle = std::mem::take(&mut threads.idle);
        for worker in idle {
            Self::spawn(&mut threads, worker)?;
        }
        Ok(())
    }

    fn spawn(threads: &mut Threads<A>, worker: Worker<A>) -> io::Result<()> {
        let name = format!("sprocket-worker-{}", threads.next_id);
        threads.next_id += 1;

        let current = worker.current();
        let thread = worker.spawn(name.clone())?;

        threads.workers.push(WorkerHandle {
            name,
            thread: Some(thread),
            current,
        });
        Ok(())
    }

    /// Starts up to `amount` workers, never more than `max_threads` in total.
    #[allow(dead_code)]
    pub(crate) fn grow(&self, amount: usize) -> io::Result<()> {
        let mut threads = self.lock();
        self.grow_locked(&mut threads, amount)
    }

    fn grow_locked(&self, threads: &mut Threads<A>, amount: usize) -> io::Result<()> {
        let amount = match self.limits.max_threads {
            0 => amount,
            max => amount.min(max.saturating_sub(threads.effective())),
        };
        if amount == 0 {
            return Ok(());
        }

        log::debug!("Growing thread pool by {amount}");
        for _ in 0..amount {
            let worker = self.worker();
            Self::spawn(threads, worker)?;
        }
        Ok(())
    }

    /// Asks `amount` workers to exit once they are idle.
    #[allow(dead_code)]
    pub(crate) fn shrink(&self, amount: usize) {
        let mut threads = self.lock();
        self.shrink_locked(&mut threads, amount);
    }

    fn shrink_locked(&self, threads: &mut Threads<A>, amount: usize) {
        let amount = amount.min(threads.effective());
        if amount == 0 {
            return;
        }

        log::debug!("Shrinking thread pool by {amount}");
        for _ in 0..amount {
            if self.active_tx.send(Message::Stop).is_err() {
                return;
            }
            threads.pending_exits += 1;
        }
    }

    /// Reaps dead workers and resizes the pool against the queue depth.
    ///
    /// Skipped when another resize holds the lock.
    pub(crate) fn dynamic_resize(&self) {
        let mut threads = match self.threads.try_lock() {
            Ok(threads) => threads,
            Err(TryLockError::WouldBlock) => return,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };

        if self.stop_server.load(Ordering::SeqCst) {
            return;
        }
        threads.reap();

        let effective = threads.effective();
        let depth = self.active_rx.len();
        let max = self.limits.max_threads;

        if depth == 0 && effective > self.limits.min_threads {
            self.shrink_locked(&mut threads, 1);
        } else if depth > self.grow_threshold && (max == 0 || effective < max) {
            if let Err(err) = self.grow_locked(&mut threads, depth) {
                log::error!("Cannot grow thread pool: {err}");
            }
        }
    }

    /// Number of worker threads still running.
    pub(crate) fn live_count(&self) -> usize {
        let mut threads = self.lock();
        threads.reap();
        threads.workers.len()
    }

    /// Stops every worker and closes connections still queued.
    pub(crate) fn stop(&self) {
        self.stop_server.store(true, Ordering::SeqCst);

        let mut threads = self.lock();
        threads.idle.clear();
        threads.reap();

        let sentinels = threads.effective();
        for _ in 0..sentinels {
            let _ = self.active_tx.send(Message::Stop);
        }

        for worker in &threads.workers {
            worker.kill();
        }

        let workers = std::mem::take(&mut threads.workers);
        if !workers.is_empty() {
            log::debug!("Joining {} worker(s)", workers.len());
        }
        workers.into_iter().for_each(WorkerHandle::join);
        threads.pending_exits = 0;
        drop(threads);

        self.drain();
    }

    /// Closes every connection left in the active queue.
    pub(crate) fn drain(&self) {
        for msg in self.active_rx.try_iter() {
            msg.close();
        }
    }
}

impl<A: App> Drop for ThreadPool<A> {
    fn drop(&mut self) {
        if !self.stop_server.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        body,
        errors::AppError,
        http::{
            request::Request,
            response::{ResponseBody, StartResponse},
        },
        limits::ConnLimits,
        server::connection::Accepted,
        tools::{socket_pair, wait_for},
    };
    use crossbeam::channel;
    use std::{
        net::TcpStream,
        thread,
        time::{Duration, Instant},
    };

    fn app(
        _req: &mut Request<'_>,
        start_response: &StartResponse,
    ) -> Result<Box<dyn ResponseBody>, AppError> {
        start_response.start("200 OK", [("Content-Type", "text/plain")])?;
        Ok(body::full("ok"))
    }

    type Handler = fn(&mut Request<'_>, &StartResponse) -> Result<Box<dyn ResponseBody>, AppError>;
    type TestPool = ThreadPool<Handler>;

    fn pool(min_threads: usize, max_threads: usize) -> (TestPool, Receiver<MonitorMessage>) {
        let (monitor_tx, monitor_rx) = channel::unbounded();
        let pool = ThreadPool::new(
            Arc::new(app as Handler),
            channel::unbounded(),
            monitor_tx,
            WorkerSettings {
                conn: ConnLimits {
                    socket_read_timeout: Duration::from_secs(30),
                    idle_timeout: None,
                },
                ..WorkerSettings::default()
            },
            PoolLimits {
                min_threads,
                max_threads,
            },
        );
        (pool, monitor_rx)
    }

    fn enqueue(pool: &TestPool, count: usize) -> Vec<TcpStream> {
        (0..count)
            .map(|_| {
                let (client, server) = socket_pair();
                let addr = server.peer_addr().unwrap();
                pool.active_tx
                    .send(Message::Accepted(Accepted::new(Box::new(server), addr, 80, false)))
                    .unwrap();
                client
            })
            .collect()
    }

    #[test]
    fn start_and_stop() {
        let (pool, _monitor) = pool(3, 10);
        assert_eq!(pool.live_count(), 0);

        pool.start().unwrap();
        assert_eq!(pool.live_count(), 3);

        pool.stop();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn grow_and_shrink() {
        let (pool, _monitor) = pool(2, 6);
        pool.start().unwrap();

        pool.grow(3).unwrap();
        assert_eq!(pool.live_count(), 5);

        pool.grow(10).unwrap();
        assert_eq!(pool.live_count(), 6);

        pool.shrink(2);
        assert!(wait_for(Duration::from_secs(2), || pool.live_count() == 4));

        pool.grow(1).unwrap();
        assert_eq!(pool.live_count(), 5);

        pool.stop();
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn resize_shrinks_idle_pool_to_min() {
        let (pool, _monitor) = pool(2, 8);
        pool.start().unwrap();
        pool.grow(4).unwrap();

        for _ in 0..20 {
            pool.dynamic_resize();
            thread::sleep(Duration::from_millis(10));
        }
        assert!(wait_for(Duration::from_secs(2), || pool.live_count() == 2));

        pool.dynamic_resize();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(pool.live_count(), 2);

        pool.stop();
    }

    #[test]
    fn resize_grows_on_backlog() {
        #[rustfmt::skip]
        let cases = [
            // max, queued, expected
            (10, 5,  5),
            (4,  5,  4),
            (0,  5,  5),
            (10, 2,  0),
        ];

        for (max, queued, expected) in cases {
            let (pool, _monitor) = pool(1, max);
            let _clients = enqueue(&pool, queued);

            pool.dynamic_resize();
            assert_eq!(pool.live_count(), expected, "max {max}, queued {queued}");

            pool.stop();
        }
    }

    #[test]
    fn resize_skipped_while_locked() {
        let (pool, _monitor) = pool(1, 10);
        let _clients = enqueue(&pool, 5);

        let guard = pool.lock();
        pool.dynamic_resize();
        drop(guard);
        assert_eq!(pool.live_count(), 0);

        pool.dynamic_resize();
        assert_eq!(pool.live_count(), 5);
        pool.stop();
    }

    #[test]
    fn reaps_exited_workers() {
        let (pool, _monitor) = pool(3, 10);
        pool.start().unwrap();

        pool.active_tx.send(Message::Stop).unwrap();
        assert!(wait_for(Duration::from_secs(2), || pool.live_count() == 2));
        pool.stop();
    }

    #[test]
    fn stop_interrupts_blocked_workers() {
        let (pool, _monitor) = pool(2, 10);
        pool.start().unwrap();

        let mut clients = enqueue(&pool, 2);
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        pool.stop();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(pool.live_count(), 0);

        for client in &mut clients {
            use std::io::Read;
            client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
    }

    #[test]
    fn stop_closes_late_connections() {
        let (pool, _monitor) = pool(1, 10);
        let mut clients = enqueue(&pool, 3);

        pool.stop();
        assert!(pool.active_rx.is_empty());

        for client in &mut clients {
            use std::io::Read;
            client.set_read_timeout(Some(Duration::from_secs(1))).unwrap();
            let mut buf = [0u8; 1];
            assert_eq!(client.read(&mut buf).unwrap(), 0);
        }
    }
}
