//! Server configuration: thread pool bounds, timeouts and request limits
//!
//! Every struct implements [`Default`] with the values listed on each field,
//! so a deployment only spells out what it changes.
//!
//! # Examples
//!
//! ```no_run
//! # sprocket::impt_default_app!{hello}
//! use sprocket::{Server, Interface, limits::{ConnLimits, PoolLimits}};
//! use std::time::Duration;
//!
//! let mut server = Server::builder()
//!     .interface(Interface::plain("127.0.0.1:8080".parse().unwrap()))
//!     .app(hello)
//!     .pool_limits(PoolLimits {
//!         min_threads: 4,
//!         max_threads: 64,
//!     })
//!     .connection_limits(ConnLimits {
//!         socket_read_timeout: Duration::from_secs(5),
//!         ..ConnLimits::default()
//!     })
//!     .build();
//!
//! server.start().unwrap();
//! ```

use std::time::Duration;

/// Process-wide settings shared by the listeners, the monitor and the
/// control loop.
///
/// # Control loop
/// ```text
///  [ Listener ]--accept-->[ active queue ]<--wake--[ Monitor ]
///                               ||                      /\
///                               \/                      ||
///                          [ Worker ]----read timeout-->[ timeout queue ]
/// ```
///
/// The thread that calls [`Server::start`](crate::Server::start) runs the
/// control loop. Every `resize_interval` it asks the pool to resize itself
/// against the active queue depth.
#[derive(Debug, Clone)]
pub struct ServerLimits {
    /// Listen backlog of each bound socket (default: `None`).
    ///
    /// `None` uses `SOMAXCONN`. The value is clamped to
    /// [`PoolLimits::max_threads`] unless that is `0`.
    pub listen_queue_size: Option<u32>,

    /// Upper bound of a single accept or readiness poll (default: `1s`).
    ///
    /// A stop request is observed within one interval.
    pub poll_interval: Duration,

    /// Pause between two `dynamic_resize` calls of the control loop (default: `1s`).
    pub resize_interval: Duration,

    /// Value of the `Server` response header (default: `Sprocket <crate version>`).
    pub server_software: String,

    /// Host name exposed to applications as `server_name` (default: the host name).
    pub server_name: String,
}

impl Default for ServerLimits {
    fn default() -> Self {
        Self {
            listen_queue_size: None,
            poll_interval: Duration::from_secs(1),
            resize_interval: Duration::from_secs(1),
            server_software: concat!("Sprocket ", env!("CARGO_PKG_VERSION")).to_string(),
            server_name: crate::server::sys::hostname(),
        }
    }
}

impl ServerLimits {
    #[inline]
    pub(crate) fn backlog(&self, pool: &PoolLimits) -> i32 {
        let queue = self.listen_queue_size.unwrap_or(libc::SOMAXCONN as u32);

        let queue = match pool.max_threads {
            0 => queue,
            max => queue.min(max as u32),
        };
        queue.min(i32::MAX as u32) as i32
    }
}

/// Bounds of the worker thread pool.
#[derive(Debug, Clone)]
pub struct PoolLimits {
    /// Number of workers started with the pool and kept while idle (default: `10`).
    pub min_threads: usize,

    /// Hard cap on live workers (default: `128`).
    ///
    /// `0` removes the cap.
    pub max_threads: usize,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            min_threads: 10,
            max_threads: 128,
        }
    }
}

impl PoolLimits {
    /// Queue depth above which the pool grows.
    #[inline]
    pub(crate) fn grow_threshold(&self) -> usize {
        self.max_threads / 10 + 2
    }
}

/// Per-connection timeouts.
#[derive(Debug, Clone)]
pub struct ConnLimits {
    /// How long a worker blocks on a read (default: `10s`).
    ///
    /// When it expires before a request line starts, the connection is
    /// parked with the monitor instead of being closed.
    pub socket_read_timeout: Duration,

    /// How long a parked connection may stay silent (default: `Some(600s)`).
    ///
    /// `None` keeps parked connections until the peer closes them.
    pub idle_timeout: Option<Duration>,
}

impl Default for ConnLimits {
    fn default() -> Self {
        Self {
            socket_read_timeout: Duration::from_secs(10),
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// Limits applied while reading the request head.
#[derive(Debug, Clone)]
pub struct ReqLimits {
    /// Maximum request line length in bytes (default: `8192`).
    ///
    /// Longer lines are answered with `414 URI Too Long`.
    pub request_line_size: usize,

    /// Maximum number of header lines (default: `100`).
    ///
    /// More lines are answered with `431 Request Header Fields Too Large`.
    pub header_count: usize,

    /// Maximum length of one header line in bytes (default: `8192`).
    pub header_line_size: usize,
}

impl Default for ReqLimits {
    fn default() -> Self {
        Self {
            request_line_size: 8192,
            header_count: 100,
            header_line_size: 8192,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backlog_clamped_to_max_threads() {
        let server = ServerLimits {
            listen_queue_size: Some(1024),
            ..ServerLimits::default()
        };

        let bounded = PoolLimits {
            min_threads: 1,
            max_threads: 20,
        };
        let unbounded = PoolLimits {
            min_threads: 1,
            max_threads: 0,
        };

        assert_eq!(server.backlog(&bounded), 20);
        assert_eq!(server.backlog(&unbounded), 1024);
    }

    #[test]
    fn grow_threshold() {
        #[rustfmt::skip]
        let cases = [
            (0,   2),
            (20,  4),
            (128, 14),
        ];

        for (max_threads, threshold) in cases {
            let limits = PoolLimits {
                min_threads: 0,
                max_threads,
            };
            assert_eq!(limits.grow_threshold(), threshold);
        }
    }
}
