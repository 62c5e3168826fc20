use std::{ffi::CStr, io, os::fd::RawFd, time::Duration};

pub(crate) use libc::{POLLHUP, POLLIN};

#[inline]
pub(crate) fn pollfd(fd: RawFd) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: POLLIN,
        revents: 0,
    }
}

/// Waits until one of `fds` has events or `timeout` passes.
///
/// Returns the number of descriptors with non-zero `revents`; `0` on timeout
/// or when the wait was interrupted by a signal.
pub(crate) fn poll(fds: &mut [libc::pollfd], timeout: Duration) -> io::Result<usize> {
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd.
    let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

    if ret < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }

    Ok(ret as usize)
}

/// Host name of this machine, `localhost` if it cannot be read.
pub(crate) fn hostname() -> String {
    let mut buf = [0 as libc::c_char; 256];

    // SAFETY: the buffer is writable for `buf.len()` bytes; the last byte
    // stays NUL even when the name is truncated.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr(), buf.len() - 1) };
    if ret != 0 {
        return "localhost".to_string();
    }

    // SAFETY: NUL-terminated above.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    match name.to_str() {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => "localhost".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, os::fd::AsRawFd};

    #[test]
    fn poll_reports_readable_socket() {
        let (mut client, server) = crate::tools::socket_pair();

        let mut fds = [pollfd(server.as_raw_fd())];
        assert_eq!(poll(&mut fds, Duration::from_millis(10)).unwrap(), 0);

        client.write_all(b"x").unwrap();
        let mut fds = [pollfd(server.as_raw_fd())];
        assert_eq!(poll(&mut fds, Duration::from_secs(1)).unwrap(), 1);
        assert_ne!(fds[0].revents & POLLIN, 0);
    }

    #[test]
    fn hostname_is_not_empty() {
        assert!(!hostname().is_empty());
    }
}
