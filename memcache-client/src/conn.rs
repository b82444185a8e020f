//! Blocking TCP connection with bounded connect and signal-safe transfer.
//!
//! Connection setup resolves the host/port pair (address family
//! unspecified, stream sockets) and walks the candidate list: each socket
//! gets `TCP_NODELAY` and `SO_REUSEADDR`, connects non-blocking, and waits
//! for writability under the configured timeout before being restored to
//! blocking mode for data transfer. Sends use `sendmsg` with `MSG_NOSIGNAL`
//! so a broken pipe surfaces as an error instead of `SIGPIPE`; `EINTR` is
//! resumed transparently everywhere.

use std::ffi::CString;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

use crate::error::Error;

/// An established connection. Dropping it closes the socket.
pub(crate) struct Conn {
    fd: OwnedFd,
}

/// Owns a `getaddrinfo` result list.
struct AddrList(*mut libc::addrinfo);

impl Drop for AddrList {
    fn drop(&mut self) {
        unsafe { libc::freeaddrinfo(self.0) }
    }
}

fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
}

impl Conn {
    /// Resolve and connect, trying each candidate address in turn.
    pub(crate) fn connect(host: &str, port: &str, timeout: Duration) -> Result<Conn, Error> {
        let resolve_failed = || Error::ResolveFailed {
            host: host.to_string(),
            port: port.to_string(),
        };
        let c_host = CString::new(host).map_err(|_| resolve_failed())?;
        let c_port = CString::new(port).map_err(|_| resolve_failed())?;

        let mut hints: libc::addrinfo = unsafe { mem::zeroed() };
        hints.ai_family = libc::AF_UNSPEC;
        hints.ai_socktype = libc::SOCK_STREAM;
        let mut results: *mut libc::addrinfo = std::ptr::null_mut();
        let rc =
            unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut results) };
        if rc != 0 {
            return Err(resolve_failed());
        }
        let list = AddrList(results);

        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
        let mut last_err = libc::ECONNREFUSED;
        let mut candidate = list.0;
        while !candidate.is_null() {
            let ai = unsafe { &*candidate };
            candidate = ai.ai_next;
            match try_connect(ai, timeout_ms) {
                Ok(fd) => {
                    tracing::debug!(host, port, "connected");
                    return Ok(Conn { fd });
                }
                Err(err) => {
                    tracing::debug!(host, port, err, "connect candidate failed");
                    last_err = err;
                }
            }
        }
        Err(Error::ConnectFailed {
            host: host.to_string(),
            port: port.to_string(),
            source: io::Error::from_raw_os_error(last_err),
        })
    }

    /// Send a scatter list in full, resuming on `EINTR` and short writes.
    pub(crate) fn send_vectored(&self, parts: &[&[u8]]) -> Result<(), Error> {
        let mut iov: Vec<libc::iovec> = parts
            .iter()
            .filter(|p| !p.is_empty())
            .map(|p| libc::iovec {
                iov_base: p.as_ptr() as *mut libc::c_void,
                iov_len: p.len(),
            })
            .collect();

        let mut idx = 0;
        while idx < iov.len() {
            let mut msg: libc::msghdr = unsafe { mem::zeroed() };
            msg.msg_iov = iov[idx..].as_mut_ptr();
            msg.msg_iovlen = (iov.len() - idx) as _;
            let sent =
                unsafe { libc::sendmsg(self.fd.as_raw_fd(), &msg, libc::MSG_NOSIGNAL) };
            if sent < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                return Err(Error::SocketError(io::Error::last_os_error()));
            }
            if sent == 0 {
                return Err(Error::SocketClosed);
            }

            // advance past whatever the kernel took
            let mut sent = sent as usize;
            while idx < iov.len() && sent >= iov[idx].iov_len {
                sent -= iov[idx].iov_len;
                idx += 1;
            }
            if idx < iov.len() && sent > 0 {
                iov[idx].iov_base = unsafe { (iov[idx].iov_base as *mut u8).add(sent) } as *mut _;
                iov[idx].iov_len -= sent;
            }
        }
        Ok(())
    }

    /// Fill `buf` exactly, resuming on `EINTR`.
    pub(crate) fn recv_exact(&self, buf: &mut [u8]) -> Result<(), Error> {
        let mut off = 0;
        while off < buf.len() {
            let got = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    buf[off..].as_mut_ptr() as *mut libc::c_void,
                    buf.len() - off,
                    0,
                )
            };
            if got < 0 {
                if last_errno() == libc::EINTR {
                    continue;
                }
                return Err(Error::SocketError(io::Error::last_os_error()));
            }
            if got == 0 {
                return Err(Error::SocketClosed);
            }
            off += got as usize;
        }
        Ok(())
    }
}

/// One candidate: socket, options, non-blocking connect bounded by `poll`.
/// Returns the raw errno on failure so the caller can report the last one.
fn try_connect(ai: &libc::addrinfo, timeout_ms: libc::c_int) -> Result<OwnedFd, i32> {
    let raw = unsafe { libc::socket(ai.ai_family, ai.ai_socktype, ai.ai_protocol) };
    if raw < 0 {
        return Err(last_errno());
    }
    // from here on the fd closes itself on every early return
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let one: libc::c_int = 1;
    let one_ptr = &one as *const libc::c_int as *const libc::c_void;
    let one_len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    if ai.ai_protocol == libc::IPPROTO_TCP
        && unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                one_ptr,
                one_len,
            )
        } < 0
    {
        return Err(last_errno());
    }
    if unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            one_ptr,
            one_len,
        )
    } < 0
    {
        return Err(last_errno());
    }

    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(last_errno());
    }
    if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(last_errno());
    }

    let restore_blocking = |fd: &OwnedFd| -> Result<(), i32> {
        if unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags) } < 0 {
            Err(last_errno())
        } else {
            Ok(())
        }
    };

    let rc = unsafe { libc::connect(fd.as_raw_fd(), ai.ai_addr, ai.ai_addrlen) };
    if rc == 0 {
        restore_blocking(&fd)?;
        return Ok(fd);
    }
    if last_errno() != libc::EINPROGRESS {
        return Err(last_errno());
    }

    let mut pfd = libc::pollfd {
        fd: fd.as_raw_fd(),
        events: libc::POLLOUT,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc == 1 {
            let mut err: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            if unsafe {
                libc::getsockopt(
                    fd.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    &mut err as *mut libc::c_int as *mut libc::c_void,
                    &mut len,
                )
            } < 0
            {
                return Err(last_errno());
            }
            if err != 0 {
                return Err(err);
            }
            restore_blocking(&fd)?;
            return Ok(fd);
        }
        if rc < 0 && last_errno() == libc::EINTR {
            // interrupted by a signal, re-arm the poll
            continue;
        }
        return Err(if rc == 0 { libc::ETIMEDOUT } else { last_errno() });
    }
}
