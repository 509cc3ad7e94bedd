//! The portable `poll(2)` fallback backend (§4.E): used on platforms with no
//! dedicated epoll/kqueue support, or when the `poll-backend` feature forces
//! it for testing. Grounded on the same register/wait contract as
//! [`crate::wait::epoll::EpollBackend`], implemented with the
//! least-common-denominator syscall instead.

use crate::error::{MprError, Result};
use crate::wait::backend::{Readiness, WaitBackend};
use crate::wait::Mask;
use crate::wait::backend::Handle;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

struct Registration {
    fd: Handle,
    mask: Mask,
}

pub struct PollBackend {
    waker_read: OwnedFd,
    waker_write: OwnedFd,
    registered: Mutex<Vec<Registration>>,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(MprError::from_io(crate::error::ErrorKind::Io, std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

impl PollBackend {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        for fd in fds {
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) })?;
        }
        let waker_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let waker_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok(PollBackend { waker_read, waker_write, registered: Mutex::new(Vec::new()) })
    }
}

impl WaitBackend for PollBackend {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).push(Registration { fd, mask });
        Ok(())
    }

    fn reregister(&self, fd: Handle, mask: Mask) -> Result<()> {
        let mut regs = self.registered.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = regs.iter_mut().find(|r| r.fd == fd) {
            r.mask = mask;
        }
        Ok(())
    }

    fn deregister(&self, fd: Handle) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).retain(|r| r.fd != fd);
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        let regs: Vec<Registration> = {
            let guard = self.registered.lock().unwrap_or_else(|e| e.into_inner());
            guard.iter().map(|r| Registration { fd: r.fd, mask: r.mask }).collect()
        };
        let mut pollfds: Vec<libc::pollfd> = Vec::with_capacity(regs.len() + 1);
        pollfds.push(libc::pollfd { fd: self.waker_read.as_raw_fd(), events: libc::POLLIN, revents: 0 });
        for reg in &regs {
            let mut events = 0;
            if reg.mask.readable {
                events |= libc::POLLIN;
            }
            if reg.mask.writable {
                events |= libc::POLLOUT;
            }
            pollfds.push(libc::pollfd { fd: reg.fd, events, revents: 0 });
        }
        let millis = timeout.map(|d| d.as_millis() as libc::c_int).unwrap_or(-1);
        cvt(unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, millis) })?;
        if pollfds[0].revents & libc::POLLIN != 0 {
            drain_pipe(self.waker_read.as_raw_fd());
        }
        let mut out = Vec::new();
        for pollfd in &pollfds[1..] {
            if pollfd.revents == 0 {
                continue;
            }
            out.push(Readiness {
                fd: pollfd.fd,
                readable: pollfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
                writable: pollfd.revents & (libc::POLLOUT | libc::POLLERR) != 0,
            });
        }
        Ok(out)
    }

    fn waker_target(&self) -> Handle {
        self.waker_write.as_raw_fd()
    }
}

fn drain_pipe(fd: Handle) {
    let mut buf = [0u8; 64];
    loop {
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n <= 0 {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    #[test]
    fn reports_readable_peer() {
        let backend = PollBackend::new().unwrap();
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        backend.register(a.as_raw_fd(), Mask::READ).unwrap();
        b.write_all(b"x").unwrap();
        let readiness = backend.wait(Some(Duration::from_secs(2))).unwrap();
        assert!(readiness.iter().any(|r| r.fd == a.as_raw_fd() && r.readable));
    }
}
