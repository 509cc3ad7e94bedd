//! Linux backend, grounded on `tokio-rs-mio`'s `sys/unix/selector/epoll.rs`.

use crate::error::{MprError, Result};
use crate::wait::backend::{Readiness, WaitBackend};
use crate::wait::Mask;
use crate::wait::backend::Handle;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

pub struct EpollBackend {
    ep: OwnedFd,
    waker_read: OwnedFd,
    waker_write: OwnedFd,
    events: Mutex<Vec<libc::epoll_event>>,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(MprError::from_io(crate::error::ErrorKind::Io, std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

impl EpollBackend {
    pub fn new() -> Result<Self> {
        let ep_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        let ep = unsafe { OwnedFd::from_raw_fd(ep_fd) };
        let mut fds = [0i32; 2];
        cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) })?;
        let waker_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let waker_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        let backend = EpollBackend { ep, waker_read, waker_write, events: Mutex::new(Vec::with_capacity(128)) };
        backend.register(backend.waker_read.as_raw_fd(), Mask::READ)?;
        Ok(backend)
    }

    fn interests_to_epoll(mask: Mask) -> u32 {
        let mut kind = libc::EPOLLET;
        if mask.readable {
            kind |= libc::EPOLLIN | libc::EPOLLRDHUP;
        }
        if mask.writable {
            kind |= libc::EPOLLOUT;
        }
        kind as u32
    }
}

impl WaitBackend for EpollBackend {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()> {
        let mut event =
            libc::epoll_event { events: Self::interests_to_epoll(mask), u64: fd as u64 };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) })?;
        Ok(())
    }

    fn reregister(&self, fd: Handle, mask: Mask) -> Result<()> {
        let mut event =
            libc::epoll_event { events: Self::interests_to_epoll(mask), u64: fd as u64 };
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_MOD, fd, &mut event) })?;
        Ok(())
    }

    fn deregister(&self, fd: Handle) -> Result<()> {
        cvt(unsafe { libc::epoll_ctl(self.ep.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut()) })?;
        Ok(())
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        let millis = timeout
            .map(|d| d.checked_add(Duration::from_nanos(999_999)).unwrap_or(d).as_millis() as libc::c_int)
            .unwrap_or(-1);
        let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
        events.clear();
        events.resize(128, libc::epoll_event { events: 0, u64: 0 });
        let n = cvt(unsafe {
            libc::epoll_wait(self.ep.as_raw_fd(), events.as_mut_ptr(), events.len() as i32, millis)
        })?;
        let mut out = Vec::with_capacity(n as usize);
        for event in &events[..n as usize] {
            let fd = event.u64 as Handle;
            if fd == self.waker_read.as_raw_fd() {
                drain_pipe(self.waker_read.as_raw_fd());
                continue;
            }
            let bits = event.events as libc::c_int;
            out.push(Readiness {
                fd,
                readable: bits & (libc::EPOLLIN | libc::EPOLLHUP | libc::EPOLLERR) != 0,
                writable: bits & (libc::EPOLLOUT | libc::EPOLLERR) != 0,
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
