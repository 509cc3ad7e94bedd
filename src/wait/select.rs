//! The `select(2)` least-common-denominator fallback (§4.E), forced on by
//! the `select-backend` feature for testing the narrowest backend path —
//! notably its `FD_SETSIZE` ceiling, which the other three backends don't
//! share.

use crate::error::{ErrorKind, MprError, Result};
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

pub struct SelectBackend {
    waker_read: OwnedFd,
    waker_write: OwnedFd,
    registered: Mutex<Vec<Registration>>,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(MprError::from_io(ErrorKind::Io, std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

impl SelectBackend {
    pub fn new() -> Result<Self> {
        let mut fds = [0i32; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        for fd in fds {
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) })?;
        }
        let waker_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let waker_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        Ok(SelectBackend { waker_read, waker_write, registered: Mutex::new(Vec::new()) })
    }
}

impl WaitBackend for SelectBackend {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(MprError::new(ErrorKind::TooManyHandlers, "fd exceeds FD_SETSIZE for select backend"));
        }
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
        let mut read_set: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_SET(self.waker_read.as_raw_fd(), &mut read_set);
        }
        let mut max_fd = self.waker_read.as_raw_fd();
        for reg in &regs {
            if reg.mask.readable {
                unsafe { libc::FD_SET(reg.fd, &mut read_set) };
            }
            if reg.mask.writable {
                unsafe { libc::FD_SET(reg.fd, &mut write_set) };
            }
            max_fd = max_fd.max(reg.fd);
        }
        let mut timeval = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let timeval_ptr = timeval.as_mut().map(|t| t as *mut _).unwrap_or(std::ptr::null_mut());
        cvt(unsafe {
            libc::select(max_fd + 1, &mut read_set, &mut write_set, std::ptr::null_mut(), timeval_ptr)
        })?;
        if unsafe { libc::FD_ISSET(self.waker_read.as_raw_fd(), &read_set) } {
            drain_pipe(self.waker_read.as_raw_fd());
        }
        let mut out = Vec::new();
        for reg in &regs {
            let readable = reg.mask.readable && unsafe { libc::FD_ISSET(reg.fd, &read_set) };
            let writable = reg.mask.writable && unsafe { libc::FD_ISSET(reg.fd, &write_set) };
            if readable || writable {
                out.push(Readiness { fd: reg.fd, readable, writable });
            }
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
