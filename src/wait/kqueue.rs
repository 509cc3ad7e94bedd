//! BSD-family backend, grounded on `tokio-rs-mio`'s
//! `sys/unix/selector/kqueue.rs`.

use crate::error::{MprError, Result};
use crate::wait::backend::{Readiness, WaitBackend};
use crate::wait::Mask;
use std::collections::HashMap;
use crate::wait::backend::Handle;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Mutex;
use std::time::Duration;

#[cfg(not(target_os = "netbsd"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;

pub struct KqueueBackend {
    kq: OwnedFd,
    waker_read: OwnedFd,
    waker_write: OwnedFd,
    registered: Mutex<HashMap<Handle, Mask>>,
}

fn cvt(ret: libc::c_int) -> Result<libc::c_int> {
    if ret < 0 {
        Err(MprError::from_io(crate::error::ErrorKind::Io, std::io::Error::last_os_error()))
    } else {
        Ok(ret)
    }
}

fn kevent_for(fd: Handle, filter: libc::c_int, flags: u16) -> libc::kevent {
    libc::kevent {
        ident: fd as libc::uintptr_t,
        filter: filter as Filter,
        flags,
        fflags: 0,
        data: 0,
        udata: std::ptr::null_mut(),
    }
}

impl KqueueBackend {
    pub fn new() -> Result<Self> {
        let kq_fd = cvt(unsafe { libc::kqueue() })?;
        cvt(unsafe { libc::fcntl(kq_fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        let kq = unsafe { OwnedFd::from_raw_fd(kq_fd) };
        let mut fds = [0i32; 2];
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        for fd in fds {
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) })?;
            cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        }
        let waker_read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let waker_write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
        let backend = KqueueBackend { kq, waker_read, waker_write, registered: Mutex::new(HashMap::new()) };
        backend.register(backend.waker_read.as_raw_fd(), Mask::READ)?;
        Ok(backend)
    }

    fn apply(&self, fd: Handle, mask: Mask, add: bool) -> Result<()> {
        let flags_read = if add && mask.readable { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE };
        let flags_write = if add && mask.writable { libc::EV_ADD | libc::EV_CLEAR } else { libc::EV_DELETE };
        let mut changes = vec![kevent_for(fd, libc::EVFILT_READ, flags_read)];
        changes.push(kevent_for(fd, libc::EVFILT_WRITE, flags_write));
        // EV_DELETE on a filter never registered returns ENOENT; harmless here.
        unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                changes.as_ptr(),
                changes.len() as i32,
                std::ptr::null_mut(),
                0,
                std::ptr::null(),
            )
        };
        Ok(())
    }
}

impl WaitBackend for KqueueBackend {
    fn register(&self, fd: Handle, mask: Mask) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).insert(fd, mask);
        self.apply(fd, mask, true)
    }

    fn reregister(&self, fd: Handle, mask: Mask) -> Result<()> {
        self.apply(fd, Mask::NONE, false)?;
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).insert(fd, mask);
        self.apply(fd, mask, true)
    }

    fn deregister(&self, fd: Handle) -> Result<()> {
        self.registered.lock().unwrap_or_else(|e| e.into_inner()).remove(&fd);
        self.apply(fd, Mask::NONE, false)
    }

    fn wait(&self, timeout: Option<Duration>) -> Result<Vec<Readiness>> {
        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as libc::c_long,
        });
        let ts_ptr = ts.as_ref().map(|t| t as *const _).unwrap_or(std::ptr::null());
        let mut events = vec![kevent_for(0, 0, 0); 128];
        let n = cvt(unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                std::ptr::null(),
                0,
                events.as_mut_ptr(),
                events.len() as i32,
                ts_ptr,
            )
        })?;
        let mut by_fd: HashMap<Handle, Readiness> = HashMap::new();
        for event in &events[..n as usize] {
            let fd = event.ident as Handle;
            if fd == self.waker_read.as_raw_fd() {
                drain_pipe(fd);
                continue;
            }
            let entry = by_fd.entry(fd).or_insert(Readiness { fd, readable: false, writable: false });
            match event.filter as Filter {
                f if f == libc::EVFILT_READ as Filter => entry.readable = true,
                f if f == libc::EVFILT_WRITE as Filter => entry.writable = true,
                _ => {}
            }
        }
        Ok(by_fd.into_values().collect())
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
