//! Non-blocking TCP/UDP sockets and address parsing (§4.G).
//!
//! Built on `std::net` rather than raw `socket(2)` calls — `TcpStream`,
//! `TcpListener` and `UdpSocket` already give a safe, non-blocking-capable
//! surface; the grounding this module draws from `tokio-rs-mio`'s
//! `sys/unix/{net,tcp,udp}.rs` is in how blocking-vs-nonblocking semantics
//! and address parsing are handled, not in re-deriving socket creation.

use crate::error::{ErrorKind, MprError, Result};
use crate::wait::HandlerId;
use std::io::{self, IoSlice, IoSliceMut, Read, Seek, SeekFrom, Write};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};

/// Parses an address of the form `host:port`, `[ipv6]:port`, `*:port`
/// (wildcard bind to all interfaces) or a bare `:port` (same as `*`).
/// IPv4 is preferred over IPv6 when a hostname resolves to both (§4.G).
pub fn parse_address(spec: &str) -> Result<SocketAddr> {
    let spec = spec.trim();
    if let Some(rest) = spec.strip_prefix('[') {
        let close = rest.find(']').ok_or_else(|| bad_address(spec))?;
        let host = &rest[..close];
        let port_part = rest[close + 1..].strip_prefix(':').ok_or_else(|| bad_address(spec))?;
        let port: u16 = port_part.parse().map_err(|_| bad_address(spec))?;
        let ip: Ipv6Addr = host.parse().map_err(|_| bad_address(spec))?;
        return Ok(SocketAddr::new(IpAddr::V6(ip), port));
    }
    let (host, port_part) = spec.rsplit_once(':').ok_or_else(|| bad_address(spec))?;
    let port: u16 = port_part.parse().map_err(|_| bad_address(spec))?;
    if host.is_empty() || host == "*" {
        return Ok(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    resolve_host_prefer_v4(host, port)
}

fn resolve_host_prefer_v4(host: &str, port: u16) -> Result<SocketAddr> {
    use std::net::ToSocketAddrs;
    let mut candidates: Vec<SocketAddr> =
        (host, port).to_socket_addrs().map_err(|e| MprError::from_io(ErrorKind::Io, e))?.collect();
    candidates.sort_by_key(|a| !a.is_ipv4());
    candidates.into_iter().next().ok_or_else(|| bad_address(host))
}

fn bad_address(spec: &str) -> MprError {
    MprError::new(ErrorKind::BadArgument, format!("invalid socket address: {spec}"))
}

/// Fills a `sockaddr_storage` for `connect(2)`/`bind(2)` without relying on
/// `std::net::SocketAddrV4`/`V6` sharing layout with `libc::sockaddr_in{,6}`.
#[cfg(unix)]
fn raw_sockaddr(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: v4.port().to_be(),
                sin_addr: libc::in_addr { s_addr: u32::from(*v4.ip()).to_be() },
                sin_zero: [0; 8],
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
                sin_len: std::mem::size_of::<libc::sockaddr_in>() as u8,
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: v6.port().to_be(),
                sin6_flowinfo: v6.flowinfo(),
                sin6_addr: libc::in6_addr { s6_addr: v6.ip().octets() },
                sin6_scope_id: v6.scope_id(),
                #[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd", target_os = "netbsd", target_os = "openbsd", target_os = "dragonfly"))]
                sin6_len: std::mem::size_of::<libc::sockaddr_in6>() as u8,
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Issues a non-blocking `socket(2)` + `connect(2)` pair, returning the raw
/// stream and whether the handshake is still in progress (`EINPROGRESS`),
/// grounded on the teacher's own `sys/unix/socket.rs` `Socket::connect`.
#[cfg(unix)]
fn connect_nonblocking(addr: SocketAddr) -> Result<(TcpStream, bool)> {
    use std::os::fd::FromRawFd;

    let domain = if addr.is_ipv4() { libc::AF_INET } else { libc::AF_INET6 };
    let fd = unsafe { libc::socket(domain, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(MprError::from_io(ErrorKind::Io, io::Error::last_os_error()));
    }
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(MprError::from_io(ErrorKind::Io, err));
    }

    let (storage, len) = raw_sockaddr(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    let in_progress = if ret < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            unsafe { libc::close(fd) };
            return Err(MprError::from_io(ErrorKind::Io, err));
        }
        true
    } else {
        false
    };
    Ok((unsafe { TcpStream::from_raw_fd(fd) }, in_progress))
}

/// Maps a `std::io` result into the spec's would-block/EOF contract: `Ok(0)`
/// on a closed peer, `Err(WouldBlock)` propagated as-is, everything else
/// wrapped.
fn map_io_result<T>(result: io::Result<T>) -> Result<T> {
    result.map_err(MprError::from)
}

/// A non-blocking TCP listener.
pub struct TcpSocket {
    listener: TcpListener,
    /// The wait-service registration this listener is plugged into, if any
    /// (§4.E/§4.G — a socket carries a reference to its `WaitHandler`).
    wait_handler: Option<HandlerId>,
}

impl TcpSocket {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        listener.set_nonblocking(true).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        Ok(TcpSocket { listener, wait_handler: None })
    }

    /// Non-blocking accept: returns `Err` with kind [`ErrorKind::WouldBlock`]
    /// when no connection is pending.
    pub fn accept(&self) -> Result<(TcpConnection, SocketAddr)> {
        let (stream, peer) = map_io_result(self.listener.accept())?;
        stream.set_nonblocking(true).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        Ok((TcpConnection { stream, wait_handler: None, connecting: false }, peer))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        map_io_result(self.listener.local_addr())
    }

    pub fn wait_handler(&self) -> Option<HandlerId> {
        self.wait_handler
    }

    pub fn set_wait_handler(&mut self, id: HandlerId) {
        self.wait_handler = Some(id);
    }
}

impl AsRawFd for TcpSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// A non-blocking TCP connection, either accepted or dialed.
pub struct TcpConnection {
    stream: TcpStream,
    /// The wait-service registration this connection is plugged into, if any
    /// (§4.E/§4.G).
    wait_handler: Option<HandlerId>,
    /// True between `connect()` issuing a non-blocking handshake and
    /// `take_connect_result()` resolving it.
    connecting: bool,
}

impl TcpConnection {
    /// Issues a non-blocking `connect(2)` and returns immediately, whether
    /// or not the handshake has finished. Check [`Self::is_connecting`]; if
    /// true, register this connection for writable interest and call
    /// [`Self::take_connect_result`] once the wait callback fires (§4.G).
    pub fn connect(addr: SocketAddr) -> Result<Self> {
        #[cfg(unix)]
        {
            let (stream, connecting) = connect_nonblocking(addr)?;
            Ok(TcpConnection { stream, wait_handler: None, connecting })
        }
        #[cfg(not(unix))]
        {
            let stream = TcpStream::connect(addr).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
            stream.set_nonblocking(true).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
            Ok(TcpConnection { stream, wait_handler: None, connecting: false })
        }
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting
    }

    pub fn wait_handler(&self) -> Option<HandlerId> {
        self.wait_handler
    }

    pub fn set_wait_handler(&mut self, id: HandlerId) {
        self.wait_handler = Some(id);
    }

    /// Resolves an in-progress non-blocking connect by reading `SO_ERROR`
    /// once the wait service reports this connection writable. A no-op if
    /// the connect already completed synchronously.
    #[cfg(unix)]
    pub fn take_connect_result(&mut self) -> Result<()> {
        if !self.connecting {
            return Ok(());
        }
        let mut err: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockopt(
                self.stream.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut err as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        self.connecting = false;
        if ret < 0 {
            return Err(MprError::from_io(ErrorKind::Io, io::Error::last_os_error()));
        }
        if err != 0 {
            return Err(MprError::from_io(ErrorKind::Io, io::Error::from_raw_os_error(err)));
        }
        Ok(())
    }

    /// Reads into `buf`. `Ok(0)` means the peer closed the connection;
    /// a `WouldBlock`-kind error means try again once readable.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        map_io_result(self.stream.read(buf))
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        map_io_result(self.stream.write(buf))
    }

    /// Vectored write across multiple buffers in one syscall (§4.G).
    pub fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        map_io_result(self.stream.write_vectored(bufs))
    }

    pub fn read_vectored(&mut self, bufs: &mut [IoSliceMut<'_>]) -> Result<usize> {
        map_io_result(self.stream.read_vectored(bufs))
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        map_io_result(self.stream.peer_addr())
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> Result<()> {
        map_io_result(self.stream.shutdown(how))
    }

    pub fn set_nodelay(&self, enabled: bool) -> Result<()> {
        map_io_result(self.stream.set_nodelay(enabled))
    }

    /// Sends a file's contents directly from the OS page cache, avoiding a
    /// userspace copy where the platform supports it (`sendfile(2)` on
    /// Linux); falls back to a buffered `read`/`write` loop elsewhere.
    ///
    /// `before`/`after` are header/trailer buffers emitted via a leading and
    /// a follow-up `writev`, bracketing the file body read from `offset`
    /// (§4.G's `send_file_to_socket(file, offset, count, beforeVec,
    /// afterVec)` contract).
    pub fn send_file(
        &mut self,
        file: &mut std::fs::File,
        offset: u64,
        count: usize,
        before: &[&[u8]],
        after: &[&[u8]],
    ) -> Result<usize> {
        let mut sent = 0usize;
        if !before.is_empty() {
            let slices: Vec<IoSlice<'_>> = before.iter().map(|b| IoSlice::new(b)).collect();
            sent += self.write_vectored(&slices)?;
        }

        map_io_result(file.seek(SeekFrom::Start(offset)))?;
        #[cfg(target_os = "linux")]
        {
            let out_fd = self.stream.as_raw_fd();
            let in_fd = file.as_raw_fd();
            let mut off = offset as libc::off_t;
            let body_sent = unsafe { libc::sendfile(out_fd, in_fd, &mut off, count) };
            if body_sent >= 0 {
                sent += body_sent as usize;
            } else {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::WouldBlock {
                    return Err(MprError::from_io(ErrorKind::Io, err));
                }
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut buf = vec![0u8; count.min(64 * 1024)];
            let n = map_io_result(file.read(&mut buf))?;
            if n > 0 {
                sent += self.write(&buf[..n])?;
            }
        }

        if !after.is_empty() {
            let slices: Vec<IoSlice<'_>> = after.iter().map(|b| IoSlice::new(b)).collect();
            sent += self.write_vectored(&slices)?;
        }
        Ok(sent)
    }
}

impl AsRawFd for TcpConnection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

/// A non-blocking UDP socket.
pub struct UdpSocketHandle {
    socket: UdpSocket,
}

impl UdpSocketHandle {
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        socket.set_nonblocking(true).map_err(|e| MprError::from_io(ErrorKind::Io, e))?;
        Ok(UdpSocketHandle { socket })
    }

    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize> {
        map_io_result(self.socket.send_to(buf, addr))
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        map_io_result(self.socket.recv_from(buf))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        map_io_result(self.socket.local_addr())
    }
}

impl AsRawFd for UdpSocketHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wildcard_and_bracketed_forms() {
        assert_eq!(parse_address("*:8080").unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(parse_address(":8080").unwrap(), "0.0.0.0:8080".parse().unwrap());
        assert_eq!(parse_address("[::1]:9000").unwrap(), "[::1]:9000".parse().unwrap());
        assert_eq!(parse_address("127.0.0.1:80").unwrap(), "127.0.0.1:80".parse().unwrap());
    }

    #[test]
    fn rejects_malformed_address() {
        assert!(parse_address("not-an-address").is_err());
    }

    #[test]
    fn accept_connect_round_trip() {
        let listener = TcpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpConnection::connect(addr).unwrap();
        // Give the listener a moment; non-blocking accept may need a retry.
        let mut server = None;
        for _ in 0..200 {
            match listener.accept() {
                Ok(pair) => {
                    server = Some(pair.0);
                    break;
                }
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let mut server = server.expect("listener never became ready");
        loop {
            match client.write(b"ping") {
                Ok(_) => break,
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("write failed: {e}"),
            }
        }
        let mut buf = [0u8; 4];
        loop {
            match server.read(&mut buf) {
                Ok(4) => break,
                Ok(_) => continue,
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&buf, b"ping");
    }

    #[test]
    fn connect_is_non_blocking_and_resolves_via_take_connect_result() {
        let listener = TcpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpConnection::connect(addr).unwrap();

        for _ in 0..200 {
            if listener.accept().is_ok() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }

        for _ in 0..200 {
            if client.take_connect_result().is_ok() && !client.is_connecting() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("non-blocking connect never resolved");
    }

    #[test]
    fn send_file_brackets_the_body_with_header_and_trailer_writes() {
        use std::io::Write as _;

        let dir = std::env::temp_dir().join(format!("mpr-sendfile-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("body.bin");
        std::fs::write(&path, b"BODY").unwrap();
        let mut file = std::fs::File::open(&path).unwrap();

        let listener = TcpSocket::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpConnection::connect(addr).unwrap();
        let mut server = None;
        for _ in 0..200 {
            match listener.accept() {
                Ok(pair) => {
                    server = Some(pair.0);
                    break;
                }
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        let mut server = server.expect("listener never became ready");

        let header = b"HDR:";
        let trailer = b":TRL";
        loop {
            match client.send_file(&mut file, 0, 4, &[header.as_slice()], &[trailer.as_slice()]) {
                Ok(_) => break,
                Err(e) if e.is_would_block() => std::thread::sleep(std::time::Duration::from_millis(5)),
                Err(e) => panic!("send_file failed: {e}"),
            }
        }
        drop(client);

        let mut buf = Vec::new();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut chunk = [0u8; 64];
        loop {
            match server.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.is_would_block() => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    assert!(std::time::Instant::now() < deadline, "never received the full send_file payload");
                }
                Err(e) => panic!("read failed: {e}"),
            }
        }
        assert_eq!(&buf, b"HDR:BODY:TRL");
        std::fs::remove_dir_all(&dir).ok();
    }
}
