//! A single-threaded echo server built directly on `mpr`'s wait service and
//! socket layer — no dispatcher, no worker pool, just the §4.E/§4.G loop a
//! minimal embedding would write by hand.
//!
//! Run it, then in another terminal:
//!   $ nc 127.0.0.1 13265

use std::collections::HashMap;
use std::io;

use mpr::socket::TcpSocket;
use mpr::wait::{HandlerId, Mask, WaitService};

const DATA: &[u8] = b"Hello world!\n";

struct Connection {
    handler: HandlerId,
    sock: mpr::socket::TcpConnection,
    pending_write: bool,
}

fn main() -> io::Result<()> {
    env_logger::init();

    let wait = WaitService::new().expect("wait service init");
    let listener = TcpSocket::bind("127.0.0.1:13265".parse().unwrap()).expect("bind");
    let listener_handler = wait.add(std::os::fd::AsRawFd::as_raw_fd(&listener), Mask::READ).expect("register listener");

    let mut connections: HashMap<HandlerId, Connection> = HashMap::new();

    println!("You can connect to the server using `nc`:");
    println!(" $ nc 127.0.0.1 13265");
    println!("You'll see our welcome message and anything you type will be printed here.");

    loop {
        let ready = wait.wait(None).expect("wait");
        for (id, mask) in ready {
            if id == listener_handler {
                accept_all(&wait, &listener, &mut connections);
                continue;
            }
            let done = match connections.get_mut(&id) {
                Some(conn) => handle_connection_event(&wait, conn, mask),
                None => false, // a stale event for an already-removed connection
            };
            if done {
                if let Some(conn) = connections.remove(&id) {
                    let _ = wait.remove(conn.handler);
                }
            }
        }
    }
}

fn accept_all(wait: &WaitService, listener: &TcpSocket, connections: &mut HashMap<HandlerId, Connection>) {
    loop {
        match listener.accept() {
            Ok((sock, addr)) => {
                println!("Accepted connection from: {addr}");
                let fd = std::os::fd::AsRawFd::as_raw_fd(&sock);
                let handler = wait.add(fd, Mask::READ.union(Mask::WRITE)).expect("register connection");
                connections.insert(handler, Connection { handler, sock, pending_write: true });
            }
            Err(e) if e.is_would_block() => break,
            Err(e) => {
                eprintln!("accept failed: {e}");
                break;
            }
        }
    }
}

/// Returns `true` if the connection should be torn down.
fn handle_connection_event(wait: &WaitService, conn: &mut Connection, mask: Mask) -> bool {
    if mask.writable && conn.pending_write {
        match conn.sock.write(DATA) {
            Ok(n) if n < DATA.len() => return true, // short write: treat as fatal, same as a WriteZero
            Ok(_) => {
                conn.pending_write = false;
                let _ = wait.modify(conn.handler, Mask::READ);
            }
            Err(e) if e.is_would_block() => {}
            Err(e) => {
                eprintln!("write failed: {e}");
                return true;
            }
        }
    }

    if mask.readable {
        let mut received = Vec::with_capacity(256);
        loop {
            let mut buf = [0u8; 256];
            match conn.sock.read(&mut buf) {
                Ok(0) => return true, // peer closed
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.is_would_block() => break,
                Err(e) => {
                    eprintln!("read failed: {e}");
                    return true;
                }
            }
        }
        match std::str::from_utf8(&received) {
            Ok(text) => println!("Received data: {}", text.trim_end()),
            Err(_) => println!("Received (non-UTF-8) data: {received:?}"),
        }
    }

    false
}
