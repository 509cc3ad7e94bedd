//! A UDP echo server built on `mpr`'s wait service and socket layer.
//!
//! Run it, then in another terminal:
//!   $ nc -u 127.0.0.1 9000

use std::io;

use mpr::socket::UdpSocketHandle;
use mpr::wait::{Mask, WaitService};

fn main() -> io::Result<()> {
    env_logger::init();

    let wait = WaitService::new().expect("wait service init");
    let socket = UdpSocketHandle::bind("127.0.0.1:9000".parse().unwrap()).expect("bind");
    let handler = wait.add(std::os::fd::AsRawFd::as_raw_fd(&socket), Mask::READ).expect("register socket");

    println!("You can connect to the server using `nc`:");
    println!(" $ nc -u 127.0.0.1 9000");
    println!("Anything you type will be echoed back to you.");

    let mut buf = vec![0u8; u16::MAX as usize];

    loop {
        let ready = wait.wait(None).expect("wait");
        for (id, mask) in ready {
            if id != handler || !mask.readable {
                eprintln!("got event for unexpected handler: {id:?}");
                continue;
            }
            loop {
                match socket.recv_from(&mut buf) {
                    Ok((len, source)) => {
                        println!("Got packet ({len} bytes) from '{source}'.");
                        if let Err(e) = socket.send_to(&buf[..len], source) {
                            eprintln!("send_to failed: {e}");
                        }
                    }
                    Err(e) if e.is_would_block() => break,
                    Err(e) => {
                        eprintln!("recv_from failed: {e}");
                        break;
                    }
                }
            }
        }
    }
}
