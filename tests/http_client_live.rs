//! Drives `HttpConnection` over a real loopback TCP socket against a tiny
//! hand-rolled server thread, exercising the `BEGIN -> WAIT -> CHUNK ->
//! COMPLETE` path and a 401-then-Digest-retry round trip the way a real
//! transport (rather than `feed()` fed with pre-built byte strings) would.

#![cfg(feature = "http-client")]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use mpr::http::{Credentials, HttpConfig, HttpConnection, State, Url};

fn drive(conn: &mut HttpConnection, stream: &mut TcpStream) {
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let out = conn.take_output();
    if !out.is_empty() {
        stream.write_all(&out).unwrap();
    }
    let mut buf = [0u8; 512];
    while !conn.is_complete() {
        let n = stream.read(&mut buf).unwrap();
        if n == 0 {
            conn.note_peer_closed();
            break;
        }
        conn.feed(&buf[..n]).unwrap();
    }
}

#[test]
fn chunked_response_over_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).unwrap(); // drain the request line/headers
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .unwrap();
    });

    let url = Url::parse(&format!("http://{addr}/")).unwrap();
    let mut conn = HttpConnection::new(HttpConfig::default());
    conn.begin_request("GET", &url, &[], &[]).unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    drive(&mut conn, &mut stream);

    assert_eq!(conn.state(), State::Complete);
    assert_eq!(conn.response().body, b"hello world");
    server.join().unwrap();
}

#[test]
fn digest_challenge_then_authorized_retry_over_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let _ = stream.read(&mut buf).unwrap();
        stream
            .write_all(
                b"HTTP/1.1 401 Unauthorized\r\n\
                  WWW-Authenticate: Digest realm=\"r\", nonce=\"abc123\", qop=\"auth\"\r\n\
                  Content-Length: 0\r\n\r\n",
            )
            .unwrap();

        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        let n = stream.read(&mut buf).unwrap();
        let request = String::from_utf8_lossy(&buf[..n]);
        assert!(request.contains("Authorization: Digest username=\"bob\""));
        stream.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok").unwrap();
    });

    let url = Url::parse(&format!("http://{addr}/secure")).unwrap();
    let mut conn = HttpConnection::new(HttpConfig::default());
    conn.set_credentials(Credentials { username: "bob".into(), password: "hunter2".into() });
    conn.begin_request("GET", &url, &[], &[]).unwrap();

    let mut stream = TcpStream::connect(addr).unwrap();
    drive(&mut conn, &mut stream);
    assert!(conn.should_retry_unauthorized());
    conn.retry_with_auth("client-nonce").unwrap();

    // The server above closes after the 401 and expects a fresh connection
    // for the retried request, mirroring a non-keep-alive 401 response.
    let mut stream = TcpStream::connect(addr).unwrap();
    drive(&mut conn, &mut stream);

    assert_eq!(conn.state(), State::Complete);
    assert_eq!(conn.response().body, b"ok");
    server.join().unwrap();
}
