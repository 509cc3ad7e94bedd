//! The client HTTP/1.1 state machine (§4.H):
//! `BEGIN → WAIT → (CHUNK ⟲) | CONTENT → COMPLETE`.
//!
//! `HttpConnection` is transport-agnostic: [`HttpConnection::take_output`]
//! hands the caller bytes to write to a socket, and [`HttpConnection::feed`]
//! is fed whatever the socket read back. This keeps the state machine
//! testable without a live connection, and lets the runtime drive it from
//! either the single-threaded or multi-threaded scheduling model.

use crate::dispatcher::{Dispatcher, EventId, Recurrence};
use crate::http::auth::{basic_header, digest_header, parse_digest_challenge, Credentials, DigestChallenge};
use crate::http::chunk::{ChunkHeader, ChunkParser};
use crate::http::url::Url;
use crate::error::{ErrorKind, MprError, Result};
use crate::sync::MprMutex;
use crate::time;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Begin,
    Wait,
    Content,
    Chunk,
    Complete,
}

enum ChunkPhase {
    Size,
    Data(u64),
    TrailerCrlf,
}

#[derive(Debug, Clone, Default)]
pub struct Response {
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_length: Option<u64>,
    pub keep_alive: bool,
    pub chunked: bool,
    pub location: Option<String>,
    pub www_authenticate: Option<DigestChallenge>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k.eq_ignore_ascii_case(name)).map(|(_, v)| v.as_str())
    }
}

#[derive(Clone)]
struct PendingRequest {
    method: String,
    url: Url,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Per-connection HTTP configuration. `timer_period` is how often the
/// runtime's idle-connection sweep runs; `follow_redirects` and
/// `max_retries` gate the 3xx/401 retry behavior.
#[derive(Debug, Clone, Copy)]
pub struct HttpConfig {
    pub timer_period: Duration,
    pub follow_redirects: bool,
    pub max_retries: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig { timer_period: Duration::from_millis(5000), follow_redirects: false, max_retries: 1 }
    }
}

pub struct HttpConnection {
    config: HttpConfig,
    credentials: Option<Credentials>,
    timeout: Duration,
    last_activity: Instant,
    state: State,
    out_buf: Vec<u8>,
    header_buf: Vec<u8>,
    chunk_buf: Vec<u8>,
    chunk_parser: ChunkParser,
    chunk_phase: ChunkPhase,
    content_remaining: u64,
    response: Response,
    pending: Option<PendingRequest>,
    retries_sent: u32,
    digest_nc: u32,
    chunked_outgoing: bool,
}

impl HttpConnection {
    pub fn new(config: HttpConfig) -> Self {
        HttpConnection {
            config,
            credentials: None,
            timeout: Duration::from_secs(30),
            last_activity: time::now(),
            state: State::Begin,
            out_buf: Vec::new(),
            header_buf: Vec::new(),
            chunk_buf: Vec::new(),
            chunk_parser: ChunkParser::new(),
            chunk_phase: ChunkPhase::Size,
            content_remaining: 0,
            response: Response::default(),
            pending: None,
            retries_sent: 0,
            digest_nc: 0,
            chunked_outgoing: false,
        }
    }

    pub fn set_credentials(&mut self, credentials: Credentials) {
        self.credentials = Some(credentials);
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn is_complete(&self) -> bool {
        self.state == State::Complete
    }

    pub fn idle_for(&self) -> Duration {
        time::elapsed_since(self.last_activity)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Assembles a request line, headers and (non-chunked) body into the
    /// output buffer and advances to `WAIT`. Credentials, if set from a
    /// prior 401, are attached automatically only on retry.
    pub fn begin_request(&mut self, method: &str, url: &Url, headers: &[(String, String)], body: &[u8]) -> Result<()> {
        self.header_buf.clear();
        self.chunk_buf.clear();
        self.response = Response::default();
        self.chunk_phase = ChunkPhase::Size;
        self.chunk_parser = ChunkParser::new();
        self.pending = Some(PendingRequest { method: method.to_string(), url: url.clone(), headers: headers.to_vec(), body: body.to_vec() });
        self.assemble_request(method, url, headers, Some(body), None)?;
        self.state = State::Wait;
        self.touch();
        Ok(())
    }

    fn assemble_request(
        &mut self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        body: Option<&[u8]>,
        auth_header: Option<String>,
    ) -> Result<()> {
        let mut out = Vec::new();
        out.extend_from_slice(format!("{method} {} HTTP/1.1\r\n", url.request_target()).as_bytes());
        out.extend_from_slice(format!("Host: {}\r\n", url.host).as_bytes());
        for (name, value) in headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if let Some(auth) = &auth_header {
            out.extend_from_slice(format!("Authorization: {auth}\r\n").as_bytes());
        }
        match body {
            Some(content) if !self.chunked_outgoing => {
                out.extend_from_slice(format!("Content-Length: {}\r\n\r\n", content.len()).as_bytes());
                out.extend_from_slice(content);
            }
            _ => {
                out.extend_from_slice(b"Transfer-Encoding: chunked\r\n\r\n");
            }
        }
        self.out_buf.extend_from_slice(&out);
        Ok(())
    }

    /// Enables outgoing chunked transfer for the current request.
    pub fn begin_chunked_body(&mut self) {
        self.chunked_outgoing = true;
    }

    /// Writes one chunk of the outgoing body; `write(_, 0)` (an empty
    /// slice) is equivalent to [`Self::finalize_writing`].
    pub fn write_chunk(&mut self, data: &[u8]) {
        if data.is_empty() {
            self.finalize_writing();
            return;
        }
        self.out_buf.extend_from_slice(format!("\r\n{:x}\r\n", data.len()).as_bytes());
        self.out_buf.extend_from_slice(data);
    }

    pub fn finalize_writing(&mut self) {
        self.out_buf.extend_from_slice(b"\r\n0\r\n\r\n");
    }

    /// Drains bytes the transport should write next.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out_buf)
    }

    fn touch(&mut self) {
        self.last_activity = time::now();
    }

    /// Feeds bytes read from the transport into the state machine.
    pub fn feed(&mut self, data: &[u8]) -> Result<()> {
        self.touch();
        match self.state {
            State::Wait => self.feed_headers(data),
            State::Content => {
                self.feed_content(data);
                Ok(())
            }
            State::Chunk => self.feed_chunk(data),
            State::Begin | State::Complete => Ok(()),
        }
    }

    fn feed_headers(&mut self, data: &[u8]) -> Result<()> {
        self.header_buf.extend_from_slice(data);
        loop {
            let terminator = find_header_terminator(&self.header_buf);
            let Some(end) = terminator else { return Ok(()) };
            let header_bytes = self.header_buf[..end].to_vec();
            let remainder = self.header_buf.split_off(end + 4);
            self.header_buf.clear();
            let status = parse_status_and_headers(&header_bytes, &mut self.response)?;
            if (100..200).contains(&status) {
                continue_with_remainder(&mut self.header_buf, remainder);
                continue;
            }
            self.response.status = status;
            if self.response.chunked {
                self.state = State::Chunk;
                self.chunk_phase = ChunkPhase::Size;
                return self.feed_chunk(&remainder);
            }
            match self.response.content_length {
                Some(0) => {
                    self.state = State::Complete;
                    return Ok(());
                }
                Some(len) => {
                    self.content_remaining = len;
                    self.state = State::Content;
                    self.feed_content(&remainder);
                    return Ok(());
                }
                None => {
                    // No Content-Length and not chunked: body runs to connection close.
                    self.content_remaining = u64::MAX;
                    self.state = State::Content;
                    self.feed_content(&remainder);
                    return Ok(());
                }
            }
        }
    }

    fn feed_content(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let take = (self.content_remaining.min(data.len() as u64)) as usize;
        self.response.body.extend_from_slice(&data[..take]);
        if self.content_remaining != u64::MAX {
            self.content_remaining -= take as u64;
        }
        if self.content_remaining == 0 {
            self.state = State::Complete;
        }
    }

    /// Signals that the peer closed the connection; relevant only for the
    /// no-`Content-Length` body-until-close case.
    pub fn note_peer_closed(&mut self) {
        if self.state == State::Content && self.content_remaining == u64::MAX {
            self.state = State::Complete;
        }
    }

    fn feed_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.chunk_buf.extend_from_slice(data);
        loop {
            match self.chunk_phase {
                ChunkPhase::Size => match self.chunk_parser.parse_header(&self.chunk_buf)? {
                    ChunkHeader::Incomplete => return Ok(()),
                    ChunkHeader::Parsed { size, consumed } => {
                        self.chunk_buf.drain(0..consumed);
                        self.chunk_phase = if size == 0 { ChunkPhase::TrailerCrlf } else { ChunkPhase::Data(size) };
                    }
                },
                ChunkPhase::Data(remaining) => {
                    if self.chunk_buf.is_empty() {
                        return Ok(());
                    }
                    let take = remaining.min(self.chunk_buf.len() as u64) as usize;
                    self.response.body.extend_from_slice(&self.chunk_buf[..take]);
                    self.chunk_buf.drain(0..take);
                    let left = remaining - take as u64;
                    if left == 0 {
                        self.chunk_phase = ChunkPhase::Size;
                    } else {
                        self.chunk_phase = ChunkPhase::Data(left);
                        return Ok(());
                    }
                }
                ChunkPhase::TrailerCrlf => {
                    if self.chunk_buf.len() < 2 {
                        return Ok(());
                    }
                    if &self.chunk_buf[..2] != b"\r\n" {
                        return Err(MprError::new(ErrorKind::BadChunk, "missing final chunk trailer"));
                    }
                    self.chunk_buf.drain(0..2);
                    self.state = State::Complete;
                    return Ok(());
                }
            }
        }
    }

    pub fn should_retry_unauthorized(&self) -> bool {
        self.response.status == 401
            && self.credentials.is_some()
            && self.response.www_authenticate.is_some()
            && self.retries_sent < self.config.max_retries
    }

    /// Resends the pending request with an `Authorization` header computed
    /// from the prior response's challenge. Digest is preferred when the
    /// challenge carries a nonce; otherwise Basic.
    pub fn retry_with_auth(&mut self, cnonce: &str) -> Result<()> {
        let pending = self.pending.clone().ok_or_else(|| MprError::new(ErrorKind::BadState, "no pending request to retry"))?;
        let creds = self.credentials.clone().ok_or_else(|| MprError::new(ErrorKind::AuthFailed, "no credentials configured"))?;
        self.digest_nc += 1;
        let auth_header = match &self.response.www_authenticate {
            Some(challenge) => digest_header(&creds, challenge, &pending.method, &pending.url.request_target(), self.digest_nc, cnonce),
            None => basic_header(&creds),
        };
        self.retries_sent += 1;
        self.header_buf.clear();
        self.response = Response::default();
        self.assemble_request(&pending.method, &pending.url, &pending.headers, Some(&pending.body), Some(auth_header))?;
        self.state = State::Wait;
        self.touch();
        Ok(())
    }

    pub fn should_follow_redirect(&self) -> bool {
        (300..400).contains(&self.response.status) && self.config.follow_redirects && self.response.location.is_some()
    }

    pub fn retry_with_redirect(&mut self) -> Result<()> {
        let location = self.response.location.clone().ok_or_else(|| MprError::new(ErrorKind::BadState, "no Location header to follow"))?;
        let url = Url::parse(&location)?;
        let pending = self.pending.clone().ok_or_else(|| MprError::new(ErrorKind::BadState, "no pending request to retry"))?;
        self.header_buf.clear();
        self.response = Response::default();
        self.pending = Some(PendingRequest { url: url.clone(), ..pending.clone() });
        self.assemble_request(&pending.method, &url, &pending.headers, Some(&pending.body), None)?;
        self.state = State::Wait;
        self.touch();
        Ok(())
    }
}

/// Tracks every live [`HttpConnection`] and evicts the ones that have sat
/// idle past their own [`HttpConnection::timeout`]. `timer_period` (from the
/// [`HttpConfig`] the pool was built with) is the cadence of the sweep
/// itself, scheduled on a [`Dispatcher`] as a `Continuous` event so it runs
/// as part of the same pump that drives everything else (§5) rather than on
/// a dedicated thread.
pub struct HttpConnectionPool {
    connections: MprMutex<HashMap<u64, Arc<MprMutex<HttpConnection>>>>,
    next_id: AtomicU64,
    config: HttpConfig,
}

impl HttpConnectionPool {
    pub fn new(config: HttpConfig) -> Self {
        HttpConnectionPool { connections: MprMutex::new(HashMap::new()), next_id: AtomicU64::new(1), config }
    }

    /// Hands the pool ownership of `conn`, returning a key the caller uses
    /// to look it back up and a handle to drive it directly.
    pub fn insert(&self, conn: HttpConnection) -> (u64, Arc<MprMutex<HttpConnection>>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(MprMutex::new(conn));
        self.connections.lock().map(|m| m.insert(id, handle.clone()));
        (id, handle)
    }

    pub fn get(&self, id: u64) -> Option<Arc<MprMutex<HttpConnection>>> {
        self.connections.lock().map(|m| m.get(&id).cloned())
    }

    pub fn remove(&self, id: u64) -> Option<Arc<MprMutex<HttpConnection>>> {
        self.connections.lock().map(|m| m.remove(&id))
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every connection whose `idle_for()` has exceeded its own
    /// `timeout`, returning the evicted keys. Connections still mid-request
    /// (anything short of `State::Complete` with fresh activity) are left
    /// alone; only truly idle ones age out.
    pub fn sweep_idle(&self) -> Vec<u64> {
        let candidates = self.connections.lock().map(|m| m.keys().copied().collect::<Vec<_>>());
        let mut evicted = Vec::new();
        for id in candidates {
            let timed_out = self
                .connections
                .lock()
                .map(|m| m.get(&id).map(|conn| conn.lock().map(|c| c.idle_for() >= c.timeout())))
                .unwrap_or(false);
            if timed_out {
                self.connections.lock().map(|m| m.remove(&id));
                evicted.push(id);
            }
        }
        evicted
    }

    /// Schedules [`Self::sweep_idle`] to run every `timer_period` on
    /// `dispatcher`. The returned [`EventId`] can be passed to
    /// [`Dispatcher::remove`] to stop the sweep.
    pub fn spawn_idle_sweep(self: &Arc<Self>, dispatcher: &Dispatcher) -> EventId {
        let pool = self.clone();
        dispatcher.schedule(self.config.timer_period, Recurrence::Continuous(self.config.timer_period), move || {
            pool.sweep_idle();
        })
    }
}

fn continue_with_remainder(header_buf: &mut Vec<u8>, remainder: Vec<u8>) {
    header_buf.extend_from_slice(&remainder);
}

fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_and_headers(raw: &[u8], response: &mut Response) -> Result<u16> {
    let text = std::str::from_utf8(raw).map_err(|_| MprError::new(ErrorKind::BadHeader, "non-utf8 response header"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines.next().ok_or_else(|| MprError::new(ErrorKind::BadHeader, "empty response"))?;
    let mut parts = status_line.splitn(3, ' ');
    let _http_version = parts.next().ok_or_else(bad_status)?;
    let status: u16 = parts.next().ok_or_else(bad_status)?.parse().map_err(|_| bad_status())?;
    let reason = parts.next().unwrap_or("").to_string();
    response.reason = reason;
    response.headers.clear();
    response.keep_alive = true;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| MprError::new(ErrorKind::BadHeader, format!("malformed header line: {line}")))?;
        let name = name.trim();
        let value = value.trim();
        match name.to_ascii_lowercase().as_str() {
            "content-length" => {
                response.content_length = Some(value.parse().map_err(|_| MprError::new(ErrorKind::BadHeader, "bad Content-Length"))?);
            }
            "transfer-encoding" => {
                response.chunked = value.eq_ignore_ascii_case("chunked");
            }
            "connection" => {
                response.keep_alive = !value.eq_ignore_ascii_case("close");
            }
            "location" => {
                response.location = Some(value.to_string());
            }
            "www-authenticate" => {
                response.www_authenticate = parse_digest_challenge(value);
            }
            _ => {}
        }
        response.headers.push((name.to_string(), value.to_string()));
    }
    Ok(status)
}

fn bad_status() -> MprError {
    MprError::new(ErrorKind::BadHeader, "malformed status line")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url::Url;

    #[test]
    fn simple_content_length_response() {
        let mut conn = HttpConnection::new(HttpConfig::default());
        let url = Url::parse("http://example.com/").unwrap();
        conn.begin_request("GET", &url, &[], &[]).unwrap();
        let _ = conn.take_output();
        conn.feed(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").unwrap();
        assert_eq!(conn.state(), State::Complete);
        assert_eq!(conn.response().body, b"hello");
    }

    #[test]
    fn chunked_response_end_to_end() {
        let mut conn = HttpConnection::new(HttpConfig::default());
        let url = Url::parse("http://example.com/").unwrap();
        conn.begin_request("GET", &url, &[], &[]).unwrap();
        let _ = conn.take_output();
        conn.feed(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n").unwrap();
        assert_eq!(conn.state(), State::Complete);
        assert_eq!(conn.response().body, b"hello world");
        assert!(conn.response().keep_alive);
    }

    #[test]
    fn informational_response_is_skipped() {
        let mut conn = HttpConnection::new(HttpConfig::default());
        let url = Url::parse("http://example.com/").unwrap();
        conn.begin_request("GET", &url, &[], &[]).unwrap();
        let _ = conn.take_output();
        conn.feed(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi").unwrap();
        assert_eq!(conn.state(), State::Complete);
        assert_eq!(conn.response().body, b"hi");
    }

    #[test]
    fn idle_sweep_evicts_only_connections_past_their_own_timeout() {
        use crate::dispatcher::Dispatcher;

        let dispatcher = Dispatcher::new();
        let config = HttpConfig { timer_period: Duration::from_millis(5), ..HttpConfig::default() };
        let pool = Arc::new(HttpConnectionPool::new(config));

        let mut stale = HttpConnection::new(config);
        stale.set_timeout(Duration::from_millis(1));
        let (stale_id, _) = pool.insert(stale);

        let mut fresh = HttpConnection::new(config);
        fresh.set_timeout(Duration::from_secs(60));
        let (fresh_id, _) = pool.insert(fresh);

        pool.spawn_idle_sweep(&dispatcher);

        std::thread::sleep(Duration::from_millis(20));
        dispatcher.service();

        assert!(pool.get(stale_id).is_none(), "connection past its own timeout should have been evicted");
        assert!(pool.get(fresh_id).is_some(), "a connection well inside its timeout must survive the sweep");
    }

    #[test]
    fn unauthorized_with_credentials_triggers_retry() {
        let mut conn = HttpConnection::new(HttpConfig::default());
        conn.set_credentials(Credentials { username: "alice".into(), password: "secret".into() });
        let url = Url::parse("http://example.com/secure").unwrap();
        conn.begin_request("GET", &url, &[], &[]).unwrap();
        let _ = conn.take_output();
        conn.feed(b"HTTP/1.1 401 Unauthorized\r\nWWW-Authenticate: Digest realm=\"r\", nonce=\"n\", qop=\"auth\"\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(conn.should_retry_unauthorized());
        conn.retry_with_auth("cnonce-value").unwrap();
        let out = conn.take_output();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("Authorization: Digest username=\"alice\""));
    }
}
