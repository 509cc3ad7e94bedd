//! Minimal URL parsing for the HTTP client (§6): scheme, host, port, path
//! and query, with no TLS support — `https` is recognized and rejected
//! with [`ErrorKind::UnsupportedScheme`] rather than silently downgraded.

use crate::error::{ErrorKind, MprError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub query: Option<String>,
}

impl Url {
    pub fn parse(raw: &str) -> Result<Url> {
        let (scheme, rest) = raw.split_once("://").ok_or_else(|| bad_url(raw))?;
        let scheme = scheme.to_ascii_lowercase();
        let default_port = match scheme.as_str() {
            "http" => 80,
            "https" => return Err(MprError::new(ErrorKind::UnsupportedScheme, format!("scheme not supported: {scheme}"))),
            other => return Err(MprError::new(ErrorKind::UnsupportedScheme, format!("scheme not supported: {other}"))),
        };
        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(bad_url(raw));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((h, p)) => (h, p.parse::<u16>().map_err(|_| bad_url(raw))?),
            None => (authority, default_port),
        };
        if host.is_empty() {
            return Err(bad_url(raw));
        }
        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (path_and_query.to_string(), None),
        };
        let path = if path.is_empty() { "/".to_string() } else { path };
        Ok(Url { scheme, host: host.to_string(), port, path, query })
    }

    /// `path` plus `?query`, as sent on the request line.
    pub fn request_target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }
}

fn bad_url(raw: &str) -> MprError {
    MprError::new(ErrorKind::BadArgument, format!("malformed URL: {raw}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_port_path_query() {
        let url = Url::parse("http://example.com:8080/a/b?x=1").unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 8080);
        assert_eq!(url.path, "/a/b");
        assert_eq!(url.query.as_deref(), Some("x=1"));
    }

    #[test]
    fn defaults_port_and_path() {
        let url = Url::parse("http://example.com").unwrap();
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/");
    }

    #[test]
    fn rejects_https() {
        assert!(matches!(Url::parse("https://example.com").unwrap_err().kind(), ErrorKind::UnsupportedScheme));
    }
}
