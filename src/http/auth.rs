//! Basic and Digest authentication (§6, RFC 2617 subset).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use md5::{Digest, Md5};

#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// The server's `WWW-Authenticate` challenge, parsed field-by-field.
#[derive(Debug, Clone, Default)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: Option<String>,
    pub opaque: Option<String>,
    pub algorithm: Option<String>,
    pub domain: Option<String>,
    pub stale: bool,
}

/// Parses a `WWW-Authenticate: Digest ...` header value into its
/// comma-separated `key="value"` fields.
pub fn parse_digest_challenge(header_value: &str) -> Option<DigestChallenge> {
    let rest = header_value.trim().strip_prefix("Digest")?.trim();
    let mut challenge = DigestChallenge::default();
    for field in split_fields(rest) {
        let (key, value) = field.split_once('=')?;
        let key = key.trim();
        let value = value.trim().trim_matches('"');
        match key {
            "realm" => challenge.realm = value.to_string(),
            "nonce" => challenge.nonce = value.to_string(),
            "qop" => challenge.qop = Some(value.to_string()),
            "opaque" => challenge.opaque = Some(value.to_string()),
            "algorithm" => challenge.algorithm = Some(value.to_string()),
            "domain" => challenge.domain = Some(value.to_string()),
            "stale" => challenge.stale = value.eq_ignore_ascii_case("true"),
            _ => {}
        }
    }
    Some(challenge)
}

/// Splits on commas that are not inside a quoted value.
fn split_fields(input: &str) -> Vec<&str> {
    let mut fields = Vec::new();
    let mut in_quotes = false;
    let mut start = 0;
    for (i, ch) in input.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                fields.push(input[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    let last = input[start..].trim();
    if !last.is_empty() {
        fields.push(last);
    }
    fields
}

pub fn basic_header(creds: &Credentials) -> String {
    let raw = format!("{}:{}", creds.username, creds.password);
    format!("Basic {}", BASE64.encode(raw.as_bytes()))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Computes `Authorization: Digest ...` per RFC 2617: `response =
/// MD5(HA1:nonce:nc:cnonce:qop:HA2)` when `qop` is present, else the
/// legacy `MD5(HA1:nonce:HA2)` form.
#[allow(clippy::too_many_arguments)]
pub fn digest_header(
    creds: &Credentials,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    nc: u32,
    cnonce: &str,
) -> String {
    let ha1 = md5_hex(&format!("{}:{}:{}", creds.username, challenge.realm, creds.password));
    let ha2 = md5_hex(&format!("{method}:{uri}"));
    let (response, qop_part) = match &challenge.qop {
        Some(qop) => {
            let nc_hex = format!("{nc:08x}");
            let response = md5_hex(&format!("{ha1}:{}:{nc_hex}:{cnonce}:{qop}:{ha2}", challenge.nonce));
            (response, format!(r#", cnonce="{cnonce}", nc={nc_hex}, qop={qop}"#))
        }
        None => (md5_hex(&format!("{ha1}:{}:{ha2}", challenge.nonce)), String::new()),
    };
    let mut header = format!(
        r#"Digest username="{}", realm="{}", nonce="{}", uri="{}", response="{response}""#,
        creds.username, challenge.realm, challenge.nonce, uri
    );
    header.push_str(&qop_part);
    if let Some(opaque) = &challenge.opaque {
        header.push_str(&format!(r#", opaque="{opaque}""#));
    }
    if let Some(algorithm) = &challenge.algorithm {
        header.push_str(&format!(r#", algorithm={algorithm}"#));
    }
    if let Some(domain) = &challenge.domain {
        header.push_str(&format!(r#", domain="{domain}""#));
    }
    if challenge.stale {
        header.push_str(", stale=FALSE");
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_encodes_user_pass() {
        let creds = Credentials { username: "alice".into(), password: "secret".into() };
        assert_eq!(basic_header(&creds), format!("Basic {}", BASE64.encode(b"alice:secret")));
    }

    #[test]
    fn parses_digest_challenge_fields() {
        let header = r#"Digest realm="testrealm", qop="auth", nonce="dcd98b7102dd2f0e", opaque="5ccc069c""#;
        let challenge = parse_digest_challenge(header).unwrap();
        assert_eq!(challenge.realm, "testrealm");
        assert_eq!(challenge.qop.as_deref(), Some("auth"));
        assert_eq!(challenge.opaque.as_deref(), Some("5ccc069c"));
    }

    #[test]
    fn digest_response_is_stable_for_same_inputs() {
        let creds = Credentials { username: "alice".into(), password: "secret".into() };
        let challenge = DigestChallenge {
            realm: "realm".into(),
            nonce: "nonce123".into(),
            qop: Some("auth".into()),
            ..Default::default()
        };
        let a = digest_header(&creds, &challenge, "GET", "/x", 1, "cnonce1");
        let b = digest_header(&creds, &challenge, "GET", "/x", 1, "cnonce1");
        assert_eq!(a, b);
    }
}
