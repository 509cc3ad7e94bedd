//! The client HTTP/1.1 stack (§4.H): URL parsing, Basic/Digest auth, the
//! chunked-transfer parser, and the request/response state machine.
//!
//! Compiled only when the `http-client` feature is enabled, matching the
//! optional `base64`/`md-5` dependencies it needs.

pub mod auth;
pub mod chunk;
mod connection;
pub mod url;

pub use auth::Credentials;
pub use connection::{HttpConfig, HttpConnection, HttpConnectionPool, Response, State};
pub use url::Url;

use crate::time;

/// One field of a multipart form upload: either plain form data or a file
/// attachment with its own filename and content type.
pub enum MultipartField<'a> {
    Field { name: &'a str, value: &'a str },
    File { name: &'a str, filename: &'a str, content_type: &'a str, data: &'a [u8] },
}

/// Builds a `multipart/form-data` body and returns it along with the
/// `Content-Type` header value to send (boundary included). The boundary is
/// derived from the current wall-clock time, matching spec wording that it
/// be time-seeded rather than random (§4.H).
pub fn build_multipart(fields: &[MultipartField<'_>]) -> (String, Vec<u8>) {
    let boundary = format!("----MprBoundary{:x}", time::unix_seconds());
    let mut body = Vec::new();
    for field in fields {
        body.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        match field {
            MultipartField::Field { name, value } => {
                body.extend_from_slice(format!("Content-Disposition: form-data; name=\"{name}\"\r\n\r\n").as_bytes());
                body.extend_from_slice(value.as_bytes());
                body.extend_from_slice(b"\r\n");
            }
            MultipartField::File { name, filename, content_type, data } => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{filename}\"\r\n").as_bytes(),
                );
                body.extend_from_slice(format!("Content-Type: {content_type}\r\n\r\n").as_bytes());
                body.extend_from_slice(data);
                body.extend_from_slice(b"\r\n");
            }
        }
    }
    body.extend_from_slice(format!("--{boundary}--\r\n").as_bytes());
    (format!("multipart/form-data; boundary={boundary}"), body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_interleaves_fields_and_files() {
        let (content_type, body) = build_multipart(&[
            MultipartField::Field { name: "title", value: "hello" },
            MultipartField::File { name: "upload", filename: "a.txt", content_type: "text/plain", data: b"contents" },
        ]);
        assert!(content_type.starts_with("multipart/form-data; boundary=----MprBoundary"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("name=\"title\""));
        assert!(text.contains("filename=\"a.txt\""));
        assert!(text.contains("contents"));
    }
}
