//! HTTP/1.x request framing.
//!
//! Decodes one request head plus a `Content-Length` body from a byte stream.
//! Responses are written raw by the transports, so there is no encoder.
//!
//! ```text
//! POST / HTTP/1.1\r\n
//! Content-Length: 42\r\n
//! \r\n
//! {"jsonrpc":"1.0","method":"getreadme",...}
//! ```

use bytes::{Buf, Bytes, BytesMut};
use std::io;
use tokio_util::codec::Decoder;

/// Maximum size of the request line plus headers (64 KB)
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Maximum request body size (8 MB)
const MAX_BODY_SIZE: usize = 8 * 1024 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A fully buffered HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    /// Minor protocol version: 1 for HTTP/1.1, 0 for HTTP/1.0.
    pub minor_version: u8,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    #[must_use]
    pub fn is_http11(&self) -> bool {
        self.minor_version >= 1
    }

    /// Whether this is a `GET` asking to switch to the WebSocket protocol.
    #[must_use]
    pub fn is_websocket_upgrade(&self) -> bool {
        self.method == "GET"
            && self
                .header("upgrade")
                .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
            && self.header("connection").is_some_and(|v| {
                v.split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
            })
    }
}

#[derive(Debug)]
struct Head {
    method: String,
    path: String,
    minor_version: u8,
    headers: Vec<(String, String)>,
    content_length: usize,
}

/// Decoder for a single HTTP request.
#[derive(Debug, Default)]
pub struct HttpCodec {
    head: Option<Head>,
}

impl HttpCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for HttpCodec {
    type Item = HttpRequest;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.head.is_none() {
            let Some(end) = find_terminator(src) else {
                if src.len() > MAX_HEAD_SIZE {
                    return Err(CodecError::HeadTooLarge);
                }
                return Ok(None);
            };
            if end > MAX_HEAD_SIZE {
                return Err(CodecError::HeadTooLarge);
            }

            let head = parse_head(&src[..end])?;
            src.advance(end + HEAD_TERMINATOR.len());
            self.head = Some(head);
        }

        let Some(length) = self.head.as_ref().map(|head| head.content_length) else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length).freeze();
        let Some(head) = self.head.take() else {
            return Ok(None);
        };

        Ok(Some(HttpRequest {
            method: head.method,
            path: head.path,
            minor_version: head.minor_version,
            headers: head.headers,
            body,
        }))
    }
}

fn find_terminator(src: &[u8]) -> Option<usize> {
    src.windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

fn parse_head(raw: &[u8]) -> Result<Head, CodecError> {
    let text = std::str::from_utf8(raw)?;
    let mut lines = text.split("\r\n");

    let request_line = lines.next().unwrap_or_default();
    let mut parts = request_line.split(' ');
    let (Some(method), Some(path), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(CodecError::BadRequestLine(request_line.to_string()));
    };
    let minor_version = match version {
        "HTTP/1.1" => 1,
        "HTTP/1.0" => 0,
        other => return Err(CodecError::UnsupportedVersion(other.to_string())),
    };

    let mut headers = Vec::new();
    let mut content_length = 0;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            return Err(CodecError::BadHeader(line.to_string()));
        };
        let name = name.trim();
        let value = value.trim();

        if name.eq_ignore_ascii_case("content-length") {
            content_length = value
                .parse()
                .map_err(|_| CodecError::BadHeader(line.to_string()))?;
            if content_length > MAX_BODY_SIZE {
                return Err(CodecError::BodyTooLarge(content_length));
            }
        } else if name.eq_ignore_ascii_case("transfer-encoding")
            && !value.eq_ignore_ascii_case("identity")
        {
            return Err(CodecError::UnsupportedTransferEncoding(value.to_string()));
        }
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(Head {
        method: method.to_string(),
        path: path.to_string(),
        minor_version,
        headers,
        content_length,
    })
}

/// Errors that can occur while framing a request
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Malformed request line: {0:?}")]
    BadRequestLine(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    #[error("Malformed header: {0:?}")]
    BadHeader(String),

    #[error("Unsupported transfer encoding: {0}")]
    UnsupportedTransferEncoding(String),

    #[error("Request head too large (max: {MAX_HEAD_SIZE})")]
    HeadTooLarge,

    #[error("Request body too large: {0} bytes (max: {MAX_BODY_SIZE})")]
    BodyTooLarge(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(raw: &[u8]) -> Result<Option<HttpRequest>, CodecError> {
        let mut codec = HttpCodec::new();
        let mut buf = BytesMut::from(raw);
        codec.decode(&mut buf)
    }

    #[test]
    fn test_decode_post() {
        let raw = b"POST / HTTP/1.1\r\nHost: localhost\r\nContent-Length: 2\r\n\r\n{}";
        let req = decode_all(raw).unwrap().unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/");
        assert!(req.is_http11());
        assert_eq!(req.header("host"), Some("localhost"));
        assert_eq!(req.body.as_ref(), b"{}");
    }

    #[test]
    fn test_decode_http10_without_body() {
        let req = decode_all(b"GET /status HTTP/1.0\r\n\r\n").unwrap().unwrap();
        assert!(!req.is_http11());
        assert!(req.body.is_empty());
    }

    #[test]
    fn test_decode_incremental() {
        let mut codec = HttpCodec::new();
        let mut buf = BytesMut::from(&b"POST / HTTP/1.1\r\nContent-Le"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"ngth: 5\r\n\r\nab");
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(b"cde");
        let req = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(req.body.as_ref(), b"abcde");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_leftover_bytes_stay_buffered() {
        let mut codec = HttpCodec::new();
        let mut buf = BytesMut::from(&b"GET /ws HTTP/1.1\r\n\r\n\x81\x00"[..]);
        codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(buf.as_ref(), b"\x81\x00");
    }

    #[test]
    fn test_websocket_upgrade_detection() {
        let raw = b"GET /ws HTTP/1.1\r\nUpgrade: WebSocket\r\nConnection: keep-alive, Upgrade\r\n\r\n";
        let req = decode_all(raw).unwrap().unwrap();
        assert!(req.is_websocket_upgrade());

        let raw = b"POST /ws HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let req = decode_all(raw).unwrap().unwrap();
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn test_rejects_chunked() {
        let raw = b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(matches!(
            decode_all(raw),
            Err(CodecError::UnsupportedTransferEncoding(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_body() {
        let raw = format!("POST / HTTP/1.1\r\nContent-Length: {}\r\n\r\n", MAX_BODY_SIZE + 1);
        assert!(matches!(
            decode_all(raw.as_bytes()),
            Err(CodecError::BodyTooLarge(_))
        ));
    }

    #[test]
    fn test_rejects_oversized_head() {
        let mut raw = b"POST / HTTP/1.1\r\nX-Pad: ".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_HEAD_SIZE));
        assert!(matches!(decode_all(&raw), Err(CodecError::HeadTooLarge)));
    }

    #[test]
    fn test_rejects_malformed_request_line() {
        assert!(matches!(
            decode_all(b"HELLO\r\n\r\n"),
            Err(CodecError::BadRequestLine(_))
        ));
        assert!(matches!(
            decode_all(b"GET / HTTP/2.0\r\n\r\n"),
            Err(CodecError::UnsupportedVersion(_))
        ));
        assert!(matches!(
            decode_all(b"GET / HTTP/1.1\r\nno-colon\r\n\r\n"),
            Err(CodecError::BadHeader(_))
        ));
    }
}
