//! Outbound HTTP/1.1 client for the `FETCH` control-channel op.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::error::HttpError;
use crate::limits::Limits;
use crate::wire::WireHeader;
use zingcore_net::allowlist;

/// A parsed `http://host[:port]/path?query` target. Anything else
/// (scheme other than `http`, userinfo, `https`) is rejected.
pub struct FetchUrl {
    /// Hostname or IP literal, brackets stripped.
    pub host: String,
    /// Port, defaulting to 80.
    pub port: u16,
    /// Path plus query, always starting with `/`.
    pub path: String,
}

/// Parse and validate a fetch URL per the capability's documented grammar.
pub fn parse_url(url: &str, max_bytes: usize) -> Result<FetchUrl, HttpError> {
    if url.len() > max_bytes {
        return Err(HttpError::MalformedRequest("fetch url too large".into()));
    }
    let rest = url.strip_prefix("http://").ok_or_else(|| HttpError::MalformedRequest("only http:// is supported".into()))?;
    if rest.contains('@') {
        return Err(HttpError::MalformedRequest("userinfo in fetch url is not supported".into()));
    }
    let (authority, path) = match rest.find('/') {
        Some(idx) => (&rest[..idx], &rest[idx..]),
        None => (rest, "/"),
    };
    if authority.is_empty() {
        return Err(HttpError::MalformedRequest("fetch url missing host".into()));
    }
    let (host, port) = match authority.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() => {
            let port: u16 = p.parse().map_err(|_| HttpError::MalformedRequest("bad port in fetch url".into()))?;
            (h.to_string(), port)
        },
        _ => (authority.to_string(), 80),
    };
    let host = if host.starts_with('[') && host.ends_with(']') { host[1..host.len() - 1].to_string() } else { host };
    Ok(FetchUrl { host, port, path: path.to_string() })
}

/// The outcome of a completed fetch: status line plus headers, with the
/// body already separated out (caller decides inline vs. stream framing).
pub struct FetchResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, lowercased names.
    pub headers: Vec<WireHeader>,
    /// Body bytes read so far (fully, for inline/close-delimited small
    /// bodies; chunk-decoded when `Transfer-Encoding: chunked` was seen).
    pub body: Vec<u8>,
}

/// Perform a synchronous outbound fetch. Blocking is permitted here per the
/// documented exception to the "never block" rule for `read`/`write`.
pub fn fetch(
    method: &str,
    url: &str,
    headers: &[WireHeader],
    body: Option<&[u8]>,
    limits: &Limits,
) -> Result<FetchResponse, HttpError> {
    let target = parse_url(url, limits.max_fetch_url_bytes)?;
    let allow = std::env::var("ZI_NET_ALLOW").unwrap_or_default();
    if !allowlist::allows(&allow, &target.host, u32::from(target.port)) {
        return Err(HttpError::Denied(format!("fetch to {}:{} not permitted", target.host, target.port)));
    }

    let mut stream = TcpStream::connect((target.host.as_str(), target.port)).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
    stream.set_read_timeout(Some(Duration::from_secs(30))).ok();
    stream.set_write_timeout(Some(Duration::from_secs(30))).ok();

    let mut has_host = false;
    let mut has_connection = false;
    let mut request = format!("{method} {} HTTP/1.1\r\n", target.path);
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("host") {
            has_host = true;
        }
        if name.eq_ignore_ascii_case("connection") {
            has_connection = true;
        }
        request.push_str(name);
        request.push_str(": ");
        request.push_str(value);
        request.push_str("\r\n");
    }
    if !has_host {
        request.push_str(&format!("Host: {}\r\n", target.host));
    }
    if !has_connection {
        request.push_str("Connection: close\r\n");
    }
    request.push_str("\r\n");

    stream.write_all(request.as_bytes()).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
    if let Some(body) = body {
        stream.write_all(body).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
    }

    let mut raw = Vec::new();
    let mut chunk = [0_u8; 4096];
    let header_end = loop {
        if let Some(pos) = find_double_crlf(&raw) {
            break pos;
        }
        let n = stream.read(&mut chunk).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
        if n == 0 {
            return Err(HttpError::MalformedRequest("connection closed before response headers".into()));
        }
        raw.extend_from_slice(&chunk[..n]);
        if raw.len() > limits.max_header_bytes {
            return Err(HttpError::HeaderTooLarge);
        }
    };

    let head = std::str::from_utf8(&raw[..header_end]).map_err(|_| HttpError::MalformedRequest("non-UTF-8 response head".into()))?;
    let mut lines = head.split("\r\n");
    let status_line = lines.next().ok_or_else(|| HttpError::MalformedRequest("missing status line".into()))?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next();
    let status: u16 = parts
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| HttpError::MalformedRequest("bad status line".into()))?;

    let mut resp_headers = Vec::new();
    let mut content_length: Option<usize> = None;
    let mut chunked = false;
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| HttpError::MalformedRequest("malformed response header".into()))?;
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim().to_string();
        if name == "content-length" {
            content_length = value.parse().ok();
        }
        if name == "transfer-encoding" && value.eq_ignore_ascii_case("chunked") {
            chunked = true;
        }
        resp_headers.push((name, value));
    }

    let mut rest = raw[header_end + 4..].to_vec();
    let body = if chunked {
        crate::request::decode_chunked_fully_streaming(&mut rest, &mut stream, limits.max_header_bytes)?
    } else if let Some(len) = content_length {
        while rest.len() < len {
            let n = stream.read(&mut chunk).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
            if n == 0 {
                return Err(HttpError::MalformedRequest("connection closed before body complete".into()));
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        rest.truncate(len);
        rest
    } else {
        loop {
            let n = stream.read(&mut chunk).map_err(|e| HttpError::Core(zingcore_net::map_io_error(&e)))?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&chunk[..n]);
        }
        rest
    };

    Ok(FetchResponse { status, headers: resp_headers, body })
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_url() {
        let url = parse_url("http://example.com/a/b?x=1", 8192).unwrap();
        assert_eq!(url.host, "example.com");
        assert_eq!(url.port, 80);
        assert_eq!(url.path, "/a/b?x=1");
    }

    #[test]
    fn parses_url_with_explicit_port() {
        let url = parse_url("http://127.0.0.1:9000/", 8192).unwrap();
        assert_eq!(url.host, "127.0.0.1");
        assert_eq!(url.port, 9000);
    }

    #[test]
    fn rejects_https_scheme() {
        assert!(parse_url("https://example.com/", 8192).is_err());
    }

    #[test]
    fn rejects_userinfo() {
        assert!(parse_url("http://user@example.com/", 8192).is_err());
    }

    #[test]
    fn defaults_to_root_path() {
        let url = parse_url("http://example.com", 8192).unwrap();
        assert_eq!(url.path, "/");
    }
}
