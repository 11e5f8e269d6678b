//! Request-line and header parsing, and body classification.

use crate::chunked::ChunkedDecoder;
use crate::error::HttpError;
use crate::limits::Limits;

/// How a request's body is framed.
pub enum BodyMode {
    /// No body (`Content-Length: 0` or absent on a method that implies none).
    None,
    /// `Content-Length` fits within `max_inline_body_bytes`; read in full
    /// before the request is handed to the guest.
    Inline { len: usize },
    /// `Content-Length` exceeds the inline cutoff; the guest must stream it.
    Stream { len: usize },
    /// `Transfer-Encoding: chunked`.
    Chunked,
    /// `multipart/form-data` with a boundary.
    Multipart { boundary: String },
}

/// A parsed request line plus headers, ready for dispatch.
pub struct ParsedRequest {
    /// `GET`, `POST`, etc., as written on the wire.
    pub method: String,
    /// Request target, always starting with `/`.
    pub path: String,
    /// Lowercased header names, in wire order.
    pub headers: Vec<(String, String)>,
    /// How the body is framed.
    pub body_mode: BodyMode,
}

impl ParsedRequest {
    /// Look up a header by lowercase name, returning the first match.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str())
    }
}

/// Parse a request line plus header block out of `buf`, which must contain
/// at least up to the terminating blank line. Returns the byte offset of the
/// start of the body (just after the blank line).
pub fn parse_head(buf: &[u8], limits: &Limits) -> Result<(ParsedRequest, usize), HttpError> {
    let line_end = find_crlf(buf).ok_or(HttpError::RequestLineTooLarge)?;
    if line_end > limits.max_req_line_bytes {
        return Err(HttpError::RequestLineTooLarge);
    }
    let line = std::str::from_utf8(&buf[..line_end])
        .map_err(|_| HttpError::MalformedRequest("non-UTF-8 request line".into()))?;
    if line.bytes().any(|b| b < 0x20 && b != b'\t') {
        return Err(HttpError::MalformedRequest("control byte in request line".into()));
    }

    let mut parts = line.split(' ');
    let method = parts.next().filter(|s| !s.is_empty()).ok_or_else(|| HttpError::MalformedRequest("missing method".into()))?;
    let path = parts.next().filter(|s| s.starts_with('/')).ok_or_else(|| HttpError::MalformedRequest("path must start with /".into()))?;
    let version = parts.next().ok_or_else(|| HttpError::MalformedRequest("missing HTTP version".into()))?;
    if version != "HTTP/1.1" || parts.next().is_some() {
        return Err(HttpError::MalformedRequest("only HTTP/1.1 is accepted".into()));
    }

    let mut pos = line_end + 2;
    let mut headers = Vec::new();
    let mut header_bytes = 0usize;
    loop {
        let rel_end = find_crlf(&buf[pos..]).ok_or(HttpError::HeaderTooLarge)?;
        if rel_end == 0 {
            pos += 2;
            break;
        }
        header_bytes += rel_end + 2;
        if header_bytes > limits.max_header_bytes {
            return Err(HttpError::HeaderTooLarge);
        }
        if headers.len() >= limits.max_header_count {
            return Err(HttpError::TooManyHeaders);
        }
        let line = std::str::from_utf8(&buf[pos..pos + rel_end])
            .map_err(|_| HttpError::MalformedRequest("non-UTF-8 header".into()))?;
        let (key, value) = line.split_once(':').ok_or_else(|| HttpError::MalformedRequest("malformed header".into()))?;
        headers.push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        pos += rel_end + 2;
    }

    let body_mode = classify_body(&headers, limits)?;

    Ok((ParsedRequest { method: method.to_string(), path: path.to_string(), headers, body_mode }, pos))
}

fn classify_body(headers: &[(String, String)], limits: &Limits) -> Result<BodyMode, HttpError> {
    let find = |name: &str| headers.iter().find(|(k, _)| k == name).map(|(_, v)| v.as_str());

    if let Some(te) = find("transfer-encoding") {
        if te.eq_ignore_ascii_case("chunked") {
            return Ok(BodyMode::Chunked);
        }
        return Err(HttpError::MalformedRequest("unsupported transfer-encoding".into()));
    }

    if let Some(ct) = find("content-type") {
        if let Some(boundary) = multipart_boundary(ct) {
            return Ok(BodyMode::Multipart { boundary });
        }
    }

    match find("content-length") {
        None => Ok(BodyMode::None),
        Some(v) => {
            let len: usize = v.trim().parse().map_err(|_| HttpError::MalformedRequest("bad content-length".into()))?;
            if len == 0 {
                Ok(BodyMode::None)
            } else if len <= limits.max_inline_body_bytes {
                Ok(BodyMode::Inline { len })
            } else {
                Ok(BodyMode::Stream { len })
            }
        },
    }
}

fn multipart_boundary(content_type: &str) -> Option<String> {
    let lower = content_type.to_ascii_lowercase();
    if !lower.starts_with("multipart/form-data") {
        return None;
    }
    for segment in content_type.split(';').skip(1) {
        let segment = segment.trim();
        if let Some(rest) = segment.strip_prefix("boundary=") {
            return Some(rest.trim_matches('"').to_string());
        }
    }
    None
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Like a full eager decode, but `buffered` holds bytes already read
/// past the header block and more are pulled from `reader` as needed.
pub fn decode_chunked_fully_streaming(
    buffered: &mut Vec<u8>,
    reader: &mut impl std::io::Read,
    trailer_byte_cap: usize,
) -> Result<Vec<u8>, HttpError> {
    let mut decoder = ChunkedDecoder::new(trailer_byte_cap);
    let mut body = Vec::new();
    let mut pos = 0;
    let mut chunk = [0_u8; 4096];
    loop {
        let outcome = decoder.feed(&buffered[pos..])?;
        body.extend_from_slice(&outcome.body);
        pos += outcome.consumed;
        if decoder.is_done() {
            break;
        }
        let n = reader.read(&mut chunk).map_err(|e| HttpError::MalformedRequest(e.to_string()))?;
        if n == 0 {
            return Err(HttpError::MalformedRequest("connection closed mid-chunk".into()));
        }
        buffered.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}
