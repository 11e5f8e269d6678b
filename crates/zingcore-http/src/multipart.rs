//! Multipart/form-data body iterator.
//!
//! The boundary delimiter is `\r\n--<boundary>`. `next_part` consumes the
//! opening boundary (accepting a bare `--<boundary>` only at the very start
//! of the body), parses one part's headers, and returns enough to hand the
//! guest a part descriptor; the raw, undecoded body bytes are never exposed.

use crate::error::HttpError;
use crate::limits::Limits;

/// One part's parsed header block.
#[derive(Debug, Clone)]
pub struct PartHeaders {
    /// `Content-Disposition`'s `name` parameter.
    pub name: String,
    /// `Content-Disposition`'s `filename` parameter, if present.
    pub filename: Option<String>,
    /// `Content-Type`, if present.
    pub content_type: Option<String>,
    /// All headers, lowercase names, in order.
    pub headers: Vec<(String, String)>,
}

/// Reads parts out of a multipart body buffer that grows as more bytes
/// arrive off the underlying connection.
pub struct MultipartReader {
    boundary_marker: Vec<u8>,
    at_start: bool,
    need_boundary: bool,
    done: bool,
    parts_seen: usize,
    limits: Limits,
}

/// Result of scanning for the next part.
pub enum NextPart {
    /// A part's headers were parsed; the part body begins at `body_start` in
    /// the buffer that was scanned.
    Part { headers: PartHeaders, body_start: usize },
    /// The closing boundary (`--<boundary>--`) was reached.
    Done,
    /// Not enough bytes buffered yet to make progress.
    NeedMoreData,
}

impl MultipartReader {
    /// Build a reader for a given `boundary` (without the leading `--`).
    #[must_use]
    pub fn new(boundary: &str, limits: Limits) -> Self {
        let mut marker = Vec::with_capacity(boundary.len() + 2);
        marker.extend_from_slice(b"--");
        marker.extend_from_slice(boundary.as_bytes());
        Self { boundary_marker: marker, at_start: true, need_boundary: false, done: false, parts_seen: 0, limits }
    }

    /// Mark that the previous part's unread body has been drained and the
    /// next `next_part` call must consume a delimiter before parsing
    /// headers.
    pub fn mark_need_boundary(&mut self) {
        self.need_boundary = true;
    }

    /// Scan `buf` for the next part. On [`NextPart::Part`], headers were
    /// fully parsed and the caller should begin reading the body from
    /// `body_start`, using [`find_delimiter`] to bound reads.
    pub fn next_part(&mut self, buf: &[u8]) -> Result<NextPart, HttpError> {
        if self.done {
            return Ok(NextPart::Done);
        }

        let mut pos = 0;
        if self.at_start || self.need_boundary {
            let prefix: &[u8] = if self.at_start { b"" } else { b"\r\n" };
            let mut expect = Vec::with_capacity(prefix.len() + self.boundary_marker.len());
            expect.extend_from_slice(prefix);
            expect.extend_from_slice(&self.boundary_marker);

            if buf.len() < expect.len() + 2 {
                return Ok(NextPart::NeedMoreData);
            }
            if !buf.starts_with(&expect) {
                return Err(HttpError::MalformedRequest("multipart boundary mismatch".into()));
            }
            pos = expect.len();
            self.at_start = false;
            self.need_boundary = false;

            if buf[pos..].starts_with(b"--") {
                self.done = true;
                return Ok(NextPart::Done);
            }
            if !buf[pos..].starts_with(b"\r\n") {
                return Ok(NextPart::NeedMoreData);
            }
            pos += 2;
        }

        self.parts_seen += 1;
        if self.parts_seen > self.limits.max_multipart_parts {
            return Err(HttpError::MultipartLimit("too many parts".into()));
        }

        let Some(header_end) = find_double_crlf(&buf[pos..]) else {
            if buf.len() - pos > self.limits.max_multipart_header_bytes {
                return Err(HttpError::MultipartLimit("part header block too large".into()));
            }
            return Ok(NextPart::NeedMoreData);
        };
        if header_end > self.limits.max_multipart_header_bytes {
            return Err(HttpError::MultipartLimit("part header block too large".into()));
        }

        let header_block = &buf[pos..pos + header_end];
        let headers = parse_part_headers(header_block, &self.limits)?;
        let body_start = pos + header_end + 4;
        Ok(NextPart::Part { headers, body_start })
    }
}

/// Find the next occurrence of `\r\n--<boundary>` in `buf`, returning the
/// byte offset where the body ends (i.e. before the delimiter).
#[must_use]
pub fn find_delimiter(buf: &[u8], boundary: &str) -> Option<usize> {
    let mut marker = Vec::with_capacity(boundary.len() + 4);
    marker.extend_from_slice(b"\r\n--");
    marker.extend_from_slice(boundary.as_bytes());
    buf.windows(marker.len()).position(|w| w == marker.as_slice())
}

fn find_double_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_part_headers(block: &[u8], limits: &Limits) -> Result<PartHeaders, HttpError> {
    let text = std::str::from_utf8(block).map_err(|_| HttpError::MalformedRequest("non-UTF-8 part header".into()))?;
    let mut headers = Vec::new();
    let mut name = None;
    let mut filename = None;
    let mut content_type = None;

    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }
        if headers.len() >= limits.max_multipart_headers {
            return Err(HttpError::MultipartLimit("too many part headers".into()));
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(HttpError::MalformedRequest("malformed part header".into()));
        };
        let key = key.trim().to_ascii_lowercase();
        let value = value.trim().to_string();

        if key == "content-disposition" {
            name = extract_param(&value, "name").map(|s| truncate(&s, limits.max_multipart_name_bytes));
            filename = extract_param(&value, "filename").map(|s| truncate(&s, limits.max_multipart_filename_bytes));
        }
        if key == "content-type" {
            content_type = Some(value.clone());
        }
        headers.push((key, value));
    }

    Ok(PartHeaders { name: name.unwrap_or_default(), filename, content_type, headers })
}

fn extract_param(header_value: &str, param: &str) -> Option<String> {
    for segment in header_value.split(';').skip(1) {
        let segment = segment.trim();
        if let Some(rest) = segment.strip_prefix(param) {
            let rest = rest.trim_start();
            if let Some(val) = rest.strip_prefix('=') {
                let val = val.trim();
                return Some(val.trim_matches('"').to_string());
            }
        }
    }
    None
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn limits() -> Limits {
        Limits::from_env()
    }

    /// Strip every occurrence of `needle` out of `haystack` so a generated
    /// part body can never accidentally contain the delimiter itself.
    fn strip_substring(haystack: &[u8], needle: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(haystack.len());
        let mut i = 0;
        while i < haystack.len() {
            if haystack[i..].starts_with(needle) {
                i += 1;
            } else {
                out.push(haystack[i]);
                i += 1;
            }
        }
        out
    }

    proptest! {
        #[test]
        fn delimiter_is_found_at_the_exact_body_boundary(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            tail in proptest::collection::vec(any::<u8>(), 0..64),
        ) {
            let marker = b"\r\n--BOUND";
            let body = strip_substring(&body, marker);
            let tail = strip_substring(&tail, marker);

            let mut buf = body.clone();
            buf.extend_from_slice(marker);
            buf.extend_from_slice(&tail);

            let found = find_delimiter(&buf, "BOUND");
            prop_assert_eq!(found, Some(body.len()));
            prop_assert_eq!(&buf[..found.unwrap()], body.as_slice());
        }

        #[test]
        fn body_without_any_delimiter_is_not_found(
            body in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let marker = b"\r\n--BOUND";
            let body = strip_substring(&body, marker);
            prop_assert_eq!(find_delimiter(&body, "BOUND"), None);
        }
    }

    #[test]
    fn parses_single_part_with_name_and_filename() {
        let body = b"--BOUND\r\nContent-Disposition: form-data; name=\"field\"; filename=\"a.txt\"\r\nContent-Type: text/plain\r\n\r\nhello\r\n--BOUND--\r\n";
        let mut reader = MultipartReader::new("BOUND", limits());
        match reader.next_part(body).unwrap() {
            NextPart::Part { headers, body_start } => {
                assert_eq!(headers.name, "field");
                assert_eq!(headers.filename.as_deref(), Some("a.txt"));
                let delim = find_delimiter(&body[body_start..], "BOUND").unwrap();
                assert_eq!(&body[body_start..body_start + delim], b"hello");
            },
            _ => panic!("expected a part"),
        }
    }

    #[test]
    fn detects_final_boundary() {
        let body = b"--BOUND--\r\n";
        let mut reader = MultipartReader::new("BOUND", limits());
        assert!(matches!(reader.next_part(body).unwrap(), NextPart::Done));
    }

    #[test]
    fn needs_more_data_when_headers_incomplete() {
        let body = b"--BOUND\r\nContent-Disposition: form-data; name=\"f\"";
        let mut reader = MultipartReader::new("BOUND", limits());
        assert!(matches!(reader.next_part(body).unwrap(), NextPart::NeedMoreData));
    }

    #[test]
    fn mismatched_boundary_is_rejected() {
        let body = b"--WRONG\r\n\r\n";
        let mut reader = MultipartReader::new("BOUND", limits());
        assert!(reader.next_part(body).is_err());
    }
}
