//! Chunked transfer-encoding decoder state machine.
//!
//! Feeds raw bytes in, produces decoded body bytes out, tracking
//! `size_line → data → data_crlf → trailers → done` as one state so a
//! decoder can be driven incrementally as more bytes arrive off the wire.

/// Decoder states, in the order a well-formed stream visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailers,
    Done,
}

/// A stateful chunked-transfer-encoding decoder.
pub struct ChunkedDecoder {
    state: State,
    trailer_bytes_seen: usize,
    trailer_byte_cap: usize,
}

/// Outcome of feeding bytes into the decoder.
#[derive(Debug, Default)]
pub struct DecodeOutcome {
    /// Decoded body bytes produced by this call.
    pub body: Vec<u8>,
    /// Number of input bytes consumed.
    pub consumed: usize,
}

impl ChunkedDecoder {
    /// Build a fresh decoder with a cap on total trailer bytes tolerated.
    #[must_use]
    pub fn new(trailer_byte_cap: usize) -> Self {
        Self { state: State::SizeLine, trailer_bytes_seen: 0, trailer_byte_cap }
    }

    /// Whether the terminating chunk and trailers have been fully consumed.
    #[must_use]
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Feed as much of `input` as forms complete lines/chunks. Returns the
    /// decoded body bytes and how many input bytes were consumed; call again
    /// with more bytes appended when `consumed < input.len()`.
    pub fn feed(&mut self, input: &[u8]) -> Result<DecodeOutcome, super::error::HttpError> {
        let mut out = DecodeOutcome::default();
        let mut pos = 0;

        loop {
            match self.state {
                State::Done => break,
                State::SizeLine => {
                    let Some(line_end) = find_crlf(&input[pos..]) else { break };
                    let line = &input[pos..pos + line_end];
                    let size_str = std::str::from_utf8(line)
                        .ok()
                        .and_then(|s| s.split(';').next())
                        .map(str::trim)
                        .ok_or_else(|| super::error::HttpError::MalformedRequest("bad chunk size".into()))?;
                    let size = usize::from_str_radix(size_str, 16)
                        .map_err(|_| super::error::HttpError::MalformedRequest("bad chunk size".into()))?;
                    pos += line_end + 2;
                    self.state = if size == 0 { State::Trailers } else { State::Data { remaining: size } };
                },
                State::Data { remaining } => {
                    let available = input.len() - pos;
                    if available == 0 {
                        break;
                    }
                    let take = available.min(remaining);
                    out.body.extend_from_slice(&input[pos..pos + take]);
                    pos += take;
                    let left = remaining - take;
                    self.state = if left == 0 { State::DataCrlf } else { State::Data { remaining: left } };
                },
                State::DataCrlf => {
                    if input.len() - pos < 2 {
                        break;
                    }
                    if &input[pos..pos + 2] != b"\r\n" {
                        return Err(super::error::HttpError::MalformedRequest("missing chunk CRLF".into()));
                    }
                    pos += 2;
                    self.state = State::SizeLine;
                },
                State::Trailers => {
                    let Some(line_end) = find_crlf(&input[pos..]) else { break };
                    self.trailer_bytes_seen += line_end + 2;
                    if self.trailer_bytes_seen > self.trailer_byte_cap {
                        return Err(super::error::HttpError::HeaderTooLarge);
                    }
                    let empty = line_end == 0;
                    pos += line_end + 2;
                    if empty {
                        self.state = State::Done;
                    }
                },
            }
        }

        out.consumed = pos;
        Ok(out)
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn encode_chunked(chunks: &[Vec<u8>]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    proptest! {
        #[test]
        fn arbitrary_chunk_bodies_round_trip(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 0..8),
        ) {
            let encoded = encode_chunked(&chunks);
            let mut dec = ChunkedDecoder::new(4096);
            let out = dec.feed(&encoded).unwrap();
            let expected: Vec<u8> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(out.body, expected);
            prop_assert_eq!(out.consumed, encoded.len());
            prop_assert!(dec.is_done());
        }

        #[test]
        fn split_at_an_arbitrary_point_still_decodes_to_the_same_body(
            chunks in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..6),
            split_frac in 0.0..1.0_f64,
        ) {
            let encoded = encode_chunked(&chunks);
            let split = ((encoded.len() as f64) * split_frac) as usize;

            let mut dec = ChunkedDecoder::new(4096);
            let first = dec.feed(&encoded[..split]).unwrap();
            let mut body = first.body;

            // unconsumed tail from the first call must be retained and
            // prepended to the rest of the stream, per feed()'s contract
            let mut remainder = encoded[first.consumed..split].to_vec();
            remainder.extend_from_slice(&encoded[split..]);
            let second = dec.feed(&remainder).unwrap();
            body.extend_from_slice(&second.body);

            let expected: Vec<u8> = chunks.into_iter().flatten().collect();
            prop_assert_eq!(body, expected);
            prop_assert!(dec.is_done());
        }
    }

    #[test]
    fn decodes_single_chunk_then_terminator() {
        let mut dec = ChunkedDecoder::new(4096);
        let input = b"5\r\nhello\r\n0\r\n\r\n";
        let out = dec.feed(input).unwrap();
        assert_eq!(out.body, b"hello");
        assert_eq!(out.consumed, input.len());
        assert!(dec.is_done());
    }

    #[test]
    fn decodes_multiple_chunks_across_feed_calls() {
        let mut dec = ChunkedDecoder::new(4096);
        let out1 = dec.feed(b"3\r\nfoo\r\n3\r\nb").unwrap();
        assert_eq!(out1.body, b"foo");
        assert!(!dec.is_done());
        let remaining = &b"3\r\nbar\r\n0\r\n\r\n"[out1.consumed..];
        let out2 = dec.feed(remaining).unwrap();
        assert_eq!(out2.body, b"ar");
        assert!(dec.is_done());
    }

    #[test]
    fn rejects_malformed_chunk_size() {
        let mut dec = ChunkedDecoder::new(4096);
        assert!(dec.feed(b"zzz\r\n").is_err());
    }

    #[test]
    fn trailer_cap_is_enforced() {
        let mut dec = ChunkedDecoder::new(4);
        let big_trailer = b"0\r\nX-Too-Long: value\r\n\r\n";
        assert!(dec.feed(big_trailer).is_err());
    }
}
