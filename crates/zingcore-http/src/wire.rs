//! Control-channel op codes and the `EV_REQUEST` event payload codec.

use bytes::{Buf, BufMut, BytesMut};

/// Control-channel operations.
pub mod ops {
    /// `LISTEN(port, flags, bind_host)`.
    pub const LISTEN: u16 = 1;
    /// `CLOSE_LISTENER(listener_id)`.
    pub const CLOSE_LISTENER: u16 = 2;
    /// `FETCH(method, url, headers[], body_kind)`.
    pub const FETCH: u16 = 3;
    /// `RESPOND_START(rid, flags, headers[])`.
    pub const RESPOND_START: u16 = 4;
    /// `RESPOND_INLINE(rid, status, headers[], body)`.
    pub const RESPOND_INLINE: u16 = 5;
    /// `RESPOND_STREAM(rid, status, headers[])`.
    pub const RESPOND_STREAM: u16 = 6;
    /// `MULTIPART_BEGIN(rid)`.
    pub const MULTIPART_BEGIN: u16 = 7;
    /// `MULTIPART_NEXT(rid)`.
    pub const MULTIPART_NEXT: u16 = 8;
    /// `MULTIPART_END(rid)`.
    pub const MULTIPART_END: u16 = 9;
    /// Server-pushed: a complete request header block has arrived.
    pub const EV_REQUEST: u16 = 100;
}

/// `body_kind` values shared by `EV_REQUEST` and `FETCH` responses.
pub mod body_kind {
    /// No body.
    pub const NONE: u32 = 0;
    /// Body was read fully and is inlined in the payload.
    pub const INLINE: u32 = 1;
    /// Body is exposed as a readable stream handle.
    pub const STREAM: u32 = 2;
    /// Body must be consumed through the `MULTIPART_*` ops.
    pub const MULTIPART: u32 = 3;
}

/// One header as carried on the wire: `(name_len, name, val_len, val)`.
pub type WireHeader = (String, String);

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn get_str(buf: &mut &[u8]) -> Option<String> {
    if buf.len() < 4 {
        return None;
    }
    let len = buf.get_u32_le() as usize;
    if buf.len() < len {
        return None;
    }
    let s = std::str::from_utf8(&buf[..len]).ok()?.to_string();
    buf.advance(len);
    Some(s)
}

/// Encode the `EV_REQUEST` payload.
#[allow(clippy::too_many_arguments)]
pub fn encode_ev_request(
    listener_id: u32,
    method: &str,
    path: &str,
    scheme: &str,
    authority: &str,
    remote_addr: [u8; 16],
    remote_port: u32,
    headers: &[WireHeader],
    body_kind: u32,
    inline_body: Option<&[u8]>,
    body_handle: Option<u32>,
) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_u32_le(listener_id);
    buf.put_u32_le(0); // flags
    put_str(&mut buf, method);
    put_str(&mut buf, path);
    put_str(&mut buf, scheme);
    put_str(&mut buf, authority);
    buf.put_slice(&remote_addr);
    buf.put_u32_le(remote_port);
    buf.put_u32_le(headers.len() as u32);
    for (name, value) in headers {
        put_str(&mut buf, name);
        put_str(&mut buf, value);
    }
    buf.put_u32_le(body_kind);
    match body_kind {
        body_kind::INLINE => {
            let body = inline_body.unwrap_or(&[]);
            buf.put_u32_le(body.len() as u32);
            buf.put_slice(body);
        },
        body_kind::STREAM | body_kind::MULTIPART => {
            buf.put_u32_le(body_handle.unwrap_or(0));
        },
        _ => {},
    }
    buf
}

/// Headers as carried on a guest-issued `RESPOND_*`/`FETCH` request:
/// `count:u32, (name_len,name,val_len,val)*count`.
pub fn parse_headers(buf: &mut &[u8]) -> Option<Vec<WireHeader>> {
    if buf.len() < 4 {
        return None;
    }
    let count = buf.get_u32_le() as usize;
    let mut headers = Vec::with_capacity(count.min(256));
    for _ in 0..count {
        let name = get_str(buf)?;
        let value = get_str(buf)?;
        headers.push((name, value));
    }
    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_ev_request_none_body_roundtrips_shape() {
        let headers = vec![("host".to_string(), "example.com".to_string())];
        let payload = encode_ev_request(
            3,
            "GET",
            "/a",
            "http",
            "example.com",
            [0_u8; 16],
            4242,
            &headers,
            body_kind::NONE,
            None,
            None,
        );
        let mut cursor: &[u8] = &payload;
        assert_eq!(cursor.get_u32_le(), 3);
        assert_eq!(cursor.get_u32_le(), 0);
        assert_eq!(get_str(&mut cursor).unwrap(), "GET");
        assert_eq!(get_str(&mut cursor).unwrap(), "/a");
    }

    #[test]
    fn parse_headers_round_trips() {
        let mut buf = BytesMut::new();
        buf.put_u32_le(1);
        put_str(&mut buf, "x-a");
        put_str(&mut buf, "1");
        let mut slice: &[u8] = &buf;
        let headers = parse_headers(&mut slice).unwrap();
        assert_eq!(headers, vec![("x-a".to_string(), "1".to_string())]);
    }
}
