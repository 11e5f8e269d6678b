//! Per-process configurable limits, read once from the environment.

fn env_clamped(key: &str, default: u64, min: u64, max: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok()).unwrap_or(default).clamp(min, max)
}

/// Resource limits for request parsing and multipart decoding.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// `ZI_HTTP_MAX_REQ_LINE_BYTES`.
    pub max_req_line_bytes: usize,
    /// `ZI_HTTP_MAX_HEADER_BYTES`.
    pub max_header_bytes: usize,
    /// `ZI_HTTP_MAX_HEADER_COUNT`.
    pub max_header_count: usize,
    /// `ZI_HTTP_MAX_INLINE_BODY_BYTES`.
    pub max_inline_body_bytes: usize,
    /// `ZI_HTTP_MAX_INFLIGHT_REQUESTS`.
    pub max_inflight_requests: usize,
    /// `ZI_HTTP_MAX_FETCH_URL_BYTES`.
    pub max_fetch_url_bytes: usize,
    /// Max multipart parts per request.
    pub max_multipart_parts: usize,
    /// Max headers per multipart part.
    pub max_multipart_headers: usize,
    /// Max bytes scanned looking for a part's header block.
    pub max_multipart_header_bytes: usize,
    /// Max bytes for a part's `name`.
    pub max_multipart_name_bytes: usize,
    /// Max bytes for a part's `filename`.
    pub max_multipart_filename_bytes: usize,
    /// Max listeners this capability instance may hold open.
    pub max_listeners: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Limits {
    /// Read all limits from the environment, clamping to their documented
    /// ranges and falling back to the documented defaults.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            max_req_line_bytes: env_clamped("ZI_HTTP_MAX_REQ_LINE_BYTES", 8192, 512, 65536) as usize,
            max_header_bytes: env_clamped("ZI_HTTP_MAX_HEADER_BYTES", 65536, 1024, 1 << 20) as usize,
            max_header_count: env_clamped("ZI_HTTP_MAX_HEADER_COUNT", 128, 1, 4096) as usize,
            max_inline_body_bytes: env_clamped("ZI_HTTP_MAX_INLINE_BODY_BYTES", 1 << 20, 0, 64 << 20) as usize,
            max_inflight_requests: env_clamped("ZI_HTTP_MAX_INFLIGHT_REQUESTS", 256, 1, 4096) as usize,
            max_fetch_url_bytes: env_clamped("ZI_HTTP_MAX_FETCH_URL_BYTES", 8192, 256, 1 << 20) as usize,
            max_multipart_parts: env_clamped("ZI_HTTP_MAX_MULTIPART_PARTS", 128, 1, 4096) as usize,
            max_multipart_headers: env_clamped("ZI_HTTP_MAX_MULTIPART_HEADERS", 64, 1, 1024) as usize,
            max_multipart_header_bytes: env_clamped("ZI_HTTP_MAX_MULTIPART_HEADER_BYTES", 16384, 256, 1 << 20) as usize,
            max_multipart_name_bytes: env_clamped("ZI_HTTP_MAX_MULTIPART_NAME_BYTES", 256, 16, 4096) as usize,
            max_multipart_filename_bytes: env_clamped("ZI_HTTP_MAX_MULTIPART_FILENAME_BYTES", 1024, 16, 8192) as usize,
            max_listeners: env_clamped("ZI_HTTP_MAX_LISTENERS", 16, 1, 256) as usize,
        }
    }
}
