//! Errors for the HTTP capability.

use thiserror::Error;
use zingcore_core::CoreError;

/// Failures specific to HTTP request/response handling.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// Delegated to the core error model.
    #[error(transparent)]
    Core(#[from] CoreError),
    /// The request line exceeded `ZI_HTTP_MAX_REQ_LINE_BYTES`.
    #[error("request line too large")]
    RequestLineTooLarge,
    /// Total header bytes exceeded `ZI_HTTP_MAX_HEADER_BYTES`.
    #[error("header block too large")]
    HeaderTooLarge,
    /// Header count exceeded `ZI_HTTP_MAX_HEADER_COUNT`.
    #[error("too many headers")]
    TooManyHeaders,
    /// The request line or a header was malformed.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// `ZI_HTTP_MAX_INFLIGHT_REQUESTS` reached.
    #[error("too many inflight requests")]
    InflightLimit,
    /// A multipart part exceeded a configured limit.
    #[error("multipart limit exceeded: {0}")]
    MultipartLimit(String),
    /// `FETCH`'s target was rejected by the outbound allowlist.
    #[error("fetch target denied: {0}")]
    Denied(String),
    /// A guest response tried to emit a forbidden header.
    #[error("forbidden response header: {0}")]
    ForbiddenHeader(String),
    /// No listener/request/part with that id.
    #[error("no such id")]
    NoSuchId,
}

impl HttpError {
    /// A stable short trace identifier for a ZCL1 error frame.
    #[must_use]
    pub fn trace(&self) -> &'static str {
        match self {
            Self::Core(e) => e.trace(),
            Self::RequestLineTooLarge => "t_http_req_line",
            Self::HeaderTooLarge => "t_http_header_bytes",
            Self::TooManyHeaders => "t_http_header_count",
            Self::MalformedRequest(_) => "t_http_invalid",
            Self::InflightLimit => "t_http_inflight",
            Self::MultipartLimit(_) => "t_http_multipart",
            Self::Denied(_) => "t_http_denied",
            Self::ForbiddenHeader(_) => "t_http_forbidden_header",
            Self::NoSuchId => "t_http_noent",
        }
    }
}
