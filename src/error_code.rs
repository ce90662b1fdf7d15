//! 网关错误分类：定义核心层的 8 类错误及其 HTTP 状态与重试语义。
//!
//! Relay error taxonomy.
//!
//! Every failure inside the core is classified into one of eight kinds. The
//! kind decides the HTTP status shown to the caller and whether the caller may
//! retry on another attempt.
//!
//! | Kind                   | Recovery                         | Status            |
//! |------------------------|----------------------------------|-------------------|
//! | `request_invalid`      | none                             | 400               |
//! | `model_unsupported`    | none                             | 400               |
//! | `upstream_unavailable` | caller may retry                 | 503               |
//! | `upstream_error`       | surfaced as-is                   | upstream status   |
//! | `stream_read_failed`   | stream terminated with an event  | 200 + error chunk |
//! | `unmarshal_failed`     | none                             | 500               |
//! | `config_missing`       | none                             | 500               |
//! | `fatal_internal`       | none; logged                     | 500               |
//!
//! ## Example
//!
//! ```rust
//! use ai_relay_rust::error_code::RelayErrorCode;
//!
//! let code = RelayErrorCode::from_http_status(503);
//! assert_eq!(code.name(), "upstream_unavailable");
//! assert!(code.retryable());
//! ```

use std::fmt;

/// Canonical relay error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorCode {
    /// Malformed request, invalid parameters, or a mode the adaptor rejects.
    RequestInvalid,
    /// The selected adaptor has no route for the requested model or mode.
    ModelUnsupported,
    /// The backend could not be reached, or reported itself overloaded.
    UpstreamUnavailable,
    /// The backend answered with a 4xx/5xx that is passed through.
    UpstreamError,
    /// Reading the backend stream failed after headers went out.
    StreamReadFailed,
    /// The backend body could not be decoded.
    UnmarshalFailed,
    /// Channel configuration is incomplete (region, project id, credentials).
    ConfigMissing,
    /// Anything else.
    FatalInternal,
}

impl RelayErrorCode {
    /// Returns the wire name (e.g. `"request_invalid"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::RequestInvalid => "request_invalid",
            Self::ModelUnsupported => "model_unsupported",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::UpstreamError => "upstream_error",
            Self::StreamReadFailed => "stream_read_failed",
            Self::UnmarshalFailed => "unmarshal_failed",
            Self::ConfigMissing => "config_missing",
            Self::FatalInternal => "fatal_internal",
        }
    }

    /// Default HTTP status for this kind. `UpstreamError` callers should prefer
    /// the upstream status when it is known.
    #[inline]
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RequestInvalid | Self::ModelUnsupported => 400,
            Self::UpstreamUnavailable => 503,
            Self::UpstreamError => 502,
            Self::StreamReadFailed => 200,
            Self::UnmarshalFailed | Self::ConfigMissing | Self::FatalInternal => 500,
        }
    }

    /// Whether the caller may retry the same request.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable)
    }

    /// OpenAI-style `error.type` string.
    pub fn openai_type(&self) -> &'static str {
        match self {
            Self::RequestInvalid | Self::ModelUnsupported => "invalid_request_error",
            Self::UpstreamUnavailable | Self::UpstreamError => "upstream_error",
            _ => "relay_error",
        }
    }

    /// Anthropic-style `error.type` string.
    pub fn claude_type(&self) -> &'static str {
        match self {
            Self::RequestInvalid | Self::ModelUnsupported => "invalid_request_error",
            Self::UpstreamUnavailable => "overloaded_error",
            _ => "api_error",
        }
    }

    /// Maps a backend HTTP status to a kind.
    pub fn from_http_status(status: u16) -> Self {
        match status {
            502 | 503 | 504 | 529 => Self::UpstreamUnavailable,
            400..=599 => Self::UpstreamError,
            _ => Self::FatalInternal,
        }
    }
}

impl fmt::Display for RelayErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RelayErrorCode::from_http_status(429), RelayErrorCode::UpstreamError);
        assert_eq!(RelayErrorCode::from_http_status(529), RelayErrorCode::UpstreamUnavailable);
        assert_eq!(RelayErrorCode::RequestInvalid.http_status(), 400);
        assert_eq!(RelayErrorCode::ConfigMissing.http_status(), 500);
    }

    #[test]
    fn test_only_unavailable_is_retryable() {
        assert!(RelayErrorCode::UpstreamUnavailable.retryable());
        assert!(!RelayErrorCode::UpstreamError.retryable());
        assert!(!RelayErrorCode::RequestInvalid.retryable());
    }
}
