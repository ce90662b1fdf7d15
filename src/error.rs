use crate::error_code::RelayErrorCode;
use crate::transport::TransportError;
use serde_json::{json, Value};
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path that caused the error (e.g., "request.messages[2].content", "config.project_id")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected type, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "anthropic.convert_request", "vertexai.request_url")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the relay core.
///
/// Every variant classifies into a [`RelayErrorCode`] via [`Error::code`].
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid request: {message}{}", format_context(.context))]
    RequestInvalid {
        message: String,
        context: ErrorContext,
    },

    #[error("Model '{model}' is not supported by the {adaptor} adaptor{}", .reason.as_ref().map(|r| format!(": {}", r)).unwrap_or_default())]
    ModelUnsupported {
        model: String,
        adaptor: String,
        reason: Option<String>,
    },

    #[error("Configuration missing: {message}{}", format_context(.context))]
    ConfigMissing {
        message: String,
        context: ErrorContext,
    },

    #[error("Upstream error: HTTP {status}: {message}")]
    Upstream {
        status: u16,
        message: String,
        /// Provider error code or type, when the body carried one.
        provider_code: Option<String>,
    },

    #[error("Stream read failed: {message}")]
    StreamRead { message: String },

    #[error("Failed to decode upstream body: {message}{}", format_context(.context))]
    Unmarshal {
        message: String,
        context: ErrorContext,
    },

    #[error("Network transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {message}{}", format_context(.context))]
    Internal {
        message: String,
        context: ErrorContext,
    },
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Error::RequestInvalid {
            message: msg.into(),
            context: ErrorContext::new(),
        }
    }

    pub fn invalid_request_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::RequestInvalid {
            message: msg.into(),
            context,
        }
    }

    pub fn model_unsupported(model: impl Into<String>, adaptor: impl Into<String>) -> Self {
        Error::ModelUnsupported {
            model: model.into(),
            adaptor: adaptor.into(),
            reason: None,
        }
    }

    pub fn mode_unsupported(
        model: impl Into<String>,
        adaptor: impl Into<String>,
        mode: crate::meta::Mode,
    ) -> Self {
        Error::ModelUnsupported {
            model: model.into(),
            adaptor: adaptor.into(),
            reason: Some(format!("mode {} is not supported", mode.as_str())),
        }
    }

    pub fn config_missing(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::ConfigMissing {
            message: msg.into(),
            context,
        }
    }

    pub fn unmarshal_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Unmarshal {
            message: msg.into(),
            context,
        }
    }

    pub fn internal_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Internal {
            message: msg.into(),
            context,
        }
    }

    pub fn stream_read(msg: impl Into<String>) -> Self {
        Error::StreamRead {
            message: msg.into(),
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::RequestInvalid { context, .. }
            | Error::ConfigMissing { context, .. }
            | Error::Unmarshal { context, .. }
            | Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Classify this error into the relay taxonomy.
    pub fn code(&self) -> RelayErrorCode {
        match self {
            Error::RequestInvalid { .. } => RelayErrorCode::RequestInvalid,
            Error::ModelUnsupported { .. } => RelayErrorCode::ModelUnsupported,
            Error::ConfigMissing { .. } => RelayErrorCode::ConfigMissing,
            Error::Upstream { status, .. } => RelayErrorCode::from_http_status(*status),
            Error::StreamRead { .. } => RelayErrorCode::StreamReadFailed,
            Error::Unmarshal { .. } | Error::Serialization(_) => RelayErrorCode::UnmarshalFailed,
            Error::Transport(_) => RelayErrorCode::UpstreamUnavailable,
            Error::Io(_) | Error::Internal { .. } => RelayErrorCode::FatalInternal,
        }
    }

    /// HTTP status to show the caller when nothing was written yet.
    pub fn status(&self) -> u16 {
        match self {
            Error::Upstream { status, .. } => *status,
            other => other.code().http_status(),
        }
    }

    /// `{"error": {...}}` in the OpenAI dialect.
    pub fn to_openai_body(&self) -> Value {
        let code = self.code();
        let provider_code = match self {
            Error::Upstream { provider_code, .. } => provider_code.clone(),
            _ => None,
        };
        json!({
            "error": {
                "message": self.to_string(),
                "type": code.openai_type(),
                "code": provider_code.unwrap_or_else(|| code.name().to_string()),
            }
        })
    }

    /// `{"type": "error", "error": {...}}` in the Claude Messages dialect.
    pub fn to_claude_body(&self) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": self.code().claude_type(),
                "message": self.to_string(),
            }
        })
    }

    /// Build an upstream error from a non-2xx response body.
    ///
    /// Understands the common provider envelopes; falls back to the raw body text.
    pub fn from_upstream_body(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body).to_string();
        let parsed: Option<Value> = serde_json::from_slice(body).ok();
        let (message, provider_code) = parsed
            .as_ref()
            .map(extract_provider_error)
            .unwrap_or((None, None));
        Error::Upstream {
            status,
            message: message.unwrap_or_else(|| {
                if text.trim().is_empty() {
                    format!("upstream returned status {}", status)
                } else {
                    text
                }
            }),
            provider_code,
        }
    }
}

fn extract_provider_error(v: &Value) -> (Option<String>, Option<String>) {
    let as_string = |p: &str| v.pointer(p).and_then(|x| x.as_str()).map(String::from);
    // OpenAI / Claude / Gemini: {"error": {"message", "type"|"code"|"status"}}
    if let Some(msg) = as_string("/error/message") {
        let code = as_string("/error/type")
            .or_else(|| as_string("/error/code"))
            .or_else(|| as_string("/error/status"))
            .or_else(|| {
                v.pointer("/error/code")
                    .and_then(|c| c.as_i64())
                    .map(|c| c.to_string())
            });
        return (Some(msg), code);
    }
    // Tencent: {"Response": {"Error": {"Code", "Message"}}}
    if let Some(msg) = as_string("/Response/Error/Message") {
        return (Some(msg), as_string("/Response/Error/Code"));
    }
    // Baidu: {"error_code", "error_msg"}
    if let Some(msg) = as_string("/error_msg") {
        let code = v.get("error_code").map(|c| c.to_string());
        return (Some(msg), code);
    }
    // Ali DashScope: {"code", "message"}
    if let Some(msg) = as_string("/message") {
        return (Some(msg), as_string("/code"));
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_body_openai_shape() {
        let body = br#"{"error":{"message":"bad key","type":"invalid_api_key"}}"#;
        let err = Error::from_upstream_body(401, body);
        assert_eq!(err.status(), 401);
        assert_eq!(err.code(), RelayErrorCode::UpstreamError);
        let out = err.to_openai_body();
        assert_eq!(out["error"]["code"], "invalid_api_key");
    }

    #[test]
    fn test_upstream_body_baidu_shape() {
        let body = br#"{"error_code":110,"error_msg":"Access token invalid"}"#;
        match Error::from_upstream_body(200, body) {
            Error::Upstream {
                message,
                provider_code,
                ..
            } => {
                assert_eq!(message, "Access token invalid");
                assert_eq!(provider_code.as_deref(), Some("110"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_claude_body_shape() {
        let err = Error::invalid_request("max_tokens must be greater than 1024");
        let body = err.to_claude_body();
        assert_eq!(body["type"], "error");
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn test_overloaded_is_unavailable() {
        let err = Error::from_upstream_body(529, b"");
        assert_eq!(err.code(), RelayErrorCode::UpstreamUnavailable);
        assert!(err.code().retryable());
    }
}
