use bytes::Bytes;
use serde_json::json;

use crate::wire::Surface;

/// Client-facing error taxonomy. The request handler is the single place
/// that converts these into HTTP responses; streaming-aware conversion is
/// used once the response stream has started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientError,
    AuthError,
    RateLimit,
    NoAccountAvailable,
    UpstreamError,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{err_type}: {message}")]
pub struct GatewayError {
    pub kind: ErrorKind,
    pub status: u16,
    pub err_type: String,
    pub message: String,
    pub timeout: bool,
}

impl GatewayError {
    fn new(kind: ErrorKind, status: u16, err_type: &str, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            err_type: err_type.to_string(),
            message: message.into(),
            timeout: false,
        }
    }

    pub fn client(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, 400, "invalid_request_error", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, 403, "invalid_request_error", message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::AuthError, 401, "authentication_error", message)
    }

    pub fn billing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ClientError, 403, "billing_error", message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::RateLimit, 429, "rate_limit_error", message)
    }

    pub fn rate_limit_timeout(message: impl Into<String>) -> Self {
        let mut err = Self::rate_limit(message);
        err.timeout = true;
        err
    }

    pub fn no_account(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoAccountAvailable, 503, "api_error", message)
    }

    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::UpstreamError, status, "upstream_error", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, 503, "api_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, 500, "api_error", message)
    }

    /// Provider-native JSON body for the surface the client is speaking.
    pub fn body_for(&self, surface: Surface) -> Bytes {
        let value = match surface {
            Surface::Anthropic => json!({
                "type": "error",
                "error": {"type": self.err_type, "message": self.message},
            }),
            Surface::OpenAI => json!({
                "error": {"type": self.err_type, "message": self.message},
            }),
            Surface::Gemini => json!({
                "error": {
                    "code": self.status,
                    "message": self.message,
                    "status": self.err_type,
                },
            }),
        };
        Bytes::from(serde_json::to_vec(&value).unwrap_or_default())
    }

    /// SSE error frame used after the response stream has started.
    pub fn sse_event(&self, surface: Surface) -> Bytes {
        let body = self.body_for(surface);
        let mut frame = Vec::with_capacity(body.len() + 32);
        frame.extend_from_slice(b"event: error\ndata: ");
        frame.extend_from_slice(&body);
        frame.extend_from_slice(b"\n\n");
        Bytes::from(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bodies_match_provider_shapes() {
        let err = GatewayError::rate_limit("slow down");
        let anthropic: serde_json::Value =
            serde_json::from_slice(&err.body_for(Surface::Anthropic)).unwrap();
        assert_eq!(anthropic["type"], "error");
        assert_eq!(anthropic["error"]["type"], "rate_limit_error");

        let openai: serde_json::Value =
            serde_json::from_slice(&err.body_for(Surface::OpenAI)).unwrap();
        assert_eq!(openai["error"]["message"], "slow down");
        assert!(openai.get("type").is_none());
    }

    #[test]
    fn sse_event_is_framed() {
        let err = GatewayError::internal("boom");
        let frame = err.sse_event(Surface::OpenAI);
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: error\ndata: {"));
        assert!(text.ends_with("\n\n"));
    }
}
