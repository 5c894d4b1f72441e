//! Session fingerprints used for sticky account affinity.

use serde_json::{Map as JsonMap, Value as JsonValue};
use sha2::{Digest, Sha256};

use crate::headers::{header_get, Headers};

fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Anthropic sessions are keyed by `metadata.user_id` in the request body.
pub fn anthropic_session_hash(body: &JsonMap<String, JsonValue>) -> String {
    let Some(user_id) = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
    else {
        return String::new();
    };
    sha256_hex(user_id)
}

/// OpenAI sessions are keyed by the `session_id` header.
pub fn openai_session_hash(headers: &Headers) -> String {
    let Some(session_id) = header_get(headers, "session_id").filter(|s| !s.is_empty()) else {
        return String::new();
    };
    sha256_hex(session_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_hash_is_stable_and_empty_when_absent() {
        let body = json!({"metadata": {"user_id": "user-1"}})
            .as_object()
            .cloned()
            .unwrap();
        let first = anthropic_session_hash(&body);
        assert_eq!(first.len(), 64);
        assert_eq!(first, anthropic_session_hash(&body));

        let empty = json!({}).as_object().cloned().unwrap();
        assert_eq!(anthropic_session_hash(&empty), "");
    }

    #[test]
    fn openai_hash_reads_session_id_header() {
        let headers = vec![("session_id".to_string(), "sess-1".to_string())];
        assert_eq!(openai_session_hash(&headers).len(), 64);
        assert_eq!(openai_session_hash(&[]), "");
    }
}
