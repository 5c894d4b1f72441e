//! Claude-Code client detection and request shaping for the Anthropic surface.

use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::headers::{apply_claude_code_headers, header_get, Headers};

pub const CLAUDE_CODE_SYSTEM_PRELUDE: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

pub fn is_claude_cli_user_agent(user_agent: Option<&str>) -> bool {
    let Some(ua) = user_agent else { return false };
    let ua = ua.to_ascii_lowercase();
    ua.starts_with("claude-cli/") || ua.starts_with("claude-code/") || ua.contains(" claude-cli/")
}

/// Shape check for `metadata.user_id`: `user_<64 hex>_account__session_<uuid>`.
pub fn is_claude_code_user_id(user_id: &str) -> bool {
    let Some(rest) = user_id.strip_prefix("user_") else {
        return false;
    };
    let Some((hex_part, session)) = rest.split_once("_account__session_") else {
        return false;
    };
    hex_part.len() == 64
        && hex_part.chars().all(|c| c.is_ascii_hexdigit())
        && is_uuid(session)
}

fn is_uuid(value: &str) -> bool {
    let bytes = value.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    value.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit(),
    })
}

fn system_prelude_present(body: &JsonMap<String, JsonValue>) -> bool {
    match body.get("system") {
        Some(JsonValue::String(text)) => text.starts_with(CLAUDE_CODE_SYSTEM_PRELUDE),
        Some(JsonValue::Array(blocks)) => blocks.first().is_some_and(|block| {
            block
                .get("text")
                .and_then(|v| v.as_str())
                .is_some_and(|text| text.starts_with(CLAUDE_CODE_SYSTEM_PRELUDE))
        }),
        _ => false,
    }
}

/// Whether the inbound request validates as an official Claude-Code client.
///
/// Fast path: any non-CLI user agent is rejected outright; a CLI user agent
/// off the messages path is accepted. The strict path for `/v1/messages`
/// additionally validates the standard system prelude, the metadata user id
/// shape, and the anthropic version/beta headers.
pub fn is_claude_code_request(
    user_agent: Option<&str>,
    is_messages_path: bool,
    headers: &Headers,
    body: Option<&JsonMap<String, JsonValue>>,
) -> bool {
    if !is_claude_cli_user_agent(user_agent) {
        return false;
    }
    if !is_messages_path {
        return true;
    }
    let Some(body) = body else { return false };
    if !system_prelude_present(body) {
        return false;
    }
    let user_id_ok = body
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .is_some_and(is_claude_code_user_id);
    if !user_id_ok {
        return false;
    }
    header_get(headers, "anthropic-version").is_some()
        && header_get(headers, "anthropic-beta").is_some()
}

/// Apply the Claude-Code client spoof to the upstream header set.
pub fn apply_claude_code_spoof(headers: &mut Headers) {
    apply_claude_code_headers(headers);
}

/// Detect a Claude-Code warmup probe: a minimal single-message haiku request
/// used by the CLI to prime a session. The predicate is deliberately narrow;
/// accounts opt in via `intercept_warmup_requests`.
pub fn is_warmup_probe(body: &JsonMap<String, JsonValue>) -> bool {
    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !model.contains("haiku") {
        return false;
    }
    if body.get("max_tokens").and_then(|v| v.as_i64()).unwrap_or(i64::MAX) > 8 {
        return false;
    }
    let Some(messages) = body.get("messages").and_then(|v| v.as_array()) else {
        return false;
    };
    if messages.len() != 1 {
        return false;
    }
    let message = &messages[0];
    if message.get("role").and_then(|v| v.as_str()) != Some("user") {
        return false;
    }
    let text = match message.get("content") {
        Some(JsonValue::String(text)) => text.clone(),
        Some(JsonValue::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(|v| v.as_str()))
            .collect::<Vec<_>>()
            .join(""),
        _ => return false,
    };
    text.trim().len() <= 16
}

/// Canned response body for an intercepted warmup probe.
pub fn warmup_response(model: &str) -> JsonValue {
    serde_json::json!({
        "id": "msg_warmup",
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": "OK"}],
        "stop_reason": "end_turn",
        "usage": {"input_tokens": 0, "output_tokens": 0},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn valid_body() -> JsonMap<String, JsonValue> {
        json!({
            "model": "claude-3-5-sonnet-20241022",
            "system": [{"text": CLAUDE_CODE_SYSTEM_PRELUDE}],
            "metadata": {"user_id": format!(
                "user_{}_account__session_11111111-1111-1111-1111-111111111111",
                "a".repeat(64)
            )},
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn strict_headers() -> Headers {
        vec![
            ("anthropic-version".to_string(), "2023-06-01".to_string()),
            ("anthropic-beta".to_string(), "oauth-2025-04-20".to_string()),
        ]
    }

    #[test]
    fn non_cli_user_agent_is_rejected() {
        assert!(!is_claude_code_request(
            Some("curl/8.6.0"),
            true,
            &strict_headers(),
            Some(&valid_body()),
        ));
    }

    #[test]
    fn cli_off_messages_path_passes_fast_path() {
        assert!(is_claude_code_request(Some("claude-cli/1.0.1"), false, &[], None));
    }

    #[test]
    fn strict_path_requires_prelude_user_id_and_headers() {
        assert!(is_claude_code_request(
            Some("claude-cli/1.0.1"),
            true,
            &strict_headers(),
            Some(&valid_body()),
        ));

        let mut missing_prelude = valid_body();
        missing_prelude.remove("system");
        assert!(!is_claude_code_request(
            Some("claude-cli/1.0.1"),
            true,
            &strict_headers(),
            Some(&missing_prelude),
        ));

        assert!(!is_claude_code_request(
            Some("claude-cli/1.0.1"),
            true,
            &[],
            Some(&valid_body()),
        ));
    }

    #[test]
    fn user_id_shape_is_validated() {
        assert!(is_claude_code_user_id(&format!(
            "user_{}_account__session_11111111-1111-1111-1111-111111111111",
            "0".repeat(64)
        )));
        assert!(!is_claude_code_user_id("user_short_account__session_x"));
        assert!(!is_claude_code_user_id(&format!(
            "user_{}_account__session_not-a-uuid",
            "0".repeat(64)
        )));
    }

    #[test]
    fn warmup_probe_is_narrow() {
        let probe = json!({
            "model": "claude-3-5-haiku-20241022",
            "max_tokens": 1,
            "messages": [{"role": "user", "content": "quota"}],
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(is_warmup_probe(&probe));

        let real = json!({
            "model": "claude-3-5-sonnet-20241022",
            "max_tokens": 1024,
            "messages": [{"role": "user", "content": "quota"}],
        })
        .as_object()
        .cloned()
        .unwrap();
        assert!(!is_warmup_probe(&real));
    }
}
