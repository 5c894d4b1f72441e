//! Usage extraction from provider response bodies and stream events.

use serde_json::Value as JsonValue;

use crate::wire::Surface;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

fn i64_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<i64> {
    let mut cursor = value;
    for key in path {
        cursor = cursor.get(key)?;
    }
    cursor.as_i64()
}

/// Parse usage out of a buffered (non-streaming) response body.
pub fn parse_usage_body(surface: Surface, body: &JsonValue) -> Usage {
    match surface {
        Surface::Anthropic => Usage {
            input_tokens: i64_at(body, &["usage", "input_tokens"]).unwrap_or(0),
            output_tokens: i64_at(body, &["usage", "output_tokens"]).unwrap_or(0),
            cache_creation_tokens: i64_at(body, &["usage", "cache_creation_input_tokens"])
                .unwrap_or(0),
            cache_read_tokens: i64_at(body, &["usage", "cache_read_input_tokens"]).unwrap_or(0),
        },
        Surface::OpenAI => Usage {
            input_tokens: i64_at(body, &["usage", "input_tokens"]).unwrap_or(0),
            output_tokens: i64_at(body, &["usage", "output_tokens"]).unwrap_or(0),
            cache_creation_tokens: 0,
            cache_read_tokens: i64_at(body, &["usage", "input_tokens_details", "cached_tokens"])
                .unwrap_or(0),
        },
        Surface::Gemini => parse_gemini_usage(body).unwrap_or_default(),
    }
}

fn parse_gemini_usage(value: &JsonValue) -> Option<Usage> {
    let metadata = value.get("usageMetadata")?;
    Some(Usage {
        input_tokens: metadata
            .get("promptTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        output_tokens: metadata
            .get("candidatesTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: metadata
            .get("cachedContentTokenCount")
            .and_then(|v| v.as_i64())
            .unwrap_or(0),
    })
}

/// Fold one stream event into the running usage. Terminal events win; the
/// Anthropic surface spreads usage across `message_start` and
/// `message_delta`.
pub fn merge_usage_event(surface: Surface, event: &JsonValue, usage: &mut Usage) {
    match surface {
        Surface::Anthropic => {
            let event_type = event.get("type").and_then(|v| v.as_str()).unwrap_or("");
            match event_type {
                "message_start" => {
                    if let Some(message) = event.get("message") {
                        let start = parse_usage_body(Surface::Anthropic, message);
                        usage.input_tokens = start.input_tokens;
                        usage.cache_creation_tokens = start.cache_creation_tokens;
                        usage.cache_read_tokens = start.cache_read_tokens;
                        if start.output_tokens > 0 {
                            usage.output_tokens = start.output_tokens;
                        }
                    }
                }
                "message_delta" => {
                    if let Some(value) = i64_at(event, &["usage", "output_tokens"]) {
                        usage.output_tokens = value;
                    }
                    if let Some(value) = i64_at(event, &["usage", "input_tokens"]) {
                        usage.input_tokens = value;
                    }
                }
                _ => {}
            }
        }
        Surface::OpenAI => {
            if event.get("type").and_then(|v| v.as_str()) == Some("response.completed") {
                if let Some(response) = event.get("response") {
                    *usage = parse_usage_body(Surface::OpenAI, response);
                }
            }
        }
        Surface::Gemini => {
            if let Some(parsed) = parse_gemini_usage(event) {
                *usage = parsed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn anthropic_body_usage() {
        let body = json!({"usage": {
            "input_tokens": 10,
            "output_tokens": 5,
            "cache_creation_input_tokens": 2,
            "cache_read_input_tokens": 3,
        }});
        let usage = parse_usage_body(Surface::Anthropic, &body);
        assert_eq!(usage.input_tokens, 10);
        assert_eq!(usage.cache_read_tokens, 3);
    }

    #[test]
    fn openai_completed_event_wins() {
        let mut usage = Usage::default();
        let event = json!({
            "type": "response.completed",
            "response": {"usage": {
                "input_tokens": 11,
                "output_tokens": 7,
                "input_tokens_details": {"cached_tokens": 3},
            }},
        });
        merge_usage_event(Surface::OpenAI, &event, &mut usage);
        assert_eq!(usage.input_tokens, 11);
        assert_eq!(usage.output_tokens, 7);
        assert_eq!(usage.cache_read_tokens, 3);
    }

    #[test]
    fn anthropic_stream_usage_spreads_across_events() {
        let mut usage = Usage::default();
        merge_usage_event(
            Surface::Anthropic,
            &json!({"type": "message_start", "message": {"usage": {
                "input_tokens": 20, "output_tokens": 1,
                "cache_read_input_tokens": 4,
            }}}),
            &mut usage,
        );
        merge_usage_event(
            Surface::Anthropic,
            &json!({"type": "message_delta", "usage": {"output_tokens": 9}}),
            &mut usage,
        );
        assert_eq!(usage.input_tokens, 20);
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.cache_read_tokens, 4);
    }

    #[test]
    fn gemini_usage_metadata() {
        let body = json!({"usageMetadata": {
            "promptTokenCount": 8,
            "candidatesTokenCount": 2,
            "cachedContentTokenCount": 1,
        }});
        let usage = parse_usage_body(Surface::Gemini, &body);
        assert_eq!(usage.input_tokens, 8);
        assert_eq!(usage.output_tokens, 2);
        assert_eq!(usage.cache_read_tokens, 1);
    }
}
