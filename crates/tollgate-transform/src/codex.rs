//! OpenAI Codex request shaping for the ChatGPT internal Responses endpoint.
//!
//! Two modes exist per account: passthrough (minimal edits, §`apply_passthrough`)
//! and the legacy transform (`apply_codex_transform`) that normalizes the model,
//! flattens tools, injects the official prompt and repairs orphaned tool
//! outputs. Bodies are handled as raw JSON maps so unknown fields survive.

use serde_json::{json, Map as JsonMap, Value as JsonValue};

pub const CODEX_CLI_UA_MARKER: &str = "codex_cli_rs";
/// Canonical UA substituted when a non-Codex client reaches a Codex account.
pub const CODEX_CLI_PINNED_UA: &str = "codex_cli_rs/0.98.0";

const ORPHAN_OUTPUT_MAX_LEN: usize = 16_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodexFamily {
    Gpt52Codex,
    CodexMax,
    Codex,
    Gpt52,
    Gpt51,
}

/// Explicit requested → canonical model table; checked before the substring
/// fallback ladder.
const CODEX_MODEL_MAP: &[(&str, &str)] = &[
    ("gpt-5.1-codex", "gpt-5.1-codex"),
    ("gpt-5.1-codex-low", "gpt-5.1-codex"),
    ("gpt-5.1-codex-medium", "gpt-5.1-codex"),
    ("gpt-5.1-codex-high", "gpt-5.1-codex"),
    ("gpt-5.1-codex-max", "gpt-5.1-codex-max"),
    ("gpt-5.1-codex-max-low", "gpt-5.1-codex-max"),
    ("gpt-5.1-codex-max-medium", "gpt-5.1-codex-max"),
    ("gpt-5.1-codex-max-high", "gpt-5.1-codex-max"),
    ("gpt-5.1-codex-max-xhigh", "gpt-5.1-codex-max"),
    ("gpt-5.2", "gpt-5.2"),
    ("gpt-5.2-none", "gpt-5.2"),
    ("gpt-5.2-low", "gpt-5.2"),
    ("gpt-5.2-medium", "gpt-5.2"),
    ("gpt-5.2-high", "gpt-5.2"),
    ("gpt-5.2-xhigh", "gpt-5.2"),
    ("gpt-5.2-codex", "gpt-5.2-codex"),
    ("gpt-5.2-codex-low", "gpt-5.2-codex"),
    ("gpt-5.2-codex-medium", "gpt-5.2-codex"),
    ("gpt-5.2-codex-high", "gpt-5.2-codex"),
    ("gpt-5.2-codex-xhigh", "gpt-5.2-codex"),
    ("gpt-5.1-codex-mini", "gpt-5.1-codex-mini"),
    ("gpt-5.1-codex-mini-medium", "gpt-5.1-codex-mini"),
    ("gpt-5.1-codex-mini-high", "gpt-5.1-codex-mini"),
    ("gpt-5.1", "gpt-5.1"),
    ("gpt-5.1-none", "gpt-5.1"),
    ("gpt-5.1-low", "gpt-5.1"),
    ("gpt-5.1-medium", "gpt-5.1"),
    ("gpt-5.1-high", "gpt-5.1"),
    ("gpt-5.1-chat-latest", "gpt-5.1"),
    ("gpt-5-codex", "gpt-5.1-codex"),
    ("codex-mini-latest", "gpt-5.1-codex-mini"),
    ("gpt-5-codex-mini", "gpt-5.1-codex-mini"),
    ("gpt-5-codex-mini-medium", "gpt-5.1-codex-mini"),
    ("gpt-5-codex-mini-high", "gpt-5.1-codex-mini"),
    ("gpt-5", "gpt-5.1"),
    ("gpt-5-mini", "gpt-5.1"),
    ("gpt-5-nano", "gpt-5.1"),
];

pub fn is_codex_user_agent(user_agent: Option<&str>) -> bool {
    user_agent
        .map(|ua| ua.contains(CODEX_CLI_UA_MARKER))
        .unwrap_or(false)
}

/// Upstream `originator` header value. Composite UAs still count as Codex.
pub fn originator_for(user_agent: Option<&str>) -> &'static str {
    if is_codex_user_agent(user_agent) {
        "codex_cli_rs"
    } else {
        "opencode"
    }
}

/// Whether the requested model is served via the Codex surface at all.
pub fn is_codex_family_model(model: &str) -> bool {
    let normalized = model.to_ascii_lowercase();
    normalized.contains("codex") || normalized.contains("gpt-5")
}

pub fn normalize_codex_model(model: &str) -> String {
    if model.is_empty() {
        return "gpt-5.1".to_string();
    }

    // Strip a provider prefix like `openai/gpt-5.2`.
    let model_id = model.rsplit('/').next().unwrap_or(model);

    if let Some((_, mapped)) = CODEX_MODEL_MAP
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(model_id))
    {
        return (*mapped).to_string();
    }

    let normalized = model_id.to_ascii_lowercase();
    let has = |needle: &str| {
        normalized.contains(needle) || normalized.contains(&needle.replace('-', " "))
    };

    if has("gpt-5.2-codex") {
        return "gpt-5.2-codex".to_string();
    }
    if has("gpt-5.2") {
        return "gpt-5.2".to_string();
    }
    if has("gpt-5.1-codex-max") {
        return "gpt-5.1-codex-max".to_string();
    }
    if has("gpt-5.1-codex-mini") {
        return "gpt-5.1-codex-mini".to_string();
    }
    if has("codex-mini-latest") || has("gpt-5-codex-mini") {
        return "codex-mini-latest".to_string();
    }
    if has("gpt-5.1-codex") {
        return "gpt-5.1-codex".to_string();
    }
    if has("gpt-5.1") {
        return "gpt-5.1".to_string();
    }
    if normalized.contains("codex") {
        return "gpt-5.1-codex".to_string();
    }
    if has("gpt-5") {
        return "gpt-5.1".to_string();
    }

    "gpt-5.1".to_string()
}

pub fn codex_model_family(normalized_model: &str) -> CodexFamily {
    let model = normalized_model.to_ascii_lowercase();
    if model.contains("gpt-5.2-codex") || model.contains("gpt 5.2 codex") {
        return CodexFamily::Gpt52Codex;
    }
    if model.contains("codex-max") {
        return CodexFamily::CodexMax;
    }
    if model.contains("codex") {
        return CodexFamily::Codex;
    }
    if model.contains("gpt-5.2") {
        return CodexFamily::Gpt52;
    }
    CodexFamily::Gpt51
}

#[derive(Debug, Default, Clone)]
pub struct CodexTransformResult {
    pub modified: bool,
    pub normalized_model: String,
}

/// Legacy transform mode: normalize the body so it matches what an official
/// Codex client would have sent. `instructions` is the fetched per-family
/// prompt, when available.
pub fn apply_codex_transform(
    body: &mut JsonMap<String, JsonValue>,
    instructions: Option<&str>,
) -> CodexTransformResult {
    let mut result = CodexTransformResult::default();

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let normalized = normalize_codex_model(&model);
    if model != normalized {
        body.insert("model".to_string(), JsonValue::String(normalized.clone()));
        result.modified = true;
    }
    result.normalized_model = normalized.clone();

    if body.get("store").and_then(|v| v.as_bool()) != Some(false) {
        body.insert("store".to_string(), JsonValue::Bool(false));
        result.modified = true;
    }
    if body.get("stream").and_then(|v| v.as_bool()) != Some(true) {
        body.insert("stream".to_string(), JsonValue::Bool(true));
        result.modified = true;
    }
    for key in ["max_output_tokens", "max_completion_tokens"] {
        if body.remove(key).is_some() {
            result.modified = true;
        }
    }

    if flatten_function_tools(body) {
        result.modified = true;
    }

    let fetched = instructions.map(str::trim).unwrap_or_default();
    let existing = body
        .get("instructions")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    if !fetched.is_empty() && existing != fetched {
        if !existing.is_empty() {
            if let Some(JsonValue::Array(input)) = body.get_mut("input") {
                let prepended = prepend_system_instruction(std::mem::take(input), &existing);
                *input = prepended;
                result.modified = true;
            }
        }
        body.insert(
            "instructions".to_string(),
            JsonValue::String(fetched.to_string()),
        );
        result.modified = true;
    }

    if let Some(JsonValue::Array(input)) = body.get_mut("input") {
        let items = std::mem::take(input);
        let items = filter_input_items(items);
        *input = normalize_orphaned_tool_outputs(items);
        result.modified = true;
    }

    let (effort, summary) = resolve_reasoning(body, &normalized);
    body.insert(
        "reasoning".to_string(),
        json!({"effort": effort, "summary": summary}),
    );
    let include = resolve_include(body);
    body.insert("include".to_string(), JsonValue::Array(include));
    result.modified = true;

    result
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassthroughOutcome {
    Forward,
    /// Codex-family request with an empty `instructions` field; must be
    /// rejected locally with 403 before any upstream contact.
    MissingInstructions,
}

/// Passthrough mode: the body stays as the client sent it, except for the
/// store/stream forcing the ChatGPT endpoint requires.
pub fn apply_passthrough(
    body: &mut JsonMap<String, JsonValue>,
    user_agent: Option<&str>,
) -> PassthroughOutcome {
    body.insert("store".to_string(), JsonValue::Bool(false));
    body.insert("stream".to_string(), JsonValue::Bool(true));

    let instructions_present = body
        .get("instructions")
        .and_then(|v| v.as_str())
        .map(|s| !s.trim().is_empty())
        .unwrap_or(false);
    if instructions_present {
        return PassthroughOutcome::Forward;
    }

    let model = body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if is_codex_family_model(model) && is_codex_user_agent(user_agent) {
        return PassthroughOutcome::MissingInstructions;
    }
    PassthroughOutcome::Forward
}

/// Tool entries shaped `{type:"function", function:{...}}` have the inner
/// fields promoted onto the tool object itself.
pub fn flatten_function_tools(body: &mut JsonMap<String, JsonValue>) -> bool {
    let Some(JsonValue::Array(tools)) = body.get_mut("tools") else {
        return false;
    };

    let mut modified = false;
    for tool in tools.iter_mut() {
        let Some(tool_map) = tool.as_object_mut() else {
            continue;
        };
        if tool_map.get("type").and_then(|v| v.as_str()).map(str::trim) != Some("function") {
            continue;
        }
        let Some(function) = tool_map.get("function").and_then(|v| v.as_object()).cloned() else {
            continue;
        };
        for key in ["name", "description", "parameters", "strict"] {
            if tool_map.contains_key(key) {
                continue;
            }
            if let Some(value) = function.get(key) {
                if matches!(key, "name" | "description")
                    && value.as_str().map(str::trim).unwrap_or_default().is_empty()
                {
                    continue;
                }
                tool_map.insert(key.to_string(), value.clone());
                modified = true;
            }
        }
    }
    modified
}

/// Drop `item_reference` entries and strip server-assigned `id` fields.
pub fn filter_input_items(input: Vec<JsonValue>) -> Vec<JsonValue> {
    input
        .into_iter()
        .filter_map(|item| {
            let JsonValue::Object(mut map) = item else {
                return Some(item);
            };
            if map.get("type").and_then(|v| v.as_str()) == Some("item_reference") {
                return None;
            }
            map.remove("id");
            Some(JsonValue::Object(map))
        })
        .collect()
}

fn prepend_system_instruction(input: Vec<JsonValue>, instructions: &str) -> Vec<JsonValue> {
    let message = json!({
        "role": "system",
        "content": [{"type": "input_text", "text": instructions}],
    });
    std::iter::once(message).chain(input).collect()
}

fn call_id_of(item: &JsonMap<String, JsonValue>) -> Option<&str> {
    item.get("call_id")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Tool outputs whose call id has no matching call earlier in the same
/// request become plain assistant messages so the model keeps the context
/// without a schema violation.
pub fn normalize_orphaned_tool_outputs(input: Vec<JsonValue>) -> Vec<JsonValue> {
    let mut function_calls = std::collections::HashSet::new();
    let mut local_shell_calls = std::collections::HashSet::new();
    let mut custom_tool_calls = std::collections::HashSet::new();

    for item in &input {
        let Some(map) = item.as_object() else { continue };
        let Some(call_id) = call_id_of(map) else { continue };
        match map.get("type").and_then(|v| v.as_str()) {
            Some("function_call") => {
                function_calls.insert(call_id.to_string());
            }
            Some("local_shell_call") => {
                local_shell_calls.insert(call_id.to_string());
            }
            Some("custom_tool_call") => {
                custom_tool_calls.insert(call_id.to_string());
            }
            _ => {}
        }
    }

    input
        .into_iter()
        .map(|item| {
            let Some(map) = item.as_object() else {
                return item;
            };
            let call_id = call_id_of(map).map(str::to_string);
            let orphaned = match map.get("type").and_then(|v| v.as_str()) {
                Some("function_call_output") => match &call_id {
                    Some(id) => !(function_calls.contains(id) || local_shell_calls.contains(id)),
                    None => true,
                },
                Some("custom_tool_call_output") => match &call_id {
                    Some(id) => !custom_tool_calls.contains(id),
                    None => true,
                },
                Some("local_shell_call_output") => match &call_id {
                    Some(id) => !local_shell_calls.contains(id),
                    None => true,
                },
                _ => false,
            };
            if orphaned {
                orphaned_output_to_message(map, call_id.as_deref())
            } else {
                item
            }
        })
        .collect()
}

fn orphaned_output_to_message(
    item: &JsonMap<String, JsonValue>,
    call_id: Option<&str>,
) -> JsonValue {
    let tool_name = item
        .get("name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or("tool");
    let label_id = call_id.unwrap_or("unknown");
    let text = stringify_output(item.get("output"));
    let text = truncate_chars(&text, ORPHAN_OUTPUT_MAX_LEN);
    json!({
        "type": "message",
        "role": "assistant",
        "content": format!("[Previous {tool_name} result; call_id={label_id}]: {text}"),
    })
}

fn stringify_output(output: Option<&JsonValue>) -> String {
    match output {
        None => String::new(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(other) => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max).collect();
    format!("{truncated}\n...[truncated]")
}

fn reasoning_value(body: &JsonMap<String, JsonValue>, field: &str) -> Option<String> {
    body.get("reasoning")
        .and_then(|v| v.as_object())
        .and_then(|r| r.get(field))
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Resolve the reasoning effort/summary pair for the model family, clamping
/// requested levels the family cannot serve.
pub fn resolve_reasoning(body: &JsonMap<String, JsonValue>, model: &str) -> (String, String) {
    let effort_override = reasoning_value(body, "effort");
    let summary_override = reasoning_value(body, "summary");
    reasoning_config(model, effort_override.as_deref(), summary_override.as_deref())
}

pub fn reasoning_config(
    model: &str,
    effort_override: Option<&str>,
    summary_override: Option<&str>,
) -> (String, String) {
    let normalized = model.to_ascii_lowercase();

    let is_gpt52_codex =
        normalized.contains("gpt-5.2-codex") || normalized.contains("gpt 5.2 codex");
    let is_gpt52_general =
        (normalized.contains("gpt-5.2") || normalized.contains("gpt 5.2")) && !is_gpt52_codex;
    let is_codex_max = normalized.contains("codex-max") || normalized.contains("codex max");
    let is_codex_mini = normalized.contains("codex-mini") || normalized.contains("codex mini");
    let is_codex = normalized.contains("codex") && !is_codex_mini;
    let is_lightweight =
        !is_codex_mini && (normalized.contains("nano") || normalized.contains("mini"));
    let is_gpt51_general = (normalized.contains("gpt-5.1") || normalized.contains("gpt 5.1"))
        && !is_codex
        && !is_codex_max
        && !is_codex_mini;

    let supports_xhigh = is_gpt52_general || is_gpt52_codex || is_codex_max;
    let supports_none = is_gpt52_general || is_gpt51_general;

    let default_effort = if is_codex_mini {
        "medium"
    } else if supports_xhigh {
        "high"
    } else if is_lightweight {
        "minimal"
    } else {
        "medium"
    };

    let mut effort = effort_override.unwrap_or(default_effort).to_string();

    if is_codex_mini {
        if matches!(effort.as_str(), "minimal" | "low" | "none") {
            effort = "medium".to_string();
        }
        if effort == "xhigh" {
            effort = "high".to_string();
        }
        if effort != "high" && effort != "medium" {
            effort = "medium".to_string();
        }
    }

    if !supports_xhigh && effort == "xhigh" {
        effort = "high".to_string();
    }
    if !supports_none && effort == "none" {
        effort = "low".to_string();
    }
    if effort == "minimal" {
        effort = "low".to_string();
    }

    let summary = summary_override.unwrap_or("auto").to_string();
    (effort, summary)
}

/// `include` always carries `reasoning.encrypted_content`, deduplicated and
/// order-preserving.
pub fn resolve_include(body: &JsonMap<String, JsonValue>) -> Vec<JsonValue> {
    const ENCRYPTED: &str = "reasoning.encrypted_content";
    let mut values: Vec<String> = body
        .get("include")
        .and_then(|v| v.as_array())
        .map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    if !values.iter().any(|v| v == ENCRYPTED) {
        values.push(ENCRYPTED.to_string());
    }
    let mut seen = std::collections::HashSet::new();
    values
        .into_iter()
        .filter(|v| seen.insert(v.clone()))
        .map(JsonValue::String)
        .collect()
}
