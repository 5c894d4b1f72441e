//! Antigravity model mapping: per-account entries first, then the default
//! table. Keys may end with `*` for prefix matching; targets are literal.

use std::collections::HashMap;

/// Default requested → effective table, consulted only when the account has
/// no entry of its own.
const DEFAULT_MAPPING: &[(&str, &str)] = &[
    ("claude-sonnet-4-5", "claude-sonnet-4-5"),
    ("claude-sonnet-4-5-thinking", "claude-sonnet-4-5-thinking"),
    ("claude-sonnet-4-5-*", "claude-sonnet-4-5"),
    ("claude-opus-4-6", "claude-opus-4-6-thinking"),
    ("claude-opus-4-6-thinking", "claude-opus-4-6-thinking"),
    ("claude-opus-4-5-*", "claude-opus-4-6-thinking"),
    ("claude-opus-4-5-thinking", "claude-opus-4-6-thinking"),
    ("claude-haiku-4-5", "claude-sonnet-4-5"),
    ("claude-haiku-4-5-*", "claude-sonnet-4-5"),
    ("gemini-2.5-flash", "gemini-2.5-flash"),
    ("gemini-2.5-flash-lite", "gemini-2.5-flash-lite"),
    ("gemini-2.5-pro", "gemini-2.5-pro"),
    ("gemini-3-flash", "gemini-3-flash"),
    ("gemini-3-pro-low", "gemini-3-pro-low"),
    ("gemini-3-pro-high", "gemini-3-pro-high"),
    ("gemini-3-pro-image", "gemini-3-pro-image"),
];

/// Only Claude and Gemini model families exist on this surface.
pub fn has_supported_prefix(model: &str) -> bool {
    model.starts_with("claude-") || model.starts_with("gemini-")
}

fn lookup(mapping: &[(&str, &str)], model: &str) -> Option<String> {
    if let Some((_, target)) = mapping.iter().find(|(key, _)| *key == model) {
        return Some((*target).to_string());
    }
    mapping
        .iter()
        .filter_map(|(key, target)| {
            let prefix = key.strip_suffix('*')?;
            model.starts_with(prefix).then(|| (*target).to_string())
        })
        .next()
}

pub fn default_mapped_model(model: &str) -> Option<String> {
    if !has_supported_prefix(model) {
        return None;
    }
    lookup(DEFAULT_MAPPING, model)
}

/// Effective model for an Antigravity account: the account mapping wins,
/// the default table backs it up, anything still unmapped is unsupported.
pub fn mapped_model(account_mapping: &HashMap<String, String>, model: &str) -> Option<String> {
    if !has_supported_prefix(model) {
        return None;
    }
    if let Some(target) = account_mapping.get(model) {
        return Some(target.clone());
    }
    let wildcard_hit = account_mapping.iter().find_map(|(key, target)| {
        let prefix = key.strip_suffix('*')?;
        model.starts_with(prefix).then(|| target.clone())
    });
    if let Some(target) = wildcard_hit {
        return Some(target);
    }
    default_mapped_model(model)
}

pub fn is_model_supported(model: &str) -> bool {
    default_mapped_model(model).is_some()
}
