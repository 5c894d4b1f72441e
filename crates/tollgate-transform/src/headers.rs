//! Header policy: whitelist passthrough, auth swap and client spoofing.

pub type Headers = Vec<(String, String)>;

pub fn header_set(headers: &mut Headers, name: impl Into<String>, value: impl Into<String>) {
    let name = name.into();
    let value = value.into();
    let key = name.to_ascii_lowercase();
    if let Some((_, v)) = headers
        .iter_mut()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
    {
        *v = value;
        return;
    }
    headers.push((name, value));
}

pub fn header_get<'a>(headers: &'a Headers, name: &str) -> Option<&'a str> {
    let key = name.to_ascii_lowercase();
    headers
        .iter()
        .find(|(k, _)| k.to_ascii_lowercase() == key)
        .map(|(_, v)| v.as_str())
}

pub fn header_remove(headers: &mut Headers, name: &str) -> Option<String> {
    let key = name.to_ascii_lowercase();
    let idx = headers
        .iter()
        .position(|(k, _)| k.to_ascii_lowercase() == key)?;
    Some(headers.remove(idx).1)
}

/// Inbound headers forwarded to any upstream. Everything else, notably
/// Authorization, Cookie, X-Api-Key, Accept-Encoding and Proxy-Authorization,
/// is dropped before the auth swap.
const FORWARDED_INBOUND: &[&str] = &[
    "accept-language",
    "content-type",
    "user-agent",
    "originator",
    "session_id",
];

/// Timeout-style headers that leak client retry behavior; forwarded only
/// when the deployment opts in.
const TIMEOUT_STYLE: &[&str] = &["x-stainless-timeout", "x-stainless-retry-count"];

pub fn is_timeout_style_header(name: &str) -> bool {
    let key = name.to_ascii_lowercase();
    TIMEOUT_STYLE.contains(&key.as_str())
}

/// Start an upstream header set from the inbound one: whitelist passthrough
/// plus optional timeout-style headers. Returns which timeout-style headers
/// were present so callers can log them on streaming requests.
pub fn whitelist_inbound(inbound: &Headers, allow_timeout_headers: bool) -> (Headers, Vec<String>) {
    let mut out = Vec::new();
    let mut seen_timeout_style = Vec::new();
    for (name, value) in inbound {
        let key = name.to_ascii_lowercase();
        if FORWARDED_INBOUND.contains(&key.as_str()) {
            out.push((key, value.clone()));
            continue;
        }
        if is_timeout_style_header(&key) {
            seen_timeout_style.push(key.clone());
            if allow_timeout_headers {
                out.push((key, value.clone()));
            }
        }
    }
    (out, seen_timeout_style)
}

pub const ANTHROPIC_VERSION: &str = "2023-06-01";
pub const ANTHROPIC_BETA: &str = "oauth-2025-04-20";
pub const CLAUDE_CODE_UA: &str = "claude-cli/2.1.27 (external, cli)";

/// Fixed Claude-Code client header set applied when spoofing an official CLI.
pub fn apply_claude_code_headers(headers: &mut Headers) {
    header_set(headers, "anthropic-version", ANTHROPIC_VERSION);
    header_set(headers, "anthropic-beta", ANTHROPIC_BETA);
    header_set(headers, "user-agent", CLAUDE_CODE_UA);
    header_set(headers, "x-app", "cli");
    header_set(headers, "anthropic-dangerous-direct-browser-access", "true");
}
