use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Anthropic,
    OpenAI,
    Gemini,
    Antigravity,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Anthropic => "anthropic",
            Platform::OpenAI => "openai",
            Platform::Gemini => "gemini",
            Platform::Antigravity => "antigravity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "anthropic" => Some(Platform::Anthropic),
            "openai" => Some(Platform::OpenAI),
            "gemini" => Some(Platform::Gemini),
            "antigravity" => Some(Platform::Antigravity),
            _ => None,
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "setup-token")]
    SetupToken,
    #[serde(rename = "apikey")]
    ApiKey,
    #[serde(rename = "upstream")]
    Upstream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingType {
    Balance,
    Subscription,
}

/// Per-status body-keyword rule that makes an account temporarily
/// unschedulable when matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TempUnschedulableRule {
    pub status: u16,
    #[serde(default)]
    pub keywords: Vec<String>,
    pub duration_minutes: u64,
    #[serde(default)]
    pub description: Option<String>,
}

/// One pooled upstream credential, denormalized for the request path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: i64,
    pub name: String,
    pub platform: Platform,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    /// Opaque credential bag: tokens, api key, base url, model mapping,
    /// custom error codes, temp-unschedulable rules.
    #[serde(default)]
    pub credentials: JsonMap<String, JsonValue>,
    /// Feature flags: passthrough mode, codex-cli-only, tls fingerprint,
    /// window cost limit, session idle timeout.
    #[serde(default)]
    pub extra: JsonMap<String, JsonValue>,
    /// Smaller value schedules earlier.
    pub priority: i32,
    /// Max in-flight requests on this account.
    pub concurrency: i32,
    #[serde(default)]
    pub rate_multiplier: Option<f64>,
    #[serde(default)]
    pub proxy_url: Option<String>,
    pub status: AccountStatus,
    pub schedulable: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_used_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub session_window_start: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub session_window_end: Option<OffsetDateTime>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
}

impl Account {
    pub fn is_schedulable(&self) -> bool {
        self.status == AccountStatus::Active && self.schedulable
    }

    fn credential_str(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).and_then(|v| v.as_str())
    }

    fn extra_bool(&self, key: &str) -> bool {
        self.extra.get(key).and_then(|v| v.as_bool()).unwrap_or(false)
    }

    pub fn access_token(&self) -> Option<&str> {
        self.credential_str("access_token")
    }

    pub fn refresh_token(&self) -> Option<&str> {
        self.credential_str("refresh_token")
    }

    pub fn api_key(&self) -> Option<&str> {
        self.credential_str("api_key")
    }

    pub fn base_url(&self) -> Option<&str> {
        self.credential_str("base_url").filter(|s| !s.is_empty())
    }

    pub fn chatgpt_account_id(&self) -> Option<&str> {
        self.credential_str("chatgpt_account_id")
    }

    /// Unix seconds at which the access token expires, when known.
    pub fn token_expires_at(&self) -> Option<i64> {
        self.credentials.get("expires_at").and_then(|v| v.as_i64())
    }

    pub fn intercept_warmup(&self) -> bool {
        self.credentials
            .get("intercept_warmup_requests")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn openai_passthrough(&self) -> bool {
        self.extra_bool("openai_passthrough")
    }

    pub fn codex_cli_only(&self) -> bool {
        self.extra_bool("codex_cli_only")
    }

    pub fn tls_fingerprint(&self) -> bool {
        self.extra_bool("tls_fingerprint")
    }

    pub fn window_cost_limit(&self) -> Option<f64> {
        self.extra
            .get("window_cost_limit")
            .and_then(|v| v.as_f64())
            .filter(|v| *v > 0.0)
    }

    pub fn model_mapping(&self) -> HashMap<String, String> {
        let Some(JsonValue::Object(map)) = self.credentials.get("model_mapping") else {
            return HashMap::new();
        };
        map.iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect()
    }

    /// Effective model after the account mapping. Identity entries whitelist,
    /// mixed entries rewrite, absent keys pass through unless the account
    /// carries a whitelist.
    pub fn mapped_model(&self, requested: &str) -> Option<String> {
        let mapping = self.model_mapping();
        if mapping.is_empty() {
            return Some(requested.to_string());
        }
        if let Some(target) = mapping.get(requested) {
            return Some(target.clone());
        }
        let has_whitelist = mapping.iter().any(|(k, v)| k == v);
        if has_whitelist {
            None
        } else {
            Some(requested.to_string())
        }
    }

    pub fn supports_model(&self, requested: &str) -> bool {
        self.mapped_model(requested).is_some()
    }

    /// Explicitly whitelisted or rewritten models, used for the available
    /// models listing.
    pub fn declared_models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.model_mapping().into_keys().collect();
        models.sort();
        models
    }

    pub fn custom_error_codes(&self) -> Option<Vec<u16>> {
        let list = self.credentials.get("custom_error_codes")?.as_array()?;
        Some(
            list.iter()
                .filter_map(|v| v.as_u64().map(|n| n as u16))
                .collect(),
        )
    }

    /// Whether an upstream status should be treated as an account-health
    /// signal. Accounts may opt into extra statuses via custom error codes.
    pub fn should_handle_error_code(&self, status: u16) -> bool {
        match self.custom_error_codes() {
            Some(codes) if !codes.is_empty() => codes.contains(&status),
            _ => matches!(status, 401 | 403 | 429) || status >= 500,
        }
    }

    pub fn temp_unschedulable_rules(&self) -> Vec<TempUnschedulableRule> {
        let Some(value) = self.credentials.get("temp_unschedulable_rules") else {
            return Vec::new();
        };
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    /// Start of the account's current rolling usage window, if one is open.
    pub fn session_window_active(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        let start = self.session_window_start?;
        let end = self.session_window_end?;
        (start <= now && now < end).then_some(start)
    }
}

/// Local api key row, read-only to the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub concurrency: i32,
    #[serde(default)]
    pub group_id: Option<i64>,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub balance: f64,
    pub concurrency: i32,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub rate_multiplier: f64,
    pub billing_type: BillingType,
    /// Per-size image price overrides.
    #[serde(default)]
    pub image_prices: Option<ImagePriceConfig>,
}

impl Group {
    pub fn is_subscription(&self) -> bool {
        self.billing_type == BillingType::Subscription
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImagePriceConfig {
    #[serde(default)]
    pub price_1k: Option<f64>,
    #[serde(default)]
    pub price_2k: Option<f64>,
    #[serde(default)]
    pub price_4k: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub group_id: i64,
    pub used_cost: f64,
    pub quota_cost: f64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub expires_at: Option<OffsetDateTime>,
}

/// Denormalized tenant view resolved once per request by the auth layer.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub api_key: ApiKey,
    pub user: User,
    pub group: Option<Group>,
    pub subscription: Option<Subscription>,
}

/// Append-only usage row written once per completed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub user_id: i64,
    pub api_key_id: i64,
    pub account_id: i64,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub subscription_id: Option<i64>,
    #[serde(default)]
    pub request_id: Option<String>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub actual_cost: f64,
    pub rate_multiplier: f64,
    pub billing_type: BillingType,
    pub stream: bool,
    #[serde(default)]
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub first_token_ms: Option<i64>,
    pub error: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn account_with(credentials: JsonValue, extra: JsonValue) -> Account {
        Account {
            id: 1,
            name: "acc".to_string(),
            platform: Platform::Anthropic,
            account_type: AccountType::OAuth,
            credentials: credentials.as_object().cloned().unwrap_or_default(),
            extra: extra.as_object().cloned().unwrap_or_default(),
            priority: 1,
            concurrency: 4,
            rate_multiplier: None,
            proxy_url: None,
            status: AccountStatus::Active,
            schedulable: true,
            last_used_at: None,
            session_window_start: None,
            session_window_end: None,
            group_ids: Vec::new(),
        }
    }

    #[test]
    fn whitelist_mapping_denies_unlisted_models() {
        let account = account_with(
            json!({"model_mapping": {"claude-3-5-sonnet": "claude-3-5-sonnet"}}),
            json!({}),
        );
        assert_eq!(
            account.mapped_model("claude-3-5-sonnet").as_deref(),
            Some("claude-3-5-sonnet")
        );
        assert_eq!(account.mapped_model("claude-3-5-haiku"), None);
        assert!(!account.supports_model("claude-3-5-haiku"));
    }

    #[test]
    fn rewrite_only_mapping_passes_unknown_models_through() {
        let account = account_with(
            json!({"model_mapping": {"claude-3-opus": "claude-3-5-sonnet"}}),
            json!({}),
        );
        assert_eq!(
            account.mapped_model("claude-3-opus").as_deref(),
            Some("claude-3-5-sonnet")
        );
        assert_eq!(
            account.mapped_model("claude-3-5-haiku").as_deref(),
            Some("claude-3-5-haiku")
        );
    }

    #[test]
    fn empty_mapping_passes_everything_through() {
        let account = account_with(json!({}), json!({}));
        assert_eq!(account.mapped_model("any-model").as_deref(), Some("any-model"));
    }

    #[test]
    fn custom_error_codes_narrow_handling() {
        let account = account_with(json!({"custom_error_codes": [409, 418]}), json!({}));
        assert!(account.should_handle_error_code(409));
        assert!(!account.should_handle_error_code(429));

        let plain = account_with(json!({}), json!({}));
        assert!(plain.should_handle_error_code(429));
        assert!(plain.should_handle_error_code(503));
        assert!(!plain.should_handle_error_code(404));
    }

    #[test]
    fn window_cost_limit_requires_positive_value() {
        let account = account_with(json!({}), json!({"window_cost_limit": 100.0}));
        assert_eq!(account.window_cost_limit(), Some(100.0));
        let zero = account_with(json!({}), json!({"window_cost_limit": 0.0}));
        assert_eq!(zero.window_cost_limit(), None);
    }

    #[test]
    fn temp_unschedulable_rules_decode() {
        let account = account_with(
            json!({"temp_unschedulable_rules": [
                {"status": 529, "keywords": ["overloaded"], "duration_minutes": 5}
            ]}),
            json!({}),
        );
        let rules = account.temp_unschedulable_rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].status, 529);
        assert_eq!(rules[0].duration_minutes, 5);
    }
}
