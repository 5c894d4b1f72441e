use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Optional outbound proxy for accounts without their own proxy.
    pub outbound_proxy: Option<String>,
    /// Billing multiplier applied when an api key has no group.
    pub default_rate_multiplier: f64,

    /// Forward `x-stainless-*` timeout headers in OpenAI passthrough mode.
    pub openai_passthrough_allow_timeout_headers: bool,
    /// Treat every OpenAI client as Codex CLI regardless of User-Agent.
    pub force_codex_cli: bool,

    pub user_group_rate_cache_ttl_seconds: u64,
    pub models_list_cache_ttl_seconds: u64,
    pub sticky_session_ttl_seconds: u64,

    // Admission.
    pub sticky_session_max_waiting: i64,
    pub sticky_session_wait_timeout_seconds: u64,
    pub fallback_wait_timeout_seconds: u64,
    pub fallback_max_waiting: i64,
    pub ping_interval_millis: u64,
    /// Hard deadline for a whole request, upstream included.
    pub request_deadline_seconds: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
            dsn: String::new(),
            outbound_proxy: None,
            default_rate_multiplier: 1.0,
            openai_passthrough_allow_timeout_headers: false,
            force_codex_cli: false,
            user_group_rate_cache_ttl_seconds: 30,
            models_list_cache_ttl_seconds: 10,
            sticky_session_ttl_seconds: 3600,
            sticky_session_max_waiting: 3,
            sticky_session_wait_timeout_seconds: 30,
            fallback_wait_timeout_seconds: 30,
            fallback_max_waiting: 10,
            ping_interval_millis: 10_000,
            request_deadline_seconds: 600,
        }
    }
}

impl GatewayConfig {
    pub fn user_group_rate_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.user_group_rate_cache_ttl_seconds)
    }

    pub fn models_list_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.models_list_cache_ttl_seconds)
    }

    pub fn sticky_session_ttl(&self) -> Duration {
        Duration::from_secs(self.sticky_session_ttl_seconds)
    }

    pub fn sticky_session_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.sticky_session_wait_timeout_seconds)
    }

    pub fn fallback_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.fallback_wait_timeout_seconds)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_millis)
    }

    pub fn request_deadline(&self) -> Duration {
        Duration::from_secs(self.request_deadline_seconds)
    }
}

/// Optional layer used when merging config sources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub dsn: Option<String>,
    pub outbound_proxy: Option<String>,
    pub default_rate_multiplier: Option<f64>,
    pub openai_passthrough_allow_timeout_headers: Option<bool>,
    pub force_codex_cli: Option<bool>,
    pub user_group_rate_cache_ttl_seconds: Option<u64>,
    pub models_list_cache_ttl_seconds: Option<u64>,
    pub sticky_session_ttl_seconds: Option<u64>,
    pub sticky_session_max_waiting: Option<i64>,
    pub sticky_session_wait_timeout_seconds: Option<u64>,
    pub fallback_wait_timeout_seconds: Option<u64>,
    pub fallback_max_waiting: Option<i64>,
    pub ping_interval_millis: Option<u64>,
    pub request_deadline_seconds: Option<u64>,
}

macro_rules! overlay_field {
    ($dst:expr, $src:expr, $($field:ident),+ $(,)?) => {
        $(if $src.$field.is_some() {
            $dst.$field = $src.$field;
        })+
    };
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        overlay_field!(
            self,
            other,
            host,
            port,
            dsn,
            outbound_proxy,
            default_rate_multiplier,
            openai_passthrough_allow_timeout_headers,
            force_codex_cli,
            user_group_rate_cache_ttl_seconds,
            models_list_cache_ttl_seconds,
            sticky_session_ttl_seconds,
            sticky_session_max_waiting,
            sticky_session_wait_timeout_seconds,
            fallback_wait_timeout_seconds,
            fallback_max_waiting,
            ping_interval_millis,
            request_deadline_seconds,
        );
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        let defaults = GatewayConfig::default();
        Ok(GatewayConfig {
            host: self.host.unwrap_or(defaults.host),
            port: self.port.unwrap_or(defaults.port),
            dsn: self.dsn.ok_or(GatewayConfigError::MissingField("dsn"))?,
            outbound_proxy: self.outbound_proxy,
            default_rate_multiplier: self
                .default_rate_multiplier
                .unwrap_or(defaults.default_rate_multiplier),
            openai_passthrough_allow_timeout_headers: self
                .openai_passthrough_allow_timeout_headers
                .unwrap_or(defaults.openai_passthrough_allow_timeout_headers),
            force_codex_cli: self.force_codex_cli.unwrap_or(defaults.force_codex_cli),
            user_group_rate_cache_ttl_seconds: self
                .user_group_rate_cache_ttl_seconds
                .unwrap_or(defaults.user_group_rate_cache_ttl_seconds),
            models_list_cache_ttl_seconds: self
                .models_list_cache_ttl_seconds
                .unwrap_or(defaults.models_list_cache_ttl_seconds),
            sticky_session_ttl_seconds: self
                .sticky_session_ttl_seconds
                .unwrap_or(defaults.sticky_session_ttl_seconds),
            sticky_session_max_waiting: self
                .sticky_session_max_waiting
                .unwrap_or(defaults.sticky_session_max_waiting),
            sticky_session_wait_timeout_seconds: self
                .sticky_session_wait_timeout_seconds
                .unwrap_or(defaults.sticky_session_wait_timeout_seconds),
            fallback_wait_timeout_seconds: self
                .fallback_wait_timeout_seconds
                .unwrap_or(defaults.fallback_wait_timeout_seconds),
            fallback_max_waiting: self
                .fallback_max_waiting
                .unwrap_or(defaults.fallback_max_waiting),
            ping_interval_millis: self
                .ping_interval_millis
                .unwrap_or(defaults.ping_interval_millis),
            request_deadline_seconds: self
                .request_deadline_seconds
                .unwrap_or(defaults.request_deadline_seconds),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            dsn: Some(value.dsn),
            outbound_proxy: value.outbound_proxy,
            default_rate_multiplier: Some(value.default_rate_multiplier),
            openai_passthrough_allow_timeout_headers: Some(
                value.openai_passthrough_allow_timeout_headers,
            ),
            force_codex_cli: Some(value.force_codex_cli),
            user_group_rate_cache_ttl_seconds: Some(value.user_group_rate_cache_ttl_seconds),
            models_list_cache_ttl_seconds: Some(value.models_list_cache_ttl_seconds),
            sticky_session_ttl_seconds: Some(value.sticky_session_ttl_seconds),
            sticky_session_max_waiting: Some(value.sticky_session_max_waiting),
            sticky_session_wait_timeout_seconds: Some(value.sticky_session_wait_timeout_seconds),
            fallback_wait_timeout_seconds: Some(value.fallback_wait_timeout_seconds),
            fallback_max_waiting: Some(value.fallback_max_waiting),
            ping_interval_millis: Some(value.ping_interval_millis),
            request_deadline_seconds: Some(value.request_deadline_seconds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_overlay_prefers_later_layer() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            dsn: Some("sqlite::memory:".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(9000),
            host: Some("0.0.0.0".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.sticky_session_ttl(), Duration::from_secs(3600));
    }

    #[test]
    fn missing_dsn_is_an_error() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GatewayConfigError::MissingField("dsn")));
    }
}
