//! Cache-aware pricing, billing eligibility and post-response metering.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use time::OffsetDateTime;
use tracing::warn;

use tollgate_store::{
    Account, AccountStore, BillingCache, BillingType, CacheStore, ImagePriceConfig,
    SubscriptionStore, TenantContext, UsageLogStore, UsageRecord, UserStore,
};

use crate::error::GatewayError;
use crate::usage::Usage;

const BILLING_CACHE_TTL: Duration = Duration::from_secs(300);
/// Rolling usage window accounts report against.
pub const SESSION_WINDOW: Duration = Duration::from_secs(5 * 60 * 60);
const WINDOW_COST_CACHE_TTL: Duration = Duration::from_secs(5 * 60 * 60);

const DEFAULT_IMAGE_PRICE_1K: f64 = 0.134;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostBreakdown {
    pub input_cost: f64,
    pub output_cost: f64,
    pub cache_creation_cost: f64,
    pub cache_read_cost: f64,
    pub total_cost: f64,
    pub actual_cost: f64,
}

/// Pricing catalog interface; deployments may substitute a live catalog.
pub trait PricingService: Send + Sync {
    /// Chat cost for already-adjusted token counts (the caller subtracts
    /// cache reads from input first).
    fn cost_for_chat(&self, model: &str, usage: &Usage, multiplier: f64) -> CostBreakdown;

    fn cost_for_image(
        &self,
        model: &str,
        size: &str,
        count: i64,
        multiplier: f64,
        group_override: Option<&ImagePriceConfig>,
    ) -> CostBreakdown;
}

#[derive(Debug, Clone, Deserialize)]
struct ModelPrice {
    input: f64,
    output: f64,
    #[serde(default)]
    cache_creation: f64,
    #[serde(default)]
    cache_read: f64,
}

#[derive(Debug, Clone, Deserialize)]
struct ImagePrice {
    #[serde(default)]
    price_1k: Option<f64>,
    #[serde(default)]
    price_2k: Option<f64>,
    #[serde(default)]
    price_4k: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct PricingTable {
    models: HashMap<String, ModelPrice>,
    #[serde(default)]
    images: HashMap<String, ImagePrice>,
}

/// Built-in pricing table, USD per million tokens.
pub struct StaticPricingService {
    table: PricingTable,
}

impl Default for StaticPricingService {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPricingService {
    pub fn new() -> Self {
        let table: PricingTable = serde_json::from_str(include_str!("pricing.json"))
            .unwrap_or(PricingTable {
                models: HashMap::new(),
                images: HashMap::new(),
            });
        Self { table }
    }

    fn price_for(&self, model: &str) -> Option<&ModelPrice> {
        if let Some(price) = self.table.models.get(model) {
            return Some(price);
        }
        // Date-suffixed and vendor-prefixed variants fall back to the
        // longest matching catalog key.
        let model_id = model.rsplit('/').next().unwrap_or(model);
        self.table
            .models
            .iter()
            .filter(|(key, _)| model_id.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .map(|(_, price)| price)
    }

    fn image_unit_price(
        &self,
        model: &str,
        size: &str,
        group_override: Option<&ImagePriceConfig>,
    ) -> f64 {
        let normalized = size.trim().to_ascii_uppercase();
        if let Some(config) = group_override {
            let from_group = match normalized.as_str() {
                "1K" => config.price_1k,
                "2K" => config.price_2k,
                "4K" => config.price_4k,
                _ => None,
            };
            if let Some(price) = from_group {
                return price;
            }
        }

        let catalog = self.table.images.get(model);
        let base_1k = catalog
            .and_then(|p| p.price_1k)
            .unwrap_or(DEFAULT_IMAGE_PRICE_1K);
        match normalized.as_str() {
            "4K" => catalog.and_then(|p| p.price_4k).unwrap_or(base_1k * 2.0),
            "2K" => catalog.and_then(|p| p.price_2k).unwrap_or(base_1k * 1.5),
            _ => base_1k,
        }
    }
}

fn effective_multiplier(multiplier: f64) -> f64 {
    if multiplier <= 0.0 {
        1.0
    } else {
        multiplier
    }
}

impl PricingService for StaticPricingService {
    fn cost_for_chat(&self, model: &str, usage: &Usage, multiplier: f64) -> CostBreakdown {
        let Some(price) = self.price_for(model) else {
            return CostBreakdown::default();
        };
        let multiplier = effective_multiplier(multiplier);
        let per_million = |tokens: i64, rate: f64| (tokens.max(0) as f64 / 1_000_000.0) * rate;

        let input_cost = per_million(usage.input_tokens, price.input) * multiplier;
        let output_cost = per_million(usage.output_tokens, price.output) * multiplier;
        let cache_creation_cost =
            per_million(usage.cache_creation_tokens, price.cache_creation) * multiplier;
        let cache_read_cost = per_million(usage.cache_read_tokens, price.cache_read) * multiplier;
        let total_cost = input_cost + output_cost + cache_creation_cost + cache_read_cost;
        CostBreakdown {
            input_cost,
            output_cost,
            cache_creation_cost,
            cache_read_cost,
            total_cost,
            actual_cost: total_cost * multiplier,
        }
    }

    fn cost_for_image(
        &self,
        model: &str,
        size: &str,
        count: i64,
        multiplier: f64,
        group_override: Option<&ImagePriceConfig>,
    ) -> CostBreakdown {
        if count <= 0 {
            return CostBreakdown::default();
        }
        let multiplier = effective_multiplier(multiplier);
        let unit = self.image_unit_price(model, size, group_override);
        let total_cost = unit * count as f64 * multiplier;
        CostBreakdown {
            output_cost: total_cost,
            total_cost,
            actual_cost: total_cost * multiplier,
            ..Default::default()
        }
    }
}

/// Pre-admission billing check against the cache-through mirrors.
pub struct BillingGate {
    billing_cache: Arc<dyn BillingCache>,
}

impl BillingGate {
    pub fn new(billing_cache: Arc<dyn BillingCache>) -> Self {
        Self { billing_cache }
    }

    pub async fn check_eligibility(&self, tenant: &TenantContext) -> Result<(), GatewayError> {
        match (&tenant.group, &tenant.subscription) {
            (Some(group), Some(subscription)) if group.is_subscription() => {
                let used = self
                    .billing_cache
                    .cached_subscription_usage(subscription.id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(subscription.used_cost);
                if used >= subscription.quota_cost {
                    return Err(GatewayError::billing("Subscription quota exhausted"));
                }
                let _ = self
                    .billing_cache
                    .prime_subscription_usage(subscription.id, used, BILLING_CACHE_TTL)
                    .await;
                Ok(())
            }
            _ => {
                let balance = self
                    .billing_cache
                    .cached_balance(tenant.user.id)
                    .await
                    .ok()
                    .flatten()
                    .unwrap_or(tenant.user.balance);
                if balance <= 0.0 {
                    return Err(GatewayError::billing("Insufficient balance"));
                }
                let _ = self
                    .billing_cache
                    .prime_balance(tenant.user.id, balance, BILLING_CACHE_TTL)
                    .await;
                Ok(())
            }
        }
    }
}

pub struct RecordUsageInput<'a> {
    pub tenant: &'a TenantContext,
    pub account: &'a Account,
    pub model: String,
    pub usage: Usage,
    pub rate_multiplier: f64,
    pub stream: bool,
    pub duration_ms: Option<i64>,
    pub first_token_ms: Option<i64>,
    pub request_id: Option<String>,
    pub error: bool,
}

/// Post-response metering: one usage row per completed request, an atomic
/// debit, the cache-through mirror and the account bookkeeping.
pub struct MeteringService {
    pricing: Arc<dyn PricingService>,
    usage_logs: Arc<dyn UsageLogStore>,
    users: Arc<dyn UserStore>,
    subscriptions: Arc<dyn SubscriptionStore>,
    accounts: Arc<dyn AccountStore>,
    billing_cache: Arc<dyn BillingCache>,
    cache: Arc<dyn CacheStore>,
}

impl MeteringService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pricing: Arc<dyn PricingService>,
        usage_logs: Arc<dyn UsageLogStore>,
        users: Arc<dyn UserStore>,
        subscriptions: Arc<dyn SubscriptionStore>,
        accounts: Arc<dyn AccountStore>,
        billing_cache: Arc<dyn BillingCache>,
        cache: Arc<dyn CacheStore>,
    ) -> Self {
        Self {
            pricing,
            usage_logs,
            users,
            subscriptions,
            accounts,
            billing_cache,
            cache,
        }
    }

    /// Meter one completed request. Errors are logged, never propagated:
    /// nothing on this path may reach the client.
    pub async fn record_usage(&self, input: RecordUsageInput<'_>) {
        let tenant = input.tenant;
        let account = input.account;

        // Cache reads are billed at the cache-read rate, not the input rate.
        let adjusted = Usage {
            input_tokens: (input.usage.input_tokens - input.usage.cache_read_tokens).max(0),
            ..input.usage
        };

        let cost = self
            .pricing
            .cost_for_chat(&input.model, &adjusted, input.rate_multiplier);

        let subscription_billing = matches!(
            (&tenant.group, &tenant.subscription),
            (Some(group), Some(_)) if group.is_subscription()
        );
        let billing_type = if subscription_billing {
            BillingType::Subscription
        } else {
            BillingType::Balance
        };
        let actual_cost = if subscription_billing {
            cost.total_cost
        } else {
            cost.actual_cost
        };

        let record = UsageRecord {
            user_id: tenant.user.id,
            api_key_id: tenant.api_key.id,
            account_id: account.id,
            group_id: tenant.api_key.group_id,
            subscription_id: tenant.subscription.as_ref().map(|s| s.id),
            request_id: input.request_id,
            model: input.model,
            input_tokens: adjusted.input_tokens,
            output_tokens: adjusted.output_tokens,
            cache_creation_tokens: adjusted.cache_creation_tokens,
            cache_read_tokens: adjusted.cache_read_tokens,
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            cache_creation_cost: cost.cache_creation_cost,
            cache_read_cost: cost.cache_read_cost,
            total_cost: cost.total_cost,
            actual_cost,
            rate_multiplier: input.rate_multiplier,
            billing_type,
            stream: input.stream,
            duration_ms: input.duration_ms,
            first_token_ms: input.first_token_ms,
            error: input.error,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(err) = self.usage_logs.create(&record).await {
            warn!(user_id = tenant.user.id, error = %err, "usage record write failed");
        }

        self.debit(tenant, subscription_billing, &cost).await;
        self.update_account(account, cost.total_cost).await;
    }

    async fn debit(&self, tenant: &TenantContext, subscription_billing: bool, cost: &CostBreakdown) {
        if subscription_billing {
            if cost.total_cost <= 0.0 {
                return;
            }
            let Some(subscription) = &tenant.subscription else {
                return;
            };
            if let Err(err) = self
                .subscriptions
                .increment_usage(subscription.id, cost.total_cost)
                .await
            {
                warn!(subscription_id = subscription.id, error = %err, "subscription debit failed");
            }
            let _ = self
                .billing_cache
                .add_subscription_usage(subscription.id, cost.total_cost)
                .await;
        } else {
            if cost.actual_cost <= 0.0 {
                return;
            }
            if let Err(err) = self
                .users
                .deduct_balance(tenant.user.id, cost.actual_cost)
                .await
            {
                warn!(user_id = tenant.user.id, error = %err, "balance debit failed");
            }
            let _ = self
                .billing_cache
                .deduct_balance(tenant.user.id, cost.actual_cost)
                .await;
        }
    }

    async fn update_account(&self, account: &Account, total_cost: f64) {
        let now = OffsetDateTime::now_utc();
        if let Err(err) = self.accounts.update_last_used(account.id, now).await {
            warn!(account_id = account.id, error = %err, "last_used update failed");
        }
        if total_cost > 0.0 {
            let _ = self.cache.add_window_cost(account.id, total_cost).await;
        }
        if account.session_window_active(now).is_none() {
            let end = now + SESSION_WINDOW;
            if let Err(err) = self.accounts.reset_session_window(account.id, now, end).await {
                warn!(account_id = account.id, error = %err, "session window reset failed");
            }
            let _ = self
                .cache
                .set_window_cost(account.id, total_cost.max(0.0), WINDOW_COST_CACHE_TTL)
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_default_pricing_and_scaling() {
        let svc = StaticPricingService::new();
        let cost = svc.cost_for_image("gemini-3-pro-image", "2K", 1, 1.0, None);
        assert!((cost.total_cost - 0.201).abs() < 1e-4);
        assert!((cost.actual_cost - 0.201).abs() < 1e-4);

        let cost = svc.cost_for_image("gemini-3-pro-image", "2K", 3, 1.0, None);
        assert!((cost.total_cost - 0.603).abs() < 1e-4);

        let cost = svc.cost_for_image("gemini-3-pro-image", "4K", 1, 1.0, None);
        assert!((cost.total_cost - 0.268).abs() < 1e-4);

        let cost = svc.cost_for_image("gemini-3-pro-image", "1K", 1, 1.0, None);
        assert!((cost.total_cost - 0.134).abs() < 1e-4);
    }

    #[test]
    fn image_group_override_wins_with_fallback_per_size() {
        let svc = StaticPricingService::new();
        let config = ImagePriceConfig {
            price_1k: Some(0.10),
            price_2k: None,
            price_4k: None,
        };
        let cost = svc.cost_for_image("gemini-3-pro-image", "1K", 1, 1.0, Some(&config));
        assert!((cost.total_cost - 0.10).abs() < 1e-4);
        // Sizes the group left out fall back to defaults.
        let cost = svc.cost_for_image("gemini-3-pro-image", "2K", 1, 1.0, Some(&config));
        assert!((cost.total_cost - 0.201).abs() < 1e-4);
        let cost = svc.cost_for_image("gemini-3-pro-image", "4K", 1, 1.0, Some(&config));
        assert!((cost.total_cost - 0.268).abs() < 1e-4);
    }

    #[test]
    fn image_rate_multiplier_applies_twice_to_actual() {
        let svc = StaticPricingService::new();
        let cost = svc.cost_for_image("gemini-3-pro-image", "2K", 1, 1.5, None);
        assert!((cost.total_cost - 0.3015).abs() < 1e-4);
        assert!((cost.actual_cost - 0.45225).abs() < 1e-4);
    }

    #[test]
    fn image_zero_and_negative_counts_cost_nothing() {
        let svc = StaticPricingService::new();
        assert_eq!(svc.cost_for_image("gemini-3-pro-image", "2K", 0, 1.0, None).total_cost, 0.0);
        assert_eq!(svc.cost_for_image("gemini-3-pro-image", "2K", -1, 1.0, None).total_cost, 0.0);
    }

    #[test]
    fn zero_multiplier_is_treated_as_one() {
        let svc = StaticPricingService::new();
        let cost = svc.cost_for_image("gemini-3-pro-image", "2K", 1, 0.0, None);
        assert!((cost.total_cost - 0.201).abs() < 1e-4);
        assert!((cost.actual_cost - 0.201).abs() < 1e-4);
    }

    #[test]
    fn chat_cost_buckets_and_surcharge() {
        let svc = StaticPricingService::new();
        let usage = Usage {
            input_tokens: 1_000_000,
            output_tokens: 500_000,
            cache_creation_tokens: 0,
            cache_read_tokens: 200_000,
        };
        let cost = svc.cost_for_chat("claude-sonnet-4-5", &usage, 1.0);
        assert!((cost.input_cost - 3.0).abs() < 1e-9);
        assert!((cost.output_cost - 7.5).abs() < 1e-9);
        assert!((cost.cache_read_cost - 0.06).abs() < 1e-9);
        assert!((cost.total_cost - 10.56).abs() < 1e-9);
        assert!((cost.actual_cost - 10.56).abs() < 1e-9);

        let doubled = svc.cost_for_chat("claude-sonnet-4-5", &usage, 2.0);
        assert!((doubled.total_cost - 21.12).abs() < 1e-9);
        assert!((doubled.actual_cost - 42.24).abs() < 1e-9);
    }

    #[test]
    fn date_suffixed_models_fall_back_by_prefix() {
        let svc = StaticPricingService::new();
        let usage = Usage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        let cost = svc.cost_for_chat("claude-3-5-sonnet-20241022", &usage, 1.0);
        assert!((cost.input_cost - 3.0).abs() < 1e-9);
    }

    #[test]
    fn unknown_models_cost_zero() {
        let svc = StaticPricingService::new();
        let usage = Usage {
            input_tokens: 1_000_000,
            ..Default::default()
        };
        assert_eq!(svc.cost_for_chat("made-up-model", &usage, 1.0), CostBreakdown::default());
    }
}
