//! Shared gateway state wired at bootstrap and injected into handlers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tokio::sync::Mutex;

use tollgate_common::GatewayConfig;
use tollgate_store::{
    AccountStore, BillingCache, CacheStore, SubscriptionStore, TenantContext, UsageLogStore,
    UserStore,
};
use tollgate_transform::CodexPromptFetcher;

use crate::admission::ConcurrencyService;
use crate::billing::{BillingGate, MeteringService, PricingService};
use crate::classify::ErrorClassifier;
use crate::events::EventHub;
use crate::selector::AccountSelector;
use crate::token::TokenProvider;
use crate::upstream::UpstreamClient;

const AUTH_CACHE_TTL: Duration = Duration::from_secs(30);

pub struct GatewayDeps {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub accounts: Arc<dyn AccountStore>,
    pub usage_logs: Arc<dyn UsageLogStore>,
    pub users: Arc<dyn UserStore>,
    pub subscriptions: Arc<dyn SubscriptionStore>,
    pub cache: Arc<dyn CacheStore>,
    pub billing_cache: Arc<dyn BillingCache>,
    pub pricing: Arc<dyn PricingService>,
    pub tokens: Arc<dyn TokenProvider>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub prompts: Arc<CodexPromptFetcher>,
}

pub struct AppState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub users: Arc<dyn UserStore>,
    pub cache: Arc<dyn CacheStore>,
    pub selector: AccountSelector,
    pub concurrency: ConcurrencyService,
    pub billing_gate: BillingGate,
    pub metering: MeteringService,
    pub classifier: ErrorClassifier,
    pub tokens: Arc<dyn TokenProvider>,
    pub upstream: Arc<dyn UpstreamClient>,
    pub prompts: Arc<CodexPromptFetcher>,
    pub events: EventHub,

    auth_cache: Mutex<HashMap<String, (TenantContext, Instant)>>,
}

impl AppState {
    pub fn new(deps: GatewayDeps) -> Self {
        let events = EventHub::new(256);
        let selector = AccountSelector::new(
            deps.accounts.clone(),
            deps.usage_logs.clone(),
            deps.users.clone(),
            deps.cache.clone(),
            deps.config.clone(),
        );
        let concurrency = ConcurrencyService::new(deps.cache.clone());
        let billing_gate = BillingGate::new(deps.billing_cache.clone());
        let metering = MeteringService::new(
            deps.pricing.clone(),
            deps.usage_logs.clone(),
            deps.users.clone(),
            deps.subscriptions.clone(),
            deps.accounts.clone(),
            deps.billing_cache.clone(),
            deps.cache.clone(),
        );
        let classifier =
            ErrorClassifier::new(deps.accounts.clone(), deps.cache.clone(), events.clone());
        Self {
            config: deps.config,
            users: deps.users,
            cache: deps.cache,
            selector,
            concurrency,
            billing_gate,
            metering,
            classifier,
            tokens: deps.tokens,
            upstream: deps.upstream,
            prompts: deps.prompts,
            events,
            auth_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a local api key to its tenant view, with a short-TTL cache in
    /// front of the store.
    pub async fn authenticate(&self, api_key: &str) -> Option<TenantContext> {
        {
            let cache = self.auth_cache.lock().await;
            if let Some((tenant, stored_at)) = cache.get(api_key) {
                if stored_at.elapsed() < AUTH_CACHE_TTL {
                    return Some(tenant.clone());
                }
            }
        }
        let tenant = self.users.resolve_api_key(api_key).await.ok().flatten()?;
        let mut cache = self.auth_cache.lock().await;
        cache.insert(api_key.to_string(), (tenant.clone(), Instant::now()));
        Some(tenant)
    }
}
