//! Account selection: sticky affinity, candidate filtering, load-aware
//! exclusion and deterministic ranking, with short-TTL caches in front of
//! the stores.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use tollgate_common::GatewayConfig;
use tollgate_store::{Account, AccountStore, CacheStore, Platform, UsageLogStore, UserStore};
use tollgate_transform::mapping::account_supports_model;

use crate::billing::SESSION_WINDOW;
use crate::error::GatewayError;
use crate::singleflight::SingleFlight;

/// Headroom kept under a window cost limit so a sticky session can finish
/// its conversation on the account it started on.
const STICKY_RESERVE: f64 = 1.0;

const WINDOW_COST_CACHE_TTL: Duration = Duration::from_secs(5 * 60 * 60);

#[derive(Debug, Default)]
pub struct SelectorMetrics {
    pub models_list_hit: AtomicI64,
    pub models_list_miss: AtomicI64,
    pub models_list_store: AtomicI64,

    pub user_rate_hit: AtomicI64,
    pub user_rate_miss: AtomicI64,
    pub user_rate_load: AtomicI64,
    pub user_rate_shared: AtomicI64,
    pub user_rate_fallback: AtomicI64,

    pub window_cost_hit: AtomicI64,
    pub window_cost_miss: AtomicI64,
    pub window_cost_batch_sql: AtomicI64,
    pub window_cost_fallback: AtomicI64,
    pub window_cost_error: AtomicI64,
}

impl SelectorMetrics {
    pub fn models_list_stats(&self) -> (i64, i64, i64) {
        (
            self.models_list_hit.load(Ordering::Relaxed),
            self.models_list_miss.load(Ordering::Relaxed),
            self.models_list_store.load(Ordering::Relaxed),
        )
    }

    pub fn user_rate_stats(&self) -> (i64, i64, i64, i64, i64) {
        (
            self.user_rate_hit.load(Ordering::Relaxed),
            self.user_rate_miss.load(Ordering::Relaxed),
            self.user_rate_load.load(Ordering::Relaxed),
            self.user_rate_shared.load(Ordering::Relaxed),
            self.user_rate_fallback.load(Ordering::Relaxed),
        )
    }

    pub fn window_cost_stats(&self) -> (i64, i64, i64, i64, i64) {
        (
            self.window_cost_hit.load(Ordering::Relaxed),
            self.window_cost_miss.load(Ordering::Relaxed),
            self.window_cost_batch_sql.load(Ordering::Relaxed),
            self.window_cost_fallback.load(Ordering::Relaxed),
            self.window_cost_error.load(Ordering::Relaxed),
        )
    }
}

/// Sticky binding warmed by the handler before admission, so selection can
/// skip the cache read it would otherwise do.
#[derive(Debug, Clone, Copy)]
pub struct PrefetchedSticky {
    pub account_id: i64,
    pub group_id: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct RequestScope {
    pub prefetched_sticky: Option<PrefetchedSticky>,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub account: Account,
    /// Whether the account came from a sticky binding.
    pub sticky: bool,
}

type TtlCache<V> = Mutex<HashMap<String, (V, Instant)>>;

pub struct AccountSelector {
    accounts: Arc<dyn AccountStore>,
    usage_logs: Arc<dyn UsageLogStore>,
    users: Arc<dyn UserStore>,
    cache: Arc<dyn CacheStore>,
    config: Arc<ArcSwap<GatewayConfig>>,
    pub metrics: SelectorMetrics,

    models_list_cache: TtlCache<Vec<String>>,
    models_list_flight: SingleFlight<String, Vec<String>>,
    user_rate_cache: TtlCache<f64>,
    user_rate_flight: SingleFlight<String, Result<Option<f64>, String>>,
}

impl AccountSelector {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        usage_logs: Arc<dyn UsageLogStore>,
        users: Arc<dyn UserStore>,
        cache: Arc<dyn CacheStore>,
        config: Arc<ArcSwap<GatewayConfig>>,
    ) -> Self {
        Self {
            accounts,
            usage_logs,
            users,
            cache,
            config,
            metrics: SelectorMetrics::default(),
            models_list_cache: Mutex::new(HashMap::new()),
            models_list_flight: SingleFlight::new(),
            user_rate_cache: Mutex::new(HashMap::new()),
            user_rate_flight: SingleFlight::new(),
        }
    }

    /// Pick one schedulable account for this request.
    pub async fn select_account(
        &self,
        scope: &RequestScope,
        group_id: Option<i64>,
        platform: Platform,
        session_hash: &str,
        requested_model: &str,
    ) -> Result<Selection, GatewayError> {
        let sticky_ttl = self.config.load().sticky_session_ttl();

        // 1. Sticky short-circuit.
        if !session_hash.is_empty() {
            if let Some(account) = self
                .sticky_account(scope, group_id, platform, session_hash, requested_model)
                .await
            {
                let _ = self
                    .cache
                    .refresh_sticky(platform, group_id, session_hash, sticky_ttl)
                    .await;
                return Ok(Selection {
                    account,
                    sticky: true,
                });
            }
        }

        // 2. Candidate set.
        let candidates = match group_id {
            Some(group_id) => {
                self.accounts
                    .list_schedulable_by_group_and_platform(group_id, platform)
                    .await
            }
            None => self.accounts.list_schedulable_by_platform(platform).await,
        }
        .map_err(|err| GatewayError::internal(format!("query accounts failed: {err}")))?;

        let candidates: Vec<Account> = candidates
            .into_iter()
            .filter(|account| {
                requested_model.is_empty() || account_supports_model(account, requested_model)
            })
            .collect();
        if candidates.is_empty() {
            return Err(if requested_model.is_empty() {
                GatewayError::no_account("no available accounts")
            } else {
                GatewayError::no_account(format!(
                    "no available accounts supporting model: {requested_model}"
                ))
            });
        }

        // 3. Load-aware filter: one bulk read for slots, one for window cost.
        let ids: Vec<i64> = candidates.iter().map(|a| a.id).collect();
        let loads = self
            .cache
            .account_load_batch(&ids)
            .await
            .unwrap_or_default();
        let window_costs = self.prefetch_window_costs(&candidates).await;

        let fallback_max_waiting = self.config.load().fallback_max_waiting;
        let mut eligible: Vec<&Account> = Vec::with_capacity(candidates.len());
        for account in &candidates {
            if self.cache.in_cooldown(account.id).await.unwrap_or(false) {
                continue;
            }
            let load = loads.get(&account.id).copied().unwrap_or_default();
            if load.in_flight >= account.concurrency as i64
                && load.waiting >= fallback_max_waiting
            {
                continue;
            }
            if let Some(limit) = account.window_cost_limit() {
                let cost = window_costs.get(&account.id).copied().unwrap_or(0.0);
                if cost + STICKY_RESERVE >= limit {
                    debug!(
                        account_id = account.id,
                        cost, limit, "window cost limit reached, skipping"
                    );
                    continue;
                }
            }
            eligible.push(account);
        }
        if eligible.is_empty() {
            return Err(GatewayError::no_account("no available accounts"));
        }

        // 4. Deterministic ranking.
        eligible.sort_by(|a, b| {
            let load_a = loads.get(&a.id).copied().unwrap_or_default().in_flight;
            let load_b = loads.get(&b.id).copied().unwrap_or_default().in_flight;
            a.priority
                .cmp(&b.priority)
                .then(load_a.cmp(&load_b))
                .then(cmp_last_used(a.last_used_at, b.last_used_at))
                .then(a.id.cmp(&b.id))
        });
        let selected = (*eligible[0]).clone();

        // 5. Sticky write; failure only costs affinity.
        if !session_hash.is_empty() {
            if let Err(err) = self
                .cache
                .set_sticky(platform, group_id, session_hash, selected.id, sticky_ttl)
                .await
            {
                warn!(account_id = selected.id, error = %err, "sticky write failed");
            }
        }

        Ok(Selection {
            account: selected,
            sticky: false,
        })
    }

    async fn sticky_account(
        &self,
        scope: &RequestScope,
        group_id: Option<i64>,
        platform: Platform,
        session_hash: &str,
        requested_model: &str,
    ) -> Option<Account> {
        let prefetched = scope
            .prefetched_sticky
            .filter(|p| p.group_id == group_id)
            .map(|p| p.account_id);
        let account_id = match prefetched {
            Some(id) => id,
            None => self
                .cache
                .get_sticky(platform, group_id, session_hash)
                .await
                .ok()
                .flatten()?,
        };

        let account = self.accounts.get_by_id(account_id).await.ok().flatten();
        let usable = account.as_ref().is_some_and(|account| {
            account.is_schedulable()
                && account.platform == platform
                && (requested_model.is_empty()
                    || account_supports_model(account, requested_model))
        });
        let in_cooldown = match &account {
            Some(account) => self.cache.in_cooldown(account.id).await.unwrap_or(false),
            None => false,
        };
        if usable && !in_cooldown {
            return account;
        }

        // The binding points at an account that can no longer serve this
        // session; drop it so selection reruns cleanly.
        let _ = self.cache.del_sticky(platform, group_id, session_hash).await;
        None
    }

    /// Batch-warm rolling window costs for every candidate with a limit and
    /// an open session window. Cache first, one SQL batch for the misses,
    /// per-account SQL only if the batch itself fails.
    pub async fn prefetch_window_costs(&self, accounts: &[Account]) -> HashMap<i64, f64> {
        let now = OffsetDateTime::now_utc();
        let mut window_starts: HashMap<i64, OffsetDateTime> = HashMap::new();
        for account in accounts {
            if account.window_cost_limit().is_none() {
                continue;
            }
            let Some(start) = account.session_window_active(now) else {
                continue;
            };
            window_starts.insert(account.id, start);
        }
        if window_starts.is_empty() {
            return HashMap::new();
        }

        let ids: Vec<i64> = window_starts.keys().copied().collect();
        let mut out = self.cache.window_cost_batch(&ids).await.unwrap_or_default();
        let misses: Vec<i64> = ids
            .iter()
            .copied()
            .filter(|id| !out.contains_key(id))
            .collect();
        self.metrics
            .window_cost_hit
            .fetch_add(out.len() as i64, Ordering::Relaxed);
        self.metrics
            .window_cost_miss
            .fetch_add(misses.len() as i64, Ordering::Relaxed);
        if misses.is_empty() {
            return out;
        }

        let earliest = misses
            .iter()
            .filter_map(|id| window_starts.get(id))
            .min()
            .copied()
            .unwrap_or(now - SESSION_WINDOW);

        self.metrics.window_cost_batch_sql.fetch_add(1, Ordering::Relaxed);
        match self.usage_logs.account_window_cost_batch(&misses, earliest).await {
            Ok(batch) => {
                for id in &misses {
                    let cost = batch.get(id).copied().unwrap_or(0.0);
                    out.insert(*id, cost);
                    let _ = self
                        .cache
                        .set_window_cost(*id, cost, WINDOW_COST_CACHE_TTL)
                        .await;
                }
            }
            Err(err) => {
                self.metrics.window_cost_error.fetch_add(1, Ordering::Relaxed);
                self.metrics.window_cost_fallback.fetch_add(1, Ordering::Relaxed);
                warn!(error = %err, "window cost batch read failed, falling back per account");
                for id in &misses {
                    let since = window_starts.get(id).copied().unwrap_or(earliest);
                    if let Ok(cost) = self.usage_logs.account_window_cost(*id, since).await {
                        out.insert(*id, cost);
                        let _ = self
                            .cache
                            .set_window_cost(*id, cost, WINDOW_COST_CACHE_TTL)
                            .await;
                    }
                }
            }
        }
        out
    }

    fn models_list_key(group_id: Option<i64>, platform: Option<Platform>) -> String {
        format!(
            "models:{}:{}",
            group_id.map(|id| id.to_string()).unwrap_or_else(|| "all".to_string()),
            platform.map(|p| p.as_str().to_string()).unwrap_or_else(|| "all".to_string()),
        )
    }

    /// Models available to a (group, platform) pair: the union of every
    /// schedulable account's declared models, cached for a few seconds.
    pub async fn available_models(
        &self,
        group_id: Option<i64>,
        platform: Option<Platform>,
    ) -> Vec<String> {
        let key = Self::models_list_key(group_id, platform);
        let ttl = self.config.load().models_list_cache_ttl();

        {
            let cache = self.models_list_cache.lock().await;
            if let Some((models, stored_at)) = cache.get(&key) {
                if stored_at.elapsed() < ttl {
                    self.metrics.models_list_hit.fetch_add(1, Ordering::Relaxed);
                    return models.clone();
                }
            }
        }
        self.metrics.models_list_miss.fetch_add(1, Ordering::Relaxed);

        let (models, _shared) = self
            .models_list_flight
            .run(key.clone(), || async {
                let accounts = match (group_id, platform) {
                    (Some(group_id), Some(platform)) => self
                        .accounts
                        .list_schedulable_by_group_and_platform(group_id, platform)
                        .await
                        .unwrap_or_default(),
                    (None, Some(platform)) => self
                        .accounts
                        .list_schedulable_by_platform(platform)
                        .await
                        .unwrap_or_default(),
                    (group_id, None) => {
                        let mut all = Vec::new();
                        for platform in [
                            Platform::Anthropic,
                            Platform::OpenAI,
                            Platform::Gemini,
                            Platform::Antigravity,
                        ] {
                            let accounts = match group_id {
                                Some(group_id) => self
                                    .accounts
                                    .list_schedulable_by_group_and_platform(group_id, platform)
                                    .await
                                    .unwrap_or_default(),
                                None => self
                                    .accounts
                                    .list_schedulable_by_platform(platform)
                                    .await
                                    .unwrap_or_default(),
                            };
                            all.extend(accounts);
                        }
                        all
                    }
                };
                let mut models: Vec<String> = accounts
                    .iter()
                    .filter(|account| {
                        platform.is_none() || Some(account.platform) == platform
                    })
                    .flat_map(|account| account.declared_models())
                    .collect();
                models.sort();
                models.dedup();
                models
            })
            .await;

        if !models.is_empty() {
            let mut cache = self.models_list_cache.lock().await;
            cache.insert(key, (models.clone(), Instant::now()));
            self.metrics.models_list_store.fetch_add(1, Ordering::Relaxed);
        }
        models
    }

    /// Drop cached model lists by group and/or platform dimension. `None`
    /// on a dimension matches every value of it.
    pub async fn invalidate_available_models(
        &self,
        group_id: Option<i64>,
        platform: Option<Platform>,
    ) {
        let group_part = group_id.map(|id| id.to_string());
        let platform_part = platform.map(|p| p.as_str().to_string());
        let mut cache = self.models_list_cache.lock().await;
        cache.retain(|key, _| {
            let mut parts = key.splitn(3, ':');
            if parts.next() != Some("models") {
                return true;
            }
            let (Some(key_group), Some(key_platform)) = (parts.next(), parts.next()) else {
                return true;
            };
            let group_matches = group_part.as_deref().map(|g| g == key_group).unwrap_or(true);
            let platform_matches = platform_part
                .as_deref()
                .map(|p| p == key_platform)
                .unwrap_or(true);
            !(group_matches && platform_matches)
        });
    }

    /// Per-(user, group) billing multiplier with cache, single-flight and a
    /// fallback to the group default when the store misbehaves.
    pub async fn user_group_rate_multiplier(
        &self,
        user_id: i64,
        group_id: i64,
        group_default: f64,
    ) -> f64 {
        if user_id <= 0 || group_id <= 0 {
            return group_default;
        }
        let key = format!("{user_id}:{group_id}");
        let ttl = self.config.load().user_group_rate_cache_ttl();

        {
            let cache = self.user_rate_cache.lock().await;
            if let Some((rate, stored_at)) = cache.get(&key) {
                if stored_at.elapsed() < ttl {
                    self.metrics.user_rate_hit.fetch_add(1, Ordering::Relaxed);
                    return *rate;
                }
            }
        }
        self.metrics.user_rate_miss.fetch_add(1, Ordering::Relaxed);

        let (result, shared) = self
            .user_rate_flight
            .run(key.clone(), || async {
                self.metrics.user_rate_load.fetch_add(1, Ordering::Relaxed);
                self.users
                    .user_group_rate(user_id, group_id)
                    .await
                    .map_err(|err| err.to_string())
            })
            .await;
        if shared {
            self.metrics.user_rate_shared.fetch_add(1, Ordering::Relaxed);
        }

        match result {
            Ok(rate) => {
                let rate = rate.unwrap_or(group_default);
                let mut cache = self.user_rate_cache.lock().await;
                cache.insert(key, (rate, Instant::now()));
                rate
            }
            Err(err) => {
                self.metrics.user_rate_fallback.fetch_add(1, Ordering::Relaxed);
                warn!(user_id, group_id, error = %err, "user group rate load failed");
                group_default
            }
        }
    }
}

fn cmp_last_used(a: Option<OffsetDateTime>, b: Option<OffsetDateTime>) -> std::cmp::Ordering {
    // Null sorts oldest: an account never used goes first.
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64 as StdAtomicI64;

    use async_trait::async_trait;
    use serde_json::json;
    use tollgate_store::cache::CacheResult;
    use tollgate_store::{
        AccountStatus, AccountType, MemoryCache, StoreResult, TenantContext,
    };

    fn test_config() -> Arc<ArcSwap<GatewayConfig>> {
        Arc::new(ArcSwap::from_pointee(GatewayConfig {
            dsn: "sqlite::memory:".to_string(),
            ..Default::default()
        }))
    }

    fn account(id: i64, priority: i32) -> Account {
        Account {
            id,
            name: format!("acc-{id}"),
            platform: Platform::Anthropic,
            account_type: AccountType::OAuth,
            credentials: Default::default(),
            extra: Default::default(),
            priority,
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

    #[derive(Default)]
    struct StubAccounts {
        accounts: std::sync::Mutex<Vec<Account>>,
        list_calls: StdAtomicI64,
    }

    impl StubAccounts {
        fn with(accounts: Vec<Account>) -> Self {
            Self {
                accounts: std::sync::Mutex::new(accounts),
                list_calls: StdAtomicI64::new(0),
            }
        }
    }

    #[async_trait]
    impl AccountStore for StubAccounts {
        async fn list_schedulable_by_group_and_platform(
            &self,
            group_id: i64,
            platform: Platform,
        ) -> StoreResult<Vec<Account>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| {
                    a.is_schedulable() && a.platform == platform && a.group_ids.contains(&group_id)
                })
                .cloned()
                .collect())
        }

        async fn list_schedulable_by_platform(
            &self,
            platform: Platform,
        ) -> StoreResult<Vec<Account>> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .filter(|a| a.is_schedulable() && a.platform == platform)
                .cloned()
                .collect())
        }

        async fn get_by_id(&self, id: i64) -> StoreResult<Option<Account>> {
            Ok(self
                .accounts
                .lock()
                .unwrap()
                .iter()
                .find(|a| a.id == id)
                .cloned())
        }

        async fn update_last_used(&self, _: i64, _: OffsetDateTime) -> StoreResult<()> {
            Ok(())
        }

        async fn update_schedulable(&self, id: i64, schedulable: bool) -> StoreResult<()> {
            let mut accounts = self.accounts.lock().unwrap();
            if let Some(account) = accounts.iter_mut().find(|a| a.id == id) {
                account.schedulable = schedulable;
            }
            Ok(())
        }

        async fn update_credentials(
            &self,
            _: i64,
            _: &serde_json::Map<String, serde_json::Value>,
        ) -> StoreResult<()> {
            Ok(())
        }

        async fn reset_session_window(
            &self,
            _: i64,
            _: OffsetDateTime,
            _: OffsetDateTime,
        ) -> StoreResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubUsageLogs {
        batch_result: HashMap<i64, f64>,
        batch_err: bool,
        single_result: HashMap<i64, f64>,
        batch_calls: StdAtomicI64,
        single_calls: StdAtomicI64,
    }

    #[async_trait]
    impl UsageLogStore for StubUsageLogs {
        async fn create(&self, _: &tollgate_store::UsageRecord) -> StoreResult<()> {
            Ok(())
        }

        async fn account_window_cost_batch(
            &self,
            account_ids: &[i64],
            _: OffsetDateTime,
        ) -> StoreResult<HashMap<i64, f64>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            if self.batch_err {
                return Err(tollgate_store::StoreError::Other("batch failed".to_string()));
            }
            Ok(account_ids
                .iter()
                .filter_map(|id| self.batch_result.get(id).map(|v| (*id, *v)))
                .collect())
        }

        async fn account_window_cost(&self, account_id: i64, _: OffsetDateTime) -> StoreResult<f64> {
            self.single_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.single_result.get(&account_id).copied().unwrap_or(0.0))
        }
    }

    struct StubUsers {
        rate: Result<Option<f64>, String>,
        calls: StdAtomicI64,
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    #[async_trait]
    impl UserStore for StubUsers {
        async fn resolve_api_key(&self, _: &str) -> StoreResult<Option<TenantContext>> {
            Ok(None)
        }

        async fn deduct_balance(&self, _: i64, _: f64) -> StoreResult<()> {
            Ok(())
        }

        async fn user_group_rate(&self, _: i64, _: i64) -> StoreResult<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.rate
                .clone()
                .map_err(tollgate_store::StoreError::Other)
        }
    }

    fn selector(
        accounts: Arc<StubAccounts>,
        usage_logs: Arc<StubUsageLogs>,
        users: Arc<StubUsers>,
        cache: Arc<MemoryCache>,
    ) -> AccountSelector {
        AccountSelector::new(accounts, usage_logs, users, cache, test_config())
    }

    fn plain_users() -> Arc<StubUsers> {
        Arc::new(StubUsers {
            rate: Ok(None),
            calls: StdAtomicI64::new(0),
            gate: None,
        })
    }

    #[tokio::test]
    async fn sticky_binding_wins_over_less_loaded_account() {
        let mut a = account(1, 1);
        let b = account(2, 2);
        a.last_used_at = Some(OffsetDateTime::now_utc());
        let accounts = Arc::new(StubAccounts::with(vec![a, b]));
        let cache = Arc::new(MemoryCache::new());
        let sel = selector(
            accounts.clone(),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            cache.clone(),
        );
        let scope = RequestScope::default();

        // First call selects by priority and installs the binding.
        let first = sel
            .select_account(&scope, None, Platform::Anthropic, "hash-1", "")
            .await
            .unwrap();
        assert_eq!(first.account.id, 1);
        assert!(!first.sticky);
        assert_eq!(
            cache.get_sticky(Platform::Anthropic, None, "hash-1").await.unwrap(),
            Some(1)
        );

        // Second call follows the binding.
        let second = sel
            .select_account(&scope, None, Platform::Anthropic, "hash-1", "")
            .await
            .unwrap();
        assert_eq!(second.account.id, 1);
        assert!(second.sticky);

        // Once the account is unschedulable the binding is replaced.
        accounts.update_schedulable(1, false).await.unwrap();
        let third = sel
            .select_account(&scope, None, Platform::Anthropic, "hash-1", "")
            .await
            .unwrap();
        assert_eq!(third.account.id, 2);
        assert_eq!(
            cache.get_sticky(Platform::Anthropic, None, "hash-1").await.unwrap(),
            Some(2)
        );
    }

    #[tokio::test]
    async fn model_whitelist_excludes_unsupported_accounts() {
        let mut acc = account(1, 1);
        acc.credentials = json!({"model_mapping": {"claude-3-5-sonnet": "claude-3-5-sonnet"}})
            .as_object()
            .cloned()
            .unwrap();
        let sel = selector(
            Arc::new(StubAccounts::with(vec![acc])),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            Arc::new(MemoryCache::new()),
        );
        let scope = RequestScope::default();

        let err = sel
            .select_account(&scope, None, Platform::Anthropic, "", "claude-3-5-haiku")
            .await
            .unwrap_err();
        assert_eq!(err.status, 503);
        assert!(err.message.contains("claude-3-5-haiku"));

        let ok = sel
            .select_account(&scope, None, Platform::Anthropic, "", "claude-3-5-sonnet")
            .await
            .unwrap();
        assert_eq!(ok.account.id, 1);
    }

    #[tokio::test]
    async fn ranking_prefers_priority_then_load_then_lru() {
        let mut low_priority = account(1, 5);
        low_priority.last_used_at = None;
        let mut busy = account(2, 1);
        busy.last_used_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(2));
        let mut idle = account(3, 1);
        idle.last_used_at = Some(OffsetDateTime::now_utc() - time::Duration::hours(5));
        let cache = Arc::new(MemoryCache::new());
        // Account 2 has one request in flight.
        cache
            .acquire_slot(tollgate_store::SlotScope::Account, 2, 10)
            .await
            .unwrap();

        let sel = selector(
            Arc::new(StubAccounts::with(vec![low_priority, busy, idle])),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            cache,
        );
        let selected = sel
            .select_account(&RequestScope::default(), None, Platform::Anthropic, "", "")
            .await
            .unwrap();
        assert_eq!(selected.account.id, 3);
    }

    #[tokio::test]
    async fn cooldown_excludes_account_until_expiry() {
        let a = account(1, 1);
        let b = account(2, 2);
        let cache = Arc::new(MemoryCache::new());
        cache.set_cooldown(1, Duration::from_millis(60)).await.unwrap();

        let sel = selector(
            Arc::new(StubAccounts::with(vec![a, b])),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            cache,
        );
        let selected = sel
            .select_account(&RequestScope::default(), None, Platform::Anthropic, "", "")
            .await
            .unwrap();
        assert_eq!(selected.account.id, 2);

        tokio::time::sleep(Duration::from_millis(80)).await;
        let selected = sel
            .select_account(&RequestScope::default(), None, Platform::Anthropic, "", "")
            .await
            .unwrap();
        assert_eq!(selected.account.id, 1);
    }

    #[tokio::test]
    async fn window_cost_limit_excludes_hot_accounts() {
        let now = OffsetDateTime::now_utc();
        let mut hot = account(1, 1);
        hot.extra = json!({"window_cost_limit": 10.0}).as_object().cloned().unwrap();
        hot.session_window_start = Some(now - time::Duration::minutes(30));
        hot.session_window_end = Some(now + time::Duration::hours(4));
        let cold = account(2, 2);

        let cache = Arc::new(MemoryCache::new());
        cache
            .set_window_cost(1, 9.5, Duration::from_secs(60))
            .await
            .unwrap();

        let sel = selector(
            Arc::new(StubAccounts::with(vec![hot, cold])),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            cache,
        );
        let selected = sel
            .select_account(&RequestScope::default(), None, Platform::Anthropic, "", "")
            .await
            .unwrap();
        assert_eq!(selected.account.id, 2);
    }

    #[tokio::test]
    async fn window_cost_prefetch_mixes_cache_and_batch_sql() {
        let now = OffsetDateTime::now_utc();
        let mut one = account(1, 1);
        let mut two = account(2, 1);
        let three = account(3, 1);
        for acc in [&mut one, &mut two] {
            acc.extra = json!({"window_cost_limit": 100.0}).as_object().cloned().unwrap();
            acc.session_window_start = Some(now - time::Duration::minutes(30));
            acc.session_window_end = Some(now + time::Duration::hours(4));
        }

        let cache = Arc::new(MemoryCache::new());
        cache.set_window_cost(1, 11.0, Duration::from_secs(60)).await.unwrap();
        let usage_logs = Arc::new(StubUsageLogs {
            batch_result: HashMap::from([(2, 22.0)]),
            ..Default::default()
        });

        let sel = selector(
            Arc::new(StubAccounts::with(Vec::new())),
            usage_logs.clone(),
            plain_users(),
            cache.clone(),
        );
        let costs = sel.prefetch_window_costs(&[one, two, three]).await;
        assert_eq!(costs.get(&1).copied(), Some(11.0));
        assert_eq!(costs.get(&2).copied(), Some(22.0));
        assert!(!costs.contains_key(&3));
        assert_eq!(usage_logs.batch_calls.load(Ordering::SeqCst), 1);
        // The SQL result was written through to the cache.
        let cached = cache.window_cost_batch(&[2]).await.unwrap();
        assert_eq!(cached.get(&2).copied(), Some(22.0));

        let (hit, miss, batch_sql, fallback, errors) = sel.metrics.window_cost_stats();
        assert_eq!((hit, miss, batch_sql, fallback, errors), (1, 1, 1, 0, 0));
    }

    #[tokio::test]
    async fn window_cost_prefetch_all_hit_skips_sql() {
        let now = OffsetDateTime::now_utc();
        let mut one = account(1, 1);
        one.extra = json!({"window_cost_limit": 100.0}).as_object().cloned().unwrap();
        one.session_window_start = Some(now - time::Duration::minutes(30));
        one.session_window_end = Some(now + time::Duration::hours(4));

        let cache = Arc::new(MemoryCache::new());
        cache.set_window_cost(1, 11.0, Duration::from_secs(60)).await.unwrap();
        let usage_logs = Arc::new(StubUsageLogs::default());

        let sel = selector(
            Arc::new(StubAccounts::with(Vec::new())),
            usage_logs.clone(),
            plain_users(),
            cache,
        );
        let costs = sel.prefetch_window_costs(&[one]).await;
        assert_eq!(costs.get(&1).copied(), Some(11.0));
        assert_eq!(usage_logs.batch_calls.load(Ordering::SeqCst), 0);
        assert_eq!(usage_logs.single_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn window_cost_batch_error_falls_back_to_single_queries() {
        let now = OffsetDateTime::now_utc();
        let mut two = account(2, 1);
        two.extra = json!({"window_cost_limit": 100.0}).as_object().cloned().unwrap();
        two.session_window_start = Some(now - time::Duration::minutes(30));
        two.session_window_end = Some(now + time::Duration::hours(4));

        let usage_logs = Arc::new(StubUsageLogs {
            batch_err: true,
            single_result: HashMap::from([(2, 33.0)]),
            ..Default::default()
        });
        let sel = selector(
            Arc::new(StubAccounts::with(Vec::new())),
            usage_logs.clone(),
            plain_users(),
            Arc::new(MemoryCache::new()),
        );
        let costs = sel.prefetch_window_costs(&[two]).await;
        assert_eq!(costs.get(&2).copied(), Some(33.0));
        assert_eq!(usage_logs.batch_calls.load(Ordering::SeqCst), 1);
        assert_eq!(usage_logs.single_calls.load(Ordering::SeqCst), 1);

        let (_, _, _, fallback, errors) = sel.metrics.window_cost_stats();
        assert_eq!((fallback, errors), (1, 1));
    }

    #[tokio::test]
    async fn user_rate_cache_coalesces_concurrent_loads() {
        let gate = Arc::new(tokio::sync::Notify::new());
        let users = Arc::new(StubUsers {
            rate: Ok(Some(1.7)),
            calls: StdAtomicI64::new(0),
            gate: Some(gate.clone()),
        });
        let sel = Arc::new(selector(
            Arc::new(StubAccounts::default()),
            Arc::new(StubUsageLogs::default()),
            users.clone(),
            Arc::new(MemoryCache::new()),
        ));

        let mut handles = Vec::new();
        for _ in 0..12 {
            let sel = sel.clone();
            handles.push(tokio::spawn(async move {
                sel.user_group_rate_multiplier(101, 202, 1.2).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.notify_waiters();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), 1.7);
        }
        assert_eq!(users.calls.load(Ordering::SeqCst), 1);

        // Warm read hits the cache without touching the store again.
        assert_eq!(sel.user_group_rate_multiplier(101, 202, 1.2).await, 1.7);
        assert_eq!(users.calls.load(Ordering::SeqCst), 1);

        let (hit, miss, load, shared, fallback) = sel.metrics.user_rate_stats();
        assert!(hit >= 1);
        assert_eq!(miss, 12);
        assert_eq!(load, 1);
        assert!(shared >= 1);
        assert_eq!(fallback, 0);
    }

    #[tokio::test]
    async fn user_rate_falls_back_on_store_error() {
        let users = Arc::new(StubUsers {
            rate: Err("db down".to_string()),
            calls: StdAtomicI64::new(0),
            gate: None,
        });
        let sel = selector(
            Arc::new(StubAccounts::default()),
            Arc::new(StubUsageLogs::default()),
            users.clone(),
            Arc::new(MemoryCache::new()),
        );
        assert_eq!(sel.user_group_rate_multiplier(101, 202, 1.25).await, 1.25);
        assert_eq!(users.calls.load(Ordering::SeqCst), 1);
        let (_, _, _, _, fallback) = sel.metrics.user_rate_stats();
        assert_eq!(fallback, 1);
    }

    #[tokio::test]
    async fn models_list_caches_and_invalidates_by_dimension() {
        let mut anthropic = account(1, 1);
        anthropic.group_ids = vec![9];
        anthropic.credentials = json!({"model_mapping": {
            "claude-3-5-sonnet": "claude-3-5-sonnet",
            "claude-3-5-haiku": "claude-3-5-haiku",
        }})
        .as_object()
        .cloned()
        .unwrap();
        let accounts = Arc::new(StubAccounts::with(vec![anthropic]));

        let sel = selector(
            accounts.clone(),
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            Arc::new(MemoryCache::new()),
        );

        let models = sel.available_models(Some(9), Some(Platform::Anthropic)).await;
        assert_eq!(models, vec!["claude-3-5-haiku", "claude-3-5-sonnet"]);
        assert_eq!(accounts.list_calls.load(Ordering::SeqCst), 1);

        // Within the TTL the repo is not consulted again.
        let cached = sel.available_models(Some(9), Some(Platform::Anthropic)).await;
        assert_eq!(cached, models);
        assert_eq!(accounts.list_calls.load(Ordering::SeqCst), 1);

        // Mutate the backing data; the cache hides it until invalidated.
        {
            let mut lock = accounts.accounts.lock().unwrap();
            let mut replacement = account(3, 1);
            replacement.group_ids = vec![9];
            replacement.credentials = json!({"model_mapping": {
                "claude-3-7-sonnet": "claude-3-7-sonnet",
            }})
            .as_object()
            .cloned()
            .unwrap();
            *lock = vec![replacement];
        }
        let stale = sel.available_models(Some(9), Some(Platform::Anthropic)).await;
        assert_eq!(stale, models);

        sel.invalidate_available_models(Some(9), Some(Platform::Anthropic)).await;
        let fresh = sel.available_models(Some(9), Some(Platform::Anthropic)).await;
        assert_eq!(fresh, vec!["claude-3-7-sonnet"]);
        assert_eq!(accounts.list_calls.load(Ordering::SeqCst), 2);

        let (hit, miss, store) = sel.metrics.models_list_stats();
        assert_eq!((hit, miss, store), (2, 2, 2));
    }

    #[tokio::test]
    async fn prefetched_sticky_skips_cache_read() {
        struct CountingCache {
            inner: MemoryCache,
            get_calls: StdAtomicI64,
        }

        #[async_trait]
        impl CacheStore for CountingCache {
            async fn acquire_slot(
                &self,
                scope: tollgate_store::SlotScope,
                id: i64,
                max: i64,
            ) -> CacheResult<bool> {
                self.inner.acquire_slot(scope, id, max).await
            }
            async fn release_slot(
                &self,
                scope: tollgate_store::SlotScope,
                id: i64,
            ) -> CacheResult<()> {
                self.inner.release_slot(scope, id).await
            }
            async fn incr_wait(
                &self,
                scope: tollgate_store::SlotScope,
                id: i64,
                max: i64,
            ) -> CacheResult<bool> {
                self.inner.incr_wait(scope, id, max).await
            }
            async fn decr_wait(
                &self,
                scope: tollgate_store::SlotScope,
                id: i64,
            ) -> CacheResult<()> {
                self.inner.decr_wait(scope, id).await
            }
            async fn get_sticky(
                &self,
                platform: Platform,
                group_id: Option<i64>,
                session_hash: &str,
            ) -> CacheResult<Option<i64>> {
                self.get_calls.fetch_add(1, Ordering::SeqCst);
                self.inner.get_sticky(platform, group_id, session_hash).await
            }
            async fn set_sticky(
                &self,
                platform: Platform,
                group_id: Option<i64>,
                session_hash: &str,
                account_id: i64,
                ttl: Duration,
            ) -> CacheResult<()> {
                self.inner
                    .set_sticky(platform, group_id, session_hash, account_id, ttl)
                    .await
            }
            async fn refresh_sticky(
                &self,
                platform: Platform,
                group_id: Option<i64>,
                session_hash: &str,
                ttl: Duration,
            ) -> CacheResult<()> {
                self.inner
                    .refresh_sticky(platform, group_id, session_hash, ttl)
                    .await
            }
            async fn del_sticky(
                &self,
                platform: Platform,
                group_id: Option<i64>,
                session_hash: &str,
            ) -> CacheResult<()> {
                self.inner.del_sticky(platform, group_id, session_hash).await
            }
            async fn account_load_batch(
                &self,
                ids: &[i64],
            ) -> CacheResult<HashMap<i64, tollgate_store::AccountLoad>> {
                self.inner.account_load_batch(ids).await
            }
            async fn window_cost_batch(&self, ids: &[i64]) -> CacheResult<HashMap<i64, f64>> {
                self.inner.window_cost_batch(ids).await
            }
            async fn set_window_cost(&self, id: i64, cost: f64, ttl: Duration) -> CacheResult<()> {
                self.inner.set_window_cost(id, cost, ttl).await
            }
            async fn add_window_cost(&self, id: i64, delta: f64) -> CacheResult<()> {
                self.inner.add_window_cost(id, delta).await
            }
            async fn set_cooldown(&self, id: i64, ttl: Duration) -> CacheResult<()> {
                self.inner.set_cooldown(id, ttl).await
            }
            async fn in_cooldown(&self, id: i64) -> CacheResult<bool> {
                self.inner.in_cooldown(id).await
            }
        }

        let acc = account(88, 1);
        let accounts = Arc::new(StubAccounts::with(vec![acc]));
        let cache = Arc::new(CountingCache {
            inner: MemoryCache::new(),
            get_calls: StdAtomicI64::new(0),
        });
        cache
            .inner
            .set_sticky(Platform::Anthropic, None, "sess-hash", 88, Duration::from_secs(60))
            .await
            .unwrap();

        let sel = AccountSelector::new(
            accounts,
            Arc::new(StubUsageLogs::default()),
            plain_users(),
            cache.clone(),
            test_config(),
        );

        // Without the prefetch the selector reads the binding once.
        let without = sel
            .select_account(
                &RequestScope::default(),
                None,
                Platform::Anthropic,
                "sess-hash",
                "",
            )
            .await
            .unwrap();
        assert_eq!(without.account.id, 88);
        assert_eq!(cache.get_calls.load(Ordering::SeqCst), 1);

        // With a matching prefetch the cache read is skipped.
        let scope = RequestScope {
            prefetched_sticky: Some(PrefetchedSticky {
                account_id: 88,
                group_id: None,
            }),
        };
        let with = sel
            .select_account(&scope, None, Platform::Anthropic, "sess-hash", "")
            .await
            .unwrap();
        assert_eq!(with.account.id, 88);
        assert_eq!(cache.get_calls.load(Ordering::SeqCst), 1);

        // A group mismatch falls back to the cache read.
        let mismatched = RequestScope {
            prefetched_sticky: Some(PrefetchedSticky {
                account_id: 999,
                group_id: Some(77),
            }),
        };
        let fallback = sel
            .select_account(&mismatched, None, Platform::Anthropic, "sess-hash", "")
            .await
            .unwrap();
        assert_eq!(fallback.account.id, 88);
        assert_eq!(cache.get_calls.load(Ordering::SeqCst), 2);
    }
}
