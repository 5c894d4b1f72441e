use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::Platform;

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
#[error("cache error: {0}")]
pub struct CacheError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotScope {
    Account,
    User,
}

impl SlotScope {
    fn prefix(&self) -> &'static str {
        match self {
            SlotScope::Account => "acct",
            SlotScope::User => "user",
        }
    }
}

/// In-flight and queued request counts for one account.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountLoad {
    pub in_flight: i64,
    pub waiting: i64,
}

/// Session/concurrency cache: atomic counters and TTL'd keys backing sticky
/// bindings, slots, wait queues, window costs and rate-limit cooldowns.
///
/// Counter mutations must each be a single atomic operation; the selector and
/// admission layers rely on that for their ceilings.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Increment the slot counter unless it is at `max`. Returns whether the
    /// slot was acquired.
    async fn acquire_slot(&self, scope: SlotScope, id: i64, max: i64) -> CacheResult<bool>;

    async fn release_slot(&self, scope: SlotScope, id: i64) -> CacheResult<()>;

    /// Increment the wait-queue counter unless it is at `max`.
    async fn incr_wait(&self, scope: SlotScope, id: i64, max: i64) -> CacheResult<bool>;

    async fn decr_wait(&self, scope: SlotScope, id: i64) -> CacheResult<()>;

    async fn get_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
    ) -> CacheResult<Option<i64>>;

    async fn set_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
        account_id: i64,
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn refresh_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
        ttl: Duration,
    ) -> CacheResult<()>;

    async fn del_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
    ) -> CacheResult<()>;

    /// One bulk read of current load for a candidate set.
    async fn account_load_batch(&self, ids: &[i64]) -> CacheResult<HashMap<i64, AccountLoad>>;

    /// One bulk read of cached rolling window costs. Missing ids are simply
    /// absent from the result.
    async fn window_cost_batch(&self, ids: &[i64]) -> CacheResult<HashMap<i64, f64>>;

    async fn set_window_cost(&self, id: i64, cost: f64, ttl: Duration) -> CacheResult<()>;

    async fn add_window_cost(&self, id: i64, delta: f64) -> CacheResult<()>;

    async fn set_cooldown(&self, account_id: i64, ttl: Duration) -> CacheResult<()>;

    async fn in_cooldown(&self, account_id: i64) -> CacheResult<bool>;
}

/// Cache-through mirror of billing state so hot admission checks avoid the DB.
#[async_trait]
pub trait BillingCache: Send + Sync {
    async fn cached_balance(&self, user_id: i64) -> CacheResult<Option<f64>>;
    async fn prime_balance(&self, user_id: i64, balance: f64, ttl: Duration) -> CacheResult<()>;
    async fn deduct_balance(&self, user_id: i64, amount: f64) -> CacheResult<()>;

    async fn cached_subscription_usage(&self, subscription_id: i64) -> CacheResult<Option<f64>>;
    async fn prime_subscription_usage(
        &self,
        subscription_id: i64,
        used: f64,
        ttl: Duration,
    ) -> CacheResult<()>;
    async fn add_subscription_usage(&self, subscription_id: i64, amount: f64) -> CacheResult<()>;
}

#[derive(Debug, Clone, Copy)]
struct NumEntry {
    value: f64,
    expires_at: Option<Instant>,
}

impl NumEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| at > now).unwrap_or(true)
    }
}

#[derive(Default)]
struct MemoryCacheInner {
    counters: HashMap<String, i64>,
    numbers: HashMap<String, NumEntry>,
    stickies: HashMap<String, (i64, Instant)>,
}

/// Single-process [`CacheStore`] + [`BillingCache`]. All state lives behind
/// one mutex; every trait call is one critical section, which gives the
/// atomicity the counters need.
#[derive(Default)]
pub struct MemoryCache {
    inner: Mutex<MemoryCacheInner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn sticky_key(platform: Platform, group_id: Option<i64>, session_hash: &str) -> String {
        format!("{}:{}:{}", platform, group_id.unwrap_or(0), session_hash)
    }

    fn slot_key(scope: SlotScope, id: i64) -> String {
        format!("slot:{}:{}", scope.prefix(), id)
    }

    fn wait_key(scope: SlotScope, id: i64) -> String {
        format!("wait:{}:{}", scope.prefix(), id)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn acquire_slot(&self, scope: SlotScope, id: i64, max: i64) -> CacheResult<bool> {
        let mut inner = self.inner.lock().await;
        let count = inner.counters.entry(Self::slot_key(scope, id)).or_insert(0);
        if *count >= max {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn release_slot(&self, scope: SlotScope, id: i64) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.counters.get_mut(&Self::slot_key(scope, id)) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    async fn incr_wait(&self, scope: SlotScope, id: i64, max: i64) -> CacheResult<bool> {
        let mut inner = self.inner.lock().await;
        let count = inner.counters.entry(Self::wait_key(scope, id)).or_insert(0);
        if *count >= max {
            return Ok(false);
        }
        *count += 1;
        Ok(true)
    }

    async fn decr_wait(&self, scope: SlotScope, id: i64) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.counters.get_mut(&Self::wait_key(scope, id)) {
            *count = (*count - 1).max(0);
        }
        Ok(())
    }

    async fn get_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
    ) -> CacheResult<Option<i64>> {
        let key = Self::sticky_key(platform, group_id, session_hash);
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        match inner.stickies.get(&key) {
            Some((account_id, expires_at)) if *expires_at > now => Ok(Some(*account_id)),
            Some(_) => {
                inner.stickies.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
        account_id: i64,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = Self::sticky_key(platform, group_id, session_hash);
        let mut inner = self.inner.lock().await;
        inner.stickies.insert(key, (account_id, Instant::now() + ttl));
        Ok(())
    }

    async fn refresh_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
        ttl: Duration,
    ) -> CacheResult<()> {
        let key = Self::sticky_key(platform, group_id, session_hash);
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.stickies.get_mut(&key) {
            entry.1 = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn del_sticky(
        &self,
        platform: Platform,
        group_id: Option<i64>,
        session_hash: &str,
    ) -> CacheResult<()> {
        let key = Self::sticky_key(platform, group_id, session_hash);
        self.inner.lock().await.stickies.remove(&key);
        Ok(())
    }

    async fn account_load_batch(&self, ids: &[i64]) -> CacheResult<HashMap<i64, AccountLoad>> {
        let inner = self.inner.lock().await;
        let mut out = HashMap::with_capacity(ids.len());
        for id in ids {
            let in_flight = inner
                .counters
                .get(&Self::slot_key(SlotScope::Account, *id))
                .copied()
                .unwrap_or(0);
            let waiting = inner
                .counters
                .get(&Self::wait_key(SlotScope::Account, *id))
                .copied()
                .unwrap_or(0);
            out.insert(*id, AccountLoad { in_flight, waiting });
        }
        Ok(out)
    }

    async fn window_cost_batch(&self, ids: &[i64]) -> CacheResult<HashMap<i64, f64>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        let mut out = HashMap::new();
        for id in ids {
            let key = format!("wcost:{id}");
            if let Some(entry) = inner.numbers.get(&key) {
                if entry.live(now) {
                    out.insert(*id, entry.value);
                }
            }
        }
        Ok(out)
    }

    async fn set_window_cost(&self, id: i64, cost: f64, ttl: Duration) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner.numbers.insert(
            format!("wcost:{id}"),
            NumEntry {
                value: cost,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn add_window_cost(&self, id: i64, delta: f64) -> CacheResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.numbers.get_mut(&format!("wcost:{id}")) {
            if entry.live(now) {
                entry.value += delta;
            }
        }
        Ok(())
    }

    async fn set_cooldown(&self, account_id: i64, ttl: Duration) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner.numbers.insert(
            format!("cooldown:{account_id}"),
            NumEntry {
                value: 1.0,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn in_cooldown(&self, account_id: i64) -> CacheResult<bool> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let key = format!("cooldown:{account_id}");
        match inner.numbers.get(&key) {
            Some(entry) if entry.live(now) => Ok(true),
            Some(_) => {
                inner.numbers.remove(&key);
                Ok(false)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl BillingCache for MemoryCache {
    async fn cached_balance(&self, user_id: i64) -> CacheResult<Option<f64>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .numbers
            .get(&format!("balance:{user_id}"))
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value))
    }

    async fn prime_balance(&self, user_id: i64, balance: f64, ttl: Duration) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner.numbers.insert(
            format!("balance:{user_id}"),
            NumEntry {
                value: balance,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn deduct_balance(&self, user_id: i64, amount: f64) -> CacheResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.numbers.get_mut(&format!("balance:{user_id}")) {
            if entry.live(now) {
                entry.value -= amount;
            }
        }
        Ok(())
    }

    async fn cached_subscription_usage(&self, subscription_id: i64) -> CacheResult<Option<f64>> {
        let now = Instant::now();
        let inner = self.inner.lock().await;
        Ok(inner
            .numbers
            .get(&format!("subusage:{subscription_id}"))
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value))
    }

    async fn prime_subscription_usage(
        &self,
        subscription_id: i64,
        used: f64,
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut inner = self.inner.lock().await;
        inner.numbers.insert(
            format!("subusage:{subscription_id}"),
            NumEntry {
                value: used,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn add_subscription_usage(&self, subscription_id: i64, amount: f64) -> CacheResult<()> {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        if let Some(entry) = inner.numbers.get_mut(&format!("subusage:{subscription_id}")) {
            if entry.live(now) {
                entry.value += amount;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn slot_counter_enforces_ceiling_and_release_floors_at_zero() {
        let cache = MemoryCache::new();
        assert!(cache.acquire_slot(SlotScope::Account, 1, 2).await.unwrap());
        assert!(cache.acquire_slot(SlotScope::Account, 1, 2).await.unwrap());
        assert!(!cache.acquire_slot(SlotScope::Account, 1, 2).await.unwrap());

        cache.release_slot(SlotScope::Account, 1).await.unwrap();
        assert!(cache.acquire_slot(SlotScope::Account, 1, 2).await.unwrap());

        // Double release must not go negative.
        cache.release_slot(SlotScope::Account, 1).await.unwrap();
        cache.release_slot(SlotScope::Account, 1).await.unwrap();
        cache.release_slot(SlotScope::Account, 1).await.unwrap();
        let load = cache.account_load_batch(&[1]).await.unwrap();
        assert_eq!(load[&1].in_flight, 0);
    }

    #[tokio::test]
    async fn wait_queue_boundary_admits_at_max_rejects_above() {
        let cache = MemoryCache::new();
        assert!(cache.incr_wait(SlotScope::User, 7, 2).await.unwrap());
        assert!(cache.incr_wait(SlotScope::User, 7, 2).await.unwrap());
        assert!(!cache.incr_wait(SlotScope::User, 7, 2).await.unwrap());
        cache.decr_wait(SlotScope::User, 7).await.unwrap();
        assert!(cache.incr_wait(SlotScope::User, 7, 2).await.unwrap());
    }

    #[tokio::test]
    async fn sticky_binding_expires_and_refreshes() {
        let cache = MemoryCache::new();
        cache
            .set_sticky(Platform::Anthropic, None, "hash", 42, Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(
            cache.get_sticky(Platform::Anthropic, None, "hash").await.unwrap(),
            Some(42)
        );

        cache
            .refresh_sticky(Platform::Anthropic, None, "hash", Duration::from_millis(200))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(
            cache.get_sticky(Platform::Anthropic, None, "hash").await.unwrap(),
            Some(42)
        );

        cache.del_sticky(Platform::Anthropic, None, "hash").await.unwrap();
        assert_eq!(
            cache.get_sticky(Platform::Anthropic, None, "hash").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn sticky_bindings_are_scoped_by_platform_and_group() {
        let cache = MemoryCache::new();
        cache
            .set_sticky(Platform::OpenAI, Some(9), "h", 1, Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(cache.get_sticky(Platform::OpenAI, Some(9), "h").await.unwrap(), Some(1));
        assert_eq!(cache.get_sticky(Platform::OpenAI, None, "h").await.unwrap(), None);
        assert_eq!(cache.get_sticky(Platform::Anthropic, Some(9), "h").await.unwrap(), None);
    }

    #[tokio::test]
    async fn window_cost_roundtrip_and_expiry() {
        let cache = MemoryCache::new();
        cache.set_window_cost(5, 11.0, Duration::from_millis(40)).await.unwrap();
        cache.add_window_cost(5, 2.5).await.unwrap();
        let costs = cache.window_cost_batch(&[5, 6]).await.unwrap();
        assert_eq!(costs.get(&5).copied(), Some(13.5));
        assert!(!costs.contains_key(&6));

        tokio::time::sleep(Duration::from_millis(60)).await;
        let costs = cache.window_cost_batch(&[5]).await.unwrap();
        assert!(costs.is_empty());
    }

    #[tokio::test]
    async fn cooldown_expires() {
        let cache = MemoryCache::new();
        cache.set_cooldown(3, Duration::from_millis(30)).await.unwrap();
        assert!(cache.in_cooldown(3).await.unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!cache.in_cooldown(3).await.unwrap());
    }

    #[tokio::test]
    async fn billing_cache_mirrors_deductions() {
        let cache = MemoryCache::new();
        cache.prime_balance(1, 10.0, Duration::from_secs(60)).await.unwrap();
        cache.deduct_balance(1, 2.5).await.unwrap();
        assert_eq!(cache.cached_balance(1).await.unwrap(), Some(7.5));

        cache
            .prime_subscription_usage(4, 1.0, Duration::from_secs(60))
            .await
            .unwrap();
        cache.add_subscription_usage(4, 0.5).await.unwrap();
        assert_eq!(cache.cached_subscription_usage(4).await.unwrap(), Some(1.5));
    }
}
