//! Concurrency admission: per-user and per-account slots with bounded,
//! SSE-friendly waiting.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::warn;

use tollgate_store::{CacheStore, SlotScope};

use crate::wire::StreamWriter;

#[derive(Debug, thiserror::Error)]
pub enum ConcurrencyError {
    /// Slot wait exceeded the allowed duration.
    #[error("concurrency wait timed out")]
    Timeout,
    /// Wait queue is already at capacity.
    #[error("too many pending requests")]
    QueueFull,
    /// Slot state could not be read or written; ceilings must not be
    /// silently bypassed, so this fails the request.
    #[error("concurrency cache unavailable: {0}")]
    Cache(String),
}

impl ConcurrencyError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ConcurrencyError::Timeout)
    }
}

/// Derive the wait-queue bound from a configured concurrency ceiling.
pub fn max_wait_for(concurrency: i32) -> i64 {
    (concurrency as i64 * 2).max(4)
}

/// Releases the slot exactly once: explicitly via [`release`], or from `Drop`
/// on any abandoned path (error, panic, cancellation).
pub struct SlotGuard {
    cache: Arc<dyn CacheStore>,
    scope: SlotScope,
    id: i64,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl SlotGuard {
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(err) = self.cache.release_slot(self.scope, self.id).await {
            warn!(id = self.id, error = %err, "slot release failed");
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = self.cache.clone();
        let scope = self.scope;
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(err) = cache.release_slot(scope, id).await {
                    warn!(id, error = %err, "slot release failed");
                }
            });
        }
    }
}

/// Decrements the wait-queue counter on drop, unconditionally.
pub struct WaitGuard {
    cache: Arc<dyn CacheStore>,
    scope: SlotScope,
    id: i64,
    released: Arc<AtomicBool>,
}

impl std::fmt::Debug for WaitGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitGuard")
            .field("scope", &self.scope)
            .field("id", &self.id)
            .field("released", &self.released)
            .finish()
    }
}

impl Drop for WaitGuard {
    fn drop(&mut self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let cache = self.cache.clone();
        let scope = self.scope;
        let id = self.id;
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = cache.decr_wait(scope, id).await;
            });
        }
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub max_wait: Duration,
    pub retry_interval: Duration,
    pub ping_interval: Duration,
    pub stream: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            max_wait: Duration::from_secs(30),
            retry_interval: Duration::from_millis(100),
            ping_interval: Duration::from_secs(10),
            stream: false,
        }
    }
}

#[derive(Clone)]
pub struct ConcurrencyService {
    cache: Arc<dyn CacheStore>,
}

impl ConcurrencyService {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Join the wait queue for `id`. Cache failures fail open here: the
    /// queue bound is a fast-reject optimization, not a correctness gate.
    pub async fn enter_wait_queue(
        &self,
        scope: SlotScope,
        id: i64,
        max_waiting: i64,
    ) -> Result<WaitGuard, ConcurrencyError> {
        match self.cache.incr_wait(scope, id, max_waiting).await {
            Ok(true) => {}
            Ok(false) => return Err(ConcurrencyError::QueueFull),
            Err(err) => {
                warn!(id, error = %err, "wait counter unavailable, admitting");
            }
        }
        Ok(WaitGuard {
            cache: self.cache.clone(),
            scope,
            id,
            released: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Acquire a slot, waiting with backoff up to `opts.max_wait`. The first
    /// attempt is immediate. In streaming mode a keepalive heartbeat is
    /// written to the client while waiting.
    pub async fn acquire_slot_with_wait(
        &self,
        scope: SlotScope,
        id: i64,
        max_concurrency: i64,
        opts: &WaitOptions,
        writer: &mut StreamWriter,
    ) -> Result<SlotGuard, ConcurrencyError> {
        let started = Instant::now();
        let deadline = started + opts.max_wait;
        let mut backoff = opts.retry_interval;
        let mut next_ping = started + opts.ping_interval;

        loop {
            match self.cache.acquire_slot(scope, id, max_concurrency).await {
                Ok(true) => {
                    return Ok(SlotGuard {
                        cache: self.cache.clone(),
                        scope,
                        id,
                        released: Arc::new(AtomicBool::new(false)),
                    });
                }
                Ok(false) => {}
                // Slot acquisition fails closed.
                Err(err) => return Err(ConcurrencyError::Cache(err.to_string())),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConcurrencyError::Timeout);
            }

            if opts.stream && now >= next_ping {
                writer.ping().await;
                next_ping = now + opts.ping_interval;
            }

            let mut sleep_for = backoff.min(deadline - now);
            if opts.stream {
                sleep_for = sleep_for.min(next_ping.saturating_duration_since(now));
            }
            tokio::time::sleep(sleep_for).await;
            backoff = (backoff * 2).min(opts.ping_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use tollgate_store::cache::{AccountLoad, CacheError, CacheResult};
    use tollgate_store::{MemoryCache, Platform};

    use crate::wire::{ClientResponse, Surface};

    /// Scripted acquire results, in the style of the admission stubs used by
    /// the upstream handler tests.
    struct ScriptedCache {
        acquire_seq: StdMutex<Vec<bool>>,
        acquire_calls: StdMutex<i64>,
        release_calls: StdMutex<i64>,
        acquire_err: Option<String>,
    }

    impl ScriptedCache {
        fn new(seq: Vec<bool>) -> Self {
            Self {
                acquire_seq: StdMutex::new(seq),
                acquire_calls: StdMutex::new(0),
                release_calls: StdMutex::new(0),
                acquire_err: None,
            }
        }

        fn failing(message: &str) -> Self {
            Self {
                acquire_seq: StdMutex::new(Vec::new()),
                acquire_calls: StdMutex::new(0),
                release_calls: StdMutex::new(0),
                acquire_err: Some(message.to_string()),
            }
        }
    }

    #[async_trait]
    impl CacheStore for ScriptedCache {
        async fn acquire_slot(&self, _: SlotScope, _: i64, _: i64) -> CacheResult<bool> {
            if let Some(message) = &self.acquire_err {
                return Err(CacheError(message.clone()));
            }
            *self.acquire_calls.lock().unwrap() += 1;
            let mut seq = self.acquire_seq.lock().unwrap();
            if seq.is_empty() {
                return Ok(false);
            }
            Ok(seq.remove(0))
        }

        async fn release_slot(&self, _: SlotScope, _: i64) -> CacheResult<()> {
            *self.release_calls.lock().unwrap() += 1;
            Ok(())
        }

        async fn incr_wait(&self, _: SlotScope, _: i64, _: i64) -> CacheResult<bool> {
            Ok(true)
        }

        async fn decr_wait(&self, _: SlotScope, _: i64) -> CacheResult<()> {
            Ok(())
        }

        async fn get_sticky(&self, _: Platform, _: Option<i64>, _: &str) -> CacheResult<Option<i64>> {
            Ok(None)
        }

        async fn set_sticky(
            &self,
            _: Platform,
            _: Option<i64>,
            _: &str,
            _: i64,
            _: Duration,
        ) -> CacheResult<()> {
            Ok(())
        }

        async fn refresh_sticky(
            &self,
            _: Platform,
            _: Option<i64>,
            _: &str,
            _: Duration,
        ) -> CacheResult<()> {
            Ok(())
        }

        async fn del_sticky(&self, _: Platform, _: Option<i64>, _: &str) -> CacheResult<()> {
            Ok(())
        }

        async fn account_load_batch(&self, _: &[i64]) -> CacheResult<HashMap<i64, AccountLoad>> {
            Ok(HashMap::new())
        }

        async fn window_cost_batch(&self, _: &[i64]) -> CacheResult<HashMap<i64, f64>> {
            Ok(HashMap::new())
        }

        async fn set_window_cost(&self, _: i64, _: f64, _: Duration) -> CacheResult<()> {
            Ok(())
        }

        async fn add_window_cost(&self, _: i64, _: f64) -> CacheResult<()> {
            Ok(())
        }

        async fn set_cooldown(&self, _: i64, _: Duration) -> CacheResult<()> {
            Ok(())
        }

        async fn in_cooldown(&self, _: i64) -> CacheResult<bool> {
            Ok(false)
        }
    }

    fn opts(max_wait_ms: u64) -> WaitOptions {
        WaitOptions {
            max_wait: Duration::from_millis(max_wait_ms),
            retry_interval: Duration::from_millis(5),
            ping_interval: Duration::from_millis(10),
            stream: false,
        }
    }

    #[tokio::test]
    async fn slot_acquired_after_retry() {
        let cache = Arc::new(ScriptedCache::new(vec![false, true]));
        let service = ConcurrencyService::new(cache.clone());
        let (mut writer, _head) = StreamWriter::new(Surface::Anthropic);

        let guard = service
            .acquire_slot_with_wait(SlotScope::Account, 101, 2, &opts(1000), &mut writer)
            .await
            .unwrap();
        assert!(*cache.acquire_calls.lock().unwrap() >= 2);
        assert!(!writer.stream_started());

        guard.release().await;
        guard.release().await;
        assert_eq!(*cache.release_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn timeout_is_classified() {
        let cache = Arc::new(ScriptedCache::new(vec![false, false, false]));
        let service = ConcurrencyService::new(cache);
        let (mut writer, _head) = StreamWriter::new(Surface::Anthropic);

        let err = service
            .acquire_slot_with_wait(SlotScope::Account, 101, 2, &opts(40), &mut writer)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[tokio::test]
    async fn first_attempt_is_immediate() {
        let cache = Arc::new(ScriptedCache::new(vec![true]));
        let service = ConcurrencyService::new(cache.clone());
        let (mut writer, _head) = StreamWriter::new(Surface::Anthropic);

        let started = std::time::Instant::now();
        let _guard = service
            .acquire_slot_with_wait(SlotScope::User, 301, 1, &opts(1000), &mut writer)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(20));
        assert_eq!(*cache.acquire_calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn streaming_wait_pings_before_timeout() {
        let cache = Arc::new(ScriptedCache::new(vec![false, false, false, false]));
        let service = ConcurrencyService::new(cache);
        let (mut writer, head) = StreamWriter::new(Surface::Anthropic);

        let mut wait_opts = opts(70);
        wait_opts.stream = true;
        let err = service
            .acquire_slot_with_wait(SlotScope::Account, 101, 2, &wait_opts, &mut writer)
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(writer.stream_started());

        writer.finish();
        let ClientResponse::Stream { mut body, .. } = head.await.unwrap() else {
            panic!("expected stream");
        };
        let frame = body.recv().await.unwrap();
        assert!(std::str::from_utf8(&frame).unwrap().contains("ping"));
    }

    #[tokio::test]
    async fn cache_error_fails_closed() {
        let cache = Arc::new(ScriptedCache::failing("redis unavailable"));
        let service = ConcurrencyService::new(cache);
        let (mut writer, _head) = StreamWriter::new(Surface::Anthropic);

        let err = service
            .acquire_slot_with_wait(SlotScope::Account, 1, 1, &opts(200), &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, ConcurrencyError::Cache(_)));
        assert!(err.to_string().contains("redis unavailable"));
    }

    #[tokio::test]
    async fn dropped_guard_releases_slot() {
        let cache = Arc::new(MemoryCache::new());
        let service = ConcurrencyService::new(cache.clone());
        let (mut writer, _head) = StreamWriter::new(Surface::Anthropic);

        {
            let _guard = service
                .acquire_slot_with_wait(SlotScope::Account, 9, 1, &opts(100), &mut writer)
                .await
                .unwrap();
            let load = cache.account_load_batch(&[9]).await.unwrap();
            assert_eq!(load[&9].in_flight, 1);
        }
        // Drop spawns the release; give it a tick.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let load = cache.account_load_batch(&[9]).await.unwrap();
        assert_eq!(load[&9].in_flight, 0);
    }

    #[tokio::test]
    async fn queue_full_rejects_fast() {
        let cache = Arc::new(MemoryCache::new());
        let service = ConcurrencyService::new(cache.clone());

        let _first = service
            .enter_wait_queue(SlotScope::User, 5, 1)
            .await
            .unwrap();
        let err = service.enter_wait_queue(SlotScope::User, 5, 1).await.unwrap_err();
        assert!(matches!(err, ConcurrencyError::QueueFull));
    }
}
