use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;

use crate::model::{Account, Platform, TenantContext, UsageRecord};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

/// Account persistence as seen by the request path. The core reads accounts
/// on every request and writes only health toggles, `last_used_at` and
/// refreshed credentials.
#[async_trait]
pub trait AccountStore: Send + Sync {
    async fn list_schedulable_by_group_and_platform(
        &self,
        group_id: i64,
        platform: Platform,
    ) -> StoreResult<Vec<Account>>;

    async fn list_schedulable_by_platform(&self, platform: Platform) -> StoreResult<Vec<Account>>;

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<Account>>;

    async fn update_last_used(&self, id: i64, at: OffsetDateTime) -> StoreResult<()>;

    async fn update_schedulable(&self, id: i64, schedulable: bool) -> StoreResult<()>;

    /// Persist a refreshed credential bag (token refresh path).
    async fn update_credentials(
        &self,
        id: i64,
        credentials: &JsonMap<String, JsonValue>,
    ) -> StoreResult<()>;

    async fn reset_session_window(
        &self,
        id: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<()>;
}

#[async_trait]
pub trait UsageLogStore: Send + Sync {
    async fn create(&self, record: &UsageRecord) -> StoreResult<()>;

    /// Rolling window cost per account since `since`, one query for the
    /// whole candidate set.
    async fn account_window_cost_batch(
        &self,
        account_ids: &[i64],
        since: OffsetDateTime,
    ) -> StoreResult<HashMap<i64, f64>>;

    /// Single-account fallback used only when the batch read fails.
    async fn account_window_cost(&self, account_id: i64, since: OffsetDateTime)
        -> StoreResult<f64>;
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Resolve a local api key into the denormalized tenant view, or `None`
    /// when the key is unknown or disabled.
    async fn resolve_api_key(&self, secret: &str) -> StoreResult<Option<TenantContext>>;

    async fn deduct_balance(&self, user_id: i64, amount: f64) -> StoreResult<()>;

    /// Per-(user, group) rate override, when the tenant has one.
    async fn user_group_rate(&self, user_id: i64, group_id: i64) -> StoreResult<Option<f64>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn increment_usage(&self, subscription_id: i64, amount: f64) -> StoreResult<()>;
}
