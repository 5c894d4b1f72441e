use std::collections::HashMap;

use async_trait::async_trait;
use sea_orm::sea_query::{Expr, ExprTrait};
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, Database, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, QueryFilter, QuerySelect, Schema,
};
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;

use crate::entities;
use crate::model::{
    Account, AccountStatus, AccountType, ApiKey, BillingType, Group, Platform, Subscription,
    TenantContext, UsageRecord, User,
};
use crate::store::{
    AccountStore, StoreError, StoreResult, SubscriptionStore, UsageLogStore, UserStore,
};

#[derive(Debug, FromQueryResult)]
struct WindowCostRow {
    account_id: i64,
    total_cost: Option<f64>,
}

#[derive(Clone)]
pub struct SeaOrmStore {
    db: DatabaseConnection,
}

impl SeaOrmStore {
    pub async fn connect(dsn: &str) -> StoreResult<Self> {
        let db = Database::connect(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Entity-first schema sync: create any missing tables at bootstrap.
    pub async fn sync(&self) -> StoreResult<()> {
        let backend = self.db.get_database_backend();
        let schema = Schema::new(backend);
        macro_rules! ensure_table {
            ($entity:expr) => {
                let mut stmt = schema.create_table_from_entity($entity);
                stmt.if_not_exists();
                self.db.execute(backend.build(&stmt)).await?;
            };
        }
        ensure_table!(entities::Users);
        ensure_table!(entities::Groups);
        ensure_table!(entities::ApiKeys);
        ensure_table!(entities::Accounts);
        ensure_table!(entities::AccountGroups);
        ensure_table!(entities::Subscriptions);
        ensure_table!(entities::UsageLogs);
        ensure_table!(entities::UserGroupRates);
        Ok(())
    }

    async fn group_memberships(&self, account_ids: &[i64]) -> StoreResult<HashMap<i64, Vec<i64>>> {
        if account_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = entities::AccountGroups::find()
            .filter(entities::account_groups::Column::AccountId.is_in(account_ids.to_vec()))
            .all(&self.db)
            .await?;
        let mut out: HashMap<i64, Vec<i64>> = HashMap::new();
        for row in rows {
            out.entry(row.account_id).or_default().push(row.group_id);
        }
        Ok(out)
    }

    async fn rows_to_accounts(
        &self,
        rows: Vec<entities::accounts::Model>,
    ) -> StoreResult<Vec<Account>> {
        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let mut memberships = self.group_memberships(&ids).await?;
        rows.into_iter()
            .map(|row| {
                let group_ids = memberships.remove(&row.id).unwrap_or_default();
                account_from_row(row, group_ids)
            })
            .collect()
    }
}

fn json_object(value: JsonValue) -> JsonMap<String, JsonValue> {
    match value {
        JsonValue::Object(map) => map,
        _ => JsonMap::new(),
    }
}

fn account_from_row(row: entities::accounts::Model, group_ids: Vec<i64>) -> StoreResult<Account> {
    let platform = Platform::parse(&row.platform)
        .ok_or_else(|| StoreError::Other(format!("unknown platform: {}", row.platform)))?;
    let account_type: AccountType =
        serde_json::from_value(JsonValue::String(row.account_type.clone()))?;
    let status: AccountStatus = serde_json::from_value(JsonValue::String(row.status.clone()))?;
    Ok(Account {
        id: row.id,
        name: row.name,
        platform,
        account_type,
        credentials: json_object(row.credentials),
        extra: json_object(row.extra),
        priority: row.priority,
        concurrency: row.concurrency,
        rate_multiplier: row.rate_multiplier,
        proxy_url: row.proxy_url,
        status,
        schedulable: row.schedulable,
        last_used_at: row.last_used_at,
        session_window_start: row.session_window_start,
        session_window_end: row.session_window_end,
        group_ids,
    })
}

fn group_from_row(row: entities::groups::Model) -> Group {
    let billing_type = match row.billing_type.as_str() {
        "subscription" => BillingType::Subscription,
        _ => BillingType::Balance,
    };
    let image_prices = row
        .image_prices
        .and_then(|value| serde_json::from_value(value).ok());
    Group {
        id: row.id,
        name: row.name,
        rate_multiplier: row.rate_multiplier,
        billing_type,
        image_prices,
    }
}

#[async_trait]
impl AccountStore for SeaOrmStore {
    async fn list_schedulable_by_group_and_platform(
        &self,
        group_id: i64,
        platform: Platform,
    ) -> StoreResult<Vec<Account>> {
        let member_ids: Vec<i64> = entities::AccountGroups::find()
            .filter(entities::account_groups::Column::GroupId.eq(group_id))
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| row.account_id)
            .collect();
        if member_ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = entities::Accounts::find()
            .filter(entities::accounts::Column::Id.is_in(member_ids))
            .filter(entities::accounts::Column::Platform.eq(platform.as_str()))
            .filter(entities::accounts::Column::Status.eq("active"))
            .filter(entities::accounts::Column::Schedulable.eq(true))
            .all(&self.db)
            .await?;
        self.rows_to_accounts(rows).await
    }

    async fn list_schedulable_by_platform(&self, platform: Platform) -> StoreResult<Vec<Account>> {
        let rows = entities::Accounts::find()
            .filter(entities::accounts::Column::Platform.eq(platform.as_str()))
            .filter(entities::accounts::Column::Status.eq("active"))
            .filter(entities::accounts::Column::Schedulable.eq(true))
            .all(&self.db)
            .await?;
        self.rows_to_accounts(rows).await
    }

    async fn get_by_id(&self, id: i64) -> StoreResult<Option<Account>> {
        let Some(row) = entities::Accounts::find_by_id(id).one(&self.db).await? else {
            return Ok(None);
        };
        let memberships = self.group_memberships(&[id]).await?;
        let group_ids = memberships.get(&id).cloned().unwrap_or_default();
        account_from_row(row, group_ids).map(Some)
    }

    async fn update_last_used(&self, id: i64, at: OffsetDateTime) -> StoreResult<()> {
        entities::Accounts::update_many()
            .col_expr(entities::accounts::Column::LastUsedAt, Expr::value(at))
            .col_expr(
                entities::accounts::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_schedulable(&self, id: i64, schedulable: bool) -> StoreResult<()> {
        entities::Accounts::update_many()
            .col_expr(
                entities::accounts::Column::Schedulable,
                Expr::value(schedulable),
            )
            .col_expr(
                entities::accounts::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn update_credentials(
        &self,
        id: i64,
        credentials: &JsonMap<String, JsonValue>,
    ) -> StoreResult<()> {
        let active = entities::accounts::ActiveModel {
            id: ActiveValue::Unchanged(id),
            credentials: ActiveValue::Set(JsonValue::Object(credentials.clone())),
            updated_at: ActiveValue::Set(OffsetDateTime::now_utc()),
            ..Default::default()
        };
        active.update(&self.db).await?;
        Ok(())
    }

    async fn reset_session_window(
        &self,
        id: i64,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> StoreResult<()> {
        entities::Accounts::update_many()
            .col_expr(
                entities::accounts::Column::SessionWindowStart,
                Expr::value(start),
            )
            .col_expr(
                entities::accounts::Column::SessionWindowEnd,
                Expr::value(end),
            )
            .filter(entities::accounts::Column::Id.eq(id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UsageLogStore for SeaOrmStore {
    async fn create(&self, record: &UsageRecord) -> StoreResult<()> {
        let billing_type = match record.billing_type {
            BillingType::Balance => "balance",
            BillingType::Subscription => "subscription",
        };
        let active = entities::usage_logs::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(record.user_id),
            api_key_id: ActiveValue::Set(record.api_key_id),
            account_id: ActiveValue::Set(record.account_id),
            group_id: ActiveValue::Set(record.group_id),
            subscription_id: ActiveValue::Set(record.subscription_id),
            request_id: ActiveValue::Set(record.request_id.clone()),
            model: ActiveValue::Set(record.model.clone()),
            input_tokens: ActiveValue::Set(record.input_tokens),
            output_tokens: ActiveValue::Set(record.output_tokens),
            cache_creation_tokens: ActiveValue::Set(record.cache_creation_tokens),
            cache_read_tokens: ActiveValue::Set(record.cache_read_tokens),
            input_cost: ActiveValue::Set(record.input_cost),
            output_cost: ActiveValue::Set(record.output_cost),
            cache_creation_cost: ActiveValue::Set(record.cache_creation_cost),
            cache_read_cost: ActiveValue::Set(record.cache_read_cost),
            total_cost: ActiveValue::Set(record.total_cost),
            actual_cost: ActiveValue::Set(record.actual_cost),
            rate_multiplier: ActiveValue::Set(record.rate_multiplier),
            billing_type: ActiveValue::Set(billing_type.to_string()),
            stream: ActiveValue::Set(record.stream),
            duration_ms: ActiveValue::Set(record.duration_ms),
            first_token_ms: ActiveValue::Set(record.first_token_ms),
            error: ActiveValue::Set(record.error),
            created_at: ActiveValue::Set(record.created_at),
        };
        active.insert(&self.db).await?;
        Ok(())
    }

    async fn account_window_cost_batch(
        &self,
        account_ids: &[i64],
        since: OffsetDateTime,
    ) -> StoreResult<HashMap<i64, f64>> {
        if account_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows: Vec<WindowCostRow> = entities::UsageLogs::find()
            .select_only()
            .column(entities::usage_logs::Column::AccountId)
            .column_as(entities::usage_logs::Column::TotalCost.sum(), "total_cost")
            .filter(entities::usage_logs::Column::AccountId.is_in(account_ids.to_vec()))
            .filter(entities::usage_logs::Column::CreatedAt.gte(since))
            .group_by(entities::usage_logs::Column::AccountId)
            .into_model::<WindowCostRow>()
            .all(&self.db)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.account_id, row.total_cost.unwrap_or(0.0)))
            .collect())
    }

    async fn account_window_cost(
        &self,
        account_id: i64,
        since: OffsetDateTime,
    ) -> StoreResult<f64> {
        let batch = self.account_window_cost_batch(&[account_id], since).await?;
        Ok(batch.get(&account_id).copied().unwrap_or(0.0))
    }
}

#[async_trait]
impl UserStore for SeaOrmStore {
    async fn resolve_api_key(&self, secret: &str) -> StoreResult<Option<TenantContext>> {
        let Some(key_row) = entities::ApiKeys::find()
            .filter(entities::api_keys::Column::Secret.eq(secret))
            .filter(entities::api_keys::Column::Enabled.eq(true))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };
        let Some(user_row) = entities::Users::find_by_id(key_row.user_id)
            .filter(entities::users::Column::Enabled.eq(true))
            .one(&self.db)
            .await?
        else {
            return Ok(None);
        };

        let group = match key_row.group_id {
            Some(group_id) => entities::Groups::find_by_id(group_id)
                .one(&self.db)
                .await?
                .map(group_from_row),
            None => None,
        };

        let subscription = match (&group, key_row.group_id) {
            (Some(group), Some(group_id)) if group.is_subscription() => {
                let now = OffsetDateTime::now_utc();
                entities::Subscriptions::find()
                    .filter(entities::subscriptions::Column::UserId.eq(user_row.id))
                    .filter(entities::subscriptions::Column::GroupId.eq(group_id))
                    .one(&self.db)
                    .await?
                    .filter(|row| row.expires_at.map(|at| at > now).unwrap_or(true))
                    .map(|row| Subscription {
                        id: row.id,
                        user_id: row.user_id,
                        group_id: row.group_id,
                        used_cost: row.used_cost,
                        quota_cost: row.quota_cost,
                        expires_at: row.expires_at,
                    })
            }
            _ => None,
        };

        Ok(Some(TenantContext {
            api_key: ApiKey {
                id: key_row.id,
                user_id: key_row.user_id,
                name: key_row.name,
                concurrency: key_row.concurrency,
                group_id: key_row.group_id,
                enabled: key_row.enabled,
            },
            user: User {
                id: user_row.id,
                name: user_row.name,
                balance: user_row.balance,
                concurrency: user_row.concurrency,
                enabled: user_row.enabled,
            },
            group,
            subscription,
        }))
    }

    async fn deduct_balance(&self, user_id: i64, amount: f64) -> StoreResult<()> {
        entities::Users::update_many()
            .col_expr(
                entities::users::Column::Balance,
                Expr::col(entities::users::Column::Balance).sub(amount),
            )
            .filter(entities::users::Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn user_group_rate(&self, user_id: i64, group_id: i64) -> StoreResult<Option<f64>> {
        let row = entities::UserGroupRates::find()
            .filter(entities::user_group_rates::Column::UserId.eq(user_id))
            .filter(entities::user_group_rates::Column::GroupId.eq(group_id))
            .one(&self.db)
            .await?;
        Ok(row.map(|r| r.rate_multiplier))
    }
}

#[async_trait]
impl SubscriptionStore for SeaOrmStore {
    async fn increment_usage(&self, subscription_id: i64, amount: f64) -> StoreResult<()> {
        entities::Subscriptions::update_many()
            .col_expr(
                entities::subscriptions::Column::UsedCost,
                Expr::col(entities::subscriptions::Column::UsedCost).add(amount),
            )
            .filter(entities::subscriptions::Column::Id.eq(subscription_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }
}
