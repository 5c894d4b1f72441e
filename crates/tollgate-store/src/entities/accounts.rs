use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "accounts")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub name: String,
    pub platform: String,
    pub account_type: String,
    pub credentials: Json,
    pub extra: Json,
    pub priority: i32,
    pub concurrency: i32,
    pub rate_multiplier: Option<f64>,
    pub proxy_url: Option<String>,
    pub status: String,
    pub schedulable: bool,
    pub last_used_at: Option<OffsetDateTime>,
    pub session_window_start: Option<OffsetDateTime>,
    pub session_window_end: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::account_groups::Entity")]
    AccountGroups,
}

impl Related<super::account_groups::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::AccountGroups.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
