//! Data model, collaborator interfaces and storage backends for the gateway.
//!
//! The request path consumes the traits in [`store`] and [`cache`]; it never
//! names SeaORM types directly. Hot-path reads go through the cache layer.

pub mod cache;
pub mod entities;
pub mod model;
pub mod seaorm;
pub mod store;

pub use cache::{
    AccountLoad, BillingCache, CacheError, CacheResult, CacheStore, MemoryCache, SlotScope,
};
pub use model::{
    Account, AccountStatus, AccountType, ApiKey, BillingType, Group, ImagePriceConfig, Platform,
    Subscription, TempUnschedulableRule, TenantContext, UsageRecord, User,
};
pub use seaorm::SeaOrmStore;
pub use store::{
    AccountStore, StoreError, StoreResult, SubscriptionStore, UsageLogStore, UserStore,
};
