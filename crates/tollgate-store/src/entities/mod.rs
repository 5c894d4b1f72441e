pub mod account_groups;
pub mod accounts;
pub mod api_keys;
pub mod groups;
pub mod subscriptions;
pub mod usage_logs;
pub mod user_group_rates;
pub mod users;

pub use account_groups::Entity as AccountGroups;
pub use accounts::Entity as Accounts;
pub use api_keys::Entity as ApiKeys;
pub use groups::Entity as Groups;
pub use subscriptions::Entity as Subscriptions;
pub use usage_logs::Entity as UsageLogs;
pub use user_group_rates::Entity as UserGroupRates;
pub use users::Entity as Users;
