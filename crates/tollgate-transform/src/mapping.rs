//! Platform-aware model support and rewriting, combining account-level
//! mappings with the Antigravity defaults.

use tollgate_store::{Account, Platform};

use crate::antigravity;

/// Effective upstream model for this account, or `None` when the account
/// cannot serve the requested model.
pub fn effective_model(account: &Account, requested: &str) -> Option<String> {
    match account.platform {
        Platform::Antigravity => {
            antigravity::mapped_model(&account.model_mapping(), requested)
        }
        _ => account.mapped_model(requested),
    }
}

pub fn account_supports_model(account: &Account, requested: &str) -> bool {
    if requested.is_empty() {
        return true;
    }
    effective_model(account, requested).is_some()
}
