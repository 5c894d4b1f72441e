//! Upstream error classification: map (status, headers, body) onto account
//! health actions and a client-facing error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::Mutex;
use tracing::{info, warn};

use tollgate_store::{Account, AccountStore, CacheStore};
use tollgate_transform::headers::{header_get, Headers};

use crate::error::GatewayError;
use crate::events::{AccountHealthEvent, Event, EventHub, UpstreamErrorEvent};

const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);
const SOFT_FAILURE_WINDOW: Duration = Duration::from_secs(60);
const SOFT_FAILURE_THRESHOLD: usize = 3;
const SOFT_FAILURE_UNSCHEDULABLE: Duration = Duration::from_secs(5 * 60);

const REVOCATION_MARKERS: &[&str] = &[
    "revoked",
    "account_deactivated",
    "organization has been disabled",
    "credential is disabled",
];

#[derive(Debug, Clone, PartialEq)]
pub enum HealthAction {
    None,
    /// Forward the upstream status/body untouched; the account does not
    /// handle this status.
    Passthrough,
    /// OAuth credential rejected; force a refresh on next use.
    RefreshToken,
    /// Rate-limit cooldown; the account self-heals when the TTL lapses.
    Cooldown(Duration),
    /// Temporarily unschedulable with an annotation.
    TempUnschedulable { duration: Duration, reason: String },
    /// Permanent revocation; the account is paused until an operator acts.
    Pause { reason: String },
}

#[derive(Debug, Clone)]
pub struct Classification {
    pub client_error: GatewayError,
    pub action: HealthAction,
}

fn parse_cooldown(headers: &Headers) -> Duration {
    if let Some(value) = header_get(headers, "retry-after") {
        if let Ok(secs) = value.trim().parse::<u64>() {
            return Duration::from_secs(secs.max(1));
        }
    }
    if let Some(value) = header_get(headers, "x-ratelimit-reset") {
        if let Ok(secs) = value.trim().parse::<u64>() {
            // Either a delta in seconds or an absolute unix timestamp.
            let now = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let delta = if secs > now { secs - now } else { secs };
            if delta > 0 {
                return Duration::from_secs(delta);
            }
        }
    }
    DEFAULT_RATE_LIMIT_COOLDOWN
}

fn body_contains_any(body: &str, needles: &[&str]) -> bool {
    let lower = body.to_ascii_lowercase();
    needles.iter().any(|needle| lower.contains(needle))
}

/// Pure classification step; the service below applies the action.
pub fn classify(
    account: &Account,
    status: u16,
    headers: &Headers,
    body: &[u8],
) -> Classification {
    let body_text = String::from_utf8_lossy(body);

    if !account.should_handle_error_code(status) {
        return Classification {
            client_error: GatewayError::upstream(status, "Upstream request failed"),
            action: HealthAction::Passthrough,
        };
    }

    // Account-specific rules run first; they carry operator intent.
    for rule in account.temp_unschedulable_rules() {
        if rule.status != status {
            continue;
        }
        let matched = rule.keywords.is_empty()
            || rule
                .keywords
                .iter()
                .any(|kw| body_contains_any(&body_text, &[kw.as_str()]));
        if matched {
            let reason = rule
                .description
                .unwrap_or_else(|| format!("temp rule on status {status}"));
            return Classification {
                client_error: GatewayError::upstream(502, "Upstream request failed"),
                action: HealthAction::TempUnschedulable {
                    duration: Duration::from_secs(rule.duration_minutes * 60),
                    reason,
                },
            };
        }
    }

    match status {
        401 => Classification {
            client_error: GatewayError::upstream(
                502,
                "Upstream authentication failed, please contact administrator",
            ),
            action: HealthAction::RefreshToken,
        },
        403 => {
            let action = if body_contains_any(&body_text, REVOCATION_MARKERS) {
                HealthAction::Pause {
                    reason: "upstream access revoked".to_string(),
                }
            } else {
                HealthAction::None
            };
            Classification {
                client_error: GatewayError::upstream(
                    502,
                    "Upstream access forbidden, please contact administrator",
                ),
                action,
            }
        }
        429 => Classification {
            client_error: GatewayError::rate_limit(
                "Upstream rate limit exceeded, please retry later",
            ),
            action: HealthAction::Cooldown(parse_cooldown(headers)),
        },
        status if status >= 500 => Classification {
            client_error: GatewayError::upstream(502, "Upstream request failed"),
            action: HealthAction::None,
        },
        _ => Classification {
            client_error: GatewayError::upstream(502, "Upstream request failed"),
            action: HealthAction::None,
        },
    }
}

pub struct ErrorClassifier {
    accounts: Arc<dyn AccountStore>,
    cache: Arc<dyn CacheStore>,
    events: EventHub,
    soft_failures: Mutex<HashMap<i64, Vec<Instant>>>,
}

impl ErrorClassifier {
    pub fn new(accounts: Arc<dyn AccountStore>, cache: Arc<dyn CacheStore>, events: EventHub) -> Self {
        Self {
            accounts,
            cache,
            events,
            soft_failures: Mutex::new(HashMap::new()),
        }
    }

    /// Classify the upstream failure, apply the health action and return the
    /// error to surface to the client. `Passthrough` classifications are
    /// returned unchanged so the caller can forward the upstream body.
    pub async fn handle_upstream_error(
        &self,
        trace_id: &str,
        account: &Account,
        status: u16,
        headers: &Headers,
        body: &[u8],
    ) -> Classification {
        let mut classification = classify(account, status, headers, body);

        // A repeated run of 5xx within a short window takes the account out
        // of rotation even without an explicit rule.
        if status >= 500 && classification.action == HealthAction::None {
            if self.record_soft_failure(account.id).await {
                classification.action = HealthAction::TempUnschedulable {
                    duration: SOFT_FAILURE_UNSCHEDULABLE,
                    reason: format!("{SOFT_FAILURE_THRESHOLD} upstream 5xx in a row"),
                };
            }
        }

        self.apply_action(account, &classification.action).await;
        self.events
            .emit(Event::UpstreamError(UpstreamErrorEvent {
                at: SystemTime::now(),
                trace_id: trace_id.to_string(),
                account_id: account.id,
                platform: account.platform.to_string(),
                status,
                passthrough: classification.action == HealthAction::Passthrough,
                action: format!("{:?}", classification.action),
                message: classification.client_error.message.clone(),
            }))
            .await;
        classification
    }

    async fn record_soft_failure(&self, account_id: i64) -> bool {
        let now = Instant::now();
        let mut map = self.soft_failures.lock().await;
        let entries = map.entry(account_id).or_default();
        entries.retain(|at| now.duration_since(*at) < SOFT_FAILURE_WINDOW);
        entries.push(now);
        if entries.len() >= SOFT_FAILURE_THRESHOLD {
            entries.clear();
            return true;
        }
        false
    }

    async fn apply_action(&self, account: &Account, action: &HealthAction) {
        match action {
            HealthAction::None | HealthAction::Passthrough => {}
            HealthAction::RefreshToken => {
                let mut credentials = account.credentials.clone();
                credentials.insert("force_refresh".to_string(), serde_json::Value::Bool(true));
                if let Err(err) = self.accounts.update_credentials(account.id, &credentials).await {
                    warn!(account_id = account.id, error = %err, "marking token for refresh failed");
                }
            }
            HealthAction::Cooldown(duration) => {
                info!(
                    account_id = account.id,
                    cooldown_secs = duration.as_secs(),
                    "account entering rate-limit cooldown"
                );
                if let Err(err) = self.cache.set_cooldown(account.id, *duration).await {
                    warn!(account_id = account.id, error = %err, "cooldown write failed");
                }
            }
            HealthAction::TempUnschedulable { duration, reason } => {
                info!(
                    account_id = account.id,
                    duration_secs = duration.as_secs(),
                    reason = %reason,
                    "account temporarily unschedulable"
                );
                if let Err(err) = self.cache.set_cooldown(account.id, *duration).await {
                    warn!(account_id = account.id, error = %err, "cooldown write failed");
                }
                self.events
                    .emit(Event::AccountHealth(AccountHealthEvent {
                        at: SystemTime::now(),
                        account_id: account.id,
                        schedulable: false,
                        reason: reason.clone(),
                    }))
                    .await;
            }
            HealthAction::Pause { reason } => {
                warn!(account_id = account.id, reason = %reason, "pausing account");
                if let Err(err) = self.accounts.update_schedulable(account.id, false).await {
                    warn!(account_id = account.id, error = %err, "pause write failed");
                }
                self.events
                    .emit(Event::AccountHealth(AccountHealthEvent {
                        at: SystemTime::now(),
                        account_id: account.id,
                        schedulable: false,
                        reason: reason.clone(),
                    }))
                    .await;
            }
        }
    }
}
