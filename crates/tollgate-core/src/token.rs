//! Upstream credential resolution with lazy OAuth refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use tollgate_store::{Account, AccountStore, AccountType, Platform};

use crate::error::GatewayError;
use crate::singleflight::SingleFlight;

/// Refresh this close to expiry, so in-flight requests never carry a token
/// that dies mid-stream.
const EXPIRY_SKEW_SECS: i64 = 300;

const ANTHROPIC_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
const ANTHROPIC_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";
const OPENAI_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
const OPENAI_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    Bearer,
    ApiKey,
}

#[derive(Debug, Clone)]
pub struct AccessCredential {
    pub token: String,
    pub scheme: AuthScheme,
    pub chatgpt_account_id: Option<String>,
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Resolve the live credential for an account, refreshing first when the
    /// access token is expired, near expiry, or flagged for refresh.
    async fn access_credential(&self, account: &Account) -> Result<AccessCredential, GatewayError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    id_token: Option<String>,
}

pub struct OAuthTokenProvider {
    client: wreq::Client,
    accounts: Arc<dyn AccountStore>,
    flights: SingleFlight<i64, Result<AccessCredential, String>>,
}

impl OAuthTokenProvider {
    pub fn new(accounts: Arc<dyn AccountStore>) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            accounts,
            flights: SingleFlight::new(),
        })
    }

    fn needs_refresh(account: &Account) -> bool {
        if account
            .credentials
            .get("force_refresh")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return true;
        }
        match account.token_expires_at() {
            Some(expires_at) => {
                let now = time::OffsetDateTime::now_utc().unix_timestamp();
                expires_at - EXPIRY_SKEW_SECS <= now
            }
            None => false,
        }
    }

    async fn refresh(&self, account: &Account) -> Result<AccessCredential, String> {
        let refresh_token = account
            .refresh_token()
            .ok_or_else(|| "refresh_token missing from credentials".to_string())?;

        let form: Vec<(&str, String)> = match account.platform {
            Platform::Anthropic => vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
                ("client_id", ANTHROPIC_CLIENT_ID.to_string()),
            ],
            Platform::OpenAI => vec![
                ("grant_type", "refresh_token".to_string()),
                ("refresh_token", refresh_token.to_string()),
                ("client_id", OPENAI_CLIENT_ID.to_string()),
            ],
            Platform::Gemini | Platform::Antigravity => {
                let client_id = account
                    .credentials
                    .get("client_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let client_secret = account
                    .credentials
                    .get("client_secret")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                vec![
                    ("grant_type", "refresh_token".to_string()),
                    ("refresh_token", refresh_token.to_string()),
                    ("client_id", client_id),
                    ("client_secret", client_secret),
                ]
            }
        };

        let url = match account.platform {
            Platform::Anthropic => ANTHROPIC_TOKEN_URL,
            Platform::OpenAI => OPENAI_TOKEN_URL,
            Platform::Gemini | Platform::Antigravity => GOOGLE_TOKEN_URL,
        };

        let response = self
            .client
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(|err| format!("token refresh request failed: {err}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("token refresh returned status {}", status.as_u16()));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|err| format!("token refresh decode failed: {err}"))?;

        let chatgpt_account_id = tokens
            .id_token
            .as_deref()
            .and_then(chatgpt_account_id_from_id_token)
            .or_else(|| account.chatgpt_account_id().map(str::to_string));

        let mut credentials = account.credentials.clone();
        credentials.insert(
            "access_token".to_string(),
            JsonValue::String(tokens.access_token.clone()),
        );
        if let Some(refresh) = &tokens.refresh_token {
            credentials.insert(
                "refresh_token".to_string(),
                JsonValue::String(refresh.clone()),
            );
        }
        if let Some(expires_in) = tokens.expires_in {
            let expires_at = time::OffsetDateTime::now_utc().unix_timestamp() + expires_in;
            credentials.insert("expires_at".to_string(), JsonValue::from(expires_at));
        }
        if let Some(id) = &chatgpt_account_id {
            credentials.insert(
                "chatgpt_account_id".to_string(),
                JsonValue::String(id.clone()),
            );
        }
        credentials.remove("force_refresh");

        if let Err(err) = self.accounts.update_credentials(account.id, &credentials).await {
            warn!(account_id = account.id, error = %err, "persisting refreshed token failed");
        }
        info!(account_id = account.id, platform = %account.platform, "access token refreshed");

        Ok(AccessCredential {
            token: tokens.access_token,
            scheme: AuthScheme::Bearer,
            chatgpt_account_id,
        })
    }
}

/// `chatgpt_account_id` lives in the auth claim of the OpenAI id-token.
fn chatgpt_account_id_from_id_token(id_token: &str) -> Option<String> {
    let payload_b64 = id_token.split('.').nth(1)?;
    let payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .ok()?;
    let claims: JsonValue = serde_json::from_slice(&payload).ok()?;
    claims
        .get("https://api.openai.com/auth")
        .and_then(|auth| auth.get("chatgpt_account_id"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[async_trait]
impl TokenProvider for OAuthTokenProvider {
    async fn access_credential(&self, account: &Account) -> Result<AccessCredential, GatewayError> {
        match account.account_type {
            AccountType::ApiKey | AccountType::Upstream => {
                let key = account
                    .api_key()
                    .ok_or_else(|| GatewayError::internal("api_key not found in credentials"))?;
                Ok(AccessCredential {
                    token: key.to_string(),
                    scheme: AuthScheme::ApiKey,
                    chatgpt_account_id: None,
                })
            }
            AccountType::OAuth | AccountType::SetupToken => {
                if !Self::needs_refresh(account) {
                    let token = account.access_token().ok_or_else(|| {
                        GatewayError::internal("access_token not found in credentials")
                    })?;
                    return Ok(AccessCredential {
                        token: token.to_string(),
                        scheme: AuthScheme::Bearer,
                        chatgpt_account_id: account.chatgpt_account_id().map(str::to_string),
                    });
                }

                let account_clone = account.clone();
                let (result, _shared) = self
                    .flights
                    .run(account.id, || async move { self.refresh(&account_clone).await })
                    .await;
                result.map_err(|message| {
                    GatewayError::upstream(
                        502,
                        format!("upstream credential refresh failed: {message}"),
                    )
                })
            }
        }
    }
}
