//! The request-path pipeline: admission, selection, transformation,
//! forwarding, streaming and metering for one inbound call.

use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tracing::{info, warn};

use tollgate_store::{Account, Platform, SlotScope, TenantContext};
use tollgate_transform::codex::{self, PassthroughOutcome};
use tollgate_transform::headers::{header_get, header_set, whitelist_inbound, Headers};
use tollgate_transform::{antigravity, claude, mapping};

use crate::admission::{max_wait_for, ConcurrencyError, WaitOptions};
use crate::billing::RecordUsageInput;
use crate::classify::HealthAction;
use crate::error::GatewayError;
use crate::selector::{PrefetchedSticky, RequestScope};
use crate::sse::{tee_sse, ModelRewrite};
use crate::state::AppState;
use crate::token::{AccessCredential, AuthScheme};
use crate::upstream::{SendOptions, UpstreamBody, UpstreamRequest};
use crate::usage::{parse_usage_body, Usage};
use crate::wire::{sse_response_headers, StreamWriter, Surface};

const ANTHROPIC_MESSAGES_URL: &str = "https://api.anthropic.com/v1/messages";
const CHATGPT_CODEX_URL: &str = "https://chatgpt.com/backend-api/codex/responses";
const OPENAI_PLATFORM_URL: &str = "https://api.openai.com/v1/responses";
const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const ANTIGRAVITY_BASE_URL: &str = "https://cloudcode-pa.googleapis.com";

const MAX_FORWARD_ATTEMPTS: u32 = 3;
const TRANSPORT_FAILURE_COOLDOWN: std::time::Duration = std::time::Duration::from_secs(10);

/// One inbound call, already authenticated and decoded by the handler.
pub struct InboundRequest {
    pub surface: Surface,
    pub platform: Platform,
    pub trace_id: String,
    pub tenant: TenantContext,
    pub headers: Headers,
    pub body: JsonMap<String, JsonValue>,
    pub user_agent: Option<String>,
    pub session_hash: String,
    pub requested_model: String,
    pub is_stream: bool,
    pub is_messages_path: bool,
    /// Gemini-style call suffix (`generateContent` or
    /// `streamGenerateContent`), present on that surface only.
    pub gemini_method: Option<String>,
}

enum UpstreamPlan {
    Forward {
        request: UpstreamRequest,
        opts: SendOptions,
        rewrite: Option<ModelRewrite>,
    },
    /// Answered locally without upstream contact.
    Local { status: u16, body: JsonValue },
}

/// Drive one request to completion, writing the response through `writer`.
pub async fn run(state: Arc<AppState>, req: InboundRequest, mut writer: StreamWriter) {
    let started = Instant::now();
    let config = state.config.load_full();
    let tenant = &req.tenant;
    let group_id = tenant.api_key.group_id;

    // Fast reject when the user's wait queue is already full.
    let user_wait = match state
        .concurrency
        .enter_wait_queue(
            SlotScope::User,
            tenant.user.id,
            max_wait_for(tenant.user.concurrency),
        )
        .await
    {
        Ok(guard) => guard,
        Err(_) => {
            writer
                .fail(&GatewayError::rate_limit(
                    "Too many pending requests, please retry later",
                ))
                .await;
            return;
        }
    };

    // Per-user slot with bounded wait.
    let wait_opts = WaitOptions {
        max_wait: config.fallback_wait_timeout(),
        ping_interval: config.ping_interval(),
        stream: req.is_stream,
        ..Default::default()
    };
    let user_slot = match state
        .concurrency
        .acquire_slot_with_wait(
            SlotScope::User,
            tenant.user.id,
            tenant.user.concurrency.max(1) as i64,
            &wait_opts,
            &mut writer,
        )
        .await
    {
        Ok(guard) => guard,
        Err(err) => {
            writer.fail(&concurrency_error(&err, "user")).await;
            return;
        }
    };

    // Billing eligibility is re-checked after the wait; the balance may have
    // drained while this request was queued.
    if let Err(err) = state.billing_gate.check_eligibility(tenant).await {
        writer.fail(&err).await;
        user_slot.release().await;
        return;
    }

    // Warm the sticky hint once so selection can skip its cache read.
    let mut scope = RequestScope::default();
    if !req.session_hash.is_empty() {
        if let Ok(Some(account_id)) = state
            .cache
            .get_sticky(req.platform, group_id, &req.session_hash)
            .await
        {
            scope.prefetched_sticky = Some(PrefetchedSticky {
                account_id,
                group_id,
            });
        }
    }

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;

        let selection = match state
            .selector
            .select_account(
                &scope,
                group_id,
                req.platform,
                &req.session_hash,
                &req.requested_model,
            )
            .await
        {
            Ok(selection) => selection,
            Err(err) => {
                writer.fail(&err).await;
                break;
            }
        };
        let account = selection.account.clone();
        info!(
            trace_id = %req.trace_id,
            account_id = account.id,
            account = %account.name,
            sticky = selection.sticky,
            attempt,
            "account selected"
        );

        // Per-account slot; sticky sessions get their own wait window so an
        // affine session is not bounced off a briefly busy account.
        let (account_max_waiting, account_wait_timeout) = if selection.sticky {
            (
                config.sticky_session_max_waiting,
                config.sticky_session_wait_timeout(),
            )
        } else {
            (config.fallback_max_waiting, config.fallback_wait_timeout())
        };
        let account_wait = match state
            .concurrency
            .enter_wait_queue(SlotScope::Account, account.id, account_max_waiting)
            .await
        {
            Ok(guard) => guard,
            Err(_) => {
                writer
                    .fail(&GatewayError::rate_limit(
                        "Concurrency limit exceeded for account, please retry later",
                    ))
                    .await;
                break;
            }
        };
        let account_slot = match state
            .concurrency
            .acquire_slot_with_wait(
                SlotScope::Account,
                account.id,
                account.concurrency.max(1) as i64,
                &WaitOptions {
                    max_wait: account_wait_timeout,
                    ping_interval: config.ping_interval(),
                    stream: req.is_stream,
                    ..Default::default()
                },
                &mut writer,
            )
            .await
        {
            Ok(guard) => guard,
            Err(err) => {
                drop(account_wait);
                writer.fail(&concurrency_error(&err, "account")).await;
                break;
            }
        };

        let credential = match state.tokens.access_credential(&account).await {
            Ok(credential) => credential,
            Err(err) => {
                writer.fail(&err).await;
                account_slot.release().await;
                drop(account_wait);
                break;
            }
        };

        let plan = match build_plan(&state, &req, &account, &credential, &config).await {
            Ok(plan) => plan,
            Err(err) => {
                writer.fail(&err).await;
                account_slot.release().await;
                drop(account_wait);
                break;
            }
        };

        match plan {
            UpstreamPlan::Local { status, body } => {
                let headers = vec![("content-type".to_string(), "application/json".to_string())];
                writer.respond_json(
                    status,
                    headers,
                    Bytes::from(serde_json::to_vec(&body).unwrap_or_default()),
                );
                account_slot.release().await;
                drop(account_wait);
                break;
            }
            UpstreamPlan::Forward {
                request,
                opts,
                rewrite,
            } => {
                let upstream_is_stream = request.is_stream;
                let response = match state.upstream.send(request, opts).await {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(
                            trace_id = %req.trace_id,
                            account_id = account.id,
                            error = %err,
                            "upstream transport failure"
                        );
                        account_slot.release().await;
                        drop(account_wait);
                        if err.kind.is_retryable() && attempt < MAX_FORWARD_ATTEMPTS {
                            // Short cooldown so the next selection skips the
                            // account that just failed to connect.
                            let _ = state
                                .cache
                                .set_cooldown(account.id, TRANSPORT_FAILURE_COOLDOWN)
                                .await;
                            if selection.sticky {
                                let _ = state
                                    .cache
                                    .del_sticky(req.platform, group_id, &req.session_hash)
                                    .await;
                                scope.prefetched_sticky = None;
                            }
                            continue;
                        }
                        writer
                            .fail(&GatewayError::upstream(502, "Upstream request failed"))
                            .await;
                        break;
                    }
                };

                finish_upstream_response(
                    &state,
                    &req,
                    &account,
                    rewrite,
                    upstream_is_stream,
                    response,
                    &mut writer,
                    started,
                )
                .await;
                account_slot.release().await;
                drop(account_wait);
                break;
            }
        }
    }

    user_slot.release().await;
    drop(user_wait);
}

fn concurrency_error(err: &ConcurrencyError, slot: &str) -> GatewayError {
    match err {
        ConcurrencyError::Timeout => GatewayError::rate_limit_timeout(format!(
            "Concurrency limit exceeded for {slot}, please retry later"
        )),
        ConcurrencyError::QueueFull => {
            GatewayError::rate_limit("Too many pending requests, please retry later")
        }
        ConcurrencyError::Cache(message) => {
            GatewayError::service_unavailable(format!("concurrency state unavailable: {message}"))
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn finish_upstream_response(
    state: &Arc<AppState>,
    req: &InboundRequest,
    account: &Account,
    rewrite: Option<ModelRewrite>,
    upstream_is_stream: bool,
    response: crate::upstream::UpstreamResponse,
    writer: &mut StreamWriter,
    started: Instant,
) {
    let upstream_request_id = response.header("x-request-id").map(str::to_string);

    if response.status >= 400 {
        let body = match response.body {
            UpstreamBody::Bytes(bytes) => bytes,
            UpstreamBody::Stream(mut rx) => {
                let mut collected = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    collected.extend_from_slice(&chunk);
                }
                Bytes::from(collected)
            }
        };
        let classification = state
            .classifier
            .handle_upstream_error(&req.trace_id, account, response.status, &response.headers, &body)
            .await;

        if classification.action == HealthAction::Passthrough && !writer.stream_started() {
            let mut headers = forwardable_headers(&response.headers);
            header_set(&mut headers, "content-type", "application/json");
            writer.respond_json(response.status, headers, body);
        } else {
            writer.fail(&classification.client_error).await;
        }

        record_usage(
            state,
            req,
            account,
            Usage::default(),
            started,
            None,
            upstream_request_id,
            true,
        )
        .await;
        return;
    }

    if upstream_is_stream {
        let UpstreamBody::Stream(rx) = response.body else {
            writer
                .fail(&GatewayError::upstream(502, "Upstream request failed"))
                .await;
            return;
        };

        // The Codex endpoint always streams; when the caller asked for a
        // buffered response the stream is collapsed into its terminal
        // `response.completed` payload.
        if !req.is_stream && !writer.stream_started() {
            let (final_response, usage) = collapse_openai_stream(rx, req.surface).await;
            match final_response {
                Some(mut value) => {
                    if let Some(rewrite) = &rewrite {
                        if value.get("model").and_then(|m| m.as_str())
                            == Some(rewrite.upstream.as_str())
                        {
                            value["model"] = JsonValue::String(rewrite.requested.clone());
                        }
                    }
                    let mut headers =
                        vec![("content-type".to_string(), "application/json".to_string())];
                    if let Some(id) = &upstream_request_id {
                        header_set(&mut headers, "x-request-id", id.clone());
                    }
                    writer.respond_json(
                        200,
                        headers,
                        Bytes::from(serde_json::to_vec(&value).unwrap_or_default()),
                    );
                }
                None => {
                    writer
                        .fail(&GatewayError::upstream(502, "Upstream request failed"))
                        .await;
                }
            }
            record_usage(
                state,
                req,
                account,
                usage,
                started,
                None,
                upstream_request_id,
                false,
            )
            .await;
            return;
        }

        if !writer.stream_started() {
            let mut headers = sse_response_headers();
            if let Some(id) = &upstream_request_id {
                header_set(&mut headers, "x-request-id", id.clone());
            }
            for (name, value) in &response.headers {
                if name.to_ascii_lowercase().starts_with("x-codex-") {
                    headers.push((name.clone(), value.clone()));
                }
            }
            writer.start_stream(200, headers);
        }

        let outcome = tee_sse(rx, writer, rewrite.as_ref(), started).await;
        writer.finish();

        if !outcome.saw_done && req.surface.done_sentinel().is_some() {
            info!(
                trace_id = %req.trace_id,
                upstream_request_id = upstream_request_id.as_deref().unwrap_or(""),
                "upstream stream ended without [DONE]"
            );
        }
        if outcome.client_gone {
            warn!(
                trace_id = %req.trace_id,
                "client disconnected mid-stream, usage metered from drained upstream"
            );
        }

        record_usage(
            state,
            req,
            account,
            outcome.usage,
            started,
            outcome.first_token_ms,
            upstream_request_id,
            false,
        )
        .await;
        return;
    }

    // Buffered response: parse usage, restore the caller's model name and
    // forward body plus non-hop-by-hop headers.
    let UpstreamBody::Bytes(body) = response.body else {
        writer
            .fail(&GatewayError::upstream(502, "Upstream request failed"))
            .await;
        return;
    };
    let mut usage = Usage::default();
    let body = match serde_json::from_slice::<JsonValue>(&body) {
        Ok(mut value) => {
            usage = parse_usage_body(req.surface, &value);
            if let Some(rewrite) = &rewrite {
                if value.get("model").and_then(|m| m.as_str()) == Some(rewrite.upstream.as_str()) {
                    value["model"] = JsonValue::String(rewrite.requested.clone());
                }
                serde_json::to_vec(&value).map(Bytes::from).unwrap_or(body)
            } else {
                body
            }
        }
        Err(_) => body,
    };

    let mut headers = forwardable_headers(&response.headers);
    header_set(&mut headers, "content-type", "application/json");
    writer.respond_json(response.status, headers, body);

    record_usage(
        state,
        req,
        account,
        usage,
        started,
        None,
        upstream_request_id,
        false,
    )
    .await;
}

#[allow(clippy::too_many_arguments)]
async fn record_usage(
    state: &Arc<AppState>,
    req: &InboundRequest,
    account: &Account,
    usage: Usage,
    started: Instant,
    first_token_ms: Option<i64>,
    request_id: Option<String>,
    error: bool,
) {
    let config = state.config.load();
    let group_default = req
        .tenant
        .group
        .as_ref()
        .map(|g| g.rate_multiplier)
        .unwrap_or(config.default_rate_multiplier);
    let multiplier = match req.tenant.api_key.group_id {
        Some(group_id) => {
            state
                .selector
                .user_group_rate_multiplier(req.tenant.user.id, group_id, group_default)
                .await
        }
        None => group_default,
    };
    let multiplier = account.rate_multiplier.unwrap_or(multiplier);

    state
        .metering
        .record_usage(RecordUsageInput {
            tenant: &req.tenant,
            account,
            model: req.requested_model.clone(),
            usage,
            rate_multiplier: multiplier,
            stream: req.is_stream,
            duration_ms: Some(started.elapsed().as_millis() as i64),
            first_token_ms,
            request_id,
            error,
        })
        .await;
}

async fn build_plan(
    state: &Arc<AppState>,
    req: &InboundRequest,
    account: &Account,
    credential: &AccessCredential,
    config: &tollgate_common::GatewayConfig,
) -> Result<UpstreamPlan, GatewayError> {
    match req.platform {
        Platform::Anthropic => build_anthropic_plan(req, account, credential),
        Platform::OpenAI => build_openai_plan(state, req, account, credential, config).await,
        Platform::Gemini | Platform::Antigravity => build_gemini_plan(req, account, credential),
    }
}

fn rewrite_for(requested: &str, effective: &str) -> Option<ModelRewrite> {
    (requested != effective).then(|| ModelRewrite {
        upstream: effective.to_string(),
        requested: requested.to_string(),
    })
}

fn base_headers(req: &InboundRequest, allow_timeout_headers: bool) -> Headers {
    let (headers, timeout_style) = whitelist_inbound(&req.headers, allow_timeout_headers);
    if req.is_stream && !timeout_style.is_empty() && !allow_timeout_headers {
        warn!(
            headers = ?timeout_style,
            "dropping timeout-style headers on streaming request"
        );
    }
    headers
}

fn apply_auth(headers: &mut Headers, credential: &AccessCredential, platform: Platform) {
    match credential.scheme {
        AuthScheme::Bearer => {
            header_set(headers, "authorization", format!("Bearer {}", credential.token));
        }
        AuthScheme::ApiKey => match platform {
            Platform::Anthropic => header_set(headers, "x-api-key", credential.token.clone()),
            Platform::Gemini | Platform::Antigravity => {
                header_set(headers, "x-goog-api-key", credential.token.clone())
            }
            Platform::OpenAI => {
                header_set(headers, "authorization", format!("Bearer {}", credential.token))
            }
        },
    }
}

fn send_options(account: &Account) -> SendOptions {
    SendOptions {
        proxy: account.proxy_url.clone(),
        tls_fingerprint: account.tls_fingerprint(),
        account_id: account.id,
    }
}

fn build_anthropic_plan(
    req: &InboundRequest,
    account: &Account,
    credential: &AccessCredential,
) -> Result<UpstreamPlan, GatewayError> {
    let mut body = req.body.clone();

    let effective = mapping::effective_model(account, &req.requested_model)
        .ok_or_else(|| GatewayError::client("model not supported by account"))?;
    if effective != req.requested_model {
        body.insert("model".to_string(), JsonValue::String(effective.clone()));
    }

    if account.intercept_warmup() && claude::is_warmup_probe(&req.body) {
        return Ok(UpstreamPlan::Local {
            status: 200,
            body: claude::warmup_response(&req.requested_model),
        });
    }

    let mut headers = base_headers(req, false);
    let spoof = claude::is_claude_code_request(
        req.user_agent.as_deref(),
        req.is_messages_path,
        &req.headers,
        Some(&req.body),
    );
    if spoof {
        claude::apply_claude_code_spoof(&mut headers);
    } else {
        // Minimal edits: keep the client's shape, supply required versioning.
        if header_get(&headers, "anthropic-version").is_none() {
            header_set(
                &mut headers,
                "anthropic-version",
                tollgate_transform::headers::ANTHROPIC_VERSION,
            );
        }
    }
    if credential.scheme == AuthScheme::Bearer {
        header_set(
            &mut headers,
            "anthropic-beta",
            tollgate_transform::headers::ANTHROPIC_BETA,
        );
    }
    apply_auth(&mut headers, credential, Platform::Anthropic);
    header_set(&mut headers, "content-type", "application/json");
    header_set(
        &mut headers,
        "accept",
        if req.is_stream { "text/event-stream" } else { "application/json" },
    );

    let url = match account.base_url() {
        Some(base) => format!("{}/v1/messages", base.trim_end_matches('/')),
        None => ANTHROPIC_MESSAGES_URL.to_string(),
    };

    Ok(UpstreamPlan::Forward {
        request: UpstreamRequest {
            url,
            headers,
            body: Bytes::from(serde_json::to_vec(&JsonValue::Object(body)).unwrap_or_default()),
            is_stream: req.is_stream,
        },
        opts: send_options(account),
        rewrite: rewrite_for(&req.requested_model, &effective),
    })
}

async fn build_openai_plan(
    state: &Arc<AppState>,
    req: &InboundRequest,
    account: &Account,
    credential: &AccessCredential,
    config: &tollgate_common::GatewayConfig,
) -> Result<UpstreamPlan, GatewayError> {
    let mut body = req.body.clone();
    let user_agent = req.user_agent.as_deref();
    let is_codex_client = config.force_codex_cli || codex::is_codex_user_agent(user_agent);

    if account.codex_cli_only() && !is_codex_client {
        return Ok(UpstreamPlan::Local {
            status: 403,
            body: serde_json::json!({
                "error": {
                    "type": "invalid_request_error",
                    "message": "This account only serves Codex CLI clients",
                },
            }),
        });
    }

    let account_mapped = account
        .mapped_model(&req.requested_model)
        .ok_or_else(|| GatewayError::client("model not supported by account"))?;
    if account_mapped != req.requested_model {
        body.insert("model".to_string(), JsonValue::String(account_mapped.clone()));
    }

    let oauth = credential.scheme == AuthScheme::Bearer;
    let effective_model;
    if account.openai_passthrough() {
        let ua_for_reject = if config.force_codex_cli { Some(codex::CODEX_CLI_PINNED_UA) } else { user_agent };
        match codex::apply_passthrough(&mut body, ua_for_reject) {
            PassthroughOutcome::Forward => {}
            PassthroughOutcome::MissingInstructions => {
                warn!(
                    trace_id = %req.trace_id,
                    request_user_agent = user_agent.unwrap_or(""),
                    reject_reason = "instructions_missing",
                    "rejecting codex request without instructions before upstream"
                );
                return Ok(UpstreamPlan::Local {
                    status: 403,
                    body: serde_json::json!({
                        "error": {
                            "type": "invalid_request_error",
                            "message": "This request requires a non-empty instructions field",
                        },
                    }),
                });
            }
        }
        effective_model = body
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(&account_mapped)
            .to_string();
    } else if oauth {
        // Legacy transform: shape the body like an official Codex client.
        let normalized = codex::normalize_codex_model(&account_mapped);
        let instructions = state.prompts.instructions_for(&normalized).await;
        let result = codex::apply_codex_transform(&mut body, instructions.as_deref());
        effective_model = result.normalized_model;
    } else {
        effective_model = account_mapped.clone();
        body.insert("store".to_string(), JsonValue::Bool(false));
    }

    let mut headers = base_headers(req, config.openai_passthrough_allow_timeout_headers);
    apply_auth(&mut headers, credential, Platform::OpenAI);
    header_set(&mut headers, "content-type", "application/json");
    header_set(&mut headers, "originator", codex::originator_for(user_agent));
    if !is_codex_client {
        header_set(&mut headers, "user-agent", codex::CODEX_CLI_PINNED_UA);
    }

    let is_stream = body
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(req.is_stream);

    let url = if oauth {
        header_set(&mut headers, "host", "chatgpt.com");
        if let Some(id) = &credential.chatgpt_account_id {
            header_set(&mut headers, "chatgpt-account-id", id.clone());
        }
        header_set(
            &mut headers,
            "accept",
            if is_stream { "text/event-stream" } else { "application/json" },
        );
        CHATGPT_CODEX_URL.to_string()
    } else {
        match account.base_url() {
            Some(base) => format!("{}/v1/responses", base.trim_end_matches('/')),
            None => OPENAI_PLATFORM_URL.to_string(),
        }
    };

    Ok(UpstreamPlan::Forward {
        request: UpstreamRequest {
            url,
            headers,
            body: Bytes::from(serde_json::to_vec(&JsonValue::Object(body)).unwrap_or_default()),
            is_stream,
        },
        opts: send_options(account),
        rewrite: rewrite_for(&req.requested_model, &effective_model),
    })
}

fn build_gemini_plan(
    req: &InboundRequest,
    account: &Account,
    credential: &AccessCredential,
) -> Result<UpstreamPlan, GatewayError> {
    if req.platform == Platform::Antigravity
        && !antigravity::has_supported_prefix(&req.requested_model)
    {
        return Err(GatewayError::client(format!(
            "model not supported: {}",
            req.requested_model
        )));
    }

    let effective = mapping::effective_model(account, &req.requested_model).ok_or_else(|| {
        GatewayError::client(format!("model not supported: {}", req.requested_model))
    })?;

    let mut headers = base_headers(req, false);
    apply_auth(&mut headers, credential, req.platform);
    header_set(&mut headers, "content-type", "application/json");

    let method = req
        .gemini_method
        .clone()
        .unwrap_or_else(|| "generateContent".to_string());
    let base = match account.base_url() {
        Some(base) => base.trim_end_matches('/').to_string(),
        None if req.platform == Platform::Antigravity => ANTIGRAVITY_BASE_URL.to_string(),
        None => GEMINI_BASE_URL.to_string(),
    };
    let mut url = format!("{base}/v1beta/models/{effective}:{method}");
    if req.is_stream {
        url.push_str("?alt=sse");
    }

    Ok(UpstreamPlan::Forward {
        request: UpstreamRequest {
            url,
            headers,
            body: Bytes::from(
                serde_json::to_vec(&JsonValue::Object(req.body.clone())).unwrap_or_default(),
            ),
            is_stream: req.is_stream,
        },
        opts: send_options(account),
        rewrite: rewrite_for(&req.requested_model, &effective),
    })
}

/// Drain an SSE stream into its terminal response object plus usage. Used
/// when the upstream insists on streaming but the caller asked for JSON.
async fn collapse_openai_stream(
    mut rx: tokio::sync::mpsc::Receiver<Bytes>,
    surface: Surface,
) -> (Option<JsonValue>, Usage) {
    let mut usage = Usage::default();
    let mut final_response: Option<JsonValue> = None;
    let mut buffer: Vec<u8> = Vec::new();

    let handle_line = |line: &str, usage: &mut Usage, out: &mut Option<JsonValue>| {
        let Some(payload) = crate::sse::data_payload(line.trim_end_matches('\r')) else {
            return;
        };
        if payload.is_empty() || payload == "[DONE]" {
            return;
        }
        let Ok(event) = serde_json::from_str::<JsonValue>(payload) else {
            return;
        };
        crate::usage::merge_usage_event(surface, &event, usage);
        if event.get("type").and_then(|t| t.as_str()) == Some("response.completed") {
            if let Some(response) = event.get("response") {
                *out = Some(response.clone());
            }
        }
    };

    while let Some(chunk) = rx.recv().await {
        buffer.extend_from_slice(&chunk);
        while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = buffer.drain(..=pos).collect();
            if let Ok(text) = std::str::from_utf8(&line[..line.len() - 1]) {
                handle_line(text, &mut usage, &mut final_response);
            }
        }
    }
    if let Ok(text) = std::str::from_utf8(&buffer) {
        if !text.is_empty() {
            handle_line(text, &mut usage, &mut final_response);
        }
    }

    (final_response, usage)
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
    "content-encoding",
];

fn forwardable_headers(upstream: &Headers) -> Headers {
    upstream
        .iter()
        .filter(|(name, _)| {
            let key = name.to_ascii_lowercase();
            !HOP_BY_HOP.contains(&key.as_str())
        })
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        let upstream = vec![
            ("Transfer-Encoding".to_string(), "chunked".to_string()),
            ("x-request-id".to_string(), "rid".to_string()),
            ("Content-Encoding".to_string(), "gzip".to_string()),
        ];
        let out = forwardable_headers(&upstream);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, "x-request-id");
    }

    #[test]
    fn rewrite_only_when_models_differ() {
        assert!(rewrite_for("a", "a").is_none());
        let rewrite = rewrite_for("alias", "real").unwrap();
        assert_eq!(rewrite.upstream, "real");
        assert_eq!(rewrite.requested, "alias");
    }
}
