//! Thin per-upstream HTTP entry points. Each handler authenticates the
//! caller, decodes the body, then spawns the pipeline and awaits the
//! response head so admission heartbeats can stream before the upstream
//! call resolves.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Map as JsonMap, Value as JsonValue};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};
use uuid::Uuid;

use tollgate_store::Platform;
use tollgate_transform::headers::Headers;
use tollgate_transform::session;

use crate::error::GatewayError;
use crate::pipeline::{self, InboundRequest};
use crate::state::AppState;
use crate::wire::{ClientResponse, StreamWriter, Surface};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/anthropic/v1/messages", post(anthropic_messages))
        .route("/openai/v1/responses", post(openai_responses))
        .route("/gemini/v1beta/models/{model_call}", post(gemini_generate))
        .route(
            "/antigravity/v1beta/models/{model_call}",
            post(antigravity_generate),
        )
        .with_state(state)
}

fn headers_to_vec(headers: &HeaderMap) -> Headers {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("authorization")?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .map(str::to_string)
}

fn error_response(surface: Surface, err: &GatewayError) -> Response {
    let mut resp = Response::new(Body::from(err.body_for(surface)));
    *resp.status_mut() = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    resp.headers_mut().insert(
        "content-type",
        HeaderValue::from_static("application/json"),
    );
    resp
}

fn parse_body(surface: Surface, body: &Bytes) -> Result<JsonMap<String, JsonValue>, GatewayError> {
    if body.is_empty() {
        return Err(GatewayError::client("Request body is empty"));
    }
    match serde_json::from_slice::<JsonValue>(body) {
        Ok(JsonValue::Object(map)) => Ok(map),
        _ => Err(GatewayError::client("Failed to parse request body")),
    }
    .map_err(|mut err| {
        // Keep the provider-native type strings per surface.
        if surface == Surface::Gemini {
            err.err_type = "INVALID_ARGUMENT".to_string();
        }
        err
    })
}

async fn dispatch(state: Arc<AppState>, req: InboundRequest) -> Response {
    let surface = req.surface;
    let trace_id = req.trace_id.clone();
    let deadline = state.config.load().request_deadline();
    let (writer, head) = StreamWriter::new(surface);

    tokio::spawn(async move {
        if tokio::time::timeout(deadline, pipeline::run(state, req, writer))
            .await
            .is_err()
        {
            warn!(trace_id = %trace_id, "request deadline exceeded, pipeline cancelled");
        }
    });

    match head.await {
        Ok(ClientResponse::Json {
            status,
            headers,
            body,
        }) => {
            let mut resp = Response::new(Body::from(body));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            apply_headers(resp.headers_mut(), &headers);
            resp
        }
        Ok(ClientResponse::Stream {
            status,
            headers,
            body,
        }) => {
            let stream = ReceiverStream::new(body).map(Ok::<Bytes, Infallible>);
            let mut resp = Response::new(Body::from_stream(stream));
            *resp.status_mut() =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            apply_headers(resp.headers_mut(), &headers);
            resp
        }
        Err(_) => error_response(surface, &GatewayError::internal("request aborted")),
    }
}

fn apply_headers(target: &mut HeaderMap, headers: &Headers) {
    for (name, value) in headers {
        let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(value) else {
            continue;
        };
        target.insert(name, value);
    }
}

async fn authenticate(
    state: &Arc<AppState>,
    surface: Surface,
    headers: &HeaderMap,
) -> Result<tollgate_store::TenantContext, Response> {
    let Some(token) = bearer_token(headers) else {
        return Err(error_response(surface, &GatewayError::auth("Invalid API key")));
    };
    match state.authenticate(&token).await {
        Some(tenant) => Ok(tenant),
        None => Err(error_response(surface, &GatewayError::auth("Invalid API key"))),
    }
}

async fn anthropic_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let surface = Surface::Anthropic;
    let tenant = match authenticate(&state, surface, &headers).await {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };
    let body_map = match parse_body(surface, &body) {
        Ok(map) => map,
        Err(err) => return error_response(surface, &err),
    };

    let requested_model = body_map
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if requested_model.is_empty() {
        return error_response(surface, &GatewayError::client("model is required"));
    }
    let is_stream = body_map
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let session_hash = session::anthropic_session_hash(&body_map);
    let headers_vec = headers_to_vec(&headers);
    let trace_id = Uuid::new_v4().to_string();
    info!(
        trace_id = %trace_id,
        model = %requested_model,
        is_stream,
        user_id = tenant.user.id,
        "anthropic messages request"
    );

    let req = InboundRequest {
        surface,
        platform: Platform::Anthropic,
        trace_id,
        tenant,
        user_agent: header_value(&headers, "user-agent"),
        headers: headers_vec,
        body: body_map,
        session_hash,
        requested_model,
        is_stream,
        is_messages_path: true,
        gemini_method: None,
    };
    dispatch(state, req).await
}

async fn openai_responses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let surface = Surface::OpenAI;
    let tenant = match authenticate(&state, surface, &headers).await {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };
    let body_map = match parse_body(surface, &body) {
        Ok(map) => map,
        Err(err) => return error_response(surface, &err),
    };

    let requested_model = body_map
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    let is_stream = body_map
        .get("stream")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let headers_vec = headers_to_vec(&headers);
    let session_hash = session::openai_session_hash(&headers_vec);
    let trace_id = Uuid::new_v4().to_string();
    info!(
        trace_id = %trace_id,
        model = %requested_model,
        is_stream,
        user_id = tenant.user.id,
        "openai responses request"
    );

    let req = InboundRequest {
        surface,
        platform: Platform::OpenAI,
        trace_id,
        tenant,
        user_agent: header_value(&headers, "user-agent"),
        headers: headers_vec,
        body: body_map,
        session_hash,
        requested_model,
        is_stream,
        is_messages_path: false,
        gemini_method: None,
    };
    dispatch(state, req).await
}

async fn gemini_generate(
    state: State<Arc<AppState>>,
    path: Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gemini_like(state, path, headers, body, Platform::Gemini).await
}

async fn antigravity_generate(
    state: State<Arc<AppState>>,
    path: Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    gemini_like(state, path, headers, body, Platform::Antigravity).await
}

async fn gemini_like(
    State(state): State<Arc<AppState>>,
    Path(model_call): Path<String>,
    headers: HeaderMap,
    body: Bytes,
    platform: Platform,
) -> Response {
    let surface = Surface::Gemini;
    let tenant = match authenticate(&state, surface, &headers).await {
        Ok(tenant) => tenant,
        Err(resp) => return resp,
    };

    let Some((model, method)) = model_call.split_once(':') else {
        return error_response(
            surface,
            &GatewayError::client("expected models/{model}:{generateContent|streamGenerateContent}"),
        );
    };
    if !matches!(method, "generateContent" | "streamGenerateContent") {
        return error_response(surface, &GatewayError::client("unsupported method"));
    }
    let body_map = match parse_body(surface, &body) {
        Ok(map) => map,
        Err(err) => return error_response(surface, &err),
    };

    let is_stream = method == "streamGenerateContent";
    let trace_id = Uuid::new_v4().to_string();
    info!(
        trace_id = %trace_id,
        model = %model,
        platform = %platform,
        is_stream,
        user_id = tenant.user.id,
        "gemini generate request"
    );

    let req = InboundRequest {
        surface,
        platform,
        trace_id,
        tenant,
        user_agent: header_value(&headers, "user-agent"),
        headers: headers_to_vec(&headers),
        body: body_map,
        session_hash: String::new(),
        requested_model: model.to_string(),
        is_stream,
        is_messages_path: false,
        gemini_method: Some(method.to_string()),
    };
    dispatch(state, req).await
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
