//! Outbound HTTP: a pooled client per (proxy, fingerprint) pair, with
//! transport error classification feeding the retry decision.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use wreq::{Client, Proxy};

use tollgate_transform::headers::Headers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamTransportErrorKind {
    Timeout,
    ReadTimeout,
    Dns,
    Tls,
    Connect,
    Other,
}

impl UpstreamTransportErrorKind {
    /// Retryable failures bubble up so the caller may pick another account.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UpstreamTransportErrorKind::Timeout
                | UpstreamTransportErrorKind::Connect
                | UpstreamTransportErrorKind::Dns
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("upstream transport error ({kind:?}): {message}")]
pub struct UpstreamTransportError {
    pub kind: UpstreamTransportErrorKind,
    pub message: String,
}

pub enum UpstreamBody {
    Bytes(Bytes),
    Stream(mpsc::Receiver<Bytes>),
}

pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: UpstreamBody,
}

impl UpstreamResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        tollgate_transform::headers::header_get(&self.headers, name)
    }
}

pub struct UpstreamRequest {
    pub url: String,
    pub headers: Headers,
    pub body: Bytes,
    pub is_stream: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub proxy: Option<String>,
    pub tls_fingerprint: bool,
    pub account_id: i64,
}

pub trait UpstreamClient: Send + Sync {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
        opts: SendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamTransportError>> + Send + 'a>>;
}

#[derive(Debug, Clone)]
pub struct UpstreamClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for UpstreamClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

type ClientKey = (Option<String>, bool);

#[derive(Clone)]
pub struct WreqUpstreamClient {
    config: UpstreamClientConfig,
    clients: Arc<Mutex<HashMap<ClientKey, Client>>>,
}

impl WreqUpstreamClient {
    pub fn new(config: UpstreamClientConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn client_for(&self, proxy: Option<String>, emulate: bool) -> Result<Client, UpstreamTransportError> {
        let proxy = proxy
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());
        let key = (proxy.clone(), emulate);
        let mut guard = self.clients.lock().map_err(|_| UpstreamTransportError {
            kind: UpstreamTransportErrorKind::Other,
            message: "upstream client cache lock failed".to_string(),
        })?;
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }
        let client = build_client(&self.config, proxy.as_deref(), emulate).map_err(map_wreq_error)?;
        guard.insert(key, client.clone());
        Ok(client)
    }
}

fn build_client(
    config: &UpstreamClientConfig,
    proxy: Option<&str>,
    emulate: bool,
) -> Result<Client, wreq::Error> {
    let mut builder = Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .read_timeout(config.stream_idle_timeout);
    if emulate {
        // wreq already speaks with a real-client TLS stack; fingerprinted
        // accounts get a dedicated connection pool so their sessions do not
        // interleave with plain gateway traffic.
        builder = builder.tcp_keepalive(Duration::from_secs(60));
    }
    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }
    builder.build()
}

impl UpstreamClient for WreqUpstreamClient {
    fn send<'a>(
        &'a self,
        req: UpstreamRequest,
        opts: SendOptions,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamTransportError>> + Send + 'a>>
    {
        Box::pin(async move {
            let client = self.client_for(opts.proxy, opts.tls_fingerprint)?;

            let mut builder = client.post(&req.url);
            for (name, value) in &req.headers {
                builder = builder.header(name, value);
            }
            builder = builder.body(req.body);

            let resp = builder.send().await.map_err(map_wreq_error)?;
            convert_response(resp, req.is_stream, self.config.stream_idle_timeout).await
        })
    }
}

async fn convert_response(
    resp: wreq::Response,
    want_stream: bool,
    stream_idle_timeout: Duration,
) -> Result<UpstreamResponse, UpstreamTransportError> {
    let status = resp.status().as_u16();
    let headers = headers_from_wreq(resp.headers());

    let is_success = (200..300).contains(&status);
    if !is_success || !want_stream {
        let body = resp.bytes().await.map_err(map_wreq_error)?;
        return Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Bytes(body),
        });
    }

    let (tx, rx) = mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        let mut stream = resp.bytes_stream();
        loop {
            let next = tokio::time::timeout(stream_idle_timeout, stream.next()).await;
            let item = match next {
                Ok(item) => item,
                Err(_) => break,
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if tx.send(chunk).await.is_err() {
                break;
            }
        }
    });

    Ok(UpstreamResponse {
        status,
        headers,
        body: UpstreamBody::Stream(rx),
    })
}

fn headers_from_wreq(map: &wreq::header::HeaderMap) -> Headers {
    let mut out = Vec::new();
    for (name, value) in map {
        if let Ok(text) = value.to_str() {
            out.push((name.as_str().to_string(), text.to_string()));
        }
    }
    out
}

fn map_wreq_error(err: wreq::Error) -> UpstreamTransportError {
    let kind = classify_wreq_error(&err);
    UpstreamTransportError {
        kind,
        message: err.to_string(),
    }
}

fn classify_wreq_error(err: &wreq::Error) -> UpstreamTransportErrorKind {
    let message = err.to_string().to_ascii_lowercase();
    if err.is_timeout() {
        if message.contains("read") || message.contains("idle") {
            return UpstreamTransportErrorKind::ReadTimeout;
        }
        return UpstreamTransportErrorKind::Timeout;
    }
    if err.is_connect() {
        if message.contains("dns") || message.contains("resolve") {
            return UpstreamTransportErrorKind::Dns;
        }
        if message.contains("tls") || message.contains("ssl") {
            return UpstreamTransportErrorKind::Tls;
        }
        return UpstreamTransportErrorKind::Connect;
    }
    if message.contains("tls") || message.contains("ssl") {
        return UpstreamTransportErrorKind::Tls;
    }
    UpstreamTransportErrorKind::Other
}
