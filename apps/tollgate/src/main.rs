use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tollgate_common::{GatewayConfig, GatewayConfigPatch};
use tollgate_core::billing::StaticPricingService;
use tollgate_core::token::OAuthTokenProvider;
use tollgate_core::upstream::{UpstreamClientConfig, WreqUpstreamClient};
use tollgate_core::{AppState, GatewayDeps};
use tollgate_store::{MemoryCache, SeaOrmStore};
use tollgate_transform::CodexPromptFetcher;

/// Multi-tenant metering reverse proxy for upstream LLM providers.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version)]
struct Cli {
    /// Bind host.
    #[arg(long, env = "TOLLGATE_HOST")]
    host: Option<String>,

    /// Bind port.
    #[arg(long, env = "TOLLGATE_PORT")]
    port: Option<u16>,

    /// Database DSN (sqlite or postgres).
    #[arg(long, env = "TOLLGATE_DSN")]
    dsn: Option<String>,

    /// Outbound proxy for accounts without one of their own.
    #[arg(long, env = "TOLLGATE_PROXY")]
    proxy: Option<String>,

    /// Forward x-stainless-* headers in OpenAI passthrough mode.
    #[arg(long, env = "TOLLGATE_ALLOW_TIMEOUT_HEADERS")]
    allow_timeout_headers: bool,

    /// Treat every OpenAI client as Codex CLI.
    #[arg(long, env = "TOLLGATE_FORCE_CODEX_CLI")]
    force_codex_cli: bool,

    /// On-disk cache directory for fetched Codex prompts.
    #[arg(long, env = "TOLLGATE_PROMPT_CACHE_DIR")]
    prompt_cache_dir: Option<String>,
}

impl Cli {
    fn into_patch(self) -> (GatewayConfigPatch, Option<String>) {
        let prompt_cache_dir = self.prompt_cache_dir.clone();
        let patch = GatewayConfigPatch {
            host: self.host,
            port: self.port,
            dsn: self.dsn,
            outbound_proxy: self.proxy,
            openai_passthrough_allow_timeout_headers: Some(self.allow_timeout_headers),
            force_codex_cli: Some(self.force_codex_cli),
            ..Default::default()
        };
        (patch, prompt_cache_dir)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let (patch, prompt_cache_dir) = Cli::parse().into_patch();
    let mut merged = GatewayConfigPatch::default();
    merged.overlay(patch);
    let config = merged.into_config().context("gateway config")?;

    let store = SeaOrmStore::connect(&config.dsn)
        .await
        .context("connect database")?;
    store.sync().await.context("schema sync")?;
    let store = Arc::new(store);

    let cache = Arc::new(MemoryCache::new());
    let prompt_cache_dir = prompt_cache_dir.unwrap_or_else(|| {
        std::env::var("HOME")
            .map(|home| format!("{home}/.cache/tollgate/codex"))
            .unwrap_or_else(|_| "./cache/codex".to_string())
    });
    let prompts = Arc::new(CodexPromptFetcher::new(&prompt_cache_dir).context("prompt fetcher")?);
    let tokens = Arc::new(OAuthTokenProvider::new(store.clone()).context("token provider")?);
    let upstream = Arc::new(WreqUpstreamClient::new(UpstreamClientConfig::default()));

    let bind = format!("{}:{}", config.host, config.port);
    let state = Arc::new(AppState::new(GatewayDeps {
        config: Arc::new(ArcSwap::from_pointee(config)),
        accounts: store.clone(),
        usage_logs: store.clone(),
        users: store.clone(),
        subscriptions: store.clone(),
        cache: cache.clone(),
        billing_cache: cache,
        pricing: Arc::new(StaticPricingService::new()),
        tokens,
        upstream,
        prompts,
    }));

    let app = axum::Router::new().merge(tollgate_core::router(state));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    info!(bind = %bind, "tollgate listening");
    axum::serve(listener, app).await.context("serve")?;
    Ok(())
}
