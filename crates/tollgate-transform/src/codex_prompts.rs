//! Remote Codex prompt source with ETag revalidation and an on-disk cache.
//!
//! Prompts are published per model family in the upstream codex repository;
//! the gateway mirrors what an official client ships by fetching the prompt
//! for the latest release tag. Results are cached on disk for 15 minutes and
//! served stale when the remote is unreachable.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::codex::{codex_model_family, CodexFamily};

const RELEASE_API_URL: &str = "https://api.github.com/repos/openai/codex/releases/latest";
const PROMPT_URL_FMT: &str = "https://raw.githubusercontent.com/openai/codex/{tag}/codex-rs/core/{file}";
const CACHE_TTL: Duration = Duration::from_secs(15 * 60);
const FETCH_UA: &str = "tollgate-codex";

fn prompt_file(family: CodexFamily) -> &'static str {
    match family {
        CodexFamily::Gpt52Codex => "gpt-5.2-codex_prompt.md",
        CodexFamily::CodexMax => "gpt-5.1-codex-max_prompt.md",
        CodexFamily::Codex => "gpt_5_codex_prompt.md",
        CodexFamily::Gpt52 => "gpt_5_2_prompt.md",
        CodexFamily::Gpt51 => "gpt_5_1_prompt.md",
    }
}

fn cache_file(family: CodexFamily) -> &'static str {
    match family {
        CodexFamily::Gpt52Codex => "gpt-5.2-codex-instructions.md",
        CodexFamily::CodexMax => "codex-max-instructions.md",
        CodexFamily::Codex => "codex-instructions.md",
        CodexFamily::Gpt52 => "gpt-5.2-instructions.md",
        CodexFamily::Gpt51 => "gpt-5.1-instructions.md",
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CacheMeta {
    #[serde(default)]
    etag: String,
    #[serde(default)]
    tag: String,
    /// Unix millis of the last successful revalidation.
    #[serde(default)]
    last_checked: i64,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseResponse {
    tag_name: String,
}

pub struct CodexPromptFetcher {
    client: wreq::Client,
    cache_dir: PathBuf,
    release_api_url: String,
    prompt_url_fmt: String,
    /// Per-family fetch lock so concurrent misses do the remote work once.
    flights: Mutex<HashMap<CodexFamily, Arc<Mutex<()>>>>,
}

impl CodexPromptFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self, wreq::Error> {
        Self::with_endpoints(cache_dir, RELEASE_API_URL, PROMPT_URL_FMT)
    }

    pub fn with_endpoints(
        cache_dir: impl Into<PathBuf>,
        release_api_url: impl Into<String>,
        prompt_url_fmt: impl Into<String>,
    ) -> Result<Self, wreq::Error> {
        let client = wreq::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
            release_api_url: release_api_url.into(),
            prompt_url_fmt: prompt_url_fmt.into(),
            flights: Mutex::new(HashMap::new()),
        })
    }

    /// The prompt for the normalized model, or `None` when neither the remote
    /// nor the cache can produce one.
    pub async fn instructions_for(&self, normalized_model: &str) -> Option<String> {
        let family = codex_model_family(if normalized_model.is_empty() {
            "gpt-5.1-codex"
        } else {
            normalized_model
        });

        let flight = {
            let mut flights = self.flights.lock().await;
            flights.entry(family).or_default().clone()
        };
        let _guard = flight.lock().await;

        let cache_path = self.cache_dir.join(cache_file(family));
        let meta_path = self.cache_dir.join(format!(
            "{}-meta.json",
            cache_file(family).trim_end_matches(".md")
        ));

        let mut meta = read_meta(&meta_path).await.unwrap_or_default();
        if meta.last_checked > 0 && !is_stale(meta.last_checked) {
            if let Some(cached) = read_cache(&cache_path).await {
                return Some(cached);
            }
        }

        let Some(tag) = self.latest_release_tag(&meta).await else {
            return read_cache(&cache_path).await;
        };
        if meta.tag != tag {
            meta.etag.clear();
        }

        let url = self
            .prompt_url_fmt
            .replace("{tag}", &tag)
            .replace("{file}", prompt_file(family));
        match self.fetch_with_etag(&url, &meta.etag).await {
            Some(FetchOutcome::NotModified) => {
                meta.last_checked = now_millis();
                let _ = write_meta(&meta_path, &meta).await;
                read_cache(&cache_path).await
            }
            Some(FetchOutcome::Fresh { body, etag }) if !body.is_empty() => {
                if write_cache(&cache_path, &body).await.is_ok() {
                    let new_meta = CacheMeta {
                        etag,
                        tag,
                        last_checked: now_millis(),
                        url,
                    };
                    let _ = write_meta(&meta_path, &new_meta).await;
                }
                Some(body)
            }
            _ => read_cache(&cache_path).await,
        }
    }

    async fn latest_release_tag(&self, meta: &CacheMeta) -> Option<String> {
        let response = self
            .client
            .get(&self.release_api_url)
            .header("user-agent", FETCH_UA)
            .send()
            .await;
        match response {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<ReleaseResponse>().await {
                    Ok(release) if !release.tag_name.is_empty() => Some(release.tag_name),
                    _ => fallback_tag(meta),
                }
            }
            Ok(resp) => {
                debug!(status = resp.status().as_u16(), "codex release lookup failed");
                fallback_tag(meta)
            }
            Err(err) => {
                debug!(error = %err, "codex release lookup failed");
                fallback_tag(meta)
            }
        }
    }

    async fn fetch_with_etag(&self, url: &str, etag: &str) -> Option<FetchOutcome> {
        let mut request = self.client.get(url).header("user-agent", FETCH_UA);
        if !etag.is_empty() {
            request = request.header("if-none-match", etag);
        }
        let response = request.send().await.ok()?;
        let status = response.status();
        if status.as_u16() == 304 {
            return Some(FetchOutcome::NotModified);
        }
        if !status.is_success() {
            return None;
        }
        let etag = response
            .headers()
            .get("etag")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response.text().await.ok()?;
        Some(FetchOutcome::Fresh { body, etag })
    }
}

enum FetchOutcome {
    NotModified,
    Fresh { body: String, etag: String },
}

fn fallback_tag(meta: &CacheMeta) -> Option<String> {
    (!meta.tag.is_empty()).then(|| meta.tag.clone())
}

fn now_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn is_stale(last_checked: i64) -> bool {
    let age = now_millis().saturating_sub(last_checked);
    age < 0 || age as u128 >= CACHE_TTL.as_millis()
}

async fn read_meta(path: &Path) -> Option<CacheMeta> {
    let data = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&data).ok()
}

async fn write_meta(path: &Path, meta: &CacheMeta) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let data = serde_json::to_vec(meta).unwrap_or_default();
    tokio::fs::write(path, data).await
}

async fn read_cache(path: &Path) -> Option<String> {
    tokio::fs::read_to_string(path).await.ok().filter(|s| !s.is_empty())
}

async fn write_cache(path: &Path, content: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, content).await
}
