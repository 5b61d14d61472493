//! Snapshot fetcher.
//!
//! Every request carries a randomly chosen user agent and is bounded by the
//! client timeout. Transient failures (transport errors, 5xx) are retried per
//! the endpoint's [`RetryPolicy`]; everything else fails on the first attempt.
//! Successful documents are archived verbatim to a dated JSON file.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{FixedOffset, NaiveDate, Offset, Utc};
use rand::Rng;
use reqwest::header::USER_AGENT;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data_sources::endpoints::{EndpointId, EndpointRegistry, RetryPolicy};
use crate::data_sources::schema::extract_records;
use crate::error::{PipelineError, PipelineResult};

/// Browser identities rotated across requests.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.130 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_2) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:72.0) Gecko/20100101 Firefox/72.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:72.0) Gecko/20100101 Firefox/72.0",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 13_3 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/13.0.5 Mobile/15E148 Safari/604.1",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/79.0.3945.130 Safari/537.36 Edg/79.0.309.71",
];

/// Default request budget.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Writes raw documents to `{dir}/{label}_{YYYYMMDD}.json`.
///
/// Write failures are logged and swallowed.
#[derive(Debug, Clone)]
pub struct Archive {
    dir: Option<PathBuf>,
    offset: FixedOffset,
}

impl Archive {
    pub fn new(dir: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            dir: Some(dir.into()),
            offset,
        }
    }

    /// An archive that never writes.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            offset: Utc.fix(),
        }
    }

    pub fn path_for(&self, label: &str, date: NaiveDate) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}_{}.json", label, date.format("%Y%m%d"))))
    }

    /// Store a document under today's (local) date. Returns the written path.
    pub async fn store(&self, label: &str, doc: &Value) -> Option<PathBuf> {
        let today = Utc::now().with_timezone(&self.offset).date_naive();
        let path = self.path_for(label, today)?;

        match write_pretty(&path, doc).await {
            Ok(()) => {
                debug!(path = %path.display(), "Archived raw document");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to archive raw document");
                None
            }
        }
    }
}

async fn write_pretty(path: &Path, doc: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let body = serde_json::to_vec_pretty(doc)?;
    tokio::fs::write(path, body).await
}

/// Client for the registered statistics endpoints.
#[derive(Clone)]
pub struct SnapshotFetcher {
    client: reqwest::Client,
    endpoints: Arc<EndpointRegistry>,
    archive: Archive,
}

impl SnapshotFetcher {
    /// Create a fetcher with the given per-request timeout.
    pub fn new(
        endpoints: EndpointRegistry,
        archive: Archive,
        timeout: Duration,
    ) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| PipelineError::Transport {
                endpoint: "client".to_string(),
                source,
            })?;

        Ok(Self {
            client,
            endpoints: Arc::new(endpoints),
            archive,
        })
    }

    pub fn endpoints(&self) -> &EndpointRegistry {
        &self.endpoints
    }

    /// Fetch and decode one endpoint's document, archiving it on success.
    pub async fn fetch(&self, id: EndpointId) -> PipelineResult<Value> {
        let cfg = self.endpoints.get(id);
        let doc = self.fetch_url(id.as_str(), &cfg.url, cfg.retry).await?;
        self.archive.store(id.as_str(), &doc).await;
        Ok(doc)
    }

    /// Fetch an endpoint and return its record array.
    pub async fn fetch_history(&self, id: EndpointId) -> PipelineResult<Vec<Value>> {
        let doc = self.fetch(id).await?;
        extract_records(id, &doc)
    }

    /// Daily list for one province, or one city within it.
    pub async fn fetch_province_daily(
        &self,
        province: &str,
        city: Option<&str>,
    ) -> PipelineResult<Vec<Value>> {
        let id = EndpointId::ProvinceDaily;
        let url = self.endpoints.province_daily_url(province, city);
        let retry = self.endpoints.get(id).retry;

        let doc = self.fetch_url(id.as_str(), &url, retry).await?;
        let label = match city {
            Some(city) => format!("{}_{}_{}", id, province, city),
            None => format!("{}_{}", id, province),
        };
        self.archive.store(&label, &doc).await;
        extract_records(id, &doc)
    }

    async fn fetch_url(&self, label: &str, url: &str, retry: RetryPolicy) -> PipelineResult<Value> {
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match self.get_once(label, url).await {
                Ok(doc) => return Ok(doc),
                Err(e) if e.is_transient() && attempt + 1 < attempts => {
                    let delay = retry.backoff(attempt);
                    warn!(
                        endpoint = label,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Upstream request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once(&self, label: &str, url: &str) -> PipelineResult<Value> {
        let transport = |source| PipelineError::Transport {
            endpoint: label.to_string(),
            source,
        };

        let response = self
            .client
            .get(url)
            .header(USER_AGENT, random_user_agent())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::RemoteService {
                endpoint: label.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport)?;
        serde_json::from_slice(&body).map_err(|source| PipelineError::Decode {
            endpoint: label.to_string(),
            source,
        })
    }
}

fn random_user_agent() -> &'static str {
    let idx = rand::rng().random_range(0..USER_AGENTS.len());
    USER_AGENTS[idx]
}

/// Bounded pool for fire-and-forget archival fetches.
///
/// At most `workers` fetches run at once. A failed fetch or handler is
/// logged and dropped; it never reaches the refresh path.
#[derive(Clone)]
pub struct ArchivalPool {
    fetcher: SnapshotFetcher,
    permits: Arc<Semaphore>,
}

impl ArchivalPool {
    pub fn new(fetcher: SnapshotFetcher, workers: usize) -> Self {
        Self {
            fetcher,
            permits: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    /// Fetch and archive an endpoint in the background.
    pub fn spawn(&self, id: EndpointId) -> JoinHandle<()> {
        self.spawn_with(id, |_| async { Ok(()) })
    }

    /// Fetch in the background and hand the document to `handler`.
    pub fn spawn_with<F, Fut>(&self, id: EndpointId, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(Value) -> Fut + Send + 'static,
        Fut: Future<Output = PipelineResult<()>> + Send + 'static,
    {
        let fetcher = self.fetcher.clone();
        let permits = self.permits.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };

            match fetcher.fetch(id).await {
                Ok(doc) => {
                    if let Err(e) = handler(doc).await {
                        warn!(endpoint = %id, error = %e, "Archival handler failed");
                    } else {
                        info!(endpoint = %id, "Archival fetch complete");
                    }
                }
                Err(e) => {
                    warn!(endpoint = %id, error = %e, "Archival fetch failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{Router, http::StatusCode, routing::get};
    use serde_json::json;
    use tokio::net::TcpListener;
    use tokio_test::{assert_err, assert_ok};

    async fn serve(app: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(5),
            multiplier: 2,
        }
    }

    fn fetcher_for(base: &str, archive: Archive) -> SnapshotFetcher {
        let registry = EndpointRegistry::rooted_at(base).with_retry_all(fast_retry());
        SnapshotFetcher::new(registry, archive, Duration::from_secs(5)).unwrap()
    }

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "epidash-fetcher-{}-{}",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn test_fetch_decodes_and_archives() {
        let app = Router::new().route(
            "/dxy",
            get(|| async { axum::Json(json!({"data": {"getAreaStat": []}})) }),
        );
        let base = serve(app).await;
        let dir = temp_dir("archive");
        let offset = FixedOffset::east_opt(8 * 3600).unwrap();
        let fetcher = fetcher_for(&base, Archive::new(&dir, offset));

        let doc = fetcher.fetch(EndpointId::Dxy).await.unwrap();
        assert_eq!(doc["data"]["getAreaStat"], json!([]));

        let today = Utc::now().with_timezone(&offset).date_naive();
        let path = dir.join(format!("dxy_{}.json", today.format("%Y%m%d")));
        let archived: Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(archived, doc);
    }

    #[tokio::test]
    async fn test_non_2xx_is_remote_service_error() {
        let app = Router::new().route("/qq", get(|| async { StatusCode::NOT_FOUND }));
        let base = serve(app).await;
        let fetcher = fetcher_for(&base, Archive::disabled());

        let err = fetcher.fetch(EndpointId::Qq).await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::RemoteService { status: 404, .. }
        ));
    }

    #[tokio::test]
    async fn test_malformed_body_is_decode_error() {
        let app = Router::new().route("/qq", get(|| async { "not json" }));
        let base = serve(app).await;
        let fetcher = fetcher_for(&base, Archive::disabled());

        let err = fetcher.fetch(EndpointId::Qq).await.unwrap_err();
        assert!(matches!(err, PipelineError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_server_errors_are_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/overall_history",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(StatusCode::SERVICE_UNAVAILABLE)
                    } else {
                        Ok(axum::Json(json!({"results": [{"updateTime": 1}]})))
                    }
                }
            }),
        );
        let base = serve(app).await;
        let fetcher = fetcher_for(&base, Archive::disabled());

        let records = fetcher
            .fetch_history(EndpointId::OverallHistory)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/area_latest",
            get(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::FORBIDDEN }
            }),
        );
        let base = serve(app).await;
        let fetcher = fetcher_for(&base, Archive::disabled());

        assert_err!(fetcher.fetch(EndpointId::AreaLatest).await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_province_daily_query() {
        let app = Router::new().route(
            "/province_daily",
            get(
                |axum::extract::Query(q): axum::extract::Query<
                    std::collections::HashMap<String, String>,
                >| async move {
                    axum::Json(json!({"data": [{"province": q.get("province")}]}))
                },
            ),
        );
        let base = serve(app).await;
        let fetcher = fetcher_for(&base, Archive::disabled());

        let records = fetcher.fetch_province_daily("湖北", None).await.unwrap();
        assert_eq!(records[0]["province"], "湖北");
    }

    #[tokio::test]
    async fn test_archival_failures_are_contained() {
        let app = Router::new().route(
            "/province_city_history",
            get(|| async { StatusCode::INTERNAL_SERVER_ERROR }),
        );
        let base = serve(app).await;
        let pool = ArchivalPool::new(fetcher_for(&base, Archive::disabled()), 5);

        // The task completes without panicking even though every attempt fails.
        assert_ok!(pool.spawn(EndpointId::ProvinceCityHistory).await);
    }

    #[tokio::test]
    async fn test_archival_handler_receives_document() {
        let app = Router::new().route(
            "/area_history",
            get(|| async { axum::Json(json!({"results": [1, 2, 3]})) }),
        );
        let base = serve(app).await;
        let pool = ArchivalPool::new(fetcher_for(&base, Archive::disabled()), 2);

        let seen = Arc::new(AtomicUsize::new(0));
        let sink = seen.clone();
        let handle = pool.spawn_with(EndpointId::AreaHistory, move |doc| async move {
            let n = extract_records(EndpointId::AreaHistory, &doc)?.len();
            sink.store(n, Ordering::SeqCst);
            Ok(())
        });
        assert_ok!(handle.await);

        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_archive_write_failure_is_contained() {
        let app = Router::new().route(
            "/dxy",
            get(|| async { axum::Json(json!({"data": {"getAreaStat": []}})) }),
        );
        let base = serve(app).await;
        let dir = temp_dir("archive-blocked");
        std::fs::create_dir_all(&dir).unwrap();
        // A regular file where the archive directory should be.
        let blocker = dir.join("blocker");
        std::fs::write(&blocker, b"not a directory").unwrap();
        let archive = Archive::new(blocker.join("history"), Utc.fix());

        assert!(archive.store("dxy", &json!({})).await.is_none());

        let fetcher = fetcher_for(&base, archive);
        let doc = assert_ok!(fetcher.fetch(EndpointId::Dxy).await);
        assert_eq!(doc["data"]["getAreaStat"], json!([]));
    }

    #[tokio::test]
    async fn test_archive_disabled_writes_nothing() {
        let archive = Archive::disabled();
        assert!(archive.store("qq", &json!({})).await.is_none());
    }
}
