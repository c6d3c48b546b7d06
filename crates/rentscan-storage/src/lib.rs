//! HTTP transport, GraphQL retry routine and atomic file persistence for rentscan.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rentscan_core::{BuildingRecord, ClassifiedListing, GeoPoint, RunStatus, Snapshot, SnapshotMetadata};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rentscan-storage";

pub const LATEST_FILE: &str = "rentals_latest.json";
pub const BACKUP_FILE: &str = "rentals_backup.json";
pub const COLLECTION_METHOD: &str = "api";

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers only ever
/// see the previous or the new content under the final name.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output".to_string());
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(()),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

/// Writes listing snapshots. Listings whose status equals the excluded status are
/// stripped before every write.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    excluded_status: String,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>, excluded_status: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            excluded_status: excluded_status.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn latest_path(&self) -> PathBuf {
        self.dir.join(LATEST_FILE)
    }

    pub fn backup_path(&self) -> PathBuf {
        self.dir.join(BACKUP_FILE)
    }

    pub fn snapshot_file_name(at: DateTime<Utc>) -> String {
        format!("rentals_{}.json", at.format("%Y%m%d_%H%M%S"))
    }

    pub fn strip_excluded(&self, listings: &[ClassifiedListing]) -> Vec<ClassifiedListing> {
        let kept: Vec<_> = listings
            .iter()
            .filter(|l| !l.has_status(&self.excluded_status))
            .cloned()
            .collect();
        let dropped = listings.len() - kept.len();
        if dropped > 0 {
            info!(dropped, status = %self.excluded_status, "filtered excluded listings before write");
        }
        kept
    }

    fn build_snapshot(&self, listings: &[ClassifiedListing], area: &str, is_backup: bool) -> Snapshot {
        let listings = self.strip_excluded(listings);
        Snapshot {
            metadata: SnapshotMetadata {
                timestamp: Utc::now(),
                total_listings: listings.len(),
                collection_method: COLLECTION_METHOD.to_string(),
                area: area.to_string(),
                is_backup: is_backup.then_some(true),
            },
            listings,
        }
    }

    async fn write_json(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(snapshot).context("serializing snapshot")?;
        write_atomic(path, &bytes).await
    }

    /// Writes the timestamped snapshot and refreshes the latest pointer file.
    pub async fn write_snapshot(
        &self,
        listings: &[ClassifiedListing],
        area: &str,
    ) -> anyhow::Result<PathBuf> {
        let snapshot = self.build_snapshot(listings, area, false);
        let path = self
            .dir
            .join(Self::snapshot_file_name(snapshot.metadata.timestamp));
        Self::write_json(&path, &snapshot).await?;
        Self::write_json(&self.latest_path(), &snapshot).await?;
        info!(
            listings = snapshot.metadata.total_listings,
            path = %path.display(),
            "snapshot written"
        );
        Ok(path)
    }

    /// Recovery checkpoint: the backup file plus the latest pointer.
    pub async fn write_backup(&self, listings: &[ClassifiedListing], area: &str) -> anyhow::Result<()> {
        let snapshot = self.build_snapshot(listings, area, true);
        Self::write_json(&self.backup_path(), &snapshot).await?;
        Self::write_json(&self.latest_path(), &snapshot).await?;
        info!(listings = snapshot.metadata.total_listings, "progress backup saved");
        Ok(())
    }
}

/// Reads a snapshot file, accepting the legacy bare-array layout.
pub async fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Snapshot> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let value: JsonValue =
        serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    if value.is_array() {
        let listings: Vec<ClassifiedListing> = serde_json::from_value(value)
            .with_context(|| format!("decoding legacy listing array {}", path.display()))?;
        let modified = fs::metadata(path)
            .await
            .and_then(|m| m.modified())
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        return Ok(Snapshot {
            metadata: SnapshotMetadata {
                timestamp: modified,
                total_listings: listings.len(),
                collection_method: COLLECTION_METHOD.to_string(),
                area: "unknown".to_string(),
                is_backup: None,
            },
            listings,
        });
    }
    serde_json::from_value(value).with_context(|| format!("decoding snapshot {}", path.display()))
}

/// Publishes [`RunStatus`] to the status file consumed by the external monitor.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    path: PathBuf,
}

impl StatusReporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write failures are logged and swallowed; a status write never fails a run.
    pub async fn publish(&self, status: &RunStatus) {
        let result = match serde_json::to_vec(status) {
            Ok(bytes) => write_atomic(&self.path, &bytes).await,
            Err(err) => Err(anyhow::Error::new(err).context("serializing run status")),
        };
        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %format!("{err:#}"), "could not publish run status");
        }
    }
}

/// Reads the status file, retrying briefly when a reader races a writer.
pub async fn read_status(path: impl AsRef<Path>) -> anyhow::Result<Option<RunStatus>> {
    read_status_with_retry(path, 3, Duration::from_millis(100)).await
}

pub async fn read_status_with_retry(
    path: impl AsRef<Path>,
    attempts: usize,
    delay: Duration,
) -> anyhow::Result<Option<RunStatus>> {
    let path = path.as_ref();
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match fs::read_to_string(path).await {
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", path.display()));
            }
            Ok(text) => {
                let trimmed = text.trim();
                if trimmed.is_empty() {
                    last_error = Some(anyhow!("status file {} is empty", path.display()));
                } else {
                    match serde_json::from_str::<RunStatus>(trimmed) {
                        Ok(status) => return Ok(Some(status)),
                        Err(err) => {
                            last_error = Some(
                                anyhow::Error::new(err)
                                    .context(format!("parsing {}", path.display())),
                            )
                        }
                    }
                }
            }
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(delay).await;
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("status file {} unreadable", path.display())))
}

/// Cooperative stop: an in-process flag plus an on-disk sentinel written by an
/// external controller. The sentinel is deleted once observed and the flag stays latched.
#[derive(Debug, Clone)]
pub struct StopSignal {
    path: PathBuf,
    latched: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            latched: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn request(&self) {
        self.latched.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.latched.load(Ordering::SeqCst)
    }

    /// Consumes the sentinel if present. A sentinel that cannot be removed still counts.
    pub async fn poll(&self) -> bool {
        if self.is_requested() {
            return true;
        }
        match fs::remove_file(&self.path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return false,
            Err(err) => warn!(path = %self.path.display(), error = %err, "could not remove stop signal"),
        }
        info!(path = %self.path.display(), "stop signal observed");
        self.request();
        true
    }

    /// Controller side: create the sentinel.
    pub async fn request_file(path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        write_atomic(path, Utc::now().to_rfc3339().as_bytes()).await
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachedBuilding {
    #[serde(default)]
    pub href: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(rename = "geoCenter", default)]
    pub geo_center: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub internal_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year_built: Option<i32>,
}

/// Slug-keyed side cache of building info, persisted across runs.
#[derive(Debug, Clone)]
pub struct BuildingInfoCache {
    path: PathBuf,
    entries: BTreeMap<String, CachedBuilding>,
}

impl BuildingInfoCache {
    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// A missing or corrupt cache file yields an empty cache.
    pub async fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read_to_string(&path).await {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "ignoring unreadable building cache");
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "could not read building cache");
                BTreeMap::new()
            }
        };
        Self { path, entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slug: &str) -> Option<&CachedBuilding> {
        self.entries.get(slug)
    }

    /// Fills a freshly discovered record from a previously resolved entry.
    pub fn hydrate(&self, record: &mut BuildingRecord) {
        let Some(entry) = self.entries.get(&record.slug) else {
            return;
        };
        if record.year_built.is_none() {
            record.year_built = entry.year_built;
        }
        if entry.internal_id.is_none() {
            return;
        }
        record.internal_id = entry.internal_id.clone();
        if let Some(address) = &entry.address {
            record.display_address = address.clone();
        }
        if entry.geo_center.is_some() {
            record.geo = entry.geo_center;
        }
    }

    pub fn remember(&mut self, record: &BuildingRecord) {
        let entry = self.entries.entry(record.slug.clone()).or_default();
        if record.href.is_some() {
            entry.href = record.href.clone();
        }
        entry.address = Some(record.display_address.clone());
        if record.geo.is_some() {
            entry.geo_center = record.geo;
        }
        if record.internal_id.is_some() {
            entry.internal_id = record.internal_id.clone();
        }
        if record.year_built.is_some() {
            entry.year_built = record.year_built;
        }
    }

    pub async fn save(&self) -> anyhow::Result<()> {
        let bytes = serde_json::to_vec_pretty(&self.entries).context("serializing building cache")?;
        write_atomic(&self.path, &bytes).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphqlRequest {
    pub query: String,
    pub variables: JsonValue,
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request failed: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout(_) | TransportError::Connect(_))
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connect(err.to_string())
    } else {
        TransportError::Other(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusDisposition {
    Success,
    RateLimited,
    Retryable,
}

pub fn classify_status(status: u16) -> StatusDisposition {
    match status {
        200 => StatusDisposition::Success,
        429 => StatusDisposition::RateLimited,
        _ => StatusDisposition::Retryable,
    }
}

/// The single POST endpoint every GraphQL query goes through.
#[async_trait]
pub trait GraphqlTransport: Send + Sync {
    async fn post(
        &self,
        request: &GraphqlRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError>;
}

/// Attempt budget and pauses for one query shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QueryPolicy {
    pub max_attempts: usize,
    pub timeout: Duration,
    pub rate_limit_step: Duration,
    pub retry_pause: Duration,
    pub timeout_error_pause: Duration,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            timeout: Duration::from_secs(15),
            rate_limit_step: Duration::from_secs(1),
            retry_pause: Duration::from_millis(500),
            timeout_error_pause: Duration::from_secs(1),
        }
    }
}

impl QueryPolicy {
    pub fn new(max_attempts: usize, timeout: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            timeout,
            ..Default::default()
        }
    }

    /// HTTP 429 waits `1 + attempt_index` steps.
    pub fn rate_limit_delay(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index + 1).unwrap_or(u32::MAX);
        self.rate_limit_step.saturating_mul(factor)
    }

    pub fn without_pauses(self) -> Self {
        Self {
            rate_limit_step: Duration::ZERO,
            retry_pause: Duration::ZERO,
            timeout_error_pause: Duration::ZERO,
            ..self
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryFailure {
    #[error("rate limited on every attempt")]
    RateLimited,
    #[error("http status {0}")]
    HttpStatus(u16),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("graphql errors: {}", .0.join("; "))]
    Graphql(Vec<String>),
    #[error("malformed payload: {0}")]
    MalformedPayload(String),
    #[error("response carried no data")]
    MissingData,
}

#[derive(Debug, Deserialize)]
struct GraphqlEnvelope {
    #[serde(default)]
    data: Option<JsonValue>,
    #[serde(default)]
    errors: Option<Vec<GraphqlErrorEntry>>,
}

#[derive(Debug, Deserialize)]
struct GraphqlErrorEntry {
    #[serde(default)]
    message: Option<String>,
}

/// Runs one query shape under `policy` and returns its non-empty `data` object.
///
/// Retried: HTTP 429, other non-200 statuses, timeouts/connection failures, and GraphQL
/// errors that mention a timeout. Everything else fails immediately.
pub async fn execute_query(
    transport: &dyn GraphqlTransport,
    name: &str,
    request: &GraphqlRequest,
    policy: &QueryPolicy,
) -> Result<JsonValue, QueryFailure> {
    let span = info_span!("graphql", query = name);
    async move {
        let attempts = policy.max_attempts.max(1);
        let mut last_failure = QueryFailure::MissingData;

        for attempt in 0..attempts {
            let has_next = attempt + 1 < attempts;
            let response = match transport.post(request, policy.timeout).await {
                Ok(response) => response,
                Err(err) if err.is_retryable() && has_next => {
                    debug!(attempt, error = %err, "transport failure, retrying");
                    last_failure = QueryFailure::Transport(err);
                    tokio::time::sleep(policy.retry_pause).await;
                    continue;
                }
                Err(err) => return Err(QueryFailure::Transport(err)),
            };

            match classify_status(response.status) {
                StatusDisposition::Success => {}
                StatusDisposition::RateLimited => {
                    debug!(attempt, "rate limited");
                    last_failure = QueryFailure::RateLimited;
                    if has_next {
                        tokio::time::sleep(policy.rate_limit_delay(attempt)).await;
                    }
                    continue;
                }
                StatusDisposition::Retryable => {
                    last_failure = QueryFailure::HttpStatus(response.status);
                    if has_next {
                        debug!(attempt, status = response.status, "unexpected status, retrying");
                        tokio::time::sleep(policy.retry_pause).await;
                        continue;
                    }
                    return Err(last_failure);
                }
            }

            let envelope: GraphqlEnvelope = serde_json::from_slice(&response.body)
                .map_err(|e| QueryFailure::MalformedPayload(e.to_string()))?;

            if let Some(errors) = envelope.errors.filter(|e| !e.is_empty()) {
                let messages: Vec<String> = errors
                    .into_iter()
                    .map(|e| e.message.unwrap_or_else(|| "Unknown error".to_string()))
                    .collect();
                let timed_out = messages
                    .iter()
                    .any(|m| m.to_ascii_lowercase().contains("timeout"));
                if timed_out && has_next {
                    debug!(attempt, "graphql timeout error, retrying");
                    last_failure = QueryFailure::Graphql(messages);
                    tokio::time::sleep(policy.timeout_error_pause).await;
                    continue;
                }
                return Err(QueryFailure::Graphql(messages));
            }

            return match envelope.data {
                Some(JsonValue::Object(map)) if !map.is_empty() => Ok(JsonValue::Object(map)),
                Some(JsonValue::Null) | None | Some(JsonValue::Object(_)) => Err(QueryFailure::MissingData),
                Some(other) => Err(QueryFailure::MalformedPayload(format!(
                    "data is not an object: {other}"
                ))),
            };
        }

        Err(last_failure)
    }
    .instrument(span)
    .await
}

/// Parses a `name=value; other=value` cookie string.
pub fn parse_cookie_string(input: &str) -> Vec<(String, String)> {
    input
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.trim().split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().to_string()))
        })
        .collect()
}

pub fn cookie_header(cookies: &[(String, String)]) -> String {
    cookies
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
    pub site_url: String,
    pub graphql_url: String,
    pub cookies: Vec<(String, String)>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36"
                .to_string(),
            site_url: "https://streeteasy.com".to_string(),
            graphql_url: "https://api-v6.streeteasy.com/".to_string(),
            cookies: Vec::new(),
            global_concurrency: 16,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Session-carrying HTTP client: every request sends the session cookies and the fixed
/// header set, and a global semaphore caps in-flight requests.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    graphql_url: String,
    global_limit: Arc<Semaphore>,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let site = config.site_url.trim_end_matches('/');
        let mut headers = HeaderMap::new();
        headers.insert(
            header::REFERER,
            HeaderValue::from_str(&format!("{site}/")).context("building referer header")?,
        );
        headers.insert(
            header::ORIGIN,
            HeaderValue::from_str(site).context("building origin header")?,
        );
        if !config.cookies.is_empty() {
            headers.insert(
                header::COOKIE,
                HeaderValue::from_str(&cookie_header(&config.cookies))
                    .context("building cookie header")?,
            );
        }

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            graphql_url: config.graphql_url,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let resp = self
            .client
            .get(url)
            .header(header::ACCEPT, "text/html,application/xhtml+xml")
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }
        resp.text()
            .await
            .map_err(|e| FetchError::Transport(classify_reqwest_error(&e)))
    }
}

#[async_trait]
impl GraphqlTransport for HttpClient {
    async fn post(
        &self,
        request: &GraphqlRequest,
        timeout: Duration,
    ) -> Result<TransportResponse, TransportError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let resp = self
            .client
            .post(&self.graphql_url)
            .header(header::ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .timeout(timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_reqwest_error(&e))?;
        let status = resp.status().as_u16();
        let body = resp
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(&e))?
            .to_vec();
        Ok(TransportResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentscan_core::{RawRentalRecord, RunState};
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct ScriptedTransport {
        replies: Mutex<VecDeque<Result<TransportResponse, TransportError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedTransport {
        fn new(replies: Vec<Result<TransportResponse, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl GraphqlTransport for ScriptedTransport {
        async fn post(
            &self,
            _request: &GraphqlRequest,
            _timeout: Duration,
        ) -> Result<TransportResponse, TransportError> {
            *self.calls.lock().unwrap() += 1;
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(TransportError::Other("script exhausted".into())))
        }
    }

    fn reply(status: u16, body: JsonValue) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse {
            status,
            body: serde_json::to_vec(&body).unwrap(),
        })
    }

    fn request() -> GraphqlRequest {
        GraphqlRequest {
            query: "query { ping }".into(),
            variables: json!({}),
        }
    }

    fn policy() -> QueryPolicy {
        QueryPolicy::new(2, Duration::from_secs(1)).without_pauses()
    }

    fn listing(status: &str) -> ClassifiedListing {
        let raw = RawRentalRecord {
            status: Some(status.into()),
            display_unit: Some("1A".into()),
            ..Default::default()
        };
        ClassifiedListing::from_raw(&raw, &BuildingRecord::discovered("b", None, "B"), "soho")
    }

    #[tokio::test]
    async fn rate_limit_then_success_returns_data() {
        let transport = ScriptedTransport::new(vec![
            reply(429, json!({})),
            reply(200, json!({"data": {"ping": true}})),
        ]);
        let data = execute_query(&transport, "ping", &request(), &policy()).await.unwrap();
        assert_eq!(data["ping"], true);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn non_timeout_graphql_error_is_not_retried() {
        let transport = ScriptedTransport::new(vec![
            reply(200, json!({"errors": [{"message": "Cannot query field"}]})),
            reply(200, json!({"data": {"ping": true}})),
        ]);
        let err = execute_query(&transport, "ping", &request(), &policy()).await.unwrap_err();
        assert_eq!(err, QueryFailure::Graphql(vec!["Cannot query field".into()]));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn timeout_graphql_error_is_retried() {
        let transport = ScriptedTransport::new(vec![
            reply(200, json!({"errors": [{"message": "Upstream Timeout"}]})),
            reply(200, json!({"data": {"ping": 1}})),
        ]);
        assert!(execute_query(&transport, "ping", &request(), &policy()).await.is_ok());
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn transport_timeouts_exhaust_attempts() {
        let transport = ScriptedTransport::new(vec![
            Err(TransportError::Timeout("t1".into())),
            Err(TransportError::Timeout("t2".into())),
            reply(200, json!({"data": {"ping": 1}})),
        ]);
        let err = execute_query(&transport, "ping", &request(), &policy()).await.unwrap_err();
        assert_eq!(err, QueryFailure::Transport(TransportError::Timeout("t2".into())));
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn malformed_payload_and_null_data_fail_fast() {
        let transport = ScriptedTransport::new(vec![Ok(TransportResponse {
            status: 200,
            body: b"<html>".to_vec(),
        })]);
        let err = execute_query(&transport, "ping", &request(), &policy()).await.unwrap_err();
        assert!(matches!(err, QueryFailure::MalformedPayload(_)));

        let transport = ScriptedTransport::new(vec![reply(200, json!({"data": null}))]);
        let err = execute_query(&transport, "ping", &request(), &policy()).await.unwrap_err();
        assert_eq!(err, QueryFailure::MissingData);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn server_error_on_last_attempt_reports_status() {
        let transport = ScriptedTransport::new(vec![reply(502, json!({})), reply(503, json!({}))]);
        let err = execute_query(&transport, "ping", &request(), &policy()).await.unwrap_err();
        assert_eq!(err, QueryFailure::HttpStatus(503));
    }

    #[test]
    fn rate_limit_delay_grows_with_attempt() {
        let policy = QueryPolicy::default();
        assert_eq!(policy.rate_limit_delay(0), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_delay(1), Duration::from_secs(2));
    }

    #[test]
    fn cookie_strings_parse_and_render() {
        let cookies = parse_cookie_string("a=1; b = two ; broken; =x; c=x=y");
        assert_eq!(
            cookies,
            vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "two".to_string()),
                ("c".to_string(), "x=y".to_string()),
            ]
        );
        assert_eq!(cookie_header(&cookies), "a=1; b=two; c=x=y");
    }

    #[tokio::test]
    async fn snapshots_never_contain_excluded_status() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path(), "DELISTED");
        let listings = vec![listing("AVAILABLE"), listing("delisted"), listing("RENTED")];

        let path = store.write_snapshot(&listings, "soho").await.unwrap();
        store.write_backup(&listings, "soho").await.unwrap();

        for file in [path, store.latest_path(), store.backup_path()] {
            let snapshot = load_snapshot(&file).await.unwrap();
            assert_eq!(snapshot.metadata.total_listings, 2);
            assert_eq!(snapshot.listings.len(), 2);
            assert!(snapshot.listings.iter().all(|l| !l.has_status("DELISTED")));
        }
        let backup = load_snapshot(store.backup_path()).await.unwrap();
        assert_eq!(backup.metadata.is_backup, Some(true));
        assert_eq!(backup.metadata.collection_method, "api");

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn legacy_array_snapshot_loads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("old.json");
        std::fs::write(&path, serde_json::to_vec(&vec![listing("RENTED")]).unwrap()).unwrap();
        let snapshot = load_snapshot(&path).await.unwrap();
        assert_eq!(snapshot.metadata.total_listings, 1);
        assert_eq!(snapshot.metadata.area, "unknown");
    }

    #[tokio::test]
    async fn status_round_trips_and_tolerates_transient_garbage() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("status.json");
        assert!(read_status(&path).await.unwrap().is_none());

        let reporter = StatusReporter::new(&path);
        reporter
            .publish(&RunStatus::new(RunState::Running).with_message("hello"))
            .await;
        let status = read_status(&path).await.unwrap().unwrap();
        assert_eq!(status.status, RunState::Running);
        assert_eq!(status.message.as_deref(), Some("hello"));

        std::fs::write(&path, "").unwrap();
        let err = read_status_with_retry(&path, 2, Duration::from_millis(1)).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn stop_signal_consumes_sentinel_and_latches() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("stop.txt");
        let signal = StopSignal::new(&path);
        assert!(!signal.poll().await);

        StopSignal::request_file(&path).await.unwrap();
        assert!(signal.poll().await);
        assert!(!path.exists());
        assert!(signal.poll().await);
        assert!(signal.clone().is_requested());
    }

    #[tokio::test]
    async fn building_cache_hydrates_resolved_entries_only() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("building_info.json");
        let mut cache = BuildingInfoCache::load(&path).await;
        assert!(cache.is_empty());

        let mut resolved = BuildingRecord::discovered("a", Some("/building/a".into()), "A card");
        resolved.internal_id = Some("11".into());
        resolved.display_address = "1 A St, New York, NY".into();
        resolved.geo = Some(GeoPoint { latitude: 1.0, longitude: 2.0 });
        cache.remember(&resolved);
        cache.remember(&BuildingRecord::discovered("b", None, "B card"));
        cache.save().await.unwrap();

        let cache = BuildingInfoCache::load(&path).await;
        assert_eq!(cache.len(), 2);
        let mut a = BuildingRecord::discovered("a", None, "A card");
        cache.hydrate(&mut a);
        assert_eq!(a.internal_id.as_deref(), Some("11"));
        assert_eq!(a.display_address, "1 A St, New York, NY");
        let mut b = BuildingRecord::discovered("b", None, "B fresh");
        cache.hydrate(&mut b);
        assert!(b.internal_id.is_none());
        assert_eq!(b.display_address, "B fresh");
    }
}
