//! HTTP transport, job/run store contracts and the upsert writer for rbjobs.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rbjobs_core::NormalizedJob;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbjobs-storage";

/// Rows per `INSERT ... ON CONFLICT` statement; keeps binds under the Postgres limit.
pub const UPSERT_CHUNK_SIZE: usize = 500;

pub type RunId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Retry schedule applied by the orchestrator around a whole source fetch.
/// Transport calls themselves never retry.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn with_retries(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
        }
    }
}

/// Shared outbound HTTP client. Built once per process and passed to every
/// adapter; bounds concurrency globally and per source.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Request(err) => classify_reqwest_error(err),
            Self::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// Single GET. Any non-success status is returned as [`FetchError::HttpStatus`].
    pub async fn fetch_bytes(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", %run_id, source_id, url);
        async {
            let _global = self
                .global_limit
                .acquire()
                .await
                .expect("semaphore not closed");
            let per_source = self.per_source_semaphore(source_id).await;
            let _source = per_source.acquire().await.expect("semaphore not closed");

            let resp = self.client.get(url).header(ACCEPT, accept).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                debug!(status = status.as_u16(), "non-success response");
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let content_type = resp
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(ToString::to_string);
            let body = resp.bytes().await?.to_vec();
            debug!(bytes = body.len(), "fetched");
            Ok(FetchedResponse {
                final_url,
                content_type,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("no run record with id {0}")]
    MissingRun(RunId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Columns written to `jobs`, in bind order. Matches the fields of [`JobRow`].
pub const JOB_COLUMNS: [&str; 15] = [
    "stable_key",
    "source_id",
    "source_name",
    "title",
    "company",
    "location",
    "remote",
    "salary_min",
    "salary_max",
    "salary_currency",
    "salary_min_eur",
    "salary_max_eur",
    "posted_at",
    "apply_url",
    "raw",
];

fn conflict_updates() -> String {
    JOB_COLUMNS
        .iter()
        .filter(|c| **c != "stable_key")
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Storage shape of a `jobs` row. Absent values are explicit `None`s.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRow {
    pub stable_key: String,
    pub source_id: String,
    pub source_name: String,
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub remote: bool,
    pub salary_min: Option<f64>,
    pub salary_max: Option<f64>,
    pub salary_currency: Option<String>,
    pub salary_min_eur: Option<f64>,
    pub salary_max_eur: Option<f64>,
    pub posted_at: DateTime<Utc>,
    pub apply_url: String,
    pub raw: Option<JsonValue>,
}

fn trimmed_or_none(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

impl From<NormalizedJob> for JobRow {
    fn from(job: NormalizedJob) -> Self {
        Self {
            location: trimmed_or_none(job.location.as_deref()),
            salary_currency: trimmed_or_none(job.salary_currency.as_deref()).map(|c| c.to_uppercase()),
            stable_key: job.stable_key,
            source_id: job.source_id,
            source_name: job.source_name,
            title: job.title,
            company: job.company,
            remote: job.remote,
            salary_min: job.salary_min,
            salary_max: job.salary_max,
            salary_min_eur: job.salary_min_eur,
            salary_max_eur: job.salary_max_eur,
            posted_at: job.posted_at,
            apply_url: job.apply_url,
            raw: job.raw,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Ok,
    Error,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

/// Result fields written when a run record is closed. `None` leaves the column untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub attempts: Option<i32>,
    pub successes: Option<i32>,
    pub errors: Option<i32>,
    pub items_inserted: Option<i64>,
    pub mean_latency_ms: Option<i64>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunRecord {
    pub id: RunId,
    pub source_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: Option<String>,
    pub attempts: Option<i32>,
    pub successes: Option<i32>,
    pub errors: Option<i32>,
    pub items_inserted: Option<i64>,
    pub mean_latency_ms: Option<i64>,
    pub notes: Option<String>,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert-or-update every row by `stable_key` as one atomic write.
    /// Returns the keys the store reports as written.
    async fn upsert_job_rows(&self, rows: &[JobRow]) -> Result<Vec<String>, StoreError>;

    async fn count_jobs(&self) -> Result<i64, StoreError>;
}

#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create_run(&self, source_id: &str) -> Result<RunId, StoreError>;

    async fn update_run(
        &self,
        run_id: RunId,
        patch: &RunPatch,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>, StoreError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UpsertSummary {
    /// Rows the store reported as written; counts inserts and updates alike.
    pub inserted: usize,
}

/// Deduplicate `jobs` by stable key (first occurrence wins) and write them in
/// one batched upsert. An empty batch never reaches the store.
pub async fn upsert_jobs(
    store: &dyn JobStore,
    jobs: Vec<NormalizedJob>,
) -> Result<UpsertSummary, StoreError> {
    if jobs.is_empty() {
        return Ok(UpsertSummary::default());
    }

    let received = jobs.len();
    let mut seen = HashSet::with_capacity(received);
    let mut rows = Vec::with_capacity(received);
    for job in jobs {
        if job.stable_key.is_empty() || job.title.trim().is_empty() || job.apply_url.trim().is_empty() {
            debug!(source_id = %job.source_id, title = %job.title, "skipping job without key, title or apply url");
            continue;
        }
        if !seen.insert(job.stable_key.clone()) {
            continue;
        }
        rows.push(JobRow::from(job));
    }

    if rows.is_empty() {
        return Ok(UpsertSummary::default());
    }

    let written = store.upsert_job_rows(&rows).await?;
    info!(received, unique = rows.len(), written = written.len(), "upserted jobs");
    Ok(UpsertSummary {
        inserted: written.len(),
    })
}

/// Start/finish bracket around one source's ingestion.
#[derive(Clone)]
pub struct RunTelemetry {
    store: Arc<dyn RunStore>,
}

impl RunTelemetry {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    pub async fn start_run(&self, source_id: &str) -> Result<RunId, StoreError> {
        let run_id = self.store.create_run(source_id).await?;
        debug!(%run_id, source_id, "run started");
        Ok(run_id)
    }

    pub async fn finish_run(&self, run_id: RunId, patch: RunPatch) -> Result<(), StoreError> {
        self.store.update_run(run_id, &patch, Utc::now()).await?;
        debug!(%run_id, status = ?patch.status, "run finished");
        Ok(())
    }
}

/// Postgres-backed store for `jobs` and `scrape_runs`.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl JobStore for PgStore {
    async fn upsert_job_rows(&self, rows: &[JobRow]) -> Result<Vec<String>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut written = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(UPSERT_CHUNK_SIZE) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO jobs ({}) ", JOB_COLUMNS.join(", ")));
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(&row.stable_key)
                    .push_bind(&row.source_id)
                    .push_bind(&row.source_name)
                    .push_bind(&row.title)
                    .push_bind(&row.company)
                    .push_bind(row.location.as_deref())
                    .push_bind(row.remote)
                    .push_bind(row.salary_min)
                    .push_bind(row.salary_max)
                    .push_bind(row.salary_currency.as_deref())
                    .push_bind(row.salary_min_eur)
                    .push_bind(row.salary_max_eur)
                    .push_bind(row.posted_at)
                    .push_bind(&row.apply_url)
                    .push_bind(row.raw.clone());
            });
            qb.push(" ON CONFLICT (stable_key) DO UPDATE SET ");
            qb.push(conflict_updates());
            qb.push(" RETURNING stable_key");
            let keys: Vec<String> = qb.build_query_scalar().fetch_all(&mut *tx).await?;
            written.extend(keys);
        }

        tx.commit().await?;
        Ok(written)
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn create_run(&self, source_id: &str) -> Result<RunId, StoreError> {
        let id: Uuid = sqlx::query_scalar("INSERT INTO scrape_runs (source_id) VALUES ($1) RETURNING id")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update_run(
        &self,
        run_id: RunId,
        patch: &RunPatch,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE scrape_runs
               SET status = COALESCE($2, status),
                   attempts = COALESCE($3, attempts),
                   successes = COALESCE($4, successes),
                   errors = COALESCE($5, errors),
                   items_inserted = COALESCE($6, items_inserted),
                   mean_latency_ms = COALESCE($7, mean_latency_ms),
                   notes = COALESCE($8, notes),
                   ended_at = $9
             WHERE id = $1
            "#,
        )
        .bind(run_id)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.attempts)
        .bind(patch.successes)
        .bind(patch.errors)
        .bind(patch.items_inserted)
        .bind(patch.mean_latency_ms)
        .bind(patch.notes.as_deref())
        .bind(ended_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MissingRun(run_id));
        }
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_id, started_at, ended_at, status, attempts, successes,
                   errors, items_inserted, mean_latency_ms, notes
              FROM scrape_runs
             ORDER BY started_at DESC
             LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(RunRecord {
                id: row.try_get("id")?,
                source_id: row.try_get("source_id")?,
                started_at: row.try_get("started_at")?,
                ended_at: row.try_get("ended_at")?,
                status: row.try_get("status")?,
                attempts: row.try_get("attempts")?,
                successes: row.try_get("successes")?,
                errors: row.try_get("errors")?,
                items_inserted: row.try_get("items_inserted")?,
                mean_latency_ms: row.try_get("mean_latency_ms")?,
                notes: row.try_get("notes")?,
            });
        }
        Ok(out)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    jobs: BTreeMap<String, JobRow>,
    runs: Vec<RunRecord>,
}

/// In-process store with the same conflict semantics as the Postgres upsert:
/// a batch that names one key twice is rejected as a whole.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    upsert_calls: AtomicUsize,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail with [`StoreError::Unavailable`].
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub fn upsert_calls(&self) -> usize {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub async fn job(&self, stable_key: &str) -> Option<JobRow> {
        self.state.lock().await.jobs.get(stable_key).cloned()
    }

    pub async fn stable_keys(&self) -> Vec<String> {
        self.state.lock().await.jobs.keys().cloned().collect()
    }

    pub async fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().await.runs.clone()
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store rejecting writes".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn upsert_job_rows(&self, rows: &[JobRow]) -> Result<Vec<String>, StoreError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.check_writable()?;

        let mut batch_keys = HashSet::with_capacity(rows.len());
        for row in rows {
            if !batch_keys.insert(row.stable_key.as_str()) {
                return Err(StoreError::Conflict(format!(
                    "stable_key {} would be affected twice in one statement",
                    row.stable_key
                )));
            }
        }

        let mut state = self.state.lock().await;
        for row in rows {
            state.jobs.insert(row.stable_key.clone(), row.clone());
        }
        Ok(rows.iter().map(|r| r.stable_key.clone()).collect())
    }

    async fn count_jobs(&self) -> Result<i64, StoreError> {
        Ok(self.state.lock().await.jobs.len() as i64)
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, source_id: &str) -> Result<RunId, StoreError> {
        self.check_writable()?;
        let id = Uuid::new_v4();
        self.state.lock().await.runs.push(RunRecord {
            id,
            source_id: source_id.to_string(),
            started_at: Utc::now(),
            ended_at: None,
            status: None,
            attempts: None,
            successes: None,
            errors: None,
            items_inserted: None,
            mean_latency_ms: None,
            notes: None,
        });
        Ok(id)
    }

    async fn update_run(
        &self,
        run_id: RunId,
        patch: &RunPatch,
        ended_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut state = self.state.lock().await;
        let record = state
            .runs
            .iter_mut()
            .find(|r| r.id == run_id)
            .ok_or(StoreError::MissingRun(run_id))?;
        if let Some(status) = patch.status {
            record.status = Some(status.as_str().to_string());
        }
        record.attempts = patch.attempts.or(record.attempts);
        record.successes = patch.successes.or(record.successes);
        record.errors = patch.errors.or(record.errors);
        record.items_inserted = patch.items_inserted.or(record.items_inserted);
        record.mean_latency_ms = patch.mean_latency_ms.or(record.mean_latency_ms);
        if let Some(notes) = &patch.notes {
            record.notes = Some(notes.clone());
        }
        record.ended_at = Some(ended_at);
        Ok(())
    }

    async fn recent_runs(&self, limit: i64) -> Result<Vec<RunRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }
}
