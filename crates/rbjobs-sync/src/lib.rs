//! Ingestion orchestration: source registry, EUR enrichment, per-source runs and scheduling.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rbjobs_adapters::{
    adapter_for_source, AdapterContext, AdapterError, AdapterOptions, Crawlability, SourceAdapter,
};
use rbjobs_core::{currency_letters, iso_currency_code, to_eur, NormalizedJob, RatesToEur};
use rbjobs_storage::{
    upsert_jobs, BackoffPolicy, HttpClientConfig, HttpFetcher, JobStore, PgStore, RetryDisposition,
    RunId, RunPatch, RunStatus, RunStore, RunTelemetry,
};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbjobs-sync";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (compatible; RemoteBalkanBot/1.0; +https://remotebalkan.com)";
pub const DEFAULT_FX_BASE_URL: &str = "https://api.exchangerate.host";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub crawlability: Crawlability,
    #[serde(flatten)]
    pub options: AdapterOptions,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let registry: Self = serde_yaml::from_str(text).context("parsing source registry")?;
        let mut seen = BTreeSet::new();
        for source in &registry.sources {
            if !seen.insert(source.source_id.as_str()) {
                bail!("source {} is listed twice", source.source_id);
            }
        }
        Ok(registry)
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    /// Enabled sources, or the one named by `only` regardless of its flag.
    pub fn select(&self, only: Option<&str>) -> Result<Vec<SourceConfig>> {
        match only {
            Some(id) => self
                .sources
                .iter()
                .find(|s| s.source_id == id)
                .cloned()
                .map(|s| vec![s])
                .ok_or_else(|| anyhow!("source {id} is not in the registry")),
            None => Ok(self.sources.iter().filter(|s| s.enabled).cloned().collect()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub fx_enabled: bool,
    pub fx_base_url: String,
    pub source_retries: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            database_url: lookup("DATABASE_URL").filter(|v| !v.trim().is_empty()),
            workspace_root: lookup("RBJOBS_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(".")),
            user_agent: lookup("RBJOBS_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: lookup("RBJOBS_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            fx_enabled: flag(lookup("RBJOBS_FX_ENABLED")),
            fx_base_url: lookup("FX_BASE_URL").unwrap_or_else(|| DEFAULT_FX_BASE_URL.to_string()),
            source_retries: lookup("RBJOBS_SOURCE_RETRIES")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            scheduler_enabled: flag(lookup("RBJOBS_SCHEDULER_ENABLED")),
            sync_cron_1: lookup("RBJOBS_SYNC_CRON_1").unwrap_or_else(|| "0 0 6 * * *".to_string()),
            sync_cron_2: lookup("RBJOBS_SYNC_CRON_2").unwrap_or_else(|| "0 0 18 * * *".to_string()),
        }
    }

    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set")
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::with_retries(self.source_retries)
    }
}

/// Value of one unit of a currency in EUR.
#[async_trait]
pub trait RateSource: Send + Sync {
    async fn rate_to_eur(&self, code: &str) -> Result<f64>;
}

/// `GET <base>/latest?base=<CODE>&symbols=EUR`, reading `rates.EUR`.
pub struct HttpRateSource {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HttpRateSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    pub fn latest_url(&self, code: &str) -> String {
        format!(
            "{}/latest?base={}&symbols=EUR",
            self.base_url.trim_end_matches('/'),
            code
        )
    }
}

pub fn parse_rate_payload(body: &[u8]) -> Result<f64> {
    let value: JsonValue = serde_json::from_slice(body).context("decoding rate payload")?;
    value
        .get("rates")
        .and_then(|rates| rates.get("EUR"))
        .and_then(JsonValue::as_f64)
        .context("rate payload has no numeric rates.EUR")
}

#[async_trait]
impl RateSource for HttpRateSource {
    async fn rate_to_eur(&self, code: &str) -> Result<f64> {
        let resp = self
            .http
            .fetch_bytes(Uuid::new_v4(), "fx", &self.latest_url(code), "application/json")
            .await
            .with_context(|| format!("fetching {code} rate"))?;
        parse_rate_payload(&resp.body)
    }
}

/// One lookup per distinct currency other than EUR; failed lookups are left out.
pub async fn get_rates_to_eur<I, S>(source: &dyn RateSource, codes: I) -> RatesToEur
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let wanted = codes
        .into_iter()
        .map(|c| currency_letters(c.as_ref()))
        .filter(|c| !c.is_empty() && c != "EUR")
        .collect::<BTreeSet<_>>();

    let mut rates = RatesToEur::default();
    for code in wanted {
        match source.rate_to_eur(&code).await {
            Ok(rate) if rate.is_finite() && rate > 0.0 => rates.insert(&code, rate),
            Ok(rate) => debug!(%code, rate, "ignoring non-positive rate"),
            Err(err) => debug!(%code, error = ?err, "rate lookup failed"),
        }
    }
    rates
}

/// Transformation applied to a source's jobs between fetch and upsert.
#[async_trait]
pub trait EnrichmentHook: Send + Sync {
    async fn apply(&self, jobs: Vec<NormalizedJob>) -> Result<Vec<NormalizedJob>>;
}

#[derive(Default)]
pub struct NoopEnrichmentHook;

#[async_trait]
impl EnrichmentHook for NoopEnrichmentHook {
    async fn apply(&self, jobs: Vec<NormalizedJob>) -> Result<Vec<NormalizedJob>> {
        Ok(jobs)
    }
}

/// Fills `salary_min_eur`/`salary_max_eur` using live rates.
pub struct EurEnrichment {
    rates: Arc<dyn RateSource>,
}

impl EurEnrichment {
    pub fn new(rates: Arc<dyn RateSource>) -> Self {
        Self { rates }
    }
}

#[async_trait]
impl EnrichmentHook for EurEnrichment {
    async fn apply(&self, jobs: Vec<NormalizedJob>) -> Result<Vec<NormalizedJob>> {
        let codes = jobs
            .iter()
            .filter(|job| job.has_salary())
            .filter_map(|job| job.salary_currency.as_deref().and_then(iso_currency_code))
            .collect::<BTreeSet<_>>();
        if codes.is_empty() {
            return Ok(jobs);
        }

        let rates = get_rates_to_eur(self.rates.as_ref(), &codes).await;
        debug!(requested = codes.len(), resolved = rates.len(), "resolved eur rates");
        Ok(jobs
            .into_iter()
            .map(|job| {
                let code = job.salary_currency.as_deref().and_then(iso_currency_code);
                let min = to_eur(job.salary_min, code.as_deref(), &rates);
                let max = to_eur(job.salary_max, code.as_deref(), &rates);
                job.with_eur_salary(min, max)
            })
            .collect())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub run_id: RunId,
    pub status: RunStatus,
    pub attempts: usize,
    pub fetched: usize,
    pub inserted: usize,
    pub mean_latency_ms: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sources: Vec<SourceReport>,
}

impl SyncRunSummary {
    pub fn total_inserted(&self) -> usize {
        self.sources.iter().map(|s| s.inserted).sum()
    }

    pub fn failed(&self) -> usize {
        self.sources
            .iter()
            .filter(|s| s.status == RunStatus::Error)
            .count()
    }
}

struct FetchOutcome {
    attempts: usize,
    mean_latency: Duration,
    result: Result<Vec<NormalizedJob>, AdapterError>,
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: Arc<HttpFetcher>,
    jobs: Arc<dyn JobStore>,
    telemetry: RunTelemetry,
    enrichment: Box<dyn EnrichmentHook>,
    backoff: BackoffPolicy,
}

impl SyncPipeline {
    pub fn new(
        config: SyncConfig,
        http: Arc<HttpFetcher>,
        jobs: Arc<dyn JobStore>,
        runs: Arc<dyn RunStore>,
    ) -> Self {
        let backoff = config.backoff_policy();
        Self {
            config,
            http,
            jobs,
            telemetry: RunTelemetry::new(runs),
            enrichment: Box::<NoopEnrichmentHook>::default(),
            backoff,
        }
    }

    /// Postgres store, shared HTTP client and, when enabled, EUR enrichment.
    pub async fn connect(config: SyncConfig) -> Result<Self> {
        let store = Arc::new(PgStore::connect(config.require_database_url()?).await?);
        let http = Arc::new(HttpFetcher::new(config.http_client_config())?);
        let fx = config
            .fx_enabled
            .then(|| HttpRateSource::new(http.clone(), config.fx_base_url.clone()));
        let pipeline = Self::new(config, http, store.clone(), store);
        Ok(match fx {
            Some(rates) => pipeline.with_enrichment(Box::new(EurEnrichment::new(Arc::new(rates)))),
            None => pipeline,
        })
    }

    pub fn with_enrichment(mut self, enrichment: Box<dyn EnrichmentHook>) -> Self {
        self.enrichment = enrichment;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn run_once(&self, only: Option<&str>) -> Result<SyncRunSummary> {
        let registry = SourceRegistry::load(&self.config.registry_path()).await?;
        let sources = registry.select(only)?;
        self.run_sources(&sources).await
    }

    pub async fn run_sources(&self, sources: &[SourceConfig]) -> Result<SyncRunSummary> {
        let mut adapters = Vec::with_capacity(sources.len());
        for source in sources {
            let adapter = adapter_for_source(&source.source_id, &source.options)
                .with_context(|| format!("no adapter registered for {}", source.source_id))?;
            if adapter.crawlability() != source.crawlability {
                warn!(
                    source_id = %source.source_id,
                    configured = ?source.crawlability,
                    actual = ?adapter.crawlability(),
                    "registry crawlability disagrees with adapter"
                );
            }
            adapters.push(adapter);
        }

        let started_at = Utc::now();
        let mut reports = Vec::with_capacity(adapters.len());
        for adapter in &adapters {
            reports.push(self.run_adapter(adapter.as_ref()).await?);
        }
        let summary = SyncRunSummary {
            started_at,
            finished_at: Utc::now(),
            sources: reports,
        };
        info!(
            sources = summary.sources.len(),
            failed = summary.failed(),
            inserted = summary.total_inserted(),
            "sync run finished"
        );
        Ok(summary)
    }

    /// One bracketed run for a single source. Source failures end up in the
    /// report and the run record; only telemetry failures are returned as errors.
    pub async fn run_adapter(&self, adapter: &dyn SourceAdapter) -> Result<SourceReport> {
        let source_id = adapter.source_id();
        let run_id = self
            .telemetry
            .start_run(source_id)
            .await
            .with_context(|| format!("starting run for {source_id}"))?;

        let span = info_span!("source_run", %run_id, source_id);
        let ctx = AdapterContext::new(run_id);
        let fetch = self.fetch_with_retries(adapter, &ctx).instrument(span.clone()).await;
        let fetched = fetch.result.as_ref().map(Vec::len).unwrap_or(0);
        let mean_latency_ms = i64::try_from(fetch.mean_latency.as_millis()).unwrap_or(i64::MAX);

        let outcome = match fetch.result {
            Ok(jobs) => self.store_jobs(jobs).instrument(span.clone()).await,
            Err(err) => Err(anyhow::Error::new(err)),
        };

        let report = match outcome {
            Ok(inserted) => {
                self.telemetry
                    .finish_run(
                        run_id,
                        RunPatch {
                            status: Some(RunStatus::Ok),
                            attempts: Some(fetch.attempts as i32),
                            successes: Some(1),
                            errors: Some(0),
                            items_inserted: Some(inserted as i64),
                            mean_latency_ms: Some(mean_latency_ms),
                            notes: None,
                        },
                    )
                    .await
                    .with_context(|| format!("finishing run for {source_id}"))?;
                span.in_scope(|| info!(fetched, inserted, mean_latency_ms, "source ingested"));
                SourceReport {
                    source_id: source_id.to_string(),
                    run_id,
                    status: RunStatus::Ok,
                    attempts: fetch.attempts,
                    fetched,
                    inserted,
                    mean_latency_ms,
                    error: None,
                }
            }
            Err(err) => {
                let message = format!("{err:#}");
                self.telemetry
                    .finish_run(
                        run_id,
                        RunPatch {
                            status: Some(RunStatus::Error),
                            attempts: Some(fetch.attempts as i32),
                            successes: Some(0),
                            errors: Some(1),
                            notes: Some(message.clone()),
                            ..RunPatch::default()
                        },
                    )
                    .await
                    .with_context(|| format!("recording failed run for {source_id}"))?;
                span.in_scope(|| warn!(error = %message, "source failed"));
                SourceReport {
                    source_id: source_id.to_string(),
                    run_id,
                    status: RunStatus::Error,
                    attempts: fetch.attempts,
                    fetched,
                    inserted: 0,
                    mean_latency_ms,
                    error: Some(message),
                }
            }
        };
        Ok(report)
    }

    async fn fetch_with_retries(&self, adapter: &dyn SourceAdapter, ctx: &AdapterContext) -> FetchOutcome {
        let mut attempt = 0usize;
        let mut total = Duration::ZERO;
        loop {
            let started = Instant::now();
            let result = adapter.fetch_jobs(&self.http, ctx).await;
            total += started.elapsed();
            attempt += 1;

            match result {
                Err(err)
                    if attempt <= self.backoff.max_retries
                        && err.disposition() == RetryDisposition::Retryable =>
                {
                    let delay = self.backoff.delay_for_attempt(attempt - 1);
                    warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying source fetch");
                    tokio::time::sleep(delay).await;
                }
                result => {
                    return FetchOutcome {
                        attempts: attempt,
                        mean_latency: total / attempt as u32,
                        result,
                    }
                }
            }
        }
    }

    async fn store_jobs(&self, jobs: Vec<NormalizedJob>) -> Result<usize> {
        let jobs = self.enrichment.apply(jobs).await.context("enriching jobs")?;
        let summary = upsert_jobs(self.jobs.as_ref(), jobs)
            .await
            .context("upserting jobs")?;
        Ok(summary.inserted)
    }

    /// Cron jobs for both configured schedules, or `None` when scheduling is off.
    /// The caller starts the scheduler.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron, move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    match pipeline.run_once(None).await {
                        Ok(summary) => info!(
                            inserted = summary.total_inserted(),
                            failed = summary.failed(),
                            "scheduled sync finished"
                        ),
                        Err(err) => error!(error = ?err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
