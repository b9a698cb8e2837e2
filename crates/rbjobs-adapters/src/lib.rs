//! Source adapter contract plus the RemoteOK, Remotive and We Work Remotely adapters.
//!
//! Every adapter issues a single GET (feed discovery aside) and hands the body
//! to a pure parser, so parsing is exercised against checked-in fixtures.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rbjobs_core::{
    coerce_posted_at, detect_contract_type, detect_experience_level, parse_salary_loose,
    posted_at_from_epoch, stable_key, ContractType, ExperienceLevel, NormalizedJob, PostedAt,
    SalaryRange,
};
use rbjobs_storage::{FetchError, FetchedResponse, HttpFetcher, RetryDisposition};
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "rbjobs-adapters";

pub const DEFAULT_QUERY: &str = "developer";
pub const REMOTEOK_API_URL: &str = "https://remoteok.com/api";
pub const REMOTIVE_API_URL: &str = "https://remotive.com/api/remote-jobs";
pub const WWR_BASE_URL: &str = "https://weworkremotely.com";
pub const SOURCE_IDS: [&str; 3] = ["remoteok", "remotive", "weworkremotely"];

const REMOTIVE_LIMIT: &str = "200";
const JSON_ACCEPT: &str = "application/json";
const RSS_ACCEPT: &str = "application/rss+xml, application/xml;q=0.9, */*;q=0.8";
const HTML_ACCEPT: &str = "text/html,application/xhtml+xml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crawlability {
    Api,
    Rss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

impl FetchedPage {
    fn from_response(resp: FetchedResponse) -> Self {
        Self {
            url: resp.final_url,
            content_type: resp.content_type,
            body: resp.body,
            fetched_at: Utc::now(),
        }
    }
}

/// Per-run values shared by every adapter call. `fetched_at` is the fallback
/// posting time for entries without a usable date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id}: {source}")]
    Fetch {
        source_id: String,
        #[source]
        source: FetchError,
    },
    #[error("{source_id}: malformed payload: {message}")]
    Decode { source_id: String, message: String },
    #[error("{0}")]
    Message(String),
}

impl AdapterError {
    fn decode(source_id: &str, page: &FetchedPage, message: impl fmt::Display) -> Self {
        let message = match page.content_type.as_deref() {
            Some(content_type) => format!("{message} (content-type {content_type})"),
            None => message.to_string(),
        };
        Self::Decode {
            source_id: source_id.to_string(),
            message,
        }
    }

    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Fetch { source, .. } => source.disposition(),
            _ => RetryDisposition::NonRetryable,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WwrCategory {
    #[default]
    Programming,
    Design,
    Marketing,
}

impl WwrCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Programming => "programming",
            Self::Design => "design",
            Self::Marketing => "marketing",
        }
    }

    pub fn page_path(&self) -> String {
        format!("/categories/remote-{}-jobs", self.as_str())
    }

    pub fn feed_url(&self) -> String {
        format!("{WWR_BASE_URL}{}.rss", self.page_path())
    }

    pub fn page_url(&self) -> String {
        format!("{WWR_BASE_URL}{}", self.page_path())
    }
}

impl FromStr for WwrCategory {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "programming" => Ok(Self::Programming),
            "design" => Ok(Self::Design),
            "marketing" => Ok(Self::Marketing),
            other => Err(format!(
                "unknown category {other:?} (expected programming, design or marketing)"
            )),
        }
    }
}

/// Per-source knobs from the source registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterOptions {
    pub query: Option<String>,
    pub category: Option<WwrCategory>,
    pub discover_feed: bool,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &'static str;
    fn source_name(&self) -> &'static str;
    fn crawlability(&self) -> Crawlability;

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError>;

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedJob>, AdapterError>;

    async fn fetch_jobs(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let page = self.fetch_listing(http, ctx).await?;
        let jobs = self.parse_listing(&page, ctx)?;
        info!(
            source_id = self.source_id(),
            count = jobs.len(),
            bytes = page.body.len(),
            "parsed listing"
        );
        Ok(jobs)
    }
}

pub fn adapter_for_source(
    source_id: &str,
    options: &AdapterOptions,
) -> Option<Box<dyn SourceAdapter>> {
    let query = options
        .query
        .clone()
        .unwrap_or_else(|| DEFAULT_QUERY.to_string());
    match source_id {
        "remoteok" => Some(Box::new(RemoteOkAdapter::new(query))),
        "remotive" => Some(Box::new(RemotiveAdapter::new(query))),
        "weworkremotely" => Some(Box::new(WeWorkRemotelyAdapter::new(
            options.category.unwrap_or_default(),
            options.discover_feed,
        ))),
        _ => None,
    }
}

async fn fetch_page(
    http: &HttpFetcher,
    ctx: &AdapterContext,
    source_id: &str,
    url: &str,
    accept: &str,
) -> Result<FetchedPage, AdapterError> {
    let resp = http
        .fetch_bytes(ctx.run_id, source_id, url, accept)
        .await
        .map_err(|source| AdapterError::Fetch {
            source_id: source_id.to_string(),
            source,
        })?;
    Ok(FetchedPage::from_response(resp))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn string_tags(values: Option<&[JsonValue]>) -> Vec<String> {
    values
        .unwrap_or_default()
        .iter()
        .filter_map(JsonValue::as_str)
        .map(ToString::to_string)
        .collect()
}

fn classify(title: &str, labels: &[String]) -> (Option<ContractType>, Option<ExperienceLevel>) {
    let text = std::iter::once(title)
        .chain(labels.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    (
        detect_contract_type(Some(&text)),
        detect_experience_level(Some(&text)),
    )
}

#[derive(Debug, Clone, Deserialize)]
struct RemoteOkEntry {
    id: Option<JsonValue>,
    position: Option<String>,
    company: Option<String>,
    tags: Option<Vec<JsonValue>>,
    salary: Option<String>,
    salary_min: Option<f64>,
    salary_max: Option<f64>,
    apply_url: Option<String>,
    url: Option<String>,
    location: Option<String>,
    date: Option<JsonValue>,
    epoch: Option<i64>,
}

impl RemoteOkEntry {
    fn has_id(&self) -> bool {
        match &self.id {
            Some(JsonValue::String(s)) => !s.is_empty(),
            Some(JsonValue::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
            _ => false,
        }
    }

    fn salary(&self) -> SalaryRange {
        if let Some(text) = non_empty(self.salary.as_deref()) {
            return parse_salary_loose(Some(text));
        }
        let min = self.salary_min.filter(|v| *v > 0.0);
        let max = self.salary_max.filter(|v| *v > 0.0);
        if min.is_none() && max.is_none() {
            return SalaryRange::default();
        }
        SalaryRange {
            min,
            max,
            currency: Some("USD".to_string()),
        }
    }

    fn posted_at(&self, now: DateTime<Utc>) -> PostedAt {
        let from_date = match &self.date {
            Some(JsonValue::String(s)) => Some(coerce_posted_at(Some(s), now)).filter(|p| !p.defaulted),
            Some(JsonValue::Number(n)) => n.as_i64().map(|v| posted_at_from_epoch(v, now)),
            _ => None,
        };
        from_date
            .or_else(|| self.epoch.map(|v| posted_at_from_epoch(v, now)))
            .unwrap_or_else(|| PostedAt::fallback(now))
    }
}

/// `GET https://remoteok.com/api`, filtered client side by keyword.
#[derive(Debug, Clone)]
pub struct RemoteOkAdapter {
    query: String,
}

impl RemoteOkAdapter {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }
}

#[async_trait]
impl SourceAdapter for RemoteOkAdapter {
    fn source_id(&self) -> &'static str {
        "remoteok"
    }

    fn source_name(&self) -> &'static str {
        "Remote OK"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        fetch_page(http, ctx, self.source_id(), REMOTEOK_API_URL, JSON_ACCEPT).await
    }

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let values: Vec<JsonValue> = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::decode(self.source_id(), page, e))?;
        let needle = self.query.to_lowercase();

        let mut jobs = Vec::new();
        for value in values {
            let entry: RemoteOkEntry = match serde_json::from_value(value.clone()) {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(source_id = self.source_id(), error = %err, "skipping malformed entry");
                    continue;
                }
            };
            let Some(position) = non_empty(entry.position.as_deref()).filter(|_| entry.has_id()) else {
                debug!(source_id = self.source_id(), "skipping entry without id or position");
                continue;
            };

            let company = entry.company.clone().unwrap_or_default();
            let tags = string_tags(entry.tags.as_deref());
            let haystack = std::iter::once(position)
                .chain(std::iter::once(company.as_str()))
                .chain(tags.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if !haystack.contains(&needle) {
                continue;
            }

            let apply_url = non_empty(entry.apply_url.as_deref())
                .or_else(|| non_empty(entry.url.as_deref()))
                .unwrap_or_default()
                .to_string();
            let salary = entry.salary();
            let posted = entry.posted_at(ctx.fetched_at);
            let (contract_type, experience_level) = classify(position, &tags);

            jobs.push(NormalizedJob {
                stable_key: stable_key(position, &company, &apply_url, entry.location.as_deref()),
                source_id: self.source_id().to_string(),
                source_name: self.source_name().to_string(),
                title: position.to_string(),
                company,
                location: non_empty(entry.location.as_deref()).map(ToString::to_string),
                remote: true,
                salary_min: salary.min,
                salary_max: salary.max,
                salary_currency: salary.currency,
                salary_min_eur: None,
                salary_max_eur: None,
                contract_type,
                experience_level,
                posted_at: posted.at,
                posted_at_defaulted: posted.defaulted,
                apply_url,
                raw: Some(value),
            });
        }
        Ok(jobs)
    }
}

#[derive(Debug, Deserialize)]
struct RemotiveResponse {
    #[serde(default)]
    jobs: Vec<JsonValue>,
}

#[derive(Debug, Clone, Deserialize)]
struct RemotiveEntry {
    title: Option<String>,
    company_name: Option<String>,
    url: Option<String>,
    candidate_required_location: Option<String>,
    salary: Option<String>,
    publication_date: Option<String>,
    tags: Option<Vec<JsonValue>>,
    job_type: Option<String>,
}

/// `GET /api/remote-jobs?search=<query>&limit=200`.
#[derive(Debug, Clone)]
pub struct RemotiveAdapter {
    query: String,
}

impl RemotiveAdapter {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
        }
    }

    pub fn listing_url(&self) -> Result<String, AdapterError> {
        let url = Url::parse_with_params(
            REMOTIVE_API_URL,
            [("search", self.query.as_str()), ("limit", REMOTIVE_LIMIT)],
        )
        .map_err(|e| AdapterError::Message(format!("building remotive url: {e}")))?;
        Ok(url.to_string())
    }
}

#[async_trait]
impl SourceAdapter for RemotiveAdapter {
    fn source_id(&self) -> &'static str {
        "remotive"
    }

    fn source_name(&self) -> &'static str {
        "Remotive"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Api
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let url = self.listing_url()?;
        fetch_page(http, ctx, self.source_id(), &url, JSON_ACCEPT).await
    }

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let response: RemotiveResponse = serde_json::from_slice(&page.body)
            .map_err(|e| AdapterError::decode(self.source_id(), page, e))?;

        let mut jobs = Vec::with_capacity(response.jobs.len());
        for value in response.jobs {
            let entry: RemotiveEntry = match serde_json::from_value(value.clone()) {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(source_id = self.source_id(), error = %err, "skipping malformed entry");
                    continue;
                }
            };
            let (Some(title), Some(company), Some(url)) = (
                non_empty(entry.title.as_deref()),
                non_empty(entry.company_name.as_deref()),
                non_empty(entry.url.as_deref()),
            ) else {
                debug!(source_id = self.source_id(), "skipping entry without title, company or url");
                continue;
            };

            let mut labels = string_tags(entry.tags.as_deref());
            // job_type arrives as `full_time`, `part_time`, `contract`, ...
            labels.extend(entry.job_type.as_deref().map(|t| t.replace('_', " ")));
            let salary = parse_salary_loose(entry.salary.as_deref());
            let posted = coerce_posted_at(entry.publication_date.as_deref(), ctx.fetched_at);
            let (contract_type, experience_level) = classify(title, &labels);

            jobs.push(NormalizedJob {
                stable_key: stable_key(title, company, url, entry.candidate_required_location.as_deref()),
                source_id: self.source_id().to_string(),
                source_name: self.source_name().to_string(),
                title: title.to_string(),
                company: company.to_string(),
                location: non_empty(entry.candidate_required_location.as_deref()).map(ToString::to_string),
                remote: true,
                salary_min: salary.min,
                salary_max: salary.max,
                salary_currency: salary.currency,
                salary_min_eur: None,
                salary_max_eur: None,
                contract_type,
                experience_level,
                posted_at: posted.at,
                posted_at_defaulted: posted.defaulted,
                apply_url: url.to_string(),
                raw: Some(value),
            });
        }
        Ok(jobs)
    }
}

/// Fields read from an RSS item. The full item is what lands in `raw`.
#[derive(Debug, Clone)]
struct WwrItem {
    title: Option<String>,
    link: Option<String>,
    creator: Option<String>,
    categories: Vec<String>,
    pub_date: Option<String>,
}

impl WwrItem {
    fn from_rss(item: &rss::Item) -> Self {
        let creator = item
            .dublin_core_ext()
            .and_then(|dc| dc.creators().iter().find(|c| !c.trim().is_empty()))
            .map(String::as_str)
            .or_else(|| non_empty(item.author()))
            .map(ToString::to_string);
        Self {
            title: item.title().map(ToString::to_string),
            link: item.link().map(ToString::to_string),
            creator,
            categories: item.categories().iter().map(|c| c.name().to_string()).collect(),
            pub_date: item.pub_date().map(ToString::to_string),
        }
    }
}

fn feed_has_items(body: &[u8]) -> bool {
    rss::Channel::read_from(body)
        .map(|channel| !channel.items().is_empty())
        .unwrap_or(false)
}

/// First `<link type="application/rss+xml" href=…>` in `html`, resolved against `page_url`.
pub fn discover_feed_url(html: &str, page_url: &str) -> Option<String> {
    let selector = Selector::parse(r#"link[type="application/rss+xml"][href]"#).ok()?;
    let document = Html::parse_document(html);
    let href = document
        .select(&selector)
        .filter_map(|node| node.value().attr("href"))
        .find(|href| !href.trim().is_empty())?;
    let base = Url::parse(page_url).ok()?;
    base.join(href.trim()).ok().map(|u| u.to_string())
}

/// Category RSS feed of weworkremotely.com.
#[derive(Debug, Clone)]
pub struct WeWorkRemotelyAdapter {
    category: WwrCategory,
    discover_feed: bool,
    base_url: String,
}

impl WeWorkRemotelyAdapter {
    pub fn new(category: WwrCategory, discover_feed: bool) -> Self {
        Self {
            category,
            discover_feed,
            base_url: WWR_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn feed_url(&self) -> String {
        format!("{}{}.rss", self.base_url, self.category.page_path())
    }

    pub fn page_url(&self) -> String {
        format!("{}{}", self.base_url, self.category.page_path())
    }

    async fn discover(&self, http: &HttpFetcher, ctx: &AdapterContext) -> Option<FetchedPage> {
        let page_url = self.page_url();
        let html = match fetch_page(http, ctx, self.source_id(), &page_url, HTML_ACCEPT).await {
            Ok(page) => page,
            Err(err) => {
                debug!(source_id = self.source_id(), error = %err, "category page unavailable");
                return None;
            }
        };
        let text = String::from_utf8_lossy(&html.body);
        let feed_url = discover_feed_url(&text, &html.url)?;
        debug!(source_id = self.source_id(), %feed_url, "discovered feed");
        match fetch_page(http, ctx, self.source_id(), &feed_url, RSS_ACCEPT).await {
            Ok(feed) if feed_has_items(&feed.body) => Some(feed),
            Ok(_) => None,
            Err(err) => {
                debug!(source_id = self.source_id(), error = %err, "discovered feed unavailable");
                None
            }
        }
    }
}

#[async_trait]
impl SourceAdapter for WeWorkRemotelyAdapter {
    fn source_id(&self) -> &'static str {
        "weworkremotely"
    }

    fn source_name(&self) -> &'static str {
        "We Work Remotely"
    }

    fn crawlability(&self) -> Crawlability {
        Crawlability::Rss
    }

    async fn fetch_listing(
        &self,
        http: &HttpFetcher,
        ctx: &AdapterContext,
    ) -> Result<FetchedPage, AdapterError> {
        let primary = fetch_page(http, ctx, self.source_id(), &self.feed_url(), RSS_ACCEPT).await;
        if !self.discover_feed {
            return primary;
        }
        match primary {
            Ok(page) if feed_has_items(&page.body) => Ok(page),
            Ok(page) => Ok(self.discover(http, ctx).await.unwrap_or(page)),
            Err(err) => self.discover(http, ctx).await.ok_or(err),
        }
    }

    fn parse_listing(
        &self,
        page: &FetchedPage,
        ctx: &AdapterContext,
    ) -> Result<Vec<NormalizedJob>, AdapterError> {
        let channel = rss::Channel::read_from(page.body.as_slice())
            .map_err(|e| AdapterError::decode(self.source_id(), page, e))?;

        let mut jobs = Vec::with_capacity(channel.items().len());
        for item in channel.items() {
            let fields = WwrItem::from_rss(item);
            let (Some(title), Some(link)) = (non_empty(fields.title.as_deref()), non_empty(fields.link.as_deref())) else {
                debug!(source_id = self.source_id(), "skipping item without title or link");
                continue;
            };

            let company = fields.creator.clone().unwrap_or_default();
            let key_location = fields.categories.join(",");
            let posted = coerce_posted_at(fields.pub_date.as_deref(), ctx.fetched_at);
            let (contract_type, experience_level) = classify(title, &fields.categories);

            jobs.push(NormalizedJob {
                stable_key: stable_key(title, &company, link, Some(&key_location)),
                source_id: self.source_id().to_string(),
                source_name: self.source_name().to_string(),
                title: title.to_string(),
                company,
                location: None,
                remote: true,
                salary_min: None,
                salary_max: None,
                salary_currency: None,
                salary_min_eur: None,
                salary_max_eur: None,
                contract_type,
                experience_level,
                posted_at: posted.at,
                posted_at_defaulted: posted.defaulted,
                apply_url: link.to_string(),
                raw: serde_json::to_value(item).ok(),
            });
        }
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;
    use std::path::{Path, PathBuf};

    fn workspace_root() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .canonicalize()
            .expect("workspace root")
    }

    fn fixture_page(relative: &str, url: &str) -> FetchedPage {
        let path = workspace_root().join("fixtures").join(relative);
        FetchedPage {
            url: url.to_string(),
            content_type: None,
            body: fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display())),
            fetched_at: ctx().fetched_at,
        }
    }

    fn ctx() -> AdapterContext {
        AdapterContext {
            run_id: Uuid::nil(),
            fetched_at: Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).single().unwrap(),
        }
    }

    fn ts(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, s).single().unwrap()
    }

    #[test]
    fn remoteok_fixture_filters_by_keyword_and_skips_notice() {
        let adapter = RemoteOkAdapter::new(DEFAULT_QUERY);
        let page = fixture_page("remoteok/sample.json", REMOTEOK_API_URL);
        let jobs = adapter.parse_listing(&page, &ctx()).unwrap();

        let titles = jobs.iter().map(|j| j.title.as_str()).collect::<Vec<_>>();
        assert_eq!(titles, vec!["Senior Rust Developer", "Frontend Developer Internship"]);

        let senior = &jobs[0];
        assert_eq!(senior.source_id, "remoteok");
        assert_eq!(senior.source_name, "Remote OK");
        assert_eq!(senior.apply_url, "https://remoteok.com/remote-jobs/1130001");
        assert_eq!(senior.location.as_deref(), Some("Europe"));
        assert_eq!(senior.salary_min, Some(90000.0));
        assert_eq!(senior.salary_max, Some(120000.0));
        assert_eq!(senior.salary_currency.as_deref(), Some("USD"));
        assert_eq!(senior.contract_type, Some(ContractType::FullTime));
        assert_eq!(senior.experience_level, Some(ExperienceLevel::Senior));
        assert_eq!(senior.posted_at, ts(2026, 2, 24, 8, 0, 0));
        assert!(!senior.posted_at_defaulted);
        assert!(senior.remote);
        assert_eq!(
            senior.stable_key,
            stable_key(
                "Senior Rust Developer",
                "Acme Cloud",
                "https://remoteok.com/remote-jobs/1130001",
                Some("Europe")
            )
        );
        assert_eq!(senior.raw.as_ref().and_then(|r| r.get("id")), Some(&JsonValue::from("1130001")));
    }

    #[test]
    fn remoteok_prefers_salary_text_and_falls_back_to_url_and_epoch() {
        let adapter = RemoteOkAdapter::new(DEFAULT_QUERY);
        let page = fixture_page("remoteok/sample.json", REMOTEOK_API_URL);
        let jobs = adapter.parse_listing(&page, &ctx()).unwrap();
        let intern = &jobs[1];

        assert_eq!(intern.apply_url, "https://remoteok.com/remote-jobs/1130002");
        assert_eq!(intern.location, None);
        assert_eq!(intern.salary_min, Some(30000.0));
        assert_eq!(intern.salary_max, Some(40000.0));
        assert_eq!(intern.salary_currency.as_deref(), Some("€"));
        assert_eq!(intern.contract_type, Some(ContractType::Internship));
        assert_eq!(intern.experience_level, Some(ExperienceLevel::Entry));
        assert_eq!(intern.posted_at, ts(2026, 2, 23, 8, 0, 0));
    }

    #[test]
    fn remoteok_query_matches_tags_and_company() {
        let page = fixture_page("remoteok/sample.json", REMOTEOK_API_URL);
        let by_tag = RemoteOkAdapter::new("SEO").parse_listing(&page, &ctx()).unwrap();
        assert_eq!(by_tag.len(), 1);
        assert_eq!(by_tag[0].company, "Growthly");

        let by_company = RemoteOkAdapter::new("balkan labs").parse_listing(&page, &ctx()).unwrap();
        assert_eq!(by_company.len(), 1);
        assert_eq!(by_company[0].title, "Frontend Developer Internship");
    }

    #[test]
    fn remoteok_rejects_non_array_payload() {
        let page = FetchedPage {
            url: REMOTEOK_API_URL.to_string(),
            content_type: Some("application/json".to_string()),
            body: br#"{"error":"rate limited"}"#.to_vec(),
            fetched_at: ctx().fetched_at,
        };
        let err = RemoteOkAdapter::new(DEFAULT_QUERY)
            .parse_listing(&page, &ctx())
            .unwrap_err();
        assert!(matches!(err, AdapterError::Decode { ref source_id, .. } if source_id == "remoteok"));
    }

    #[test]
    fn remotive_fixture_maps_jobs_and_skips_incomplete_entries() {
        let adapter = RemotiveAdapter::new(DEFAULT_QUERY);
        let page = fixture_page("remotive/sample.json", REMOTIVE_API_URL);
        let jobs = adapter.parse_listing(&page, &ctx()).unwrap();
        assert_eq!(jobs.len(), 3);

        let contract = &jobs[0];
        assert_eq!(contract.title, "Backend Developer (Contract)");
        assert_eq!(contract.company, "Ferrous Systems");
        assert_eq!(contract.location.as_deref(), Some("Europe"));
        assert_eq!(contract.salary_min, Some(50000.0));
        assert_eq!(contract.salary_max, Some(70000.0));
        assert_eq!(contract.salary_currency.as_deref(), Some("$"));
        assert_eq!(contract.contract_type, Some(ContractType::Contract));
        assert_eq!(contract.experience_level, None);
        assert_eq!(contract.posted_at, ts(2026, 2, 20, 10, 11, 12));

        let junior = &jobs[1];
        assert_eq!(junior.experience_level, Some(ExperienceLevel::Entry));
        assert_eq!(junior.contract_type, Some(ContractType::FullTime));
        assert_eq!(junior.salary_min, None);
        assert_eq!(junior.salary_currency, None);
        assert_eq!(junior.posted_at, ctx().fetched_at);
        assert!(junior.posted_at_defaulted);
    }

    #[test]
    fn remotive_job_type_feeds_the_contract_classifier() {
        let adapter = RemotiveAdapter::new(DEFAULT_QUERY);
        let page = fixture_page("remotive/sample.json", REMOTIVE_API_URL);
        let jobs = adapter.parse_listing(&page, &ctx()).unwrap();

        let support = &jobs[2];
        assert_eq!(support.title, "Support Engineer");
        assert_eq!(support.contract_type, Some(ContractType::PartTime));
        assert_eq!(support.location.as_deref(), Some("Serbia"));
        assert_eq!(support.salary_min, Some(1500.0));
        assert_eq!(support.salary_currency.as_deref(), Some("EUR"));
        assert_eq!(
            support.raw.as_ref().and_then(|r| r.get("job_type")),
            Some(&JsonValue::from("part_time"))
        );
    }

    #[test]
    fn remotive_url_encodes_query() {
        let url = RemotiveAdapter::new("rust dev").listing_url().unwrap();
        assert_eq!(url, "https://remotive.com/api/remote-jobs?search=rust+dev&limit=200");
    }

    #[test]
    fn wwr_fixture_reads_creator_categories_and_dates() {
        let adapter = WeWorkRemotelyAdapter::new(WwrCategory::Programming, false);
        let page = fixture_page("weworkremotely/sample.rss", &WwrCategory::Programming.feed_url());
        let jobs = adapter.parse_listing(&page, &ctx()).unwrap();
        assert_eq!(jobs.len(), 2);

        let lead = &jobs[0];
        assert_eq!(lead.title, "Northwind: Lead Platform Engineer");
        assert_eq!(lead.company, "Northwind");
        assert_eq!(lead.location, None);
        assert_eq!(lead.salary_min, None);
        assert_eq!(lead.experience_level, Some(ExperienceLevel::Senior));
        assert_eq!(lead.posted_at, ts(2026, 2, 23, 14, 5, 0));
        assert_eq!(
            lead.stable_key,
            stable_key(
                "Northwind: Lead Platform Engineer",
                "Northwind",
                "https://weworkremotely.com/remote-jobs/northwind-lead-platform-engineer",
                Some("Programming,Full-Stack")
            )
        );

        let raw = lead.raw.as_ref().expect("raw item");
        assert_eq!(
            raw.get("description").and_then(JsonValue::as_str),
            Some("<p>Full job body with salary details</p>")
        );
        assert_eq!(
            raw.pointer("/dublin_core_ext/creators/0").and_then(JsonValue::as_str),
            Some("Northwind")
        );

        let part_time = &jobs[1];
        assert_eq!(part_time.company, "jobs@pixelforge.example");
        assert_eq!(part_time.contract_type, Some(ContractType::PartTime));
        assert!(part_time.posted_at_defaulted);
    }

    #[test]
    fn wwr_rejects_non_rss_body() {
        let page = FetchedPage {
            url: WwrCategory::Design.feed_url(),
            content_type: Some("text/html".to_string()),
            body: b"<html><body>moved</body></html>".to_vec(),
            fetched_at: ctx().fetched_at,
        };
        let err = WeWorkRemotelyAdapter::new(WwrCategory::Design, false)
            .parse_listing(&page, &ctx())
            .unwrap_err();
        assert!(matches!(err, AdapterError::Decode { .. }));
        assert!(err.to_string().contains("content-type text/html"));
    }

    #[test]
    fn feed_discovery_resolves_relative_href() {
        let page = fixture_page("weworkremotely/category.html", &WwrCategory::Programming.page_url());
        let html = String::from_utf8(page.body).unwrap();
        let found = discover_feed_url(&html, &page.url);
        assert_eq!(
            found.as_deref(),
            Some("https://weworkremotely.com/categories/remote-programming-jobs.rss?v=2")
        );
        assert_eq!(discover_feed_url("<html></html>", &page.url), None);
    }

    #[test]
    fn empty_feed_is_detected() {
        let empty = fixture_page("weworkremotely/empty.rss", "");
        let full = fixture_page("weworkremotely/sample.rss", "");
        assert!(!feed_has_items(&empty.body));
        assert!(feed_has_items(&full.body));
        assert!(!feed_has_items(b"not xml"));
    }

    #[test]
    fn category_urls_and_parsing() {
        assert_eq!(
            WwrCategory::Marketing.feed_url(),
            "https://weworkremotely.com/categories/remote-marketing-jobs.rss"
        );
        assert_eq!("Design".parse::<WwrCategory>(), Ok(WwrCategory::Design));
        assert!("sales".parse::<WwrCategory>().is_err());
    }

    #[test]
    fn registry_builds_known_sources_only() {
        let options = AdapterOptions::default();
        for id in SOURCE_IDS {
            let adapter = adapter_for_source(id, &options).expect("known source");
            assert_eq!(adapter.source_id(), id);
        }
        assert_eq!(
            adapter_for_source("weworkremotely", &options).unwrap().crawlability(),
            Crawlability::Rss
        );
        assert!(adapter_for_source("linkedin", &options).is_none());
    }

    #[test]
    fn fetch_errors_keep_their_retry_disposition() {
        let err = AdapterError::Fetch {
            source_id: "remotive".to_string(),
            source: FetchError::HttpStatus {
                status: 502,
                url: REMOTIVE_API_URL.to_string(),
            },
        };
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
        assert!(err.to_string().contains("502"));
        assert_eq!(
            AdapterError::Message("x".to_string()).disposition(),
            RetryDisposition::NonRetryable
        );
    }

    mod discovery {
        use super::*;
        use axum::http::{header, StatusCode};
        use axum::routing::get;
        use axum::Router;
        use rbjobs_storage::HttpClientConfig;
        use std::sync::{Arc, Mutex};
        use tokio::net::TcpListener;

        const FEED_PATH: &str = "/categories/remote-programming-jobs.rss";
        const PAGE_PATH: &str = "/categories/remote-programming-jobs";
        const ALT_FEED_PATH: &str = "/feeds/programming.rss";
        const PAGE_HTML: &str = r#"<html><head>
            <link rel="alternate" type="application/rss+xml" href="/feeds/programming.rss">
            </head><body></body></html>"#;

        #[derive(Clone)]
        struct Reply {
            status: u16,
            content_type: &'static str,
            body: String,
        }

        fn feed_reply(fixture: &str) -> Reply {
            let path = workspace_root().join("fixtures/weworkremotely").join(fixture);
            Reply {
                status: 200,
                content_type: "application/rss+xml",
                body: fs::read_to_string(path).expect("rss fixture"),
            }
        }

        fn html_reply(body: &str) -> Reply {
            Reply {
                status: 200,
                content_type: "text/html",
                body: body.to_string(),
            }
        }

        fn status_reply(code: u16) -> Reply {
            Reply {
                status: code,
                content_type: "text/plain",
                body: String::new(),
            }
        }

        /// Serves `routes` on an ephemeral port; returns the base url and the request log.
        async fn serve(routes: Vec<(&'static str, Reply)>) -> (String, Arc<Mutex<Vec<String>>>) {
            let hits = Arc::new(Mutex::new(Vec::new()));
            let mut app = Router::new();
            for (path, reply) in routes {
                let hits = hits.clone();
                app = app.route(
                    path,
                    get(move || {
                        let hits = hits.clone();
                        let reply = reply.clone();
                        async move {
                            hits.lock().unwrap().push(path.to_string());
                            (
                                StatusCode::from_u16(reply.status).unwrap(),
                                [(header::CONTENT_TYPE, reply.content_type)],
                                reply.body,
                            )
                        }
                    }),
                );
            }
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            tokio::spawn(async move {
                axum::serve(listener, app).await.unwrap();
            });
            (format!("http://{addr}"), hits)
        }

        fn adapter(base_url: &str, discover_feed: bool) -> WeWorkRemotelyAdapter {
            WeWorkRemotelyAdapter::new(WwrCategory::Programming, discover_feed).with_base_url(base_url)
        }

        fn http() -> HttpFetcher {
            HttpFetcher::new(HttpClientConfig::default()).unwrap()
        }

        fn requested(hits: &Mutex<Vec<String>>) -> Vec<String> {
            hits.lock().unwrap().clone()
        }

        #[tokio::test]
        async fn without_discovery_a_failed_feed_is_one_request() {
            let (base, hits) = serve(vec![
                (FEED_PATH, status_reply(503)),
                (PAGE_PATH, html_reply(PAGE_HTML)),
                (ALT_FEED_PATH, feed_reply("sample.rss")),
            ])
            .await;
            let err = adapter(&base, false).fetch_listing(&http(), &ctx()).await.unwrap_err();

            assert!(err.to_string().contains("503"));
            assert_eq!(err.disposition(), RetryDisposition::Retryable);
            assert_eq!(requested(&hits), vec![FEED_PATH]);
        }

        #[tokio::test]
        async fn healthy_feed_skips_discovery() {
            let (base, hits) = serve(vec![
                (FEED_PATH, feed_reply("sample.rss")),
                (PAGE_PATH, html_reply(PAGE_HTML)),
            ])
            .await;
            let page = adapter(&base, true).fetch_listing(&http(), &ctx()).await.unwrap();

            assert!(page.url.ends_with(FEED_PATH));
            assert_eq!(requested(&hits), vec![FEED_PATH]);
        }

        #[tokio::test]
        async fn failed_feed_falls_back_to_discovered_feed() {
            let (base, hits) = serve(vec![
                (FEED_PATH, status_reply(503)),
                (PAGE_PATH, html_reply(PAGE_HTML)),
                (ALT_FEED_PATH, feed_reply("sample.rss")),
            ])
            .await;
            let adapter = adapter(&base, true);
            let page = adapter.fetch_listing(&http(), &ctx()).await.unwrap();

            assert_eq!(page.url, format!("{base}{ALT_FEED_PATH}"));
            assert_eq!(page.content_type.as_deref(), Some("application/rss+xml"));
            assert_eq!(adapter.parse_listing(&page, &ctx()).unwrap().len(), 2);
            assert_eq!(requested(&hits), vec![FEED_PATH, PAGE_PATH, ALT_FEED_PATH]);
        }

        #[tokio::test]
        async fn empty_feed_falls_back_to_discovered_feed() {
            let (base, hits) = serve(vec![
                (FEED_PATH, feed_reply("empty.rss")),
                (PAGE_PATH, html_reply(PAGE_HTML)),
                (ALT_FEED_PATH, feed_reply("sample.rss")),
            ])
            .await;
            let page = adapter(&base, true).fetch_listing(&http(), &ctx()).await.unwrap();

            assert!(page.url.ends_with(ALT_FEED_PATH));
            assert!(feed_has_items(&page.body));
            assert_eq!(requested(&hits), vec![FEED_PATH, PAGE_PATH, ALT_FEED_PATH]);
        }

        #[tokio::test]
        async fn original_error_stands_when_category_page_fails() {
            let (base, hits) = serve(vec![
                (FEED_PATH, status_reply(503)),
                (PAGE_PATH, status_reply(404)),
                (ALT_FEED_PATH, feed_reply("sample.rss")),
            ])
            .await;
            let err = adapter(&base, true).fetch_listing(&http(), &ctx()).await.unwrap_err();

            assert!(matches!(
                err,
                AdapterError::Fetch {
                    source: FetchError::HttpStatus { status: 503, .. },
                    ..
                }
            ));
            assert_eq!(requested(&hits), vec![FEED_PATH, PAGE_PATH]);
        }

        #[tokio::test]
        async fn original_error_stands_when_page_has_no_feed_link() {
            let (base, hits) = serve(vec![
                (FEED_PATH, status_reply(502)),
                (PAGE_PATH, html_reply("<html><head></head></html>")),
            ])
            .await;
            let err = adapter(&base, true).fetch_listing(&http(), &ctx()).await.unwrap_err();

            assert!(err.to_string().contains("502"));
            assert_eq!(requested(&hits), vec![FEED_PATH, PAGE_PATH]);
        }

        #[tokio::test]
        async fn original_page_stands_when_discovered_feed_is_empty() {
            let (base, hits) = serve(vec![
                (FEED_PATH, feed_reply("empty.rss")),
                (PAGE_PATH, html_reply(PAGE_HTML)),
                (ALT_FEED_PATH, feed_reply("empty.rss")),
            ])
            .await;
            let adapter = adapter(&base, true);
            let page = adapter.fetch_listing(&http(), &ctx()).await.unwrap();

            assert!(page.url.ends_with(FEED_PATH));
            assert!(adapter.parse_listing(&page, &ctx()).unwrap().is_empty());
            assert_eq!(requested(&hits), vec![FEED_PATH, PAGE_PATH, ALT_FEED_PATH]);
        }
    }
}
