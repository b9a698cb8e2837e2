//! Core job model, stable keys and free-text heuristics for rbjobs.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;
use url::Url;

pub const CRATE_NAME: &str = "rbjobs-core";

/// Length of the hex prefix kept from the SHA-256 digest.
pub const STABLE_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContractType {
    Internship,
    Contract,
    Freelance,
    PartTime,
    FullTime,
}

impl ContractType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Internship => "internship",
            Self::Contract => "contract",
            Self::Freelance => "freelance",
            Self::PartTime => "part-time",
            Self::FullTime => "full-time",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExperienceLevel {
    Senior,
    Entry,
    Mid,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Senior => "senior",
            Self::Entry => "entry",
            Self::Mid => "mid",
        }
    }
}

/// Canonical in-flight job record produced by source adapters.
///
/// Built once per ingestion run and handed to the upsert writer by value.
/// Enrichment consumes a job and returns a new one; nothing mutates a job
/// in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedJob {
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
    pub contract_type: Option<ContractType>,
    pub experience_level: Option<ExperienceLevel>,
    pub posted_at: DateTime<Utc>,
    pub posted_at_defaulted: bool,
    pub apply_url: String,
    pub raw: Option<JsonValue>,
}

impl NormalizedJob {
    pub fn with_eur_salary(self, salary_min_eur: Option<f64>, salary_max_eur: Option<f64>) -> Self {
        Self {
            salary_min_eur,
            salary_max_eur,
            ..self
        }
    }

    pub fn has_salary(&self) -> bool {
        self.salary_min.is_some() || self.salary_max.is_some()
    }
}

/// Lowercase, NFKD-decompose, collapse every run of non-word characters to a
/// single space and trim. Word characters are ASCII `[A-Za-z0-9_]`, so
/// combining marks left by the decomposition act as separators.
pub fn normalize_key_fragment(input: &str) -> String {
    let decomposed = input.to_lowercase().nfkd().collect::<String>();
    decomposed
        .split(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Host of `url` without a leading `www.`; the raw string when it does not parse.
/// A URL that parses without a host (`mailto:`) yields an empty host.
pub fn canonical_host(url: &str) -> String {
    match Url::parse(url) {
        Ok(parsed) => {
            let host = parsed.host_str().unwrap_or_default();
            host.strip_prefix("www.").unwrap_or(host).to_string()
        }
        Err(_) => url.to_string(),
    }
}

pub fn stable_key(title: &str, company: &str, url: &str, location: Option<&str>) -> String {
    let payload = [
        normalize_key_fragment(title),
        normalize_key_fragment(company),
        canonical_host(url),
        normalize_key_fragment(location.unwrap_or_default()),
    ]
    .join("|");
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    let mut key = hex::encode(hasher.finalize());
    key.truncate(STABLE_KEY_LEN);
    key
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalaryRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub currency: Option<String>,
}

impl SalaryRange {
    pub fn is_empty(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }
}

// Alternation order matters only for tokens starting at the same position.
const CURRENCY_TOKENS: [&str; 6] = ["€", "eur", "rsd", "usd", "$", "£"];

fn detect_currency(text: &str) -> Option<String> {
    for (idx, _) in text.char_indices() {
        let rest = &text[idx..];
        for token in CURRENCY_TOKENS {
            if rest
                .get(..token.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(token))
            {
                return Some(token.to_uppercase());
            }
        }
    }
    None
}

/// Digit runs with their inner `.`/`,` separators; trailing separators are punctuation.
fn numeric_tokens(text: &str) -> Vec<String> {
    fn flush(current: &mut String, out: &mut Vec<String>) {
        let token = current.trim_end_matches(|c| c == '.' || c == ',');
        if !token.is_empty() {
            out.push(token.to_string());
        }
        current.clear();
    }

    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() || (!current.is_empty() && (ch == '.' || ch == ',')) {
            current.push(ch);
            continue;
        }
        flush(&mut current, &mut out);
    }
    flush(&mut current, &mut out);
    out
}

/// Drop `.`/`,` separators that precede exactly one group of three digits.
fn strip_thousands_separators(token: &str) -> String {
    let chars = token.chars().collect::<Vec<_>>();
    let mut out = String::with_capacity(token.len());
    for (idx, ch) in chars.iter().enumerate() {
        if *ch == '.' || *ch == ',' {
            let group = chars.get(idx + 1..idx + 4);
            let after = chars.get(idx + 4);
            let is_separator = group.is_some_and(|g| g.iter().all(char::is_ascii_digit))
                && !after.is_some_and(char::is_ascii_digit);
            if is_separator {
                continue;
            }
        }
        out.push(*ch);
    }
    out
}

pub fn parse_salary_loose(input: Option<&str>) -> SalaryRange {
    let Some(text) = input.filter(|s| !s.is_empty()) else {
        return SalaryRange::default();
    };
    let currency = detect_currency(text);
    let numbers = numeric_tokens(text)
        .iter()
        .filter_map(|token| strip_thousands_separators(token).parse::<f64>().ok())
        .filter(|n| n.is_finite())
        .collect::<Vec<_>>();

    match numbers.as_slice() {
        [] => SalaryRange {
            min: None,
            max: None,
            currency,
        },
        [only] => SalaryRange {
            min: Some(*only),
            max: Some(*only),
            currency,
        },
        [a, b, ..] => SalaryRange {
            min: Some(a.min(*b)),
            max: Some(a.max(*b)),
            currency,
        },
    }
}

pub fn detect_contract_type(input: Option<&str>) -> Option<ContractType> {
    let normalized = input?.to_lowercase();
    let kind = if normalized.contains("intern") {
        ContractType::Internship
    } else if normalized.contains("contract") {
        ContractType::Contract
    } else if normalized.contains("freelance") || normalized.contains("gig") {
        ContractType::Freelance
    } else if normalized.contains("part-time") || normalized.contains("part time") {
        ContractType::PartTime
    } else {
        ContractType::FullTime
    };
    Some(kind)
}

pub fn detect_experience_level(input: Option<&str>) -> Option<ExperienceLevel> {
    let normalized = input?.to_lowercase();
    if normalized.contains("senior") || normalized.contains("lead") {
        Some(ExperienceLevel::Senior)
    } else if normalized.contains("junior") || normalized.contains("intern") {
        Some(ExperienceLevel::Entry)
    } else if normalized.contains("mid") || normalized.contains("intermediate") {
        Some(ExperienceLevel::Mid)
    } else {
        None
    }
}

/// Posting timestamp plus whether it came from the ingestion-time fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostedAt {
    pub at: DateTime<Utc>,
    pub defaulted: bool,
}

impl PostedAt {
    pub fn parsed(at: DateTime<Utc>) -> Self {
        Self { at, defaulted: false }
    }

    pub fn fallback(now: DateTime<Utc>) -> Self {
        Self {
            at: now,
            defaulted: true,
        }
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

pub fn coerce_posted_at(value: Option<&str>, now: DateTime<Utc>) -> PostedAt {
    value
        .and_then(parse_timestamp)
        .map(PostedAt::parsed)
        .unwrap_or_else(|| PostedAt::fallback(now))
}

/// Epoch seconds, or milliseconds when the magnitude only makes sense as such.
pub fn posted_at_from_epoch(value: i64, now: DateTime<Utc>) -> PostedAt {
    let parsed = if value.unsigned_abs() > 100_000_000_000 {
        DateTime::from_timestamp_millis(value)
    } else {
        DateTime::from_timestamp(value, 0)
    };
    parsed
        .map(PostedAt::parsed)
        .unwrap_or_else(|| PostedAt::fallback(now))
}

/// `code -> value of one unit in EUR`. EUR is always present at exactly 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatesToEur {
    rates: BTreeMap<String, f64>,
}

impl Default for RatesToEur {
    fn default() -> Self {
        let mut rates = BTreeMap::new();
        rates.insert("EUR".to_string(), 1.0);
        Self { rates }
    }
}

impl RatesToEur {
    pub fn insert(&mut self, code: &str, rate: f64) {
        let code = currency_letters(code);
        if code.is_empty() || code == "EUR" {
            return;
        }
        self.rates.insert(code, rate);
    }

    pub fn get(&self, code: &str) -> Option<f64> {
        self.rates.get(code).copied()
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.rates.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl<S: AsRef<str>> FromIterator<(S, f64)> for RatesToEur {
    fn from_iter<I: IntoIterator<Item = (S, f64)>>(iter: I) -> Self {
        let mut rates = Self::default();
        for (code, rate) in iter {
            rates.insert(code.as_ref(), rate);
        }
        rates
    }
}

/// ASCII letters of `code`, uppercased.
pub fn currency_letters(code: &str) -> String {
    code.chars()
        .filter(char::is_ascii_alphabetic)
        .collect::<String>()
        .to_ascii_uppercase()
}

/// ISO code for a salary currency as emitted by [`parse_salary_loose`].
pub fn iso_currency_code(currency: &str) -> Option<String> {
    match currency.trim() {
        "€" => Some("EUR".to_string()),
        "$" => Some("USD".to_string()),
        "£" => Some("GBP".to_string()),
        other => {
            let letters = currency_letters(other);
            if letters.is_empty() {
                None
            } else {
                Some(letters)
            }
        }
    }
}

pub fn to_eur(amount: Option<f64>, currency: Option<&str>, rates: &RatesToEur) -> Option<f64> {
    let amount = amount.filter(|a| a.is_finite() && *a != 0.0)?;
    let currency = currency.filter(|c| !c.is_empty())?;
    let rate = rates.get(&currency_letters(currency))?;
    Some((amount * rate * 100.0).round() / 100.0)
}
