//! Paginated observation fetching from the SensorThings observation endpoint.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::normalize::{normalize_before, NormalizeConfig, NormalizeReport, Series};

pub const DEFAULT_OBSERVATIONS_URL: &str =
    "https://api.sealevelsensors.org/v1.0/Datastreams(262)/Observations";
const API_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorApiConfig {
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_pages: usize,
}

impl Default for SensorApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_OBSERVATIONS_URL.to_string(),
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
            max_pages: 10_000,
        }
    }
}

/// One observation record as delivered by the API, before timestamp parsing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawObservation {
    pub time: Option<String>,
    pub value: Option<f64>,
}

impl RawObservation {
    pub fn new(time: impl Into<String>, value: f64) -> Self {
        Self {
            time: Some(time.into()),
            value: Some(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObservationPage {
    pub url: String,
    pub records: Vec<RawObservation>,
    pub next_link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub records: Vec<RawObservation>,
    pub pages: usize,
    pub sub_ranges: Vec<(DateTime<Utc>, DateTime<Utc>)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchedSeries {
    pub series: Series,
    pub normalize_report: NormalizeReport,
    pub pages: usize,
    pub raw_records: usize,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch range: {0}")]
    InvalidRange(String),
    #[error("worker_count must be > 0")]
    InvalidWorkerCount,
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("unexpected HTTP status {status} for {url}")]
    HttpStatus { url: String, status: u16 },
    #[error("malformed observation page from {url}: {message}")]
    MalformedPage { url: String, message: String },
    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last_error: String,
    },
    #[error("pagination starting at {start_url} exceeded {max_pages} pages")]
    PageLimitExceeded { start_url: String, max_pages: usize },
    #[error("pagination cursor revisited {url}")]
    CursorLoop { url: String },
    #[error("fetch cancelled after a sibling worker failed")]
    Cancelled,
    #[error("fetch worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

impl FetchError {
    /// Transport failures, throttling and server-side errors are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::HttpRequest { .. } => true,
            Self::HttpStatus { status, .. } => *status == 429 || (500..600).contains(status),
            _ => false,
        }
    }
}

pub trait HttpFetcher: Send + Sync {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

pub struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    pub fn new(timeout_ms: u64) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| FetchError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| FetchError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

/// Lazy sequence of observation pages following `@iot.nextLink`.
///
/// Every page request is retried according to the config. The cursor stops
/// yielding after the first error, and [`PageCursor::restart`] rewinds it to
/// the initial request.
pub struct PageCursor<'a> {
    fetcher: &'a dyn HttpFetcher,
    cfg: &'a SensorApiConfig,
    start_url: String,
    next_url: Option<String>,
    visited: HashSet<String>,
    pages_fetched: usize,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> PageCursor<'a> {
    pub fn new(
        fetcher: &'a dyn HttpFetcher,
        start_url: impl Into<String>,
        cfg: &'a SensorApiConfig,
    ) -> Self {
        let start_url = start_url.into();
        Self {
            fetcher,
            cfg,
            next_url: Some(start_url.clone()),
            start_url,
            visited: HashSet::new(),
            pages_fetched: 0,
            cancel: None,
        }
    }

    fn with_cancel_flag(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn restart(&mut self) {
        self.next_url = Some(self.start_url.clone());
        self.visited.clear();
        self.pages_fetched = 0;
    }

    pub fn pages_fetched(&self) -> usize {
        self.pages_fetched
    }
}

impl Iterator for PageCursor<'_> {
    type Item = Result<ObservationPage, FetchError>;

    fn next(&mut self) -> Option<Self::Item> {
        let url = self.next_url.take()?;

        if self
            .cancel
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
        {
            return Some(Err(FetchError::Cancelled));
        }
        if self.pages_fetched >= self.cfg.max_pages {
            return Some(Err(FetchError::PageLimitExceeded {
                start_url: self.start_url.clone(),
                max_pages: self.cfg.max_pages,
            }));
        }
        if !self.visited.insert(url.clone()) {
            return Some(Err(FetchError::CursorLoop { url }));
        }

        let fetcher = self.fetcher;
        let page = retry(&url, self.cfg, || fetcher.get_bytes(&url))
            .and_then(|bytes| decode_page(&url, &bytes));

        match page {
            Ok(page) => {
                self.pages_fetched += 1;
                self.next_url = page.next_link.clone();
                debug!(
                    component = "fetcher",
                    event = "fetch.page.received",
                    url = %page.url,
                    records = page.records.len(),
                    has_next = page.next_link.is_some()
                );
                Some(Ok(page))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

pub fn format_api_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(API_TIMESTAMP_FORMAT).to_string()
}

pub fn build_initial_url(base_url: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let separator = if base_url.contains('?') { '&' } else { '?' };
    format!(
        "{base_url}{separator}$orderby=phenomenonTime%20desc&$filter=phenomenonTime%20ge%20{}%20and%20phenomenonTime%20le%20{}",
        format_api_timestamp(start),
        format_api_timestamp(end)
    )
}

/// Splits `[start, end)` into contiguous, non-overlapping sub-ranges of equal
/// millisecond length; the last sub-range absorbs the remainder.
pub fn split_time_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    worker_count: usize,
) -> Result<Vec<(DateTime<Utc>, DateTime<Utc>)>, FetchError> {
    if worker_count == 0 {
        return Err(FetchError::InvalidWorkerCount);
    }
    validate_range(start, end)?;

    let total_ms = (end - start).num_milliseconds();
    if total_ms == 0 {
        return Ok(vec![(start, end)]);
    }

    let workers = (worker_count as i64).min(total_ms);
    let step_ms = total_ms / workers;
    let ranges = (0..workers)
        .map(|idx| {
            let sub_start = start + ChronoDuration::milliseconds(step_ms * idx);
            let sub_end = if idx == workers - 1 {
                end
            } else {
                start + ChronoDuration::milliseconds(step_ms * (idx + 1))
            };
            (sub_start, sub_end)
        })
        .collect();

    Ok(ranges)
}

pub fn fetch_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &SensorApiConfig,
) -> Result<FetchResult, FetchError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    fetch_range_with_fetcher(&fetcher, start, end, cfg)
}

pub fn fetch_range_with_fetcher(
    fetcher: &dyn HttpFetcher,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &SensorApiConfig,
) -> Result<FetchResult, FetchError> {
    validate_range(start, end)?;
    info!(
        component = "fetcher",
        event = "fetch.range.start",
        start = %format_api_timestamp(start),
        end = %format_api_timestamp(end)
    );

    let (records, pages) = fetch_sub_range(fetcher, start, end, cfg, None)?;

    info!(
        component = "fetcher",
        event = "fetch.range.finish",
        pages = pages,
        records = records.len()
    );

    Ok(FetchResult {
        records,
        pages,
        sub_ranges: vec![(start, end)],
    })
}

pub fn fetch_concurrent(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    worker_count: usize,
    cfg: &SensorApiConfig,
) -> Result<FetchResult, FetchError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    fetch_concurrent_with_fetcher(&fetcher, start, end, worker_count, cfg)
}

/// Fans the range out over one scoped worker per sub-range and joins them all
/// before concatenating. A single failing worker fails the whole fetch.
pub fn fetch_concurrent_with_fetcher(
    fetcher: &dyn HttpFetcher,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    worker_count: usize,
    cfg: &SensorApiConfig,
) -> Result<FetchResult, FetchError> {
    let sub_ranges = split_time_range(start, end, worker_count)?;
    info!(
        component = "fetcher",
        event = "fetch.concurrent.start",
        start = %format_api_timestamp(start),
        end = %format_api_timestamp(end),
        workers = sub_ranges.len()
    );

    let cancel = AtomicBool::new(false);
    let outcomes: Vec<Result<(Vec<RawObservation>, usize), FetchError>> = thread::scope(|scope| {
        let handles: Vec<_> = sub_ranges
            .iter()
            .map(|&(sub_start, sub_end)| {
                let cancel = &cancel;
                scope.spawn(move || {
                    let outcome = fetch_sub_range(fetcher, sub_start, sub_end, cfg, Some(cancel));
                    if outcome.is_err() {
                        cancel.store(true, Ordering::SeqCst);
                    }
                    outcome
                })
            })
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(worker, handle)| {
                handle
                    .join()
                    .unwrap_or(Err(FetchError::WorkerPanicked { worker }))
            })
            .collect()
    });

    let mut records = Vec::new();
    let mut pages = 0usize;
    let mut first_error: Option<FetchError> = None;
    for (worker, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            Ok((mut part, part_pages)) => {
                records.append(&mut part);
                pages += part_pages;
            }
            Err(err) => {
                warn!(
                    component = "fetcher",
                    event = "fetch.worker.failed",
                    worker = worker,
                    error = %err
                );
                let replace = match &first_error {
                    None => true,
                    Some(FetchError::Cancelled) => !matches!(err, FetchError::Cancelled),
                    Some(_) => false,
                };
                if replace {
                    first_error = Some(err);
                }
            }
        }
    }

    if let Some(err) = first_error {
        return Err(err);
    }

    info!(
        component = "fetcher",
        event = "fetch.concurrent.finish",
        workers = sub_ranges.len(),
        pages = pages,
        records = records.len()
    );

    Ok(FetchResult {
        records,
        pages,
        sub_ranges,
    })
}

pub fn fetch_series(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    worker_count: usize,
    api_cfg: &SensorApiConfig,
    normalize_cfg: &NormalizeConfig,
) -> Result<FetchedSeries, FetchError> {
    let fetcher = ReqwestBlockingFetcher::new(api_cfg.http_timeout_ms)?;
    fetch_series_with_fetcher(&fetcher, start, end, worker_count, api_cfg, normalize_cfg)
}

/// Fetches `[start, end)` and normalizes it. Records the inclusive API filter
/// returns at exactly `end` are dropped and counted in the normalize report.
pub fn fetch_series_with_fetcher(
    fetcher: &dyn HttpFetcher,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    worker_count: usize,
    api_cfg: &SensorApiConfig,
    normalize_cfg: &NormalizeConfig,
) -> Result<FetchedSeries, FetchError> {
    let fetched = match worker_count {
        0 => return Err(FetchError::InvalidWorkerCount),
        1 => fetch_range_with_fetcher(fetcher, start, end, api_cfg)?,
        _ => fetch_concurrent_with_fetcher(fetcher, start, end, worker_count, api_cfg)?,
    };
    let (series, normalize_report) = normalize_before(&fetched.records, normalize_cfg, end);

    Ok(FetchedSeries {
        series,
        normalize_report,
        pages: fetched.pages,
        raw_records: fetched.records.len(),
    })
}

fn fetch_sub_range(
    fetcher: &dyn HttpFetcher,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    cfg: &SensorApiConfig,
    cancel: Option<&AtomicBool>,
) -> Result<(Vec<RawObservation>, usize), FetchError> {
    let url = build_initial_url(&cfg.base_url, start, end);
    let mut cursor = PageCursor::new(fetcher, url, cfg);
    if let Some(flag) = cancel {
        cursor = cursor.with_cancel_flag(flag);
    }

    let mut records = Vec::new();
    for page in cursor.by_ref() {
        let mut page = page?;
        records.append(&mut page.records);
    }

    Ok((records, cursor.pages_fetched()))
}

fn validate_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<(), FetchError> {
    if end <= start {
        return Err(FetchError::InvalidRange(format!(
            "end {} must be after start {}",
            format_api_timestamp(end),
            format_api_timestamp(start)
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ApiPage {
    #[serde(default)]
    value: Vec<ApiRecord>,
    #[serde(rename = "@iot.nextLink", default)]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiRecord {
    #[serde(rename = "phenomenonTime", default)]
    phenomenon_time: Option<String>,
    #[serde(rename = "resultTime", default)]
    result_time: Option<String>,
    #[serde(default)]
    result: Option<serde_json::Value>,
}

impl ApiRecord {
    fn into_raw(self) -> RawObservation {
        // phenomenonTime may be an ISO interval; its start is the sample time.
        let time = self
            .phenomenon_time
            .map(|raw| match raw.split_once('/') {
                Some((interval_start, _)) => interval_start.to_string(),
                None => raw,
            })
            .or(self.result_time);
        let value = self.result.as_ref().and_then(result_value);
        RawObservation { time, value }
    }
}

fn result_value(raw: &serde_json::Value) -> Option<f64> {
    match raw {
        serde_json::Value::Number(number) => number.as_f64(),
        serde_json::Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn decode_page(url: &str, bytes: &[u8]) -> Result<ObservationPage, FetchError> {
    let page: ApiPage =
        serde_json::from_slice(bytes).map_err(|err| FetchError::MalformedPage {
            url: url.to_string(),
            message: err.to_string(),
        })?;

    Ok(ObservationPage {
        url: url.to_string(),
        records: page.value.into_iter().map(ApiRecord::into_raw).collect(),
        next_link: page.next_link.filter(|link| !link.trim().is_empty()),
    })
}

fn retry<T>(
    url: &str,
    cfg: &SensorApiConfig,
    mut f: impl FnMut() -> Result<T, FetchError>,
) -> Result<T, FetchError> {
    let mut attempt: u32 = 0;
    loop {
        match f() {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(err),
            Err(err) if attempt >= cfg.max_retries => {
                return Err(FetchError::RetriesExhausted {
                    url: url.to_string(),
                    attempts: attempt.saturating_add(1),
                    last_error: err.to_string(),
                });
            }
            Err(err) => {
                attempt = attempt.saturating_add(1);
                let backoff = backoff_duration(cfg.retry_backoff_ms, attempt);
                warn!(
                    component = "fetcher",
                    event = "fetch.page.retry",
                    url = url,
                    attempt = attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err
                );
                thread::sleep(backoff);
            }
        }
    }
}

fn backoff_duration(base_ms: u64, attempt: u32) -> std::time::Duration {
    let shift = attempt.saturating_sub(1).min(10);
    let factor = 1u64 << shift;
    std::time::Duration::from_millis(base_ms.saturating_mul(factor))
}
