#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde_json::json;
use tidecast::{format_api_timestamp, parse_timestamp, FetchError, HttpFetcher};

pub const BASE_URL: &str = "http://sensors.test/v1.0/Datastreams(262)/Observations";

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0)
        .single()
        .expect("valid UTC timestamp expected")
}

/// Observations every `step_minutes` starting at [`t0`].
pub fn regular_observations(count: usize, step_minutes: i64) -> Vec<(DateTime<Utc>, f64)> {
    (0..count)
        .map(|i| {
            (
                t0() + ChronoDuration::minutes(step_minutes * i as i64),
                1.0 + i as f64 * 0.01,
            )
        })
        .collect()
}

/// In-memory stand-in for the observation endpoint. Honors the `ge`/`le`
/// filter, returns newest first and pages with `$skip` next links.
pub struct SensorServer {
    observations: Vec<(DateTime<Utc>, f64)>,
    page_size: usize,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, Vec<FetchError>>>,
}

impl SensorServer {
    pub fn new(observations: Vec<(DateTime<Utc>, f64)>, page_size: usize) -> Self {
        Self {
            observations,
            page_size,
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Queues errors returned for requests whose URL contains `fragment`,
    /// before any successful response.
    pub fn fail_with(&self, fragment: &str, errors: Vec<FetchError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(fragment.to_string(), errors);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn queued_failure(&self, url: &str) -> Option<FetchError> {
        let mut failures = self.failures.lock().unwrap();
        failures
            .iter_mut()
            .find(|(fragment, errors)| url.contains(fragment.as_str()) && !errors.is_empty())
            .map(|(_, errors)| errors.remove(0))
    }
}

impl HttpFetcher for SensorServer {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(err) = self.queued_failure(url) {
            return Err(err);
        }

        let (start, end) = filter_bounds(url);
        let skip = skip_param(url);
        let mut matching: Vec<&(DateTime<Utc>, f64)> = self
            .observations
            .iter()
            .filter(|(time, _)| *time >= start && *time <= end)
            .collect();
        matching.sort_by(|a, b| b.0.cmp(&a.0));

        let value: Vec<_> = matching
            .iter()
            .skip(skip)
            .take(self.page_size)
            .map(|(time, result)| {
                json!({
                    "phenomenonTime": format_api_timestamp(*time),
                    "resultTime": format_api_timestamp(*time),
                    "result": result,
                })
            })
            .collect();

        let mut body = json!({ "value": value });
        if skip + self.page_size < matching.len() {
            let base = url.split("&$skip=").next().unwrap_or(url);
            body["@iot.nextLink"] = json!(format!("{base}&$skip={}", skip + self.page_size));
        }
        Ok(serde_json::to_vec(&body).unwrap())
    }
}

fn filter_bounds(url: &str) -> (DateTime<Utc>, DateTime<Utc>) {
    let after_ge = url.split_once("ge%20").unwrap().1;
    let start = after_ge.split("%20and").next().unwrap();
    let after_le = url.split_once("le%20").unwrap().1;
    let end = after_le.split('&').next().unwrap();
    (parse_timestamp(start).unwrap(), parse_timestamp(end).unwrap())
}

fn skip_param(url: &str) -> usize {
    url.split_once("&$skip=")
        .map(|(_, raw)| raw.parse().unwrap())
        .unwrap_or(0)
}
