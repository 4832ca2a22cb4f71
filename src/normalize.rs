//! Series normalization: timestamp parsing, ordering, dedupe and gap marking.

use std::ops::Range;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fetcher::RawObservation;

pub const DEFAULT_GAP_THRESHOLD_SECONDS: i64 = 3_600;

const OFFSET_TIMESTAMP_FORMATS: [&str; 2] = [
    "%Y-%m-%d %H:%M:%S%.f%:z",
    "%Y-%m-%d %H:%M:%S%.f%z",
];
const NAIVE_TIMESTAMP_FORMATS: [&str; 3] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
];

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NormalizeConfig {
    pub gap_threshold_seconds: i64,
    /// Exclusive `(min, max)` bounds for a sensor reading. Readings on or
    /// outside either bound are spikes and get dropped.
    pub plausible_range: Option<(f64, f64)>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            gap_threshold_seconds: DEFAULT_GAP_THRESHOLD_SECONDS,
            plausible_range: None,
        }
    }
}

impl NormalizeConfig {
    fn is_plausible(&self, value: f64) -> bool {
        match self.plausible_range {
            Some((min, max)) => value > min && value < max,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub time: DateTime<Utc>,
    pub value: f64,
}

impl Observation {
    pub fn new(time: DateTime<Utc>, value: f64) -> Self {
        Self { time, value }
    }
}

/// Time-ordered observations with unique timestamps and finite values.
///
/// Only [`normalize`] and [`normalize_observations`] construct a `Series`, so
/// every instance upholds those invariants. Gap boundaries are the indices of
/// observations that follow a delta larger than the configured threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    observations: Vec<Observation>,
    gap_boundaries: Vec<usize>,
    gap_threshold_seconds: i64,
}

impl Series {
    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn values(&self) -> Vec<f64> {
        self.observations.iter().map(|obs| obs.value).collect()
    }

    pub fn values_f32(&self) -> Vec<f32> {
        self.observations.iter().map(|obs| obs.value as f32).collect()
    }

    pub fn gap_boundaries(&self) -> &[usize] {
        &self.gap_boundaries
    }

    pub fn is_gap_boundary(&self, index: usize) -> bool {
        self.gap_boundaries.binary_search(&index).is_ok()
    }

    pub fn gap_threshold_seconds(&self) -> i64 {
        self.gap_threshold_seconds
    }

    /// Index ranges of the contiguous runs between gap boundaries.
    pub fn segments(&self) -> Vec<Range<usize>> {
        let mut out = Vec::with_capacity(self.gap_boundaries.len() + 1);
        let mut start = 0;
        for &boundary in &self.gap_boundaries {
            out.push(start..boundary);
            start = boundary;
        }
        if start < self.observations.len() {
            out.push(start..self.observations.len());
        }
        out
    }

    pub fn first_time(&self) -> Option<DateTime<Utc>> {
        self.observations.first().map(|obs| obs.time)
    }

    pub fn last_time(&self) -> Option<DateTime<Utc>> {
        self.observations.last().map(|obs| obs.time)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeReport {
    pub input_records: u64,
    pub parse_failures: u64,
    pub invalid_values: u64,
    pub implausible_values: u64,
    pub beyond_end: u64,
    pub duplicates_removed: u64,
    pub output_points: u64,
    pub gap_count: u64,
    pub first_parse_failure: Option<String>,
}

/// Parses, orders, dedupes and gap-annotates raw records.
///
/// Records with a missing or unparseable timestamp and records without a
/// finite value are dropped and counted in the report; they never fail the run.
/// So are readings outside `cfg.plausible_range`.
pub fn normalize(raw: &[RawObservation], cfg: &NormalizeConfig) -> (Series, NormalizeReport) {
    normalize_bounded(raw, cfg, None)
}

/// Same as [`normalize`], also dropping records stamped at or after `end`.
///
/// The API filter is inclusive at both ends, so a fetch of `[start, end)`
/// can return a record at exactly `end`.
pub fn normalize_before(
    raw: &[RawObservation],
    cfg: &NormalizeConfig,
    end: DateTime<Utc>,
) -> (Series, NormalizeReport) {
    normalize_bounded(raw, cfg, Some(end))
}

fn normalize_bounded(
    raw: &[RawObservation],
    cfg: &NormalizeConfig,
    end: Option<DateTime<Utc>>,
) -> (Series, NormalizeReport) {
    let mut report = NormalizeReport {
        input_records: raw.len() as u64,
        ..NormalizeReport::default()
    };

    let mut parsed = Vec::with_capacity(raw.len());
    for (idx, record) in raw.iter().enumerate() {
        let Some(time) = record.time.as_deref().and_then(parse_timestamp) else {
            report.parse_failures += 1;
            if report.first_parse_failure.is_none() {
                report.first_parse_failure = Some(format!("record {idx}: {:?}", record.time));
            }
            continue;
        };
        let Some(value) = record.value.filter(|value| value.is_finite()) else {
            report.invalid_values += 1;
            continue;
        };
        if end.map(|end| time >= end).unwrap_or(false) {
            report.beyond_end += 1;
            continue;
        }
        if !cfg.is_plausible(value) {
            report.implausible_values += 1;
            continue;
        }
        parsed.push(Observation { time, value });
    }

    if report.parse_failures > 0 {
        warn!(
            component = "normalize",
            event = "normalize.parse_failures",
            parse_failures = report.parse_failures,
            first_failure = report.first_parse_failure.as_deref().unwrap_or_default()
        );
    }

    let series = build_series(parsed, cfg, &mut report);
    (series, report)
}

/// Same as [`normalize`] for observations that already carry parsed timestamps.
pub fn normalize_observations(
    observations: Vec<Observation>,
    cfg: &NormalizeConfig,
) -> (Series, NormalizeReport) {
    let mut report = NormalizeReport {
        input_records: observations.len() as u64,
        ..NormalizeReport::default()
    };

    let finite: Vec<Observation> = observations
        .into_iter()
        .filter(|obs| obs.value.is_finite())
        .collect();
    report.invalid_values = report.input_records - finite.len() as u64;

    let plausible: Vec<Observation> = finite
        .into_iter()
        .filter(|obs| {
            let keep = cfg.is_plausible(obs.value);
            if !keep {
                report.implausible_values += 1;
            }
            keep
        })
        .collect();

    let series = build_series(plausible, cfg, &mut report);
    (series, report)
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    for format in OFFSET_TIMESTAMP_FORMATS {
        if let Ok(parsed) = DateTime::parse_from_str(trimmed, format) {
            return Some(parsed.with_timezone(&Utc));
        }
    }
    for format in NAIVE_TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    None
}

fn build_series(
    mut observations: Vec<Observation>,
    cfg: &NormalizeConfig,
    report: &mut NormalizeReport,
) -> Series {
    // Stable: equal timestamps keep arrival order, so dedupe keeps the first arrival.
    observations.sort_by_key(|obs| obs.time);

    let mut deduped: Vec<Observation> = Vec::with_capacity(observations.len());
    for obs in observations {
        if deduped
            .last()
            .map(|existing| existing.time == obs.time)
            .unwrap_or(false)
        {
            report.duplicates_removed += 1;
        } else {
            deduped.push(obs);
        }
    }

    // A threshold beyond the representable span can never be exceeded.
    let threshold = ChronoDuration::try_seconds(cfg.gap_threshold_seconds);
    let gap_boundaries: Vec<usize> = match threshold {
        Some(threshold) => (1..deduped.len())
            .filter(|&idx| deduped[idx].time - deduped[idx - 1].time > threshold)
            .collect(),
        None => Vec::new(),
    };

    report.output_points = deduped.len() as u64;
    report.gap_count = gap_boundaries.len() as u64;

    info!(
        component = "normalize",
        event = "normalize.finish",
        input_records = report.input_records,
        output_points = report.output_points,
        parse_failures = report.parse_failures,
        invalid_values = report.invalid_values,
        implausible_values = report.implausible_values,
        beyond_end = report.beyond_end,
        duplicates_removed = report.duplicates_removed,
        gap_count = report.gap_count
    );

    Series {
        observations: deduped,
        gap_boundaries,
        gap_threshold_seconds: cfg.gap_threshold_seconds,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(hour: u32, minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, hour, minute, second)
            .single()
            .expect("valid UTC timestamp expected")
    }

    #[test]
    fn parse_timestamp_accepts_api_and_export_formats() {
        assert_eq!(parse_timestamp("2025-06-01T01:02:03.000Z"), Some(ts(1, 2, 3)));
        assert_eq!(parse_timestamp("2025-06-01T01:02:03Z"), Some(ts(1, 2, 3)));
        assert_eq!(parse_timestamp("2025-06-01T03:02:03+02:00"), Some(ts(1, 2, 3)));
        assert_eq!(parse_timestamp("2025-06-01 01:02:03+00:00"), Some(ts(1, 2, 3)));
        assert_eq!(parse_timestamp("2025-06-01 01:02:03"), Some(ts(1, 2, 3)));
        assert_eq!(
            parse_timestamp(" 2025-06-01T01:02:03.5 "),
            Some(ts(1, 2, 3) + ChronoDuration::milliseconds(500))
        );
        assert_eq!(parse_timestamp("2025-06-01T01:02"), Some(ts(1, 2, 0)));
        assert_eq!(parse_timestamp("not-a-time"), None);
        assert_eq!(parse_timestamp(""), None);
    }

    #[test]
    fn drops_unparseable_and_non_finite_records() {
        let raw = vec![
            RawObservation::new("2025-06-01T00:00:00Z", 1.0),
            RawObservation::new("garbage", 2.0),
            RawObservation {
                time: None,
                value: Some(3.0),
            },
            RawObservation {
                time: Some("2025-06-01T00:06:00Z".to_string()),
                value: None,
            },
            RawObservation::new("2025-06-01T00:12:00Z", f64::NAN),
            RawObservation::new("2025-06-01T00:18:00Z", 4.0),
        ];

        let (series, report) = normalize(&raw, &NormalizeConfig::default());
        assert_eq!(series.len(), 2);
        assert_eq!(report.input_records, 6);
        assert_eq!(report.parse_failures, 2);
        assert_eq!(report.invalid_values, 2);
        assert_eq!(report.output_points, 2);
        assert!(report
            .first_parse_failure
            .as_deref()
            .unwrap()
            .starts_with("record 1"));
    }

    #[test]
    fn sorts_descending_pages_and_keeps_first_duplicate() {
        let raw = vec![
            RawObservation::new("2025-06-01T00:12:00Z", 3.0),
            RawObservation::new("2025-06-01T00:06:00Z", 2.0),
            RawObservation::new("2025-06-01T00:06:00.000Z", 99.0),
            RawObservation::new("2025-06-01T00:00:00Z", 1.0),
        ];

        let (series, report) = normalize(&raw, &NormalizeConfig::default());
        assert_eq!(series.values(), vec![1.0, 2.0, 3.0]);
        assert_eq!(report.duplicates_removed, 1);
        assert!(series.gap_boundaries().is_empty());
    }

    #[test]
    fn marks_second_observation_of_long_delta_as_gap() {
        let observations = vec![
            Observation::new(ts(0, 0, 0), 1.0),
            Observation::new(ts(0, 30, 0), 2.0),
            Observation::new(ts(1, 30, 0), 3.0),
            Observation::new(ts(3, 0, 0), 4.0),
            Observation::new(ts(3, 6, 0), 5.0),
        ];

        let (series, report) = normalize_observations(observations, &NormalizeConfig::default());
        // Exactly one hour is not a gap; 90 minutes is.
        assert_eq!(series.gap_boundaries(), &[3]);
        assert_eq!(report.gap_count, 1);
        assert!(series.is_gap_boundary(3));
        assert!(!series.is_gap_boundary(2));
        assert_eq!(series.segments(), vec![0..3, 3..5]);
    }

    #[test]
    fn records_at_or_after_end_are_dropped_and_counted() {
        let raw = vec![
            RawObservation::new("2025-06-01T01:00:00Z", 3.0),
            RawObservation::new("2025-06-01T00:54:00Z", 2.0),
            RawObservation::new("2025-06-01T00:48:00Z", 1.0),
            RawObservation::new("2025-06-01T01:06:00Z", 4.0),
        ];

        let (series, report) = normalize_before(&raw, &NormalizeConfig::default(), ts(1, 0, 0));
        assert_eq!(series.values(), vec![1.0, 2.0]);
        assert_eq!(series.last_time(), Some(ts(0, 54, 0)));
        assert_eq!(report.beyond_end, 2);
        assert_eq!(report.output_points, 2);

        let (unbounded, report) = normalize(&raw, &NormalizeConfig::default());
        assert_eq!(unbounded.len(), 4);
        assert_eq!(report.beyond_end, 0);
    }

    #[test]
    fn readings_outside_the_plausible_range_are_dropped() {
        let cfg = NormalizeConfig {
            plausible_range: Some((-2.0, 4.0)),
            ..NormalizeConfig::default()
        };
        let raw = vec![
            RawObservation::new("2025-06-01T00:00:00Z", 1.0),
            RawObservation::new("2025-06-01T00:06:00Z", 99.9),
            RawObservation::new("2025-06-01T00:12:00Z", 4.0),
            RawObservation::new("2025-06-01T00:18:00Z", -1.5),
            RawObservation::new("2025-06-01T00:24:00Z", -2.0),
        ];

        let (series, report) = normalize(&raw, &cfg);
        assert_eq!(series.values(), vec![1.0, -1.5]);
        assert_eq!(report.implausible_values, 3);
        assert_eq!(report.invalid_values, 0);

        let observations = vec![
            Observation::new(ts(0, 0, 0), 1.0),
            Observation::new(ts(0, 6, 0), -40.0),
        ];
        let (series, report) = normalize_observations(observations, &cfg);
        assert_eq!(series.len(), 1);
        assert_eq!(report.implausible_values, 1);
    }

    #[test]
    fn unrepresentable_gap_threshold_marks_no_gaps() {
        let cfg = NormalizeConfig {
            gap_threshold_seconds: i64::MAX,
            ..NormalizeConfig::default()
        };
        let observations = vec![
            Observation::new(ts(0, 0, 0), 1.0),
            Observation::new(ts(9, 0, 0), 2.0),
        ];

        let (series, report) = normalize_observations(observations, &cfg);
        assert!(series.gap_boundaries().is_empty());
        assert_eq!(report.gap_count, 0);
        assert_eq!(series.gap_threshold_seconds(), i64::MAX);
    }

    #[test]
    fn empty_input_yields_empty_series() {
        let (series, report) = normalize(&[], &NormalizeConfig::default());
        assert!(series.is_empty());
        assert!(series.segments().is_empty());
        assert_eq!(report.output_points, 0);
        assert_eq!(series.first_time(), None);
    }
}
