//! Series-to-features transform: calendar fields, cyclical encodings, lags and
//! trailing rolling statistics.
//!
//! Column order is fixed: calendar fields, cyclical sin/cos pairs, lags,
//! rolling statistics, then the raw value. Lag and rolling state is kept per
//! gap segment, so no statistic reaches back across a sensor outage.

use std::collections::VecDeque;
use std::f64::consts::PI;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::normalize::Series;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;
pub const VALUE_COLUMN: &str = "value";

const HALF_DAY_MINUTES: u32 = 720;

const CALENDAR_COLUMNS: [(&str, FeatureDType); 14] = [
    ("year", FeatureDType::Int),
    ("month", FeatureDType::Int),
    ("day", FeatureDType::Int),
    ("day_of_week", FeatureDType::Int),
    ("hour", FeatureDType::Int),
    ("minute", FeatureDType::Int),
    ("second", FeatureDType::Int),
    ("day_of_year", FeatureDType::Int),
    ("week_of_year", FeatureDType::Int),
    ("is_weekend", FeatureDType::Flag),
    ("is_month_start", FeatureDType::Flag),
    ("is_month_end", FeatureDType::Flag),
    ("is_quarter_start", FeatureDType::Flag),
    ("is_quarter_end", FeatureDType::Flag),
];

const CYCLICAL_COMPONENTS: [&str; 5] = ["hour", "day_of_week", "month", "day_of_year", "bi_daily"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    Int,
    Flag,
    F64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureGroup {
    Calendar,
    Cyclical,
    Lag,
    Rolling,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
    pub group: FeatureGroup,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub columns: Vec<FeatureColumn>,
}

impl FeatureSchema {
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|column| column.name.as_str()).collect()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }
}

/// One engineered row; `None` marks a feature with insufficient history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureRow {
    pub ts_ms_utc: i64,
    pub values: Vec<Option<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    pub schema: FeatureSchema,
    pub rows: Vec<FeatureRow>,
}

impl FeatureTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.schema.column_index(name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<Option<f64>>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| row.values[idx]).collect())
    }

    pub fn value(&self, row: usize, name: &str) -> Option<f64> {
        let idx = self.column_index(name)?;
        self.rows.get(row).and_then(|row| row.values[idx])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureConfig {
    pub lags: usize,
    pub rolling_window: usize,
    pub schema_version: u32,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            lags: 3,
            rolling_window: 3,
            schema_version: FEATURE_SCHEMA_VERSION,
        }
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("schema error: cannot engineer features from an empty series")]
    EmptySeries,
    #[error("invalid feature config: {0}")]
    InvalidConfig(String),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

/// Trailing values of the current gap segment, current row last.
#[derive(Debug, Clone)]
struct SegmentHistory {
    values: VecDeque<f64>,
    capacity: usize,
}

impl SegmentHistory {
    fn new(capacity: usize) -> Self {
        Self {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn reset(&mut self) {
        self.values.clear();
    }

    fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    fn lag(&self, k: usize) -> Option<f64> {
        if self.values.len() <= k {
            return None;
        }
        Some(self.values[self.values.len() - 1 - k])
    }

    fn trailing(&self, w: usize) -> Option<impl Iterator<Item = f64> + '_> {
        if self.values.len() < w {
            return None;
        }
        Some(self.values.range(self.values.len() - w..).copied())
    }

    fn rolling_mean(&self, w: usize) -> Option<f64> {
        let sum: f64 = self.trailing(w)?.sum();
        Some(sum / w as f64)
    }

    fn rolling_std(&self, w: usize) -> Option<f64> {
        let mean = self.rolling_mean(w)?;
        let sum_sq: f64 = self
            .trailing(w)?
            .map(|v| {
                let d = v - mean;
                d * d
            })
            .sum();
        Some((sum_sq / (w - 1) as f64).sqrt())
    }
}

pub fn build_feature_schema(cfg: &FeatureConfig) -> FeatureSchema {
    let mut columns = Vec::new();

    for (name, dtype) in CALENDAR_COLUMNS {
        columns.push(FeatureColumn {
            name: name.to_string(),
            dtype,
            group: FeatureGroup::Calendar,
        });
    }
    for component in CYCLICAL_COMPONENTS {
        for suffix in ["sin", "cos"] {
            columns.push(FeatureColumn {
                name: format!("{component}_{suffix}"),
                dtype: FeatureDType::F64,
                group: FeatureGroup::Cyclical,
            });
        }
    }
    for k in 1..=cfg.lags {
        columns.push(FeatureColumn {
            name: format!("lag_{k}"),
            dtype: FeatureDType::F64,
            group: FeatureGroup::Lag,
        });
    }
    for stat in ["mean", "std"] {
        columns.push(FeatureColumn {
            name: format!("rolling_{stat}_{}", cfg.rolling_window),
            dtype: FeatureDType::F64,
            group: FeatureGroup::Rolling,
        });
    }
    columns.push(FeatureColumn {
        name: VALUE_COLUMN.to_string(),
        dtype: FeatureDType::F64,
        group: FeatureGroup::Value,
    });

    let fingerprint = schema_fingerprint(cfg, &columns);

    FeatureSchema {
        version: cfg.schema_version,
        fingerprint,
        columns,
    }
}

pub fn engineer(series: &Series) -> Result<FeatureTable, FeatureError> {
    engineer_with_config(series, &FeatureConfig::default())
}

pub fn engineer_with_config(
    series: &Series,
    cfg: &FeatureConfig,
) -> Result<FeatureTable, FeatureError> {
    validate_config(cfg)?;
    if series.is_empty() {
        return Err(FeatureError::EmptySeries);
    }

    let schema = build_feature_schema(cfg);
    info!(
        component = "features",
        event = "features.transform.start",
        input_points = series.len(),
        segments = series.segments().len(),
        column_count = schema.columns.len(),
        fingerprint = %schema.fingerprint
    );

    let mut history = SegmentHistory::new((cfg.lags + 1).max(cfg.rolling_window));
    let mut boundaries = series.gap_boundaries().iter().copied().peekable();
    let mut rows = Vec::with_capacity(series.len());

    for (idx, obs) in series.observations().iter().enumerate() {
        if boundaries.next_if_eq(&idx).is_some() {
            history.reset();
        }
        history.push(obs.value);

        let mut values = Vec::with_capacity(schema.columns.len());
        values.extend(calendar_fields(obs.time).into_iter().map(Some));
        values.extend(cyclical_fields(obs.time).into_iter().map(Some));
        for k in 1..=cfg.lags {
            values.push(history.lag(k));
        }
        values.push(history.rolling_mean(cfg.rolling_window));
        values.push(history.rolling_std(cfg.rolling_window));
        values.push(Some(obs.value));

        rows.push(FeatureRow {
            ts_ms_utc: obs.time.timestamp_millis(),
            values,
        });
    }

    info!(
        component = "features",
        event = "features.transform.finish",
        output_points = rows.len(),
        gap_resets = series.gap_boundaries().len()
    );

    Ok(FeatureTable { schema, rows })
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

fn validate_config(cfg: &FeatureConfig) -> Result<(), FeatureError> {
    if cfg.lags == 0 {
        return Err(FeatureError::InvalidConfig("lags must be > 0".to_string()));
    }
    if cfg.rolling_window < 2 {
        return Err(FeatureError::InvalidConfig(
            "rolling_window must be >= 2 for a sample standard deviation".to_string(),
        ));
    }
    if cfg.schema_version != FEATURE_SCHEMA_VERSION {
        return Err(FeatureError::InvalidConfig(format!(
            "schema_version must equal FEATURE_SCHEMA_VERSION ({FEATURE_SCHEMA_VERSION})"
        )));
    }
    Ok(())
}

fn calendar_fields(ts: DateTime<Utc>) -> [f64; 14] {
    let date = ts.date_naive();
    let month = ts.month();
    let weekday = ts.weekday().num_days_from_monday();
    let month_start = ts.day() == 1;
    let month_end = is_last_day_of_month(date);
    let quarter_start_month = matches!(month, 1 | 4 | 7 | 10);
    let quarter_end_month = matches!(month, 3 | 6 | 9 | 12);

    [
        ts.year() as f64,
        month as f64,
        ts.day() as f64,
        weekday as f64,
        ts.hour() as f64,
        ts.minute() as f64,
        ts.second() as f64,
        ts.ordinal() as f64,
        ts.iso_week().week() as f64,
        flag(weekday >= 5),
        flag(month_start),
        flag(month_end),
        flag(month_start && quarter_start_month),
        flag(month_end && quarter_end_month),
    ]
}

fn cyclical_fields(ts: DateTime<Utc>) -> [f64; 10] {
    let days_in_year = if is_leap_year(ts.year()) { 366.0 } else { 365.0 };
    let minutes_in_cycle = (ts.hour() * 60 + ts.minute()) % HALF_DAY_MINUTES;

    let (hour_sin, hour_cos) = cyclical_pair(ts.hour() as f64, 24.0);
    let (dow_sin, dow_cos) = cyclical_pair(ts.weekday().num_days_from_monday() as f64, 7.0);
    let (month_sin, month_cos) = cyclical_pair(ts.month() as f64, 12.0);
    let (doy_sin, doy_cos) = cyclical_pair(ts.ordinal() as f64, days_in_year);
    let (bi_daily_sin, bi_daily_cos) =
        cyclical_pair(minutes_in_cycle as f64, HALF_DAY_MINUTES as f64);

    [
        hour_sin,
        hour_cos,
        dow_sin,
        dow_cos,
        month_sin,
        month_cos,
        doy_sin,
        doy_cos,
        bi_daily_sin,
        bi_daily_cos,
    ]
}

fn cyclical_pair(component: f64, period: f64) -> (f64, f64) {
    let angle = 2.0 * PI * component / period;
    (angle.sin(), angle.cos())
}

fn flag(on: bool) -> f64 {
    if on {
        1.0
    } else {
        0.0
    }
}

fn is_last_day_of_month(date: NaiveDate) -> bool {
    date.succ_opt()
        .map(|next| next.month() != date.month())
        .unwrap_or(true)
}

fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

fn schema_fingerprint(cfg: &FeatureConfig, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{};", cfg.schema_version));
    hasher.update(format!("lags:{};", cfg.lags));
    hasher.update(format!("rolling_window:{};", cfg.rolling_window));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(format!(":{:?};", column.dtype));
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0)
            .single()
            .expect("valid UTC timestamp expected")
    }

    #[test]
    fn history_lags_and_sample_std() {
        let mut history = SegmentHistory::new(4);
        history.push(2.0);
        assert_eq!(history.lag(1), None);
        assert_eq!(history.rolling_mean(3), None);

        history.push(4.0);
        history.push(9.0);
        assert_eq!(history.lag(1), Some(4.0));
        assert_eq!(history.lag(2), Some(2.0));
        assert_eq!(history.lag(3), None);
        assert_eq!(history.rolling_mean(3), Some(5.0));
        // Sample variance of (2, 4, 9) is (9 + 1 + 16) / 2 = 13.
        assert!((history.rolling_std(3).unwrap() - 13.0_f64.sqrt()).abs() < 1e-12);

        history.reset();
        history.push(1.0);
        assert_eq!(history.lag(1), None);
    }

    #[test]
    fn calendar_fields_cover_boundary_flags() {
        // 2024-03-31 is a Sunday and ends Q1.
        let fields = calendar_fields(at(2024, 3, 31, 23, 45));
        assert_eq!(fields[0], 2024.0);
        assert_eq!(fields[1], 3.0);
        assert_eq!(fields[2], 31.0);
        assert_eq!(fields[3], 6.0);
        assert_eq!(fields[7], 91.0);
        assert_eq!(fields[8], 13.0);
        assert_eq!(&fields[9..], &[1.0, 0.0, 1.0, 0.0, 1.0]);

        // 2025-04-01 is a Tuesday and starts Q2.
        let fields = calendar_fields(at(2025, 4, 1, 0, 0));
        assert_eq!(fields[3], 1.0);
        assert_eq!(&fields[9..], &[0.0, 1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn cyclical_day_of_year_uses_leap_year_period() {
        let leap = cyclical_fields(at(2024, 12, 31, 0, 0));
        let angle = 2.0 * PI * 366.0 / 366.0;
        assert!((leap[6] - angle.sin()).abs() < 1e-12);
        assert!((leap[7] - angle.cos()).abs() < 1e-12);

        let common = cyclical_fields(at(2025, 12, 31, 0, 0));
        assert!((common[7] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn bi_daily_cycle_repeats_every_twelve_hours() {
        let morning = cyclical_fields(at(2025, 5, 5, 3, 15));
        let evening = cyclical_fields(at(2025, 5, 5, 15, 15));
        assert!((morning[8] - evening[8]).abs() < 1e-12);
        assert!((morning[9] - evening[9]).abs() < 1e-12);
        // 195 of 720 minutes into the half-day cycle.
        let angle = 2.0 * PI * 195.0 / 720.0;
        assert!((morning[8] - angle.sin()).abs() < 1e-12);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = FeatureConfig {
            rolling_window: 1,
            ..FeatureConfig::default()
        };
        assert!(matches!(
            validate_config(&cfg),
            Err(FeatureError::InvalidConfig(_))
        ));
        let cfg = FeatureConfig {
            lags: 0,
            ..FeatureConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
    }
}
