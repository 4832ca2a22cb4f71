//! Forecast consumer boundary: the model contract, context extraction and the
//! append-only prediction log.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::normalize::Series;

pub const PREDICTION_LOG_HEADERS: [&str; 2] = ["timestamp", "prediction"];
const PREDICTION_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Frequency class code handed to the model alongside the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrequencyClass {
    High,
    Medium,
    Low,
}

impl FrequencyClass {
    pub fn code(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Medium => 1,
            Self::Low => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "0" | "high" => Some(Self::High),
            "1" | "medium" => Some(Self::Medium),
            "2" | "low" => Some(Self::Low),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastInput {
    pub context: Vec<f32>,
    pub frequency: FrequencyClass,
    pub context_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Forecast {
    Point(f64),
    Horizon(Vec<f32>),
}

impl Forecast {
    pub fn len(&self) -> usize {
        match self {
            Self::Point(_) => 1,
            Self::Horizon(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The next-step prediction, which is what the prediction log records.
    pub fn first(&self) -> Option<f64> {
        match self {
            Self::Point(value) => Some(*value),
            Self::Horizon(values) => values.first().map(|v| *v as f64),
        }
    }
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("insufficient context: {available} observations available, {required} required")]
    InsufficientContext { available: usize, required: usize },
    #[error("model returned {actual} horizon values, expected {expected}")]
    HorizonMismatch { expected: usize, actual: usize },
    #[error("model returned an empty forecast")]
    EmptyForecast,
    #[error("model returned a non-finite prediction")]
    NonFinitePrediction,
    #[error("model failure: {0}")]
    Model(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

/// Anything that turns a context window into a prediction.
pub trait Forecaster {
    fn name(&self) -> &str;

    fn predict(&self, input: &ForecastInput) -> Result<Forecast, ForecastError>;
}

/// Baseline model that carries the last observed value across the horizon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistenceForecaster {
    pub horizon_len: usize,
}

impl Forecaster for PersistenceForecaster {
    fn name(&self) -> &str {
        "persistence"
    }

    fn predict(&self, input: &ForecastInput) -> Result<Forecast, ForecastError> {
        let last = input
            .context
            .last()
            .copied()
            .ok_or(ForecastError::InsufficientContext {
                available: 0,
                required: 1,
            })?;
        Ok(Forecast::Horizon(vec![last; self.horizon_len]))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub timestamp: String,
    pub prediction: f64,
}

/// The most recent `context_len` values of the series as model input.
pub fn latest_context(
    series: &Series,
    context_len: usize,
    frequency: FrequencyClass,
) -> Result<ForecastInput, ForecastError> {
    if context_len == 0 || series.len() < context_len {
        return Err(ForecastError::InsufficientContext {
            available: series.len(),
            required: context_len.max(1),
        });
    }

    let tail = &series.observations()[series.len() - context_len..];
    Ok(ForecastInput {
        context: tail.iter().map(|obs| obs.value as f32).collect(),
        frequency,
        context_end: tail.last().map(|obs| obs.time),
    })
}

pub fn run_forecast(
    model: &dyn Forecaster,
    input: &ForecastInput,
    expected_horizon: Option<usize>,
) -> Result<Forecast, ForecastError> {
    let forecast = model.predict(input)?;

    if forecast.is_empty() {
        return Err(ForecastError::EmptyForecast);
    }
    if let (Forecast::Horizon(values), Some(expected)) = (&forecast, expected_horizon) {
        if values.len() != expected {
            return Err(ForecastError::HorizonMismatch {
                expected,
                actual: values.len(),
            });
        }
    }
    let all_finite = match &forecast {
        Forecast::Point(value) => value.is_finite(),
        Forecast::Horizon(values) => values.iter().all(|v| v.is_finite()),
    };
    if !all_finite {
        return Err(ForecastError::NonFinitePrediction);
    }

    info!(
        component = "forecast",
        event = "forecast.predicted",
        model = model.name(),
        context_len = input.context.len(),
        frequency = input.frequency.code(),
        horizon_len = forecast.len(),
        first = forecast.first().unwrap_or(f64::NAN)
    );

    Ok(forecast)
}

/// Appends one `(timestamp, prediction)` row, writing the header only when the
/// log is created. Returns whether the header was written.
pub fn append_prediction(
    path: &Path,
    timestamp: DateTime<Utc>,
    prediction: f64,
) -> Result<bool, ForecastError> {
    let is_new = fs::metadata(path).map(|meta| meta.len() == 0).unwrap_or(true);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(file);
    if is_new {
        writer.write_record(PREDICTION_LOG_HEADERS)?;
    }
    writer.write_record([
        timestamp.format(PREDICTION_TIMESTAMP_FORMAT).to_string(),
        prediction.to_string(),
    ])?;
    writer.flush()?;

    info!(
        component = "forecast",
        event = "forecast.logged",
        path = %path.display(),
        header_written = is_new,
        prediction = prediction
    );

    Ok(is_new)
}

pub fn read_prediction_log(path: &Path) -> Result<Vec<PredictionRecord>, ForecastError> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut out = Vec::new();
    for record in reader.deserialize() {
        out.push(record?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::{normalize_observations, NormalizeConfig, Observation};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::tempdir;

    fn series_of(values: &[f64]) -> Series {
        let start = Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap();
        let observations = values
            .iter()
            .enumerate()
            .map(|(i, v)| Observation::new(start + ChronoDuration::minutes(6 * i as i64), *v))
            .collect();
        normalize_observations(observations, &NormalizeConfig::default()).0
    }

    struct FixedModel(Forecast);

    impl Forecaster for FixedModel {
        fn name(&self) -> &str {
            "fixed"
        }

        fn predict(&self, _input: &ForecastInput) -> Result<Forecast, ForecastError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn latest_context_takes_tail_of_series() {
        let series = series_of(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let input = latest_context(&series, 3, FrequencyClass::High).unwrap();
        assert_eq!(input.context, vec![3.0, 4.0, 5.0]);
        assert_eq!(input.context_end, series.last_time());

        let err = latest_context(&series, 6, FrequencyClass::High).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InsufficientContext {
                available: 5,
                required: 6
            }
        ));
    }

    #[test]
    fn persistence_model_repeats_last_value() {
        let series = series_of(&[0.4, 0.7]);
        let input = latest_context(&series, 2, FrequencyClass::Medium).unwrap();
        let model = PersistenceForecaster { horizon_len: 3 };

        let forecast = run_forecast(&model, &input, Some(3)).unwrap();
        assert_eq!(forecast, Forecast::Horizon(vec![0.7, 0.7, 0.7]));
        assert!((forecast.first().unwrap() - 0.7_f32 as f64).abs() < 1e-12);
    }

    #[test]
    fn run_forecast_validates_model_output() {
        let input = ForecastInput {
            context: vec![1.0],
            frequency: FrequencyClass::Low,
            context_end: None,
        };

        let short = FixedModel(Forecast::Horizon(vec![1.0, 2.0]));
        assert!(matches!(
            run_forecast(&short, &input, Some(3)),
            Err(ForecastError::HorizonMismatch {
                expected: 3,
                actual: 2
            })
        ));

        let empty = FixedModel(Forecast::Horizon(Vec::new()));
        assert!(matches!(
            run_forecast(&empty, &input, None),
            Err(ForecastError::EmptyForecast)
        ));

        let nan = FixedModel(Forecast::Point(f64::NAN));
        assert!(matches!(
            run_forecast(&nan, &input, Some(3)),
            Err(ForecastError::NonFinitePrediction)
        ));

        let point = FixedModel(Forecast::Point(1.5));
        assert_eq!(run_forecast(&point, &input, Some(3)).unwrap(), Forecast::Point(1.5));
    }

    #[test]
    fn prediction_log_writes_header_once() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("predictions.csv");
        let t0 = Utc.with_ymd_and_hms(2025, 7, 4, 12, 0, 0).unwrap();

        assert!(append_prediction(&path, t0, 1.25).unwrap());
        assert!(!append_prediction(&path, t0 + ChronoDuration::hours(1), 1.5).unwrap());

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(
            text,
            "timestamp,prediction\n2025-07-04T12:00:00Z,1.25\n2025-07-04T13:00:00Z,1.5\n"
        );

        let records = read_prediction_log(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].prediction, 1.5);
    }

    #[test]
    fn frequency_class_codes_round_trip_from_text() {
        assert_eq!(FrequencyClass::parse("HIGH"), Some(FrequencyClass::High));
        assert_eq!(FrequencyClass::parse("2"), Some(FrequencyClass::Low));
        assert_eq!(FrequencyClass::parse("hourly"), None);
        assert_eq!(FrequencyClass::Medium.code(), 1);
    }
}
