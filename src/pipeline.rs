//! Stage orchestration shared by the binaries.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConfigError, PipelineConfig};
use crate::features::{engineer_with_config, FeatureError};
use crate::fetcher::{
    fetch_series_with_fetcher, format_api_timestamp, FetchError, FetchedSeries, HttpFetcher,
    ReqwestBlockingFetcher,
};
use crate::forecast::{
    append_prediction, latest_context, run_forecast, Forecast, ForecastError, Forecaster,
};
use crate::normalize::{normalize, NormalizeReport, Series};
use crate::parcels::ParcelError;
use crate::table::{load_observations_csv, write_feature_table, write_observations_csv, TableError};
use crate::windows::{build_split_windows, split, SplitKind, SplitWindows, WindowError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PipelineStage {
    Config,
    Fetch,
    Features,
    Windows,
    Table,
    Forecast,
    Parcels,
}

impl PipelineStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Fetch => "fetch",
            Self::Features => "features",
            Self::Windows => "windows",
            Self::Table => "table",
            Self::Forecast => "forecast",
            Self::Parcels => "parcels",
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Features(#[from] FeatureError),
    #[error(transparent)]
    Windows(#[from] WindowError),
    #[error(transparent)]
    Table(#[from] TableError),
    #[error(transparent)]
    Forecast(#[from] ForecastError),
    #[error(transparent)]
    Parcels(#[from] ParcelError),
}

impl PipelineError {
    pub fn stage(&self) -> PipelineStage {
        match self {
            Self::Config(_) => PipelineStage::Config,
            Self::Fetch(_) => PipelineStage::Fetch,
            Self::Features(_) => PipelineStage::Features,
            Self::Windows(_) => PipelineStage::Windows,
            Self::Table(_) => PipelineStage::Table,
            Self::Forecast(_) => PipelineStage::Forecast,
            Self::Parcels(_) => PipelineStage::Parcels,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub pages: usize,
    pub raw_records: usize,
    pub normalize: NormalizeReport,
    pub feature_rows: usize,
    pub feature_fingerprint: String,
    pub observations_path: PathBuf,
    pub features_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PredictReport {
    pub model: String,
    pub context_end: Option<DateTime<Utc>>,
    pub forecast: Forecast,
    pub logged_at: DateTime<Utc>,
    pub logged_value: f64,
    pub header_written: bool,
    pub predictions_path: PathBuf,
}

#[derive(Debug)]
pub struct DatasetReport {
    pub sources: Vec<PathBuf>,
    /// Sources dropped for lacking a time or reading column.
    pub skipped_sources: Vec<PathBuf>,
    pub normalize: NormalizeReport,
    pub windows: SplitWindows,
}

impl DatasetReport {
    pub fn window_count(&self, kind: SplitKind) -> Option<usize> {
        self.windows.get(kind).as_ref().ok().map(|set| set.len())
    }
}

/// The `[now - lookback, now)` range every scheduled run covers.
pub fn lookback_range(
    cfg: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), ConfigError> {
    let start = cfg
        .lookback()
        .and_then(|lookback| now.checked_sub_signed(lookback))
        .ok_or_else(|| ConfigError::InvalidValue {
            key: "TIDECAST_LOOKBACK_HOURS",
            value: cfg.lookback_hours.to_string(),
            reason: format!("reaches before the earliest representable time from {now}"),
        })?;
    Ok((start, now))
}

pub fn run_ingest(cfg: &PipelineConfig, now: DateTime<Utc>) -> Result<IngestReport, PipelineError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.api.http_timeout_ms)?;
    run_ingest_with_fetcher(&fetcher, cfg, now)
}

/// Fetches the lookback range, then persists the raw series and its feature table.
pub fn run_ingest_with_fetcher(
    fetcher: &dyn HttpFetcher,
    cfg: &PipelineConfig,
    now: DateTime<Utc>,
) -> Result<IngestReport, PipelineError> {
    let (start, end) = lookback_range(cfg, now)?;
    let fetched = fetch_lookback(fetcher, cfg, start, end)?;

    let table = engineer_with_config(&fetched.series, &cfg.features)?;
    let observations_path = cfg.observations_path();
    let features_path = cfg.features_path();
    write_observations_csv(&observations_path, &fetched.series)?;
    write_feature_table(&features_path, &table)?;

    info!(
        component = "pipeline",
        event = "pipeline.ingest.finish",
        start = %format_api_timestamp(start),
        end = %format_api_timestamp(end),
        points = fetched.series.len(),
        feature_rows = table.len()
    );

    Ok(IngestReport {
        start,
        end,
        pages: fetched.pages,
        raw_records: fetched.raw_records,
        normalize: fetched.normalize_report,
        feature_rows: table.len(),
        feature_fingerprint: table.schema.fingerprint.clone(),
        observations_path,
        features_path,
    })
}

pub fn run_predict(
    cfg: &PipelineConfig,
    model: &dyn Forecaster,
    now: DateTime<Utc>,
) -> Result<PredictReport, PipelineError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.api.http_timeout_ms)?;
    run_predict_with_fetcher(&fetcher, cfg, model, now)
}

/// Fetches the lookback range, forecasts from its latest context and appends
/// the next-step prediction to the log stamped with `now`.
pub fn run_predict_with_fetcher(
    fetcher: &dyn HttpFetcher,
    cfg: &PipelineConfig,
    model: &dyn Forecaster,
    now: DateTime<Utc>,
) -> Result<PredictReport, PipelineError> {
    let (start, end) = lookback_range(cfg, now)?;
    let fetched = fetch_lookback(fetcher, cfg, start, end)?;

    let input = latest_context(&fetched.series, cfg.context_len, cfg.frequency)?;
    let forecast = run_forecast(model, &input, Some(cfg.horizon_len))?;
    let logged_value = forecast.first().ok_or(ForecastError::EmptyForecast)?;

    let predictions_path = cfg.predictions_path();
    let header_written = append_prediction(&predictions_path, now, logged_value)?;

    Ok(PredictReport {
        model: model.name().to_string(),
        context_end: input.context_end,
        forecast,
        logged_at: now,
        logged_value,
        header_written,
        predictions_path,
    })
}

/// Loads every history source, normalizes the combined records into one
/// time-ordered series and slices it into split windows.
///
/// A source without a time or reading column is skipped and logged. Any other
/// read failure aborts the build.
pub fn build_dataset(cfg: &PipelineConfig) -> Result<DatasetReport, PipelineError> {
    let mut raw = Vec::new();
    let mut sources = Vec::new();
    let mut skipped_sources = Vec::new();
    for path in cfg.history_sources() {
        match load_observations_csv(&path) {
            Ok(mut records) => {
                raw.append(&mut records);
                sources.push(path);
            }
            Err(err @ TableError::MissingColumn { .. }) => {
                warn!(
                    component = "pipeline",
                    event = "pipeline.dataset.source_skipped",
                    path = %path.display(),
                    error = %err
                );
                skipped_sources.push(path);
            }
            Err(err) => return Err(err.into()),
        }
    }
    if sources.is_empty() {
        return Err(TableError::NoUsableSources {
            skipped: skipped_sources,
        }
        .into());
    }

    let (series, normalize_report) = normalize(&raw, &cfg.normalize);
    let windows = window_series(&series, cfg)?;

    for kind in SplitKind::ALL {
        match windows.get(kind) {
            Ok(set) => info!(
                component = "pipeline",
                event = "pipeline.dataset.split",
                split = kind.as_str(),
                windows = set.len()
            ),
            Err(err) => warn!(
                component = "pipeline",
                event = "pipeline.dataset.split_unavailable",
                split = kind.as_str(),
                error = %err
            ),
        }
    }

    Ok(DatasetReport {
        sources,
        skipped_sources,
        normalize: normalize_report,
        windows,
    })
}

pub fn window_series(series: &Series, cfg: &PipelineConfig) -> Result<SplitWindows, WindowError> {
    let ranges = split(series.len(), cfg.val_frac, cfg.test_frac)?;
    build_split_windows(&series.values_f32(), &ranges, cfg.context_len, cfg.horizon_len)
}

fn fetch_lookback(
    fetcher: &dyn HttpFetcher,
    cfg: &PipelineConfig,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<FetchedSeries, FetchError> {
    fetch_series_with_fetcher(fetcher, start, end, cfg.workers, &cfg.api, &cfg.normalize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_follows_the_wrapped_error() {
        let err: PipelineError = FetchError::InvalidWorkerCount.into();
        assert_eq!(err.stage(), PipelineStage::Fetch);
        assert_eq!(err.stage().as_str(), "fetch");

        let err: PipelineError = FeatureError::EmptySeries.into();
        assert_eq!(err.stage().as_str(), "features");

        let err: PipelineError = ForecastError::EmptyForecast.into();
        assert_eq!(err.stage(), PipelineStage::Forecast);
        assert_eq!(err.to_string(), "model returned an empty forecast");
    }

    #[test]
    fn lookback_past_the_time_range_is_a_config_error() {
        let cfg = PipelineConfig {
            lookback_hours: 10_000_000_000,
            ..PipelineConfig::default()
        };
        let now = DateTime::<Utc>::MIN_UTC;

        let err = lookback_range(&cfg, now).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { key: "TIDECAST_LOOKBACK_HOURS", .. }
        ));

        let cfg = PipelineConfig {
            lookback_hours: 2,
            ..PipelineConfig::default()
        };
        let err = lookback_range(&cfg, now).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));

        let later = now + chrono::Duration::hours(3);
        let (start, end) = lookback_range(&cfg, later).unwrap();
        assert_eq!(end - start, chrono::Duration::hours(2));

        let err: PipelineError = ConfigError::InvalidValue {
            key: "TIDECAST_LOOKBACK_HOURS",
            value: "1".to_string(),
            reason: "r".to_string(),
        }
        .into();
        assert_eq!(err.stage(), PipelineStage::Config);
    }
}
