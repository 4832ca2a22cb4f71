//! Environment-driven pipeline configuration.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Duration as ChronoDuration;
use thiserror::Error;

use crate::features::FeatureConfig;
use crate::fetcher::SensorApiConfig;
use crate::forecast::FrequencyClass;
use crate::normalize::NormalizeConfig;

pub const OBSERVATIONS_FILE: &str = "observations.csv";
pub const FEATURES_FILE: &str = "features.csv";
pub const PREDICTIONS_FILE: &str = "predictions.csv";

/// Ten leap years of hourly lookback.
const MAX_LOOKBACK_HOURS: i64 = 87_840;
/// One leap year.
const MAX_GAP_THRESHOLD_SECONDS: i64 = 31_622_400;
const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub api: SensorApiConfig,
    pub normalize: NormalizeConfig,
    pub features: FeatureConfig,
    pub lookback_hours: i64,
    pub workers: usize,
    pub context_len: usize,
    pub horizon_len: usize,
    pub val_frac: f64,
    pub test_frac: f64,
    pub frequency: FrequencyClass,
    pub output_dir: PathBuf,
    /// Historical observation exports the dataset is built from. Empty means
    /// the ingest output in `output_dir`.
    pub history_files: Vec<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            api: SensorApiConfig::default(),
            normalize: NormalizeConfig::default(),
            features: FeatureConfig::default(),
            lookback_hours: 168,
            workers: 4,
            context_len: 512,
            horizon_len: 128,
            val_frac: 0.15,
            test_frac: 0.15,
            frequency: FrequencyClass::High,
            output_dir: PathBuf::from("data"),
            history_files: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// `None` when `lookback_hours` is beyond what a duration can hold.
    pub fn lookback(&self) -> Option<ChronoDuration> {
        ChronoDuration::try_hours(self.lookback_hours)
    }

    pub fn observations_path(&self) -> PathBuf {
        self.output_dir.join(OBSERVATIONS_FILE)
    }

    pub fn features_path(&self) -> PathBuf {
        self.output_dir.join(FEATURES_FILE)
    }

    pub fn predictions_path(&self) -> PathBuf {
        self.output_dir.join(PREDICTIONS_FILE)
    }

    pub fn history_sources(&self) -> Vec<PathBuf> {
        if self.history_files.is_empty() {
            vec![self.observations_path()]
        } else {
            self.history_files.clone()
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

pub fn pipeline_config_from_env() -> Result<PipelineConfig, ConfigError> {
    pipeline_config_from_lookup(|key| env::var(key).ok())
}

/// Builds the config from `TIDECAST_*` keys resolved through `lookup`. Unset or
/// blank keys keep their defaults; anything unparseable is an error.
pub fn pipeline_config_from_lookup(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<PipelineConfig, ConfigError> {
    let mut cfg = PipelineConfig::default();
    let get = |key: &str| {
        lookup(key)
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    };

    if let Some(url) = get("TIDECAST_API_URL") {
        cfg.api.base_url = url;
    }
    if let Some(raw) = get("TIDECAST_HTTP_TIMEOUT_MS") {
        cfg.api.http_timeout_ms = parse_positive("TIDECAST_HTTP_TIMEOUT_MS", &raw)?;
    }
    if let Some(raw) = get("TIDECAST_MAX_RETRIES") {
        cfg.api.max_retries = parse_value("TIDECAST_MAX_RETRIES", &raw)?;
    }
    if let Some(raw) = get("TIDECAST_LOOKBACK_HOURS") {
        cfg.lookback_hours = parse_bounded("TIDECAST_LOOKBACK_HOURS", &raw, MAX_LOOKBACK_HOURS)?;
    }
    if let Some(raw) = get("TIDECAST_WORKERS") {
        cfg.workers = parse_bounded("TIDECAST_WORKERS", &raw, MAX_WORKERS)?;
    }
    if let Some(raw) = get("TIDECAST_GAP_THRESHOLD_SECONDS") {
        cfg.normalize.gap_threshold_seconds = parse_bounded(
            "TIDECAST_GAP_THRESHOLD_SECONDS",
            &raw,
            MAX_GAP_THRESHOLD_SECONDS,
        )?;
    }
    match (get("TIDECAST_PLAUSIBLE_MIN"), get("TIDECAST_PLAUSIBLE_MAX")) {
        (None, None) => {}
        (Some(min_raw), Some(max_raw)) => {
            let min = parse_finite("TIDECAST_PLAUSIBLE_MIN", &min_raw)?;
            let max = parse_finite("TIDECAST_PLAUSIBLE_MAX", &max_raw)?;
            if min >= max {
                return Err(ConfigError::InvalidValue {
                    key: "TIDECAST_PLAUSIBLE_MAX",
                    value: max_raw,
                    reason: format!("must be greater than TIDECAST_PLAUSIBLE_MIN ({min})"),
                });
            }
            cfg.normalize.plausible_range = Some((min, max));
        }
        (Some(raw), None) | (None, Some(raw)) => {
            return Err(ConfigError::InvalidValue {
                key: "TIDECAST_PLAUSIBLE_MIN",
                value: raw,
                reason: "TIDECAST_PLAUSIBLE_MIN and TIDECAST_PLAUSIBLE_MAX must be set together"
                    .to_string(),
            });
        }
    }
    if let Some(raw) = get("TIDECAST_CONTEXT_LEN") {
        cfg.context_len = parse_positive("TIDECAST_CONTEXT_LEN", &raw)?;
    }
    if let Some(raw) = get("TIDECAST_HORIZON_LEN") {
        cfg.horizon_len = parse_positive("TIDECAST_HORIZON_LEN", &raw)?;
    }
    if let Some(raw) = get("TIDECAST_VAL_FRAC") {
        cfg.val_frac = parse_fraction("TIDECAST_VAL_FRAC", &raw)?;
    }
    if let Some(raw) = get("TIDECAST_TEST_FRAC") {
        cfg.test_frac = parse_fraction("TIDECAST_TEST_FRAC", &raw)?;
    }
    if cfg.val_frac + cfg.test_frac >= 1.0 {
        return Err(ConfigError::InvalidValue {
            key: "TIDECAST_TEST_FRAC",
            value: cfg.test_frac.to_string(),
            reason: format!("val_frac + test_frac must be < 1 (val_frac={})", cfg.val_frac),
        });
    }
    if let Some(raw) = get("TIDECAST_FREQUENCY") {
        cfg.frequency =
            FrequencyClass::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
                key: "TIDECAST_FREQUENCY",
                value: raw.clone(),
                reason: "expected high, medium, low or 0-2".to_string(),
            })?;
    }
    if let Some(dir) = get("TIDECAST_OUTPUT_DIR") {
        cfg.output_dir = PathBuf::from(dir);
    }
    if let Some(raw) = get("TIDECAST_HISTORY_FILES") {
        cfg.history_files = raw
            .split(',')
            .map(str::trim)
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .collect();
    }

    Ok(cfg)
}

fn parse_value<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse::<T>().map_err(|err| ConfigError::InvalidValue {
        key,
        value: raw.to_string(),
        reason: err.to_string(),
    })
}

fn parse_positive<T>(key: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let value: T = parse_value(key, raw)?;
    if value <= T::default() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "must be > 0".to_string(),
        });
    }
    Ok(value)
}

fn parse_bounded<T>(key: &'static str, raw: &str, max: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default + std::fmt::Display,
    T::Err: std::fmt::Display,
{
    let value: T = parse_positive(key, raw)?;
    if value > max {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: format!("must be <= {max}"),
        });
    }
    Ok(value)
}

fn parse_finite(key: &'static str, raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = parse_value(key, raw)?;
    if !value.is_finite() {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "must be finite".to_string(),
        });
    }
    Ok(value)
}

fn parse_fraction(key: &'static str, raw: &str) -> Result<f64, ConfigError> {
    let value: f64 = parse_value(key, raw)?;
    if !value.is_finite() || !(0.0..1.0).contains(&value) {
        return Err(ConfigError::InvalidValue {
            key,
            value: raw.to_string(),
            reason: "must be in [0, 1)".to_string(),
        });
    }
    Ok(value)
}
