//! tidecast core crate.
//!
//! Sea-level sensor ingest and dataset preparation:
//! - paginated, concurrent observation fetching with bounded retry
//! - gap-aware series normalization
//! - calendar, cyclical, lag and rolling feature engineering
//! - leakage-free split windowing and the forecast consumer boundary
//! - parcel CSV cleaning

mod config;
mod features;
mod fetcher;
mod forecast;
mod normalize;
mod observability;
mod parcels;
mod pipeline;
mod table;
mod windows;

pub use config::{
    pipeline_config_from_env, pipeline_config_from_lookup, ConfigError, PipelineConfig,
    FEATURES_FILE, OBSERVATIONS_FILE, PREDICTIONS_FILE,
};
pub use features::{
    assert_schema_compatible, build_feature_schema, engineer, engineer_with_config,
    FeatureColumn, FeatureConfig, FeatureDType, FeatureError, FeatureGroup, FeatureRow,
    FeatureSchema, FeatureTable, FEATURE_SCHEMA_VERSION, VALUE_COLUMN,
};
pub use fetcher::{
    build_initial_url, fetch_concurrent, fetch_concurrent_with_fetcher, fetch_range,
    fetch_range_with_fetcher, fetch_series, fetch_series_with_fetcher, format_api_timestamp,
    split_time_range, FetchError, FetchResult, FetchedSeries, HttpFetcher, ObservationPage,
    PageCursor, RawObservation, ReqwestBlockingFetcher, SensorApiConfig,
    DEFAULT_OBSERVATIONS_URL,
};
pub use forecast::{
    append_prediction, latest_context, read_prediction_log, run_forecast, Forecast,
    ForecastError, ForecastInput, Forecaster, FrequencyClass, PersistenceForecaster,
    PredictionRecord, PREDICTION_LOG_HEADERS,
};
pub use normalize::{
    normalize, normalize_before, normalize_observations, parse_timestamp, NormalizeConfig,
    NormalizeReport, Observation, Series, DEFAULT_GAP_THRESHOLD_SECONDS,
};
pub use observability::{
    init_logging, log_app_start, log_pipeline_failure, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use parcels::{
    clean_parcel_files, write_parcels_csv, ParcelCleanConfig, ParcelCleanOutcome, ParcelError,
    ParcelFileReport, ParcelRecord, ParcelSkipReason, ParcelTable, PROPERTY_ADDRESS_COLUMN,
};
pub use pipeline::{
    build_dataset, lookback_range, run_ingest, run_ingest_with_fetcher, run_predict,
    run_predict_with_fetcher, window_series, DatasetReport, IngestReport, PipelineError,
    PipelineStage, PredictReport,
};
pub use table::{
    load_observations_csv, write_feature_table, write_observations_csv, TableError,
    OBSERVATION_HEADERS,
};
pub use windows::{
    build_split_windows, split, windowize, SplitKind, SplitRanges, SplitWindows, WindowError,
    WindowPair, WindowSet, WindowTensors,
};
