//! CSV persistence for raw observations and engineered feature tables.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use csv::StringRecord;
use thiserror::Error;
use tracing::{info, warn};

use crate::features::{FeatureDType, FeatureTable};
use crate::fetcher::{format_api_timestamp, RawObservation};
use crate::normalize::Series;

pub const OBSERVATION_HEADERS: [&str; 2] = ["time", "result"];

const TIME_COLUMN_CANDIDATES: [&str; 3] = ["time", "phenomenonTime", "resultTime"];
const VALUE_COLUMN_CANDIDATES: [&str; 3] = ["result", "reading", "value"];

#[derive(Debug, Error)]
pub enum TableError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("schema error: {path} has no {column} column")]
    MissingColumn { path: PathBuf, column: String },
    #[error("invalid output path: {0}")]
    InvalidPath(PathBuf),
    #[error("no usable observation sources: all {} failed the schema check", skipped.len())]
    NoUsableSources { skipped: Vec<PathBuf> },
}

/// Reads a historical observation export. Any of `time`, `phenomenonTime` or
/// `resultTime` names the time axis; `result`, `reading` or `value` the reading.
///
/// A row that is not valid UTF-8 loads with neither time nor reading, so the
/// normalizer counts it as a parse failure instead of the whole file failing.
pub fn load_observations_csv(path: &Path) -> Result<Vec<RawObservation>, TableError> {
    let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let time_idx = find_column(&headers, &TIME_COLUMN_CANDIDATES).ok_or_else(|| {
        TableError::MissingColumn {
            path: path.to_path_buf(),
            column: TIME_COLUMN_CANDIDATES.join("|"),
        }
    })?;
    let value_idx = find_column(&headers, &VALUE_COLUMN_CANDIDATES).ok_or_else(|| {
        TableError::MissingColumn {
            path: path.to_path_buf(),
            column: VALUE_COLUMN_CANDIDATES.join("|"),
        }
    })?;

    let mut out = Vec::new();
    let mut undecodable = 0usize;
    for record in reader.byte_records() {
        let record = record?;
        match StringRecord::from_byte_record(record) {
            Ok(record) => out.push(raw_from_record(&record, time_idx, value_idx)),
            Err(_) => {
                undecodable += 1;
                out.push(RawObservation {
                    time: None,
                    value: None,
                });
            }
        }
    }

    if undecodable > 0 {
        warn!(
            component = "table",
            event = "table.observations.undecodable_rows",
            path = %path.display(),
            rows = undecodable
        );
    }
    info!(
        component = "table",
        event = "table.observations.loaded",
        path = %path.display(),
        records = out.len()
    );

    Ok(out)
}

pub fn write_observations_csv(path: &Path, series: &Series) -> Result<(), TableError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(OBSERVATION_HEADERS)?;
    for obs in series.observations() {
        writer.write_record([format_api_timestamp(obs.time), obs.value.to_string()])?;
    }

    let bytes = finish(writer)?;
    write_atomic(path, &bytes)?;
    info!(
        component = "table",
        event = "table.observations.written",
        path = %path.display(),
        rows = series.len()
    );
    Ok(())
}

/// Writes exactly the schema columns in schema order; nulls become empty cells.
pub fn write_feature_table(path: &Path, table: &FeatureTable) -> Result<(), TableError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(table.schema.column_names())?;

    let dtypes: Vec<FeatureDType> = table.schema.columns.iter().map(|c| c.dtype).collect();
    for row in &table.rows {
        let cells = row
            .values
            .iter()
            .zip(&dtypes)
            .map(|(value, dtype)| format_cell(*value, *dtype));
        writer.write_record(cells)?;
    }

    let bytes = finish(writer)?;
    write_atomic(path, &bytes)?;
    info!(
        component = "table",
        event = "table.features.written",
        path = %path.display(),
        rows = table.rows.len(),
        columns = table.schema.columns.len(),
        fingerprint = %table.schema.fingerprint
    );
    Ok(())
}

pub(crate) fn find_column(headers: &[String], candidates: &[&str]) -> Option<usize> {
    candidates
        .iter()
        .find_map(|candidate| headers.iter().position(|header| header == candidate))
}

pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TableError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| TableError::InvalidPath(path.to_path_buf()))?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

pub(crate) fn finish(writer: csv::Writer<Vec<u8>>) -> Result<Vec<u8>, TableError> {
    writer
        .into_inner()
        .map_err(|err| TableError::Io(err.into_error()))
}

fn raw_from_record(record: &StringRecord, time_idx: usize, value_idx: usize) -> RawObservation {
    let time = record
        .get(time_idx)
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(str::to_string);
    let value = record
        .get(value_idx)
        .and_then(|raw| raw.trim().parse::<f64>().ok());
    RawObservation { time, value }
}

fn format_cell(value: Option<f64>, dtype: FeatureDType) -> String {
    match (value, dtype) {
        (None, _) => String::new(),
        (Some(v), FeatureDType::Int | FeatureDType::Flag) => format!("{}", v as i64),
        (Some(v), FeatureDType::F64) => v.to_string(),
    }
}
