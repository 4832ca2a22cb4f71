//! Property-parcel CSV cleaning.
//!
//! County parcel exports disagree on column names and split the street address
//! over many columns. [`clean_parcel_files`] folds them into one table keyed by
//! a composed `Property Address`.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::table::{finish, write_atomic, TableError};

pub const PROPERTY_ADDRESS_COLUMN: &str = "Property Address";

const DEFAULT_ADDRESS_COLUMNS: [&str; 21] = [
    "PropAddress_Full",
    "PropAddress_Num",
    "PropAddress_PreDir",
    "PropAddress_StreetName",
    "PropAddress_StreetType",
    "PropAddress_PostDir",
    "PropAddress_UnitType",
    "PropAddress_UnitNum",
    "PropAddress_City",
    "PropAddress_State",
    "PropAddress_Zip",
    "PropAddres",
    "PropAddr_1",
    "PropAddr_2",
    "PropAddr_3",
    "PropAddr_5",
    "PropAddr_6",
    "PropAddr_7",
    "PropAddr_8",
    "PropAddr_9",
    "PropAddr10",
];

const DEFAULT_ALTERNATE_NAMES: [(&str, &str); 7] = [
    ("FairMarket", "Fair Market Value"),
    ("FairMarketValue", "Fair Market Value"),
    ("Sale_Price", "Sale Price"),
    ("Acres", "Acres"),
    ("YearBuilt", "Year Built"),
    ("FMV_Land", "FMV Land"),
    ("FMV_Building", "FMV Building"),
];

const DEFAULT_REQUIRED_COLUMNS: [&str; 4] =
    ["Fair Market Value", "Sale Price", "Acres", "Year Built"];

/// Cells that count as missing, in addition to empty ones.
const NULL_TOKENS: [&str; 8] = ["na", "n/a", "nan", "null", "none", "<na>", "#n/a", "-nan"];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelCleanConfig {
    pub address_columns: Vec<String>,
    pub alternate_names: Vec<(String, String)>,
    pub required_columns: Vec<String>,
}

impl Default for ParcelCleanConfig {
    fn default() -> Self {
        Self {
            address_columns: DEFAULT_ADDRESS_COLUMNS.iter().map(|c| c.to_string()).collect(),
            alternate_names: DEFAULT_ALTERNATE_NAMES
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
            required_columns: DEFAULT_REQUIRED_COLUMNS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl ParcelCleanConfig {
    pub fn output_columns(&self) -> Vec<String> {
        std::iter::once(PROPERTY_ADDRESS_COLUMN.to_string())
            .chain(self.required_columns.iter().cloned())
            .collect()
    }
}

/// One cleaned parcel; `values` follow `ParcelCleanConfig::required_columns`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParcelRecord {
    pub address: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelTable {
    pub columns: Vec<String>,
    pub records: Vec<ParcelRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParcelSkipReason {
    Unreadable(String),
    MissingRequiredColumns(Vec<String>),
    NoAddressColumns,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParcelFileReport {
    pub path: PathBuf,
    pub rows_read: usize,
    pub rows_kept: usize,
    pub rows_dropped: usize,
    pub skipped: Option<ParcelSkipReason>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParcelCleanOutcome {
    pub table: ParcelTable,
    pub duplicates_removed: usize,
    pub files: Vec<ParcelFileReport>,
}

#[derive(Debug, Error)]
pub enum ParcelError {
    #[error("no parcel files given")]
    NoInputs,
    #[error("none of the {files} parcel files could be used")]
    NoUsableInputs { files: usize },
    #[error("parcel output error: {0}")]
    Output(#[from] TableError),
}

impl From<csv::Error> for ParcelError {
    fn from(err: csv::Error) -> Self {
        Self::Output(TableError::Csv(err))
    }
}

impl From<io::Error> for ParcelError {
    fn from(err: io::Error) -> Self {
        Self::Output(TableError::Io(err))
    }
}

/// Cleans every file, skipping the ones that cannot be used, and combines the
/// surviving rows with exact duplicates removed (first occurrence kept).
pub fn clean_parcel_files(
    paths: &[PathBuf],
    cfg: &ParcelCleanConfig,
) -> Result<ParcelCleanOutcome, ParcelError> {
    if paths.is_empty() {
        return Err(ParcelError::NoInputs);
    }

    let mut seen = HashSet::new();
    let mut records = Vec::new();
    let mut duplicates_removed = 0usize;
    let mut files = Vec::with_capacity(paths.len());

    for path in paths {
        match clean_parcel_file(path, cfg) {
            Ok((rows, report)) => {
                for record in rows {
                    if seen.insert(record.clone()) {
                        records.push(record);
                    } else {
                        duplicates_removed += 1;
                    }
                }
                files.push(report);
            }
            Err(reason) => {
                warn!(
                    component = "parcels",
                    event = "parcels.file.skipped",
                    path = %path.display(),
                    reason = ?reason
                );
                files.push(ParcelFileReport {
                    path: path.clone(),
                    rows_read: 0,
                    rows_kept: 0,
                    rows_dropped: 0,
                    skipped: Some(reason),
                });
            }
        }
    }

    if files.iter().all(|report| report.skipped.is_some()) {
        return Err(ParcelError::NoUsableInputs { files: files.len() });
    }

    info!(
        component = "parcels",
        event = "parcels.clean.finish",
        files = files.len(),
        skipped = files.iter().filter(|r| r.skipped.is_some()).count(),
        records = records.len(),
        duplicates_removed = duplicates_removed
    );

    Ok(ParcelCleanOutcome {
        table: ParcelTable {
            columns: cfg.output_columns(),
            records,
        },
        duplicates_removed,
        files,
    })
}

pub fn write_parcels_csv(path: &Path, table: &ParcelTable) -> Result<(), ParcelError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns)?;
    for record in &table.records {
        let cells = std::iter::once(record.address.as_str())
            .chain(record.values.iter().map(String::as_str));
        writer.write_record(cells)?;
    }

    let bytes = finish(writer)?;
    write_atomic(path, &bytes)?;
    info!(
        component = "parcels",
        event = "parcels.written",
        path = %path.display(),
        rows = table.records.len()
    );
    Ok(())
}

fn clean_parcel_file(
    path: &Path,
    cfg: &ParcelCleanConfig,
) -> Result<(Vec<ParcelRecord>, ParcelFileReport), ParcelSkipReason> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|err| ParcelSkipReason::Unreadable(err.to_string()))?;
    let headers: Vec<String> = reader
        .headers()
        .map_err(|err| ParcelSkipReason::Unreadable(err.to_string()))?
        .iter()
        .map(|header| header.trim().to_string())
        .collect();

    let address_idx: Vec<usize> = cfg
        .address_columns
        .iter()
        .filter_map(|column| headers.iter().position(|header| header == column))
        .collect();
    if address_idx.is_empty() {
        return Err(ParcelSkipReason::NoAddressColumns);
    }

    let renamed = apply_alternate_names(&headers, cfg);
    let mut required_idx = Vec::with_capacity(cfg.required_columns.len());
    let mut missing = Vec::new();
    for column in &cfg.required_columns {
        match renamed.iter().position(|header| header == column) {
            Some(idx) => required_idx.push(idx),
            None => missing.push(column.clone()),
        }
    }
    if !missing.is_empty() {
        return Err(ParcelSkipReason::MissingRequiredColumns(missing));
    }

    let mut rows = Vec::new();
    let mut rows_read = 0usize;
    let mut rows_dropped = 0usize;
    for (row_idx, record) in reader.records().enumerate() {
        let record = record.map_err(|err| ParcelSkipReason::Unreadable(err.to_string()))?;
        rows_read += 1;

        let address = address_idx
            .iter()
            .filter_map(|&idx| non_null(record.get(idx)))
            .collect::<Vec<_>>()
            .join(" ");
        let values: Vec<Option<&str>> = required_idx
            .iter()
            .map(|&idx| non_null(record.get(idx)))
            .collect();

        let mut missing_fields: Vec<&str> = cfg
            .required_columns
            .iter()
            .zip(&values)
            .filter(|(_, value)| value.is_none())
            .map(|(column, _)| column.as_str())
            .collect();
        if address.is_empty() {
            missing_fields.insert(0, PROPERTY_ADDRESS_COLUMN);
        }
        if !missing_fields.is_empty() {
            rows_dropped += 1;
            debug!(
                component = "parcels",
                event = "parcels.row.dropped",
                path = %path.display(),
                row = row_idx + 1,
                missing = ?missing_fields
            );
            continue;
        }

        rows.push(ParcelRecord {
            address,
            values: values
                .into_iter()
                .map(|value| value.unwrap_or_default().to_string())
                .collect(),
        });
    }

    info!(
        component = "parcels",
        event = "parcels.file.cleaned",
        path = %path.display(),
        rows_read = rows_read,
        rows_kept = rows.len(),
        rows_dropped = rows_dropped
    );

    let report = ParcelFileReport {
        path: path.to_path_buf(),
        rows_read,
        rows_kept: rows.len(),
        rows_dropped,
        skipped: None,
    };
    Ok((rows, report))
}

fn apply_alternate_names(headers: &[String], cfg: &ParcelCleanConfig) -> Vec<String> {
    headers
        .iter()
        .map(|header| {
            cfg.alternate_names
                .iter()
                .find(|(from, _)| from == header)
                .map(|(_, to)| to.clone())
                .unwrap_or_else(|| header.clone())
        })
        .collect()
}

fn non_null(cell: Option<&str>) -> Option<&str> {
    let trimmed = cell?.trim();
    if trimmed.is_empty() || NULL_TOKENS.contains(&trimmed.to_ascii_lowercase().as_str()) {
        None
    } else {
        Some(trimmed)
    }
}
