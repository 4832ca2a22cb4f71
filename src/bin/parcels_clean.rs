use std::path::{Path, PathBuf};
use std::process::ExitCode;

use tidecast::{
    clean_parcel_files, init_logging, log_pipeline_failure, logging_config_from_env,
    write_parcels_csv, ParcelCleanConfig, PipelineError, PipelineStage,
};

const BINARY: &str = "parcels_clean";
const DEFAULT_OUTPUT: &str = "preprocessed_parcels_data.csv";

/// Usage: `parcels_clean <input.csv>...`; the output path comes from
/// `TIDECAST_PARCELS_OUTPUT`.
fn main() -> ExitCode {
    let logging_cfg = logging_config_from_env();
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("{BINARY}: {err}");
        return ExitCode::FAILURE;
    }

    let inputs: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    let output = std::env::var("TIDECAST_PARCELS_OUTPUT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_OUTPUT));

    match run(&inputs, &output) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log_pipeline_failure(BINARY, PipelineStage::Parcels.as_str(), &err);
            ExitCode::FAILURE
        }
    }
}

fn run(inputs: &[PathBuf], output: &Path) -> Result<(), PipelineError> {
    let outcome = clean_parcel_files(inputs, &ParcelCleanConfig::default())?;
    write_parcels_csv(output, &outcome.table)?;

    for file in &outcome.files {
        match &file.skipped {
            Some(reason) => println!("skipped {}: {reason:?}", file.path.display()),
            None => println!(
                "{}: kept {} of {} rows",
                file.path.display(),
                file.rows_kept,
                file.rows_read
            ),
        }
    }
    println!(
        "wrote {} parcels to {} ({} duplicates removed)",
        outcome.table.records.len(),
        output.display(),
        outcome.duplicates_removed
    );
    Ok(())
}
