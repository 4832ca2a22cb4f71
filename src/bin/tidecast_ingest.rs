use std::process::ExitCode;

use chrono::Utc;
use tidecast::{
    init_logging, log_app_start, log_pipeline_failure, logging_config_from_env,
    pipeline_config_from_env, run_ingest, PipelineError, PipelineStage,
};

const BINARY: &str = "tidecast_ingest";

fn main() -> ExitCode {
    let logging_cfg = logging_config_from_env();
    if let Err(err) = init_logging(&logging_cfg) {
        eprintln!("{BINARY}: {err}");
        return ExitCode::FAILURE;
    }

    let cfg = match pipeline_config_from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            log_pipeline_failure(BINARY, PipelineStage::Config.as_str(), &err);
            return ExitCode::FAILURE;
        }
    };
    log_app_start(BINARY, &logging_cfg, &cfg);

    match run_ingest(&cfg, Utc::now()) {
        Ok(report) => {
            println!(
                "ingested {} points ({} raw records over {} pages, {} gaps) into {} and {}",
                report.normalize.output_points,
                report.raw_records,
                report.pages,
                report.normalize.gap_count,
                report.observations_path.display(),
                report.features_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => fail(&err),
    }
}

fn fail(err: &PipelineError) -> ExitCode {
    log_pipeline_failure(BINARY, err.stage().as_str(), err);
    ExitCode::FAILURE
}
