use std::process::ExitCode;

use chrono::Utc;
use tidecast::{
    init_logging, log_app_start, log_pipeline_failure, logging_config_from_env,
    pipeline_config_from_env, run_predict, PersistenceForecaster, PipelineStage,
};

const BINARY: &str = "tidecast_predict";

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

    let model = PersistenceForecaster {
        horizon_len: cfg.horizon_len,
    };
    match run_predict(&cfg, &model, Utc::now()) {
        Ok(report) => {
            println!(
                "{} prediction {} logged to {}",
                report.model,
                report.logged_value,
                report.predictions_path.display()
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            log_pipeline_failure(BINARY, err.stage().as_str(), &err);
            ExitCode::FAILURE
        }
    }
}
