use std::process::ExitCode;

use tidecast::{
    build_dataset, init_logging, log_app_start, log_pipeline_failure, logging_config_from_env,
    pipeline_config_from_env, PipelineStage, SplitKind,
};

const BINARY: &str = "tidecast_dataset";

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

    let report = match build_dataset(&cfg) {
        Ok(report) => report,
        Err(err) => {
            log_pipeline_failure(BINARY, err.stage().as_str(), &err);
            return ExitCode::FAILURE;
        }
    };

    let sources: Vec<String> = report
        .sources
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    println!(
        "{} points from {} (context_len={}, horizon_len={})",
        report.normalize.output_points,
        sources.join(", "),
        cfg.context_len,
        cfg.horizon_len
    );
    for path in &report.skipped_sources {
        println!("skipped {} (missing time or reading column)", path.display());
    }
    for kind in SplitKind::ALL {
        let range = report.windows.ranges.range(kind);
        match report.windows.get(kind) {
            Ok(set) => {
                let tensors = set.to_tensors(cfg.frequency);
                println!(
                    "{kind:<10} rows {:>7}..{:<7} windows {:>7} past ({}, {}) future ({}, {})",
                    range.start,
                    range.end,
                    set.len(),
                    tensors.rows,
                    tensors.context_len,
                    tensors.rows,
                    tensors.horizon_len
                );
            }
            Err(err) => println!(
                "{kind:<10} rows {:>7}..{:<7} unavailable: {err}",
                range.start, range.end
            ),
        }
    }

    // Without training windows there is no dataset to hand over.
    if let Err(err) = report.windows.get(SplitKind::Train) {
        log_pipeline_failure(BINARY, PipelineStage::Windows.as_str(), err);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
