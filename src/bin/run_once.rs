//! Run one pipeline from config + env and print the report.
//!
//! Usage: `run_once` or `run_once --resume <run_id>`. Ctrl-C cancels at the
//! next step boundary.

use deal_intel::notify::NotifierMux;
use deal_intel::pipeline::{Collaborators, Pipeline};
use deal_intel::telemetry::init_tracing;
use deal_intel::{RunConfig, RunState, Stage};
use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    init_tracing();

    match run().await {
        Ok(state) => {
            if let Some(report) = state.report() {
                println!("{}\n\n{}", report.text, report.summary);
                NotifierMux::from_env().deliver(report).await;
            }
            for w in state.warnings() {
                eprintln!("warning [{:?} @ {}]: {}", w.kind, w.stage, w.message);
            }
            match state.stage() {
                Stage::Done => ExitCode::SUCCESS,
                Stage::Failed => {
                    if let Some(f) = state.failure() {
                        eprintln!("run {} failed at {}: {}", state.run_id(), f.stage, f.cause);
                    }
                    ExitCode::FAILURE
                }
                stage => {
                    eprintln!("run {} stopped before {stage}", state.run_id());
                    ExitCode::from(2)
                }
            }
        }
        Err(e) => {
            eprintln!("run_once: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<RunState> {
    let cfg = RunConfig::load()?;
    let collab = Collaborators::from_config(&cfg)?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    if let [flag, run_id] = args.as_slice() {
        if flag == "--resume" {
            let dir = cfg.output.checkpoint_dir.clone();
            return Ok(Pipeline::resume(run_id, dir, collab).await?);
        }
        anyhow::bail!("unknown argument '{flag}'");
    }

    let pipeline = Pipeline::new(cfg, collab)?;
    let cancel = pipeline.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "pipeline", "ctrl-c received, cancelling at next step");
            cancel.cancel();
        }
    });
    Ok(pipeline.run().await)
}
