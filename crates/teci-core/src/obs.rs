//! Structured observability hooks for the run lifecycle.
//!
//! - A run-scoped tracing span via `run_span`
//! - Emission functions for run start, stage transitions and run finish
//!
//! Events are emitted at `info!` level with an `event` field, so they can be
//! filtered in JSON output.

use tracing::info;

use crate::context::RunResult;

/// Run-scoped span; attach it to the run future with
/// `tracing::Instrument::instrument`.
pub fn run_span(job: &str, build: u64) -> tracing::Span {
    tracing::info_span!("teci.run", job = %job, build = build)
}

/// Emit event: run started.
pub fn emit_run_started(run_id: &str, job: &str, configuration: &str) {
    info!(event = "run.started", run_id = %run_id, job = %job, configuration = %configuration);
}

/// Emit event: a stage began.
pub fn emit_stage(run_id: &str, stage: &str) {
    info!(event = "run.stage", run_id = %run_id, stage = %stage);
}

/// Emit event: run finished with its final result.
pub fn emit_run_finished(run_id: &str, duration_ms: u64, result: RunResult) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        result = %result,
    );
}

/// Emit event: a best-effort step failed and was ignored (warning level).
pub fn emit_ignored_failure(run_id: &str, step: &str, error: &dyn std::fmt::Display) {
    tracing::warn!(event = "run.ignored_failure", run_id = %run_id, step = %step, error = %error);
}
