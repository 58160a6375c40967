use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::info;

use super::{RunTrigger, TriggerOutcome, TriggerRequest};
use crate::context::RunResult;
use crate::error::{Result, TeciError};

/// Starts downstream jobs by invoking the `teci` binary on
/// `<jobs_dir>/<job>.toml`.
///
/// Each triggered job runs in its own `<workspaces>/<job>` directory.
#[derive(Debug, Clone)]
pub struct ProcessTrigger {
    program: PathBuf,
    jobs_dir: PathBuf,
    workspaces: PathBuf,
}

impl ProcessTrigger {
    pub fn new(
        program: impl Into<PathBuf>,
        jobs_dir: impl Into<PathBuf>,
        workspaces: impl Into<PathBuf>,
    ) -> Self {
        Self {
            program: program.into(),
            jobs_dir: jobs_dir.into(),
            workspaces: workspaces.into(),
        }
    }

    /// Workspace handed to the triggered run of `job`.
    pub fn workspace_for(&self, job: &str) -> PathBuf {
        self.workspaces.join(job)
    }

    /// Command line arguments used for `request`.
    pub fn args(&self, request: &TriggerRequest) -> Vec<String> {
        let config = self.jobs_dir.join(format!("{}.toml", request.job));
        let mut args = vec![
            "run".to_string(),
            "--config".to_string(),
            config.to_string_lossy().to_string(),
            "--job".to_string(),
            request.job.clone(),
            "--workspace".to_string(),
            self.workspace_for(&request.job)
                .to_string_lossy()
                .to_string(),
        ];
        for (key, value) in &request.params {
            args.push("--param".to_string());
            args.push(format!("{key}={value}"));
        }
        args
    }

    fn command(&self, request: &TriggerRequest) -> Command {
        let mut command = Command::new(&self.program);
        command.args(self.args(request)).stdin(Stdio::null());
        // The triggered run numbers itself and owns its workspace.
        for var in RUN_SCOPED_VARS {
            command.env_remove(var);
        }
        command
    }
}

/// Environment variables describing the triggering run.
const RUN_SCOPED_VARS: &[&str] = &["TECI_BUILD", "TECI_URL", "TECI_WORKSPACE"];

#[async_trait]
impl RunTrigger for ProcessTrigger {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerOutcome> {
        let config = self.jobs_dir.join(format!("{}.toml", request.job));
        if !config.exists() {
            return Err(TeciError::Trigger {
                job: request.job.clone(),
                reason: format!("no job definition at {}", config.display()),
            });
        }

        let mut command = self.command(request);

        let spawn_err = |e: std::io::Error| TeciError::Trigger {
            job: request.job.clone(),
            reason: e.to_string(),
        };

        if !request.wait {
            command.stdout(Stdio::null()).stderr(Stdio::null());
            let child = command.spawn().map_err(spawn_err)?;
            info!(job = %request.job, pid = ?child.id(), "downstream run started");
            return Ok(TriggerOutcome::Queued);
        }

        let status = command.status().await.map_err(spawn_err)?;
        let result = if status.success() {
            RunResult::Success
        } else {
            RunResult::Failure
        };
        info!(job = %request.job, result = %result, "downstream run finished");
        Ok(TriggerOutcome::Completed(result))
    }
}
