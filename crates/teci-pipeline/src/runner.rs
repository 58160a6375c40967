//! External command execution for the action, hooks and statistics.

use crate::stage::StageConfig;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;
use teci_core::Vars;
use tokio::process::Command;

/// Result of a stage execution.
#[derive(Debug, Clone)]
pub struct StageResult {
    /// Stage name.
    pub stage_name: String,

    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,

    /// Whether execution succeeded.
    pub success: bool,
}

impl StageResult {
    /// Whether this stage passed (exit code 0).
    pub fn passed(&self) -> bool {
        self.success && self.exit_code == 0
    }

    /// Result for a command that could not be run at all.
    pub fn errored(stage_name: impl Into<String>, error: &anyhow::Error, duration_ms: u64) -> Self {
        Self {
            stage_name: stage_name.into(),
            exit_code: -1,
            stdout: String::new(),
            stderr: format!("{error:#}"),
            duration_ms,
            success: false,
        }
    }
}

/// Runs stage commands in the run workspace.
pub struct CommandRunner;

impl CommandRunner {
    /// Execute a single stage in `cwd` with `envs` added to the inherited
    /// environment.
    ///
    /// Spawn failures and timeouts are errors; a non-zero exit is a
    /// `StageResult` that did not pass.
    pub async fn execute(config: &StageConfig, cwd: &Path, envs: &Vars) -> anyhow::Result<StageResult> {
        let start = Instant::now();

        // Validate command
        if config.command.is_empty() {
            anyhow::bail!("Stage {} has empty command", config.name);
        }

        let exe = &config.command[0];
        let args = &config.command[1..];

        let child = Command::new(exe)
            .args(args)
            .current_dir(cwd)
            .envs(envs)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| anyhow::anyhow!("Stage {} failed to start {}: {}", config.name, exe, e))?;

        let output = if config.timeout_secs > 0 {
            tokio::time::timeout(
                std::time::Duration::from_secs(config.timeout_secs),
                child.wait_with_output(),
            )
            .await
            .map_err(|_| {
                anyhow::anyhow!(
                    "Stage {} timed out after {} seconds",
                    config.name,
                    config.timeout_secs
                )
            })??
        } else {
            child.wait_with_output().await?
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        let success = output.status.success();

        Ok(StageResult {
            stage_name: config.name.clone(),
            exit_code,
            stdout,
            stderr,
            duration_ms,
            success,
        })
    }
}
