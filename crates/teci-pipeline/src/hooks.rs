//! Named extension points of a run.

use async_trait::async_trait;
use teci_core::{NotificationBuffer, RevisionStore, RunContext, RunIdentity, RunResult, Vars};
use tracing::info;

use crate::config::HookCommands;
use crate::runner::CommandRunner;
use crate::stage::{Stage, StageConfig};

/// What a hook can see and change.
pub struct HookContext<'a> {
    pub identity: &'a RunIdentity,
    pub ctx: &'a mut RunContext,
    pub revisions: &'a mut RevisionStore,
    pub notification: &'a mut NotificationBuffer,
    /// Result so far; `None` before the action ran.
    pub result: Option<RunResult>,
}

impl HookContext<'_> {
    pub fn command_env(&self) -> Vars {
        command_env(self.identity, &*self.ctx, self.result)
    }
}

/// Variables exported to commands: parameters, then context on top,
/// then `TECI_*` run identity.
pub fn command_env(identity: &RunIdentity, ctx: &RunContext, result: Option<RunResult>) -> Vars {
    let mut env = ctx.params.clone();
    env.extend(ctx.context.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.insert("TECI_JOB".to_string(), identity.job_name.clone());
    env.insert("TECI_BUILD".to_string(), identity.build_number.to_string());
    if let Some(result) = result {
        env.insert("TECI_RESULT".to_string(), result.to_string());
    }
    env
}

/// Extension points. Every method defaults to doing nothing; an error
/// from `pre_start`, `pre_run` or `post_run` fails the run.
#[async_trait]
pub trait Hooks: Send + Sync {
    async fn pre_start(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_run(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_run(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_always(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_success(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn cleanup(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl Hooks for NoHooks {}

/// Hooks bound to shell commands, run in the workspace.
#[derive(Debug, Clone, Default)]
pub struct ShellHooks {
    commands: HookCommands,
}

impl ShellHooks {
    pub fn new(commands: HookCommands) -> Self {
        Self { commands }
    }

    async fn run(
        &self,
        stage: Stage,
        command: Option<&Vec<String>>,
        run: &mut HookContext<'_>,
    ) -> anyhow::Result<()> {
        let Some(command) = command.filter(|c| !c.is_empty()) else {
            return Ok(());
        };
        let config = StageConfig::custom(stage.name(), command.clone(), self.commands.timeout_secs);
        let result = CommandRunner::execute(&config, &run.identity.workspace, &run.command_env()).await?;
        info!(hook = %stage, exit_code = result.exit_code, duration_ms = result.duration_ms, "hook finished");
        if !result.passed() {
            anyhow::bail!(
                "{} hook exited with code {}: {}",
                stage,
                result.exit_code,
                result.stderr.trim()
            );
        }
        Ok(())
    }
}

#[async_trait]
impl Hooks for ShellHooks {
    async fn pre_start(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::PreStart, self.commands.pre_start.as_ref(), run).await
    }

    async fn pre_run(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::PreRun, self.commands.pre_run.as_ref(), run).await
    }

    async fn post_run(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::PostRun, self.commands.post_run.as_ref(), run).await
    }

    async fn post_always(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::PostAlways, self.commands.post_always.as_ref(), run).await
    }

    async fn on_success(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::Downstream, self.commands.on_success.as_ref(), run).await
    }

    async fn cleanup(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.run(Stage::Cleanup, self.commands.cleanup.as_ref(), run).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Option<Vec<String>> {
        Some(vec!["sh".to_string(), "-c".to_string(), script.to_string()])
    }

    #[tokio::test]
    async fn test_shell_hooks_run_in_workspace_with_context() {
        let dir = tempfile::tempdir().unwrap();
        let identity = RunIdentity::new("nightly", 4, dir.path().to_path_buf());
        let mut ctx = RunContext::default();
        ctx.params.insert("TE_REV".to_string(), "param".to_string());
        ctx.context.insert("TE_REV".to_string(), "ctx".to_string());
        let mut revisions = RevisionStore::new();
        let mut notification = NotificationBuffer::new();

        let hooks = ShellHooks::new(HookCommands {
            pre_run: sh("echo \"$TE_REV $TECI_JOB $TECI_BUILD\" > hook.out"),
            post_run: sh("exit 7"),
            timeout_secs: 30,
            ..HookCommands::default()
        });

        let mut run = HookContext {
            identity: &identity,
            ctx: &mut ctx,
            revisions: &mut revisions,
            notification: &mut notification,
            result: None,
        };
        hooks.pre_start(&mut run).await.expect("unset hook is a no-op");
        hooks.pre_run(&mut run).await.unwrap();
        let written = std::fs::read_to_string(dir.path().join("hook.out")).unwrap();
        assert_eq!(written.trim(), "ctx nightly 4");

        let err = hooks.post_run(&mut run).await.unwrap_err();
        assert!(err.to_string().contains("post_run hook exited with code 7"));
    }

    struct Annotating;

    #[async_trait]
    impl Hooks for Annotating {
        async fn post_always(&self, run: &mut HookContext<'_>) -> anyhow::Result<()> {
            run.notification.append("extra line");
            run.revisions.put("rigs", "RIGS_REV", "abc");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_custom_hooks_can_mutate_run_state() {
        let identity = RunIdentity::new("nightly", 1, std::env::temp_dir());
        let mut ctx = RunContext::default();
        let mut revisions = RevisionStore::new();
        let mut notification = NotificationBuffer::new();
        let mut run = HookContext {
            identity: &identity,
            ctx: &mut ctx,
            revisions: &mut revisions,
            notification: &mut notification,
            result: Some(RunResult::Success),
        };
        Annotating.cleanup(&mut run).await.unwrap();
        Annotating.post_always(&mut run).await.unwrap();
        assert!(notification.text().contains("extra line"));
        assert_eq!(revisions.get("rigs", "RIGS_REV"), Some("abc"));
    }
}
