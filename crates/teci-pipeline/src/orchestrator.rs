//! Run orchestration: the fixed stage sequence of one run.
//!
//! 1. `pre_start` hook, inherited revisions, site config, checkouts
//! 2. named lock around `pre_run`, node preparation, the action, `post_run`
//! 3. statistics
//! 4. always: metadata, revision snapshot, best-effort archive, log
//!    publishing, `post_always`
//! 5. on success: `on_success`, downstream runs
//! 6. always: `cleanup`, notification
//!
//! Fatal configuration errors in 1-2 skip straight to 3; the error is
//! returned with the report after the notification went out. Cancelling
//! the run during 1-2 stops the active stage and continues at 3 with an
//! `ABORTED` result.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::{self, Display};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use teci_core::context::lookup;
use teci_core::obs;
use teci_core::{
    collect_run_metas, ArtifactStore, CheckoutService, Component, Mailer, MetadataDocument, Metas,
    NodeDirectory, NotificationBuffer, ParamSuffix, PostOutcome, Resolver, RevisionStore,
    RunContext, RunIdentity, RunResult, RunTrigger, TeciError, TriggerOutcome, TriggerRequest,
    VarSuffix, Vars, METADATA_FILE, PARAMS_FILE, REVISIONS_FILE,
};

use crate::config::{
    ActionConfig, ComponentConfig, DownstreamRun, NodePrepare, NotifyConfig, PipelineConfig,
};
use crate::hooks::{command_env, HookContext, Hooks, ShellHooks};
use crate::lock::LockManager;
use crate::nodes::on_nodes;
use crate::runner::{CommandRunner, StageResult};
use crate::site::merge_site_config;
use crate::stage::{Stage, StageConfig};
use crate::stats::RunStatistics;

/// Run parameter whose `;`-separated addresses are added to the
/// configured recipients.
pub const NOTIFY_PARAM: &str = "notify_recipients";

/// External services a run talks to.
#[derive(Clone)]
pub struct Services {
    pub checkout: Arc<dyn CheckoutService>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub mailer: Arc<dyn Mailer>,
    pub trigger: Arc<dyn RunTrigger>,
    pub locks: Arc<dyn LockManager>,
    pub nodes: Arc<dyn NodeDirectory>,
}

/// Outcome of the best-effort archive step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArchiveOutcome {
    Archived(Vec<String>),
    Failed(String),
}

impl ArchiveOutcome {
    pub fn is_archived(&self) -> bool {
        matches!(self, ArchiveOutcome::Archived(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub ok: bool,
    pub detail: Option<String>,
}

/// A downstream or log-publishing run this run started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TriggeredRun {
    pub job: String,
    pub params: Vars,
    pub outcome: Option<TriggerOutcome>,
    pub error: Option<String>,
}

/// Result of a complete run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub result: RunResult,
    pub stages: Vec<StageRecord>,
    pub action: Option<StageResult>,
    pub statistics: Option<RunStatistics>,
    /// Revision Store as archived.
    pub revisions: RevisionStore,
    pub metadata: Option<MetadataDocument>,
    /// Effective run parameters.
    pub params: Vars,
    pub archive: Option<ArchiveOutcome>,
    pub triggered: Vec<TriggeredRun>,
    pub notification: Option<PostOutcome>,
    /// Why the run was aborted: fatal error text or cancellation.
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl RunReport {
    fn new(run_id: String) -> Self {
        Self {
            run_id,
            result: RunResult::Success,
            stages: Vec::new(),
            action: None,
            statistics: None,
            revisions: RevisionStore::new(),
            metadata: None,
            params: Vars::new(),
            archive: None,
            triggered: Vec::new(),
            notification: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Records for `stage`, in order.
    pub fn stage(&self, stage: Stage) -> impl Iterator<Item = &StageRecord> {
        self.stages.iter().filter(move |r| r.stage == stage)
    }

    pub fn ran(&self, stage: Stage) -> bool {
        self.stage(stage).next().is_some()
    }

    pub fn failed_stages(&self) -> Vec<Stage> {
        self.stages.iter().filter(|r| !r.ok).map(|r| r.stage).collect()
    }
}

/// A run stopped by a fatal error. Statistics, the always stage, cleanup
/// and the notification ran before it was returned.
#[derive(Debug)]
pub struct RunAborted {
    pub report: Box<RunReport>,
    pub error: anyhow::Error,
}

impl Display for RunAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "run {} aborted", self.report.run_id)
    }
}

impl std::error::Error for RunAborted {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.error.as_ref())
    }
}

/// Mutable per-run state threaded through the stages.
struct RunState {
    identity: RunIdentity,
    ctx: RunContext,
    revisions: RevisionStore,
    notification: NotificationBuffer,
    report: RunReport,
    /// Last stage entered.
    current: Option<Stage>,
}

impl RunState {
    fn new(run_id: String, identity: RunIdentity, ctx: RunContext, notify: &NotifyConfig) -> Self {
        let mut notification = NotificationBuffer::new();
        notification.set_recipients(&notify.recipients);
        if let Some(extra) = lookup(&ctx.params, NOTIFY_PARAM) {
            notification.add_recipients(extra);
        }
        if let Some(sender) = &notify.sender {
            notification.set_sender(sender.clone());
        }
        if let Some(prefix) = &notify.subject_prefix {
            notification.set_subject_prefix(prefix.clone());
        }
        if let Some(trailer) = &notify.subject_trailer {
            notification.set_subject_trailer(trailer.clone());
        }
        notification.set_attachments(notify.attachments.clone());
        notification.start(&identity);

        Self {
            identity,
            ctx,
            revisions: RevisionStore::new(),
            notification,
            report: RunReport::new(run_id),
            current: None,
        }
    }

    fn hook_ctx(&mut self, result: Option<RunResult>) -> HookContext<'_> {
        HookContext {
            identity: &self.identity,
            ctx: &mut self.ctx,
            revisions: &mut self.revisions,
            notification: &mut self.notification,
            result,
        }
    }

    fn workspace(&self) -> &Path {
        &self.identity.workspace
    }

    fn env(&self, result: Option<RunResult>) -> Vars {
        command_env(&self.identity, &self.ctx, result)
    }

    fn enter(&mut self, stage: Stage) {
        obs::emit_stage(&self.report.run_id, stage.name());
        self.current = Some(stage);
    }

    fn record(&mut self, stage: Stage, ok: bool, detail: Option<String>) {
        self.report.stages.push(StageRecord { stage, ok, detail });
    }

    /// Best-effort step failed: log it and carry on.
    fn ignore(&mut self, stage: Stage, error: &dyn Display) {
        obs::emit_ignored_failure(&self.report.run_id, stage.name(), error);
        self.record(stage, false, Some(error.to_string()));
    }

    /// Execution step failed: the run is a failure.
    fn fail(&mut self, stage: Stage, error: &anyhow::Error) -> RunResult {
        error!(stage = %stage, error = %format!("{error:#}"), "stage failed");
        self.notification.append(format!("{stage} failed: {error:#}"));
        self.record(stage, false, Some(format!("{error:#}")));
        RunResult::Failure
    }
}

/// Runs one configured job.
pub struct Orchestrator {
    config: PipelineConfig,
    services: Services,
    hooks: Arc<dyn Hooks>,
}

impl Orchestrator {
    /// Orchestrator with the shell hooks from `config`.
    pub fn new(config: PipelineConfig, services: Services) -> Self {
        let hooks = Arc::new(ShellHooks::new(config.hooks.clone()));
        Self {
            config,
            services,
            hooks,
        }
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Execute the full stage sequence.
    ///
    /// Returns the report for runs that got through their stages, whatever
    /// their result. Fatal configuration errors are returned as
    /// [`RunAborted`] after cleanup and notification ran.
    pub async fn run(&self, identity: RunIdentity, ctx: RunContext) -> Result<RunReport, RunAborted> {
        self.run_until(identity, ctx, std::future::pending()).await
    }

    /// Like [`Orchestrator::run`], but `cancel` completing stops the
    /// preparation or execution stage in progress. The run then goes on
    /// with statistics, the always stage, cleanup and notification and
    /// finishes as [`RunResult::Aborted`].
    pub async fn run_until<F>(
        &self,
        identity: RunIdentity,
        ctx: RunContext,
        cancel: F,
    ) -> Result<RunReport, RunAborted>
    where
        F: Future<Output = ()> + Send,
    {
        let span = obs::run_span(&identity.job_name, identity.build_number);
        self.run_stages(identity, ctx, cancel).instrument(span).await
    }

    async fn run_stages<F>(
        &self,
        identity: RunIdentity,
        ctx: RunContext,
        cancel: F,
    ) -> Result<RunReport, RunAborted>
    where
        F: Future<Output = ()> + Send,
    {
        let clock = Instant::now();
        let started_at = identity.started_at;
        let run_id = Uuid::new_v4().to_string();
        obs::emit_run_started(&run_id, &identity.job_name, &self.config.configuration);

        let mut state = RunState::new(run_id, identity, ctx, &self.config.notify);

        // Dropping the staged future kills a running action and releases
        // the lock.
        let staged = async {
            self.prepare(&mut state).await?;
            self.execute(&mut state).await
        };
        let outcome = tokio::select! {
            outcome = staged => Some(outcome),
            () = cancel => None,
        };
        let executed = matches!(outcome, Some(Ok(_)));
        let (mut result, fatal) = match outcome {
            Some(Ok(result)) => (result, None),
            Some(Err(e)) => {
                error!(error = %format!("{e:#}"), "run aborted");
                state.notification.append(format!("Aborted: {e:#}"));
                state.report.error = Some(format!("{e:#}"));
                (RunResult::Failure, Some(e))
            }
            None => {
                let stage = state.current.unwrap_or(Stage::PreStart);
                warn!(stage = %stage, "run cancelled");
                state
                    .notification
                    .append(format!("Aborted: run cancelled during {stage}"));
                state.record(stage, false, Some("cancelled".to_string()));
                state.report.error = Some("cancelled".to_string());
                (RunResult::Aborted, None)
            }
        };

        self.collect_statistics(&mut state, started_at, executed)
            .await;
        result = self.always(&mut state, result).await;
        if result.is_success() {
            result = self.on_success(&mut state, result).await;
        }
        result = self.finish(&mut state, result).await;

        let mut report = state.report;
        report.result = result;
        report.revisions = state.revisions;
        report.params = state.ctx.params;
        report.duration_ms = clock.elapsed().as_millis() as u64;
        obs::emit_run_finished(&report.run_id, report.duration_ms, result);

        match fatal {
            Some(error) => Err(RunAborted {
                report: Box::new(report),
                error,
            }),
            None => Ok(report),
        }
    }

    // -----------------------------------------------------------------------
    // Preparation
    // -----------------------------------------------------------------------

    async fn prepare(&self, state: &mut RunState) -> anyhow::Result<()> {
        state.enter(Stage::PreStart);
        self.hooks
            .pre_start(&mut state.hook_ctx(None))
            .await
            .context("pre_start hook failed")?;
        state.record(Stage::PreStart, true, None);

        if let Some(job) = &self.config.inherit_revisions_from {
            state.enter(Stage::InheritRevisions);
            let inherited =
                RevisionStore::load_from_external_run(self.services.artifacts.as_ref(), job).await;
            let written = inherited.export_to(&mut state.ctx.context, false, None, None);
            info!(job = %job, entries = inherited.len(), written, "inherited revisions");
            state.record(
                Stage::InheritRevisions,
                true,
                Some(format!("{written} variables from {job}")),
            );
        }

        if let Some(site) = &self.config.site_config {
            state.enter(Stage::SiteConfig);
            let target = self.checkout_component(state, &site.checkout()).await?;
            let path = state.workspace().join(target).join(&site.file);
            let written = merge_site_config(&path, &mut state.ctx.context)?;
            info!(file = %path.display(), written, "site config loaded");
            state.record(Stage::SiteConfig, true, Some(format!("{written} variables")));
        }

        state.enter(Stage::Checkout);
        for component in &self.config.components {
            self.checkout_component(state, component).await?;
        }
        state.record(
            Stage::Checkout,
            true,
            Some(format!("{} components", self.config.components.len())),
        );

        if let Some(extra) = &self.config.extra_checkout {
            state.enter(Stage::ExtraCheckout);
            let url = Resolver::new(&state.ctx).resolve_url(&extra.name, extra.url.as_deref());
            if url.is_none() {
                info!(component = %extra.name, "no URL for extra checkout, skipping");
                state.record(Stage::ExtraCheckout, true, Some("skipped".to_string()));
            } else {
                self.checkout_component(state, extra).await?;
                state.record(Stage::ExtraCheckout, true, None);
            }
        }

        Ok(())
    }

    /// Resolve, check out and record one component. Returns its target
    /// directory inside the workspace.
    async fn checkout_component(
        &self,
        state: &mut RunState,
        spec: &ComponentConfig,
    ) -> anyhow::Result<PathBuf> {
        let params = Resolver::new(&state.ctx).resolve_checkout(&spec.name, &spec.overrides())?;
        info!(
            component = %params.component,
            url = %params.url,
            revision = %params.revision,
            target = %params.target_dir.display(),
            "checking out"
        );

        let outcome = self
            .services
            .checkout
            .checkout(state.workspace(), &params)
            .await?;
        state
            .revisions
            .record_checkout(&params.component, &params.url, &outcome);
        // Later stages and commands see what was actually checked out.
        state.revisions.export_to(
            &mut state.ctx.context,
            true,
            Some(params.component.as_str()),
            None,
        );
        debug!(component = %params.component, commit = %outcome.commit, "checked out");
        Ok(params.target_dir)
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    async fn execute(&self, state: &mut RunState) -> anyhow::Result<RunResult> {
        let lock_name = self.config.lock_name();
        state.enter(Stage::Lock);
        let guard = self.services.locks.acquire(lock_name).await?;
        info!(lock = %guard.name(), "lock acquired");
        state.record(Stage::Lock, true, Some(lock_name.to_string()));

        let result = self.locked(state).await;

        drop(guard);
        info!(lock = %lock_name, "lock released");
        result
    }

    async fn locked(&self, state: &mut RunState) -> anyhow::Result<RunResult> {
        state.enter(Stage::PreRun);
        let hooked = self.hooks.pre_run(&mut state.hook_ctx(None)).await;
        if let Err(e) = hooked {
            return Ok(state.fail(Stage::PreRun, &e));
        }
        state.record(Stage::PreRun, true, None);

        if let Some(prepare) = &self.config.node_prepare {
            state.enter(Stage::NodePrepare);
            match self.prepare_nodes(state, prepare).await {
                Ok(count) => state.record(Stage::NodePrepare, true, Some(format!("{count} nodes"))),
                Err(e) if matches!(e.downcast_ref::<TeciError>(), Some(TeciError::NoNodes { .. })) => {
                    return Err(e)
                }
                Err(e) => return Ok(state.fail(Stage::NodePrepare, &e)),
            }
        }

        let mut result = RunResult::Success;
        if let Some(action) = self.config.action.as_ref().filter(|a| a.stage.enabled) {
            state.enter(Stage::Action);
            result = self.run_action(state, action).await;
            if !result.is_success() {
                return Ok(result);
            }
        }

        state.enter(Stage::PostRun);
        let hooked = self.hooks.post_run(&mut state.hook_ctx(Some(result))).await;
        if let Err(e) = hooked {
            return Ok(state.fail(Stage::PostRun, &e));
        }
        state.record(Stage::PostRun, true, None);
        Ok(result)
    }

    async fn prepare_nodes(&self, state: &RunState, prepare: &NodePrepare) -> anyhow::Result<usize> {
        let env = state.env(None);
        let workspace = state.workspace();
        let done = on_nodes(self.services.nodes.as_ref(), &prepare.label, |node| {
            let command = prepare
                .command
                .iter()
                .map(|arg| arg.replace("{node}", &node))
                .collect();
            let config = StageConfig::custom(
                format!("{}@{node}", Stage::NodePrepare),
                command,
                prepare.timeout_secs,
            );
            let mut env = env.clone();
            env.insert("TECI_NODE".to_string(), node);
            async move {
                let result = CommandRunner::execute(&config, workspace, &env).await?;
                if !result.passed() {
                    anyhow::bail!(
                        "exited with code {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    );
                }
                Ok(())
            }
        })
        .await?;
        Ok(done.len())
    }

    /// Run the action, then do the guaranteed cleanup whatever happened.
    async fn run_action(&self, state: &mut RunState, action: &ActionConfig) -> RunResult {
        let env = state.env(None);
        let workspace = state.workspace().to_path_buf();

        let stage_result = match CommandRunner::execute(&action.stage, &workspace, &env).await {
            Ok(result) => result,
            Err(e) => {
                warn!(stage = %action.stage.name, error = %e, "action could not run");
                StageResult::errored(&action.stage.name, &e, 0)
            }
        };
        info!(
            stage = %stage_result.stage_name,
            exit_code = stage_result.exit_code,
            duration_ms = stage_result.duration_ms,
            "action finished"
        );

        if let Some(tmp_dir) = &action.tmp_dir {
            remove_tmp_dir(&workspace.join(tmp_dir)).await;
        }
        if let Some(bundle) = &action.result_bundle {
            move_result_bundle(&workspace, bundle).await;
        }

        let passed = stage_result.passed();
        state.record(
            Stage::Action,
            passed,
            Some(format!("exit code {}", stage_result.exit_code)),
        );
        if !passed {
            state.notification.append(format!(
                "Action {} failed with exit code {}",
                stage_result.stage_name, stage_result.exit_code
            ));
        }
        state.report.action = Some(stage_result);

        if passed {
            RunResult::Success
        } else {
            RunResult::Failure
        }
    }

    async fn collect_statistics(&self, state: &mut RunState, started_at: DateTime<Utc>, executed: bool) {
        state.enter(Stage::Statistics);
        let mut stats = RunStatistics::new(started_at, state.report.action.as_ref());

        if let Some(command) = self.config.stats.as_ref().filter(|c| executed && c.enabled) {
            let env = state.env(None);
            let executed = CommandRunner::execute(command, state.workspace(), &env).await;
            match executed {
                Ok(output) if output.passed() => {
                    let added = stats.absorb_output(&output.stdout);
                    debug!(added, "statistics collected");
                }
                Ok(output) => {
                    let reason = format!("statistics command exited with code {}", output.exit_code);
                    state.ignore(Stage::Statistics, &reason);
                }
                Err(e) => state.ignore(Stage::Statistics, &e),
            }
        }

        state.record(Stage::Statistics, true, None);
        state.report.statistics = Some(stats);
    }

    // -----------------------------------------------------------------------
    // Always stage
    // -----------------------------------------------------------------------

    async fn always(&self, state: &mut RunState, mut result: RunResult) -> RunResult {
        state.enter(Stage::Metadata);
        let metas = self.metas(state, result);
        let document = MetadataDocument::emit(&metas, &[&state.ctx.context, &state.ctx.env]);
        match document.write(&state.workspace().join(METADATA_FILE)) {
            Ok(()) => state.record(
                Stage::Metadata,
                true,
                Some(format!("{} metas", document.metas.len())),
            ),
            Err(e) => state.ignore(Stage::Metadata, &e),
        }
        state.report.metadata = Some(document);

        state.enter(Stage::ArchiveRevisions);
        let snapshot = self.archive_snapshot(state).await;
        match snapshot {
            Ok(files) => state.record(Stage::ArchiveRevisions, true, Some(files.join(", "))),
            Err(e) => result = state.fail(Stage::ArchiveRevisions, &e),
        }

        if !self.config.archive.is_empty() {
            state.enter(Stage::Archive);
            let archived = self
                .services
                .artifacts
                .archive(
                    &state.identity.job_name,
                    state.identity.build_number,
                    state.workspace(),
                    &self.config.archive,
                )
                .await;
            let outcome = match archived {
                Ok(paths) => {
                    state.record(Stage::Archive, true, Some(format!("{} files", paths.len())));
                    ArchiveOutcome::Archived(paths)
                }
                Err(e) => {
                    state.ignore(Stage::Archive, &e);
                    ArchiveOutcome::Failed(e.to_string())
                }
            };
            state.report.archive = Some(outcome);
        }

        if let Some(publish) = &self.config.publish_logs {
            if publish.when.matches(result) {
                state.enter(Stage::PublishLogs);
                let mut params = publish.params.clone();
                params.insert("source_job".to_string(), state.identity.job_name.clone());
                params.insert(
                    "source_build".to_string(),
                    state.identity.build_number.to_string(),
                );
                params.insert("configuration".to_string(), self.config.configuration.clone());
                params.insert("result".to_string(), result.to_string());
                let run = self
                    .trigger(state, Stage::PublishLogs, &publish.job, params, true)
                    .await;
                state.report.triggered.push(run);
            } else {
                debug!(result = %result, "log publishing not wanted for this result");
            }
        }

        state.enter(Stage::PostAlways);
        let hooked = self.hooks.post_always(&mut state.hook_ctx(Some(result))).await;
        match hooked {
            Ok(()) => state.record(Stage::PostAlways, true, None),
            Err(e) => result = state.fail(Stage::PostAlways, &e),
        }

        result
    }

    fn metas(&self, state: &RunState, result: RunResult) -> Metas {
        let mut run = state
            .report
            .statistics
            .as_ref()
            .map(RunStatistics::metas)
            .unwrap_or_default();
        run.insert("CFG".to_string(), Some(self.config.configuration.clone()));
        run.insert("JOB_NAME".to_string(), Some(state.identity.job_name.clone()));
        run.insert(
            "BUILD_NUMBER".to_string(),
            Some(state.identity.build_number.to_string()),
        );
        run.insert("RESULT".to_string(), Some(result.to_string()));

        let fixed = self
            .config
            .metas
            .iter()
            .map(|(name, value)| (name.clone(), Some(value.clone())));
        let lookups = self.config.meta_lookups.iter().map(|name| (name.clone(), None));
        collect_run_metas(&state.revisions, run, fixed.chain(lookups))
    }

    /// Save `all.rev` and `params.json` into the workspace and archive them
    /// with `meta_data.json`.
    async fn archive_snapshot(&self, state: &RunState) -> anyhow::Result<Vec<String>> {
        let workspace = state.workspace();
        state
            .revisions
            .save(&workspace.join(REVISIONS_FILE))
            .context("Failed to save revision store")?;
        let params = serde_json::to_vec_pretty(&state.ctx.params)?;
        std::fs::write(workspace.join(PARAMS_FILE), params)
            .with_context(|| format!("Failed to write {PARAMS_FILE}"))?;

        let mut files = vec![REVISIONS_FILE.to_string(), PARAMS_FILE.to_string()];
        if workspace.join(METADATA_FILE).exists() {
            files.push(METADATA_FILE.to_string());
        }
        let archived = self
            .services
            .artifacts
            .archive(
                &state.identity.job_name,
                state.identity.build_number,
                workspace,
                &files,
            )
            .await
            .context("Failed to archive revision snapshot")?;
        Ok(archived)
    }

    // -----------------------------------------------------------------------
    // Success branch
    // -----------------------------------------------------------------------

    async fn on_success(&self, state: &mut RunState, result: RunResult) -> RunResult {
        state.enter(Stage::Downstream);
        let hooked = self.hooks.on_success(&mut state.hook_ctx(Some(result))).await;
        if let Err(e) = hooked {
            return state.fail(Stage::Downstream, &e);
        }

        let marked = self
            .services
            .artifacts
            .mark_successful(&state.identity.job_name, state.identity.build_number)
            .await;
        if let Err(e) = marked {
            state.ignore(Stage::Downstream, &e);
        }

        for downstream in &self.config.downstream {
            let params = downstream_params(&state.revisions, downstream);
            let run = self
                .trigger(state, Stage::Downstream, &downstream.job, params, false)
                .await;
            state.report.triggered.push(run);
        }
        result
    }

    async fn trigger(
        &self,
        state: &mut RunState,
        stage: Stage,
        job: &str,
        params: Vars,
        wait: bool,
    ) -> TriggeredRun {
        let request = TriggerRequest {
            job: job.to_string(),
            params,
            wait,
        };
        let triggered = self.services.trigger.trigger(&request).await;
        match triggered {
            Ok(outcome) => {
                if let TriggerOutcome::Completed(r) = outcome {
                    if !r.is_success() {
                        warn!(job = %job, result = %r, "triggered run did not succeed");
                    }
                }
                info!(job = %job, outcome = ?outcome, "run triggered");
                state.record(stage, true, Some(job.to_string()));
                TriggeredRun {
                    job: request.job,
                    params: request.params,
                    outcome: Some(outcome),
                    error: None,
                }
            }
            Err(e) => {
                state.ignore(stage, &e);
                TriggeredRun {
                    job: request.job,
                    params: request.params,
                    outcome: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Finish
    // -----------------------------------------------------------------------

    async fn finish(&self, state: &mut RunState, mut result: RunResult) -> RunResult {
        state.enter(Stage::Cleanup);
        let hooked = self.hooks.cleanup(&mut state.hook_ctx(Some(result))).await;
        match hooked {
            Ok(()) => state.record(Stage::Cleanup, true, None),
            Err(e) => result = state.fail(Stage::Cleanup, &e),
        }

        if !self.config.notify.when.contains(&result) {
            info!(result = %result, "result not in notification interest set");
            return result;
        }

        state.enter(Stage::Notify);
        state.notification.append_blank();
        state.notification.append_all_revisions(&state.revisions);
        let posted = state
            .notification
            .post(result, &state.identity, &state.ctx, self.services.mailer.as_ref())
            .await;
        match posted {
            Ok(outcome) => {
                state.record(Stage::Notify, true, Some(format!("{outcome:?}")));
                state.report.notification = Some(outcome);
            }
            Err(e) => state.ignore(Stage::Notify, &e),
        }
        result
    }
}

/// Parameters for a downstream run: `<component>_repo` / `<component>_rev`
/// for every recorded checkout, then the configured ones on top.
fn downstream_params(revisions: &RevisionStore, downstream: &DownstreamRun) -> Vars {
    let mut params = Vars::new();
    if downstream.pass_revisions {
        for (component, key, value) in revisions.iter() {
            let Ok(component) = Component::new(component) else {
                continue;
            };
            let suffix = match VarSuffix::of(key) {
                Some(VarSuffix::Rev) => ParamSuffix::Rev,
                Some(VarSuffix::GitUrl) => ParamSuffix::Repo,
                _ => continue,
            };
            params.insert(component.param(suffix), value.to_string());
        }
    }
    params.extend(downstream.params.clone());
    params
}

async fn remove_tmp_dir(path: &Path) {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => debug!(path = %path.display(), "temporary directory removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "cannot remove temporary directory"),
    }
}

/// Move `bundle` (absolute or workspace-relative) to the workspace root.
async fn move_result_bundle(workspace: &Path, bundle: &Path) {
    let source = workspace.join(bundle);
    let Some(name) = source.file_name() else {
        warn!(bundle = %bundle.display(), "result bundle has no file name");
        return;
    };
    let target = workspace.join(name);
    if source == target {
        return;
    }
    if !source.exists() {
        debug!(bundle = %source.display(), "no result bundle to move");
        return;
    }

    let moved = match tokio::fs::rename(&source, &target).await {
        Ok(()) => Ok(()),
        // Cross-device moves fall back to copy + remove.
        Err(_) => match tokio::fs::copy(&source, &target).await {
            Ok(_) => tokio::fs::remove_file(&source).await,
            Err(e) => Err(e),
        },
    };
    match moved {
        Ok(()) => info!(from = %source.display(), to = %target.display(), "result bundle moved"),
        Err(e) => warn!(bundle = %source.display(), error = %e, "cannot move result bundle"),
    }
}
