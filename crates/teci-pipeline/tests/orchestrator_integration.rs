//! Integration tests for the run orchestrator with in-memory services.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use teci_core::fakes::{MemoryArtifactStore, MemoryCheckout, MemoryMailer, MemoryTrigger};
use teci_core::{
    ArtifactStore, BuildSelector, MetadataDocument, PostOutcome, RevisionStore, RunContext,
    RunIdentity, RunResult, TeciError, TriggerOutcome, Vars,
};
use teci_pipeline::{
    ArchiveOutcome, HookContext, Hooks, LocalLocks, LockManager, Orchestrator, PipelineConfig,
    Services, Stage,
};

struct Harness {
    checkout: Arc<MemoryCheckout>,
    artifacts: Arc<MemoryArtifactStore>,
    mailer: Arc<MemoryMailer>,
    trigger: Arc<MemoryTrigger>,
    locks: Arc<LocalLocks>,
}

impl Harness {
    fn new() -> Self {
        Self {
            checkout: Arc::new(MemoryCheckout::new()),
            artifacts: Arc::new(MemoryArtifactStore::new()),
            mailer: Arc::new(MemoryMailer::new()),
            trigger: Arc::new(MemoryTrigger::new()),
            locks: Arc::new(LocalLocks::new()),
        }
    }

    fn orchestrator(&self, toml: &str) -> Orchestrator {
        let config = PipelineConfig::from_toml(toml).expect("valid config");
        let services = Services {
            checkout: self.checkout.clone(),
            artifacts: self.artifacts.clone(),
            mailer: self.mailer.clone(),
            trigger: self.trigger.clone(),
            locks: self.locks.clone(),
            nodes: Arc::new(config.nodes.clone()),
        };
        Orchestrator::new(config, services)
    }
}

fn vars(pairs: &[(&str, &str)]) -> Vars {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn identity(workspace: &Path) -> RunIdentity {
    RunIdentity::new("nightly", 7, workspace.to_path_buf())
}

/// Hooks that record which slots ran.
#[derive(Default)]
struct RecordingHooks {
    calls: Mutex<Vec<&'static str>>,
}

impl RecordingHooks {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn push(&self, name: &'static str) {
        self.calls.lock().unwrap().push(name);
    }
}

#[async_trait]
impl Hooks for RecordingHooks {
    async fn pre_start(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("pre_start");
        Ok(())
    }

    async fn pre_run(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("pre_run");
        Ok(())
    }

    async fn post_run(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("post_run");
        Ok(())
    }

    async fn post_always(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("post_always");
        Ok(())
    }

    async fn on_success(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("on_success");
        Ok(())
    }

    async fn cleanup(&self, _run: &mut HookContext<'_>) -> anyhow::Result<()> {
        self.push("cleanup");
        Ok(())
    }
}

const SUCCESSFUL: &str = r#"
configuration = "cfg-a"
archive = ["*.log"]
meta_lookups = ["BUILD_TAG", "NOT_SET_ANYWHERE"]

[[components]]
name = "te"

[[components]]
name = "ts"
depth = 1

[action]
name = "run"
command = ["sh", "-c", "echo \"running $TE_REV\" > run.log"]
timeout_secs = 30

[[downstream]]
job = "import"
params = { suite = "smoke" }

[notify]
recipients = "dev@example.com;qa@example.com"
sender = "__USER__@example.com"

[metas]
CAMPAIGN = "weekly"
"#;

/// Test: a full successful run
#[tokio::test]
async fn test_successful_run() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let hooks = Arc::new(RecordingHooks::default());
    let orchestrator = h.orchestrator(SUCCESSFUL).with_hooks(hooks.clone());

    let ctx = RunContext::new(
        vars(&[("te_repo", "https://git.example.com/te.git"), ("te_rev", "v2.0")]),
        vars(&[("TS_GIT_URL", "https://git.example.com/ts.git"), ("BUILD_TAG", "ci-nightly-7")]),
        Some("alice".to_string()),
    );
    let report = orchestrator
        .run(identity(ws.path()), ctx)
        .await
        .expect("run should complete");

    assert_eq!(report.result, RunResult::Success);
    assert!(report.error.is_none());
    assert_eq!(
        hooks.calls(),
        vec!["pre_start", "pre_run", "post_run", "post_always", "on_success", "cleanup"]
    );

    // Checkouts resolved from parameters and environment.
    let requests = h.checkout.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].url, "https://git.example.com/te.git");
    assert_eq!(requests[0].revision, "v2.0");
    assert_eq!(requests[1].url, "https://git.example.com/ts.git");
    assert_eq!(requests[1].revision, "main");
    assert_eq!(requests[1].depth, Some(1));

    // The action saw the checked-out revision.
    let log = std::fs::read_to_string(ws.path().join("run.log")).unwrap();
    assert_eq!(log.trim(), "running v2.0-commit");

    // Revision snapshot archived and loadable by a later run.
    assert_eq!(report.revisions.get("te", "TE_REV"), Some("v2.0-commit"));
    assert_eq!(report.revisions.get("ts", "TS_BRANCH"), Some("main"));
    let archived = h.artifacts.archived("nightly", 7);
    for file in ["all.rev", "params.json", "meta_data.json", "run.log"] {
        assert!(archived.iter().any(|a| a == file), "{file} not archived");
    }
    assert_eq!(h.artifacts.last_successful("nightly"), Some(7));
    let reloaded = RevisionStore::load_from_external_run(h.artifacts.as_ref(), "nightly").await;
    assert_eq!(reloaded, report.revisions);

    // Metadata document.
    let doc: MetadataDocument =
        serde_json::from_slice(&std::fs::read(ws.path().join("meta_data.json")).unwrap()).unwrap();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.get("CFG").unwrap().value, "cfg-a");
    assert_eq!(doc.get("RESULT").unwrap().value, "SUCCESS");
    assert_eq!(doc.get("TE_REV").unwrap().value, "v2.0-commit");
    assert_eq!(doc.get("CAMPAIGN").unwrap().value, "weekly");
    assert_eq!(doc.get("BUILD_TAG").unwrap().value, "ci-nightly-7");
    assert!(doc.get("NOT_SET_ANYWHERE").is_none());
    assert!(doc.get("TE_GIT_URL").is_none());
    assert!(doc.get("START_TIMESTAMP").is_some());

    // Best-effort archive and downstream trigger.
    assert!(matches!(&report.archive, Some(ArchiveOutcome::Archived(files)) if files == &vec!["run.log".to_string()]));
    let triggered = h.trigger.requests();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].job, "import");
    assert!(!triggered[0].wait);
    assert_eq!(triggered[0].params["te_rev"], "v2.0-commit");
    assert_eq!(triggered[0].params["ts_repo"], "https://git.example.com/ts.git");
    assert_eq!(triggered[0].params["suite"], "smoke");

    // Notification.
    assert_eq!(report.notification, Some(PostOutcome::Sent));
    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].subject, "[CI nightly] job #7: SUCCESS");
    assert_eq!(sent[0].from.as_deref(), Some("alice@example.com"));
    assert_eq!(sent[0].to.len(), 2);
    assert!(sent[0].body.contains("Revisions:\nTE_REV=v2.0-commit\nTS_REV=main-commit"));
    assert!(sent[0].body.trim_end().ends_with("OK"));

    // Lock released.
    assert!(h.locks.try_acquire("cfg-a").await.unwrap().is_some());
}

/// Test: action failure runs guaranteed cleanup and skips downstream runs
#[tokio::test]
async fn test_action_failure() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-b"

        [[components]]
        name = "te"
        url = "https://git.example.com/te.git"

        [action]
        name = "run"
        command = ["sh", "-c", "mkdir -p tmp/work && echo partial > out/results.tar; exit 2"]
        tmp_dir = "tmp"
        result_bundle = "out/results.tar"

        [publish_logs]
        job = "publish-logs"
        when = "on_failure"

        [[downstream]]
        job = "import"

        [notify]
        recipients = "dev@example.com"
        subject_trailer = "(cfg-b)"
        "#,
    );
    std::fs::create_dir_all(ws.path().join("out")).unwrap();
    h.trigger.set_result(RunResult::Success);

    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .expect("action failure is not fatal");

    assert_eq!(report.result, RunResult::Failure);
    let action = report.action.as_ref().unwrap();
    assert_eq!(action.exit_code, 2);
    assert!(!ws.path().join("tmp").exists());
    assert!(ws.path().join("results.tar").exists());
    assert!(!ws.path().join("out/results.tar").exists());
    assert!(!report.ran(Stage::PostRun));

    // Log publishing is synchronous, downstream runs are skipped.
    let triggered = h.trigger.requests();
    assert_eq!(triggered.len(), 1);
    assert_eq!(triggered[0].job, "publish-logs");
    assert!(triggered[0].wait);
    assert_eq!(triggered[0].params["result"], "FAILURE");
    assert_eq!(
        report.triggered[0].outcome,
        Some(TriggerOutcome::Completed(RunResult::Success))
    );
    assert_eq!(h.artifacts.last_successful("nightly"), None);

    // Revisions are archived on failure too.
    assert!(h.artifacts.get("nightly", 7, "all.rev").is_some());

    let sent = h.mailer.sent();
    assert_eq!(sent[0].subject, "[CI nightly] job #7: FAILURE (cfg-b)");
    assert!(sent[0].body.contains("Action run failed with exit code 2"));
    assert!(sent[0].body.trim_end().ends_with("FAIL"));
}

/// Test: a missing URL aborts the run but cleanup and notification still run
#[tokio::test]
async fn test_missing_url_is_fatal() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let hooks = Arc::new(RecordingHooks::default());
    let orchestrator = h
        .orchestrator(
            r#"
            configuration = "cfg-c"

            [[components]]
            name = "te"

            [action]
            name = "run"
            command = ["sh", "-c", "touch ran"]

            [[downstream]]
            job = "import"

            [notify]
            recipients = "dev@example.com"
            "#,
        )
        .with_hooks(hooks.clone());

    let err = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.error.downcast_ref::<TeciError>(),
        Some(TeciError::MissingUrl { component, .. }) if component == "te"
    ));

    // The report of the aborted run comes back with the error.
    let report = &err.report;
    assert_eq!(report.result, RunResult::Failure);
    assert!(report
        .error
        .as_deref()
        .is_some_and(|e| e.starts_with("no repository URL for component te")));
    assert!(report.ran(Stage::PreStart));
    assert!(report.ran(Stage::Cleanup));
    assert!(!report.ran(Stage::Action));
    assert_eq!(report.notification, Some(PostOutcome::Sent));

    assert!(!ws.path().join("ran").exists());
    assert_eq!(hooks.calls(), vec!["pre_start", "post_always", "cleanup"]);
    assert!(h.trigger.requests().is_empty());
    assert!(h.artifacts.get("nightly", 7, "meta_data.json").is_some());

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.ends_with("FAILURE"));
    assert!(sent[0].body.contains("Aborted: no repository URL for component te"));
}

/// Test: archive failures never change the run result
#[tokio::test]
async fn test_archive_failure_is_ignored() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.artifacts.fail_pattern("logs/**");
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-d"
        archive = ["logs/**"]

        [action]
        name = "run"
        command = ["true"]
        "#,
    );

    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap();

    assert_eq!(report.result, RunResult::Success);
    assert!(matches!(report.archive, Some(ArchiveOutcome::Failed(_))));
    assert_eq!(report.failed_stages(), vec![Stage::Archive]);
    // No recipients: nothing sent, not an error.
    assert_eq!(report.notification, Some(PostOutcome::Skipped));
    assert!(h.mailer.sent().is_empty());
}

/// Test: revisions inherited from another job feed resolution without
/// overriding parameters
#[tokio::test]
async fn test_inherited_revisions() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();

    let mut upstream = RevisionStore::new();
    upstream.put("te", "TE_GIT_URL", "https://git.example.com/te.git");
    upstream.put("te", "TE_REV", "aaa111");
    upstream.put("ts", "TS_GIT_URL", "https://git.example.com/ts.git");
    upstream.put("ts", "TS_REV", "bbb222");
    h.artifacts
        .insert("te-build", 12, "all.rev", upstream.serialize().unwrap());
    h.artifacts.mark_successful("te-build", 12).await.unwrap();

    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-e"
        inherit_revisions_from = "te-build"

        [[components]]
        name = "te"

        [[components]]
        name = "ts"
        "#,
    );
    let ctx = RunContext::new(vars(&[("ts_rev", "pinned")]), Vars::new(), None);
    let report = orchestrator.run(identity(ws.path()), ctx).await.unwrap();

    let requests = h.checkout.requests();
    assert_eq!(requests[0].url, "https://git.example.com/te.git");
    assert_eq!(requests[0].revision, "aaa111");
    assert_eq!(requests[1].url, "https://git.example.com/ts.git");
    assert_eq!(requests[1].revision, "pinned");
    assert!(report.ran(Stage::InheritRevisions));
}

/// Test: a missing upstream snapshot leaves resolution untouched
#[tokio::test]
async fn test_missing_inherited_snapshot_is_empty() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-e"
        inherit_revisions_from = "never-built"

        [[components]]
        name = "te"
        url = "https://git.example.com/te.git"
        "#,
    );
    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap();
    assert_eq!(report.result, RunResult::Success);
    assert_eq!(h.checkout.requests()[0].revision, "main");
}

/// Test: the site config supplies URLs for later checkouts
#[tokio::test]
async fn test_site_config_feeds_context() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    h.checkout.add_file(
        "tsconf",
        "env/site.env",
        "TE_GIT_URL=https://mirror.example.com/te.git\nRIG=rig-1\n",
    );
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-f"

        [site_config]
        name = "tsconf"
        url = "https://git.example.com/tsconf.git"
        file = "env/site.env"

        [[components]]
        name = "te"

        [extra_checkout]
        name = "tsrigs"

        [action]
        name = "run"
        command = ["sh", "-c", "test \"$RIG\" = rig-1"]
        "#,
    );

    let env = vars(&[("TE_GIT_URL", "https://env.example.com/te.git")]);
    let report = orchestrator
        .run(identity(ws.path()), RunContext::new(Vars::new(), env, None))
        .await
        .unwrap();

    assert_eq!(report.result, RunResult::Success);
    let requests = h.checkout.requests();
    assert_eq!(requests.len(), 2, "extra checkout without URL is skipped");
    assert_eq!(requests[0].component.as_str(), "tsconf");
    assert_eq!(requests[1].url, "https://mirror.example.com/te.git");
    assert_eq!(
        report.stage(Stage::ExtraCheckout).next().unwrap().detail.as_deref(),
        Some("skipped")
    );
}

/// Test: notification only for results in the interest set
#[tokio::test]
async fn test_notification_interest_set() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-g"

        [notify]
        recipients = "dev@example.com"
        when = ["FAILURE", "UNSTABLE"]
        "#,
    );
    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap();
    assert_eq!(report.result, RunResult::Success);
    assert_eq!(report.notification, None);
    assert!(h.mailer.sent().is_empty());
}

/// Test: mail delivery failure does not fail the run
#[tokio::test]
async fn test_mail_failure_is_ignored() {
    let ws = tempfile::tempdir().unwrap();
    let mut h = Harness::new();
    h.mailer = Arc::new(MemoryMailer::failing());
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-g"

        [notify]
        recipients = "dev@example.com"
        "#,
    );
    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap();
    assert_eq!(report.result, RunResult::Success);
    assert_eq!(report.failed_stages(), vec![Stage::Notify]);
}

/// Test: node preparation fans out and an unknown label is fatal
#[tokio::test]
async fn test_node_prepare() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-h"

        [node_prepare]
        label = "rig"
        command = ["sh", "-c", "touch prepared-{node}"]

        [nodes]
        rig = ["rig-1", "rig-2"]
        "#,
    );
    let report = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap();
    assert_eq!(report.result, RunResult::Success);
    assert!(ws.path().join("prepared-rig-1").exists());
    assert!(ws.path().join("prepared-rig-2").exists());

    let ws = tempfile::tempdir().unwrap();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-h"

        [node_prepare]
        label = "gpu"
        command = ["true"]
        "#,
    );
    let err = orchestrator
        .run(identity(ws.path()), RunContext::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err.error.downcast_ref::<TeciError>(),
        Some(TeciError::NoNodes { label }) if label == "gpu"
    ));
    assert!(err.report.ran(Stage::Lock));
}

/// Test: runs on the same lock name are serialised
#[tokio::test]
async fn test_runs_wait_for_lock() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = Arc::new(h.orchestrator(
        r#"
        configuration = "cfg-i"
        lock = "rig-pool"
        "#,
    ));

    let held = h.locks.acquire("rig-pool").await.unwrap();
    let run = {
        let orchestrator = orchestrator.clone();
        let workspace = ws.path().to_path_buf();
        tokio::spawn(async move {
            orchestrator
                .run(RunIdentity::new("nightly", 8, workspace), RunContext::default())
                .await
        })
    };

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert!(!run.is_finished());

    drop(held);
    let report = tokio::time::timeout(std::time::Duration::from_secs(5), run)
        .await
        .expect("run finishes once the lock is free")
        .unwrap()
        .unwrap();
    assert_eq!(report.result, RunResult::Success);
}

/// Test: effective parameters are archived for sticky parameters
#[tokio::test]
async fn test_params_archived() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator("configuration = \"cfg-j\"");
    let params = vars(&[("te_rev", "v1")]);
    orchestrator
        .run(identity(ws.path()), RunContext::new(params.clone(), Vars::new(), None))
        .await
        .unwrap();

    let bytes = h
        .artifacts
        .fetch("nightly", "params.json", BuildSelector::LastSuccessful)
        .await
        .unwrap();
    let archived: BTreeMap<String, String> = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(archived, params);
}

/// Test: a cancelled run stops its action but still cleans up and notifies
#[tokio::test]
async fn test_cancelled_run_is_aborted() {
    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let hooks = Arc::new(RecordingHooks::default());
    let orchestrator = h
        .orchestrator(
            r#"
            configuration = "cfg-k"

            [action]
            name = "run"
            command = ["sh", "-c", "sleep 30 && touch finished"]
            timeout_secs = 60

            [[downstream]]
            job = "import"

            [notify]
            recipients = "dev@example.com"
            "#,
        )
        .with_hooks(hooks.clone());

    let started = std::time::Instant::now();
    let report = orchestrator
        .run_until(
            identity(ws.path()),
            RunContext::default(),
            tokio::time::sleep(std::time::Duration::from_millis(300)),
        )
        .await
        .expect("a cancelled run still reports");
    assert!(started.elapsed() < std::time::Duration::from_secs(10));

    assert_eq!(report.result, RunResult::Aborted);
    assert_eq!(report.error.as_deref(), Some("cancelled"));
    let action: Vec<_> = report.stage(Stage::Action).collect();
    assert_eq!(action.len(), 1);
    assert!(!action[0].ok);
    assert_eq!(action[0].detail.as_deref(), Some("cancelled"));
    assert!(!ws.path().join("finished").exists());

    assert_eq!(hooks.calls(), vec!["pre_start", "pre_run", "post_always", "cleanup"]);
    assert!(h.trigger.requests().is_empty());

    let meta = h.artifacts.get("nightly", 7, "meta_data.json").unwrap();
    let doc: MetadataDocument = serde_json::from_slice(&meta).unwrap();
    assert_eq!(doc.get("RESULT").unwrap().value, "ABORTED");

    let sent = h.mailer.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].subject.ends_with("ABORTED"));
    assert!(sent[0].body.contains("Aborted: run cancelled during action"));

    // The lock was released with the dropped stage.
    let again = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        h.locks.acquire("cfg-k"),
    )
    .await;
    assert!(again.is_ok());
}

/// Test: metadata and notification share the run's start time
#[tokio::test]
async fn test_start_timestamp_matches_identity() {
    use chrono::{TimeZone, Utc};

    let ws = tempfile::tempdir().unwrap();
    let h = Harness::new();
    let orchestrator = h.orchestrator(
        r#"
        configuration = "cfg-l"

        [notify]
        recipients = "dev@example.com"
        "#,
    );

    let mut identity = identity(ws.path());
    identity.started_at = Utc.with_ymd_and_hms(2026, 5, 4, 3, 2, 1).unwrap();
    let report = orchestrator
        .run(identity, RunContext::default())
        .await
        .unwrap();

    let doc = report.metadata.expect("metadata emitted");
    assert_eq!(
        doc.get("START_TIMESTAMP").unwrap().value,
        "2026-05-04T03:02:01+00:00"
    );
    let sent = h.mailer.sent();
    assert!(sent[0].body.contains("Started: 2026-05-04T03:02:01+00:00"));
}
