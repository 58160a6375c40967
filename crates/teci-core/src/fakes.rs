//! In-memory fakes for the external service traits (testing only)
//!
//! Provides `MemoryCheckout`, `MemoryArtifactStore`, `MemoryMailer` and
//! `MemoryTrigger`, which satisfy the trait contracts and record every call.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::context::RunResult;
use crate::error::{Result, TeciError};
use crate::resolver::CheckoutParams;
use crate::services::fs::collect_matches;
use crate::services::*;

// ---------------------------------------------------------------------------
// MemoryCheckout
// ---------------------------------------------------------------------------

/// Checkout fake. Unknown components check out as commit
/// `<revision>-commit` on branch `<revision>`.
#[derive(Debug, Default)]
pub struct MemoryCheckout {
    outcomes: Mutex<HashMap<String, CheckoutOutcome>>,
    failing: Mutex<Vec<String>>,
    files: Mutex<Vec<(String, PathBuf, String)>>,
    requests: Mutex<Vec<CheckoutParams>>,
}

impl MemoryCheckout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fix the outcome reported for `component`.
    pub fn set_outcome(&self, component: &str, outcome: CheckoutOutcome) {
        self.outcomes
            .lock()
            .unwrap()
            .insert(component.to_string(), outcome);
    }

    /// Make checkouts of `component` fail.
    pub fn fail(&self, component: &str) {
        self.failing.lock().unwrap().push(component.to_string());
    }

    /// Write `contents` to `<target_dir>/<path>` when `component` is checked out.
    pub fn add_file(&self, component: &str, path: impl Into<PathBuf>, contents: &str) {
        self.files
            .lock()
            .unwrap()
            .push((component.to_string(), path.into(), contents.to_string()));
    }

    /// All checkout requests, in call order.
    pub fn requests(&self) -> Vec<CheckoutParams> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CheckoutService for MemoryCheckout {
    async fn checkout(
        &self,
        workspace: &Path,
        params: &CheckoutParams,
    ) -> Result<CheckoutOutcome> {
        let component = params.component.as_str();
        self.requests.lock().unwrap().push(params.clone());

        if self.failing.lock().unwrap().iter().any(|c| c == component) {
            return Err(TeciError::Checkout {
                component: component.to_string(),
                reason: "checkout failed".to_string(),
            });
        }

        let target = workspace.join(&params.target_dir);
        std::fs::create_dir_all(&target)?;
        let files: Vec<_> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| c == component)
            .cloned()
            .collect();
        for (_, path, contents) in files {
            let file = target.join(path);
            if let Some(parent) = file.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(file, contents)?;
        }

        let outcome = self.outcomes.lock().unwrap().get(component).cloned();
        Ok(outcome.unwrap_or_else(|| CheckoutOutcome {
            commit: format!("{}-commit", params.revision),
            branch: BranchRef::Named(params.revision.clone()),
        }))
    }
}

// ---------------------------------------------------------------------------
// MemoryArtifactStore
// ---------------------------------------------------------------------------

type BuildKey = (String, u64);

/// Artifact store fake backed by `HashMap<(job, build), path -> bytes>`.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    builds: Mutex<HashMap<BuildKey, BTreeMap<String, Vec<u8>>>>,
    last_successful: Mutex<HashMap<String, u64>>,
    failing_patterns: Mutex<Vec<String>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store bytes directly, as if archived by an earlier run.
    pub fn insert(&self, job: &str, build: u64, path: &str, bytes: Vec<u8>) {
        self.builds
            .lock()
            .unwrap()
            .entry((job.to_string(), build))
            .or_default()
            .insert(path.to_string(), bytes);
    }

    /// Make any `archive` call that includes `pattern` fail.
    pub fn fail_pattern(&self, pattern: &str) {
        self.failing_patterns
            .lock()
            .unwrap()
            .push(pattern.to_string());
    }

    /// Paths archived for a build.
    pub fn archived(&self, job: &str, build: u64) -> Vec<String> {
        self.builds
            .lock()
            .unwrap()
            .get(&(job.to_string(), build))
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, job: &str, build: u64, path: &str) -> Option<Vec<u8>> {
        self.builds
            .lock()
            .unwrap()
            .get(&(job.to_string(), build))
            .and_then(|files| files.get(path).cloned())
    }

    pub fn last_successful(&self, job: &str) -> Option<u64> {
        self.last_successful.lock().unwrap().get(job).copied()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn archive(
        &self,
        job: &str,
        build: u64,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Vec<String>> {
        {
            let failing = self.failing_patterns.lock().unwrap();
            if let Some(p) = patterns.iter().find(|p| failing.contains(p)) {
                return Err(TeciError::Artifact(format!("cannot archive {p}")));
            }
        }

        let matches = collect_matches(workspace, patterns)?;
        let mut archived = Vec::new();
        for rel in matches {
            let bytes = std::fs::read(workspace.join(&rel))?;
            let name = rel.to_string_lossy().replace('\\', "/");
            self.insert(job, build, &name, bytes);
            archived.push(name);
        }
        Ok(archived)
    }

    async fn fetch(&self, job: &str, path: &str, selector: BuildSelector) -> Result<Vec<u8>> {
        let build = match selector {
            BuildSelector::Build(n) => Some(n),
            BuildSelector::LastSuccessful => self.last_successful(job),
        };
        build
            .and_then(|b| self.get(job, b, path))
            .ok_or_else(|| TeciError::ArtifactNotFound {
                job: job.to_string(),
                path: path.to_string(),
            })
    }

    async fn mark_successful(&self, job: &str, build: u64) -> Result<()> {
        self.last_successful
            .lock()
            .unwrap()
            .insert(job.to_string(), build);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryMailer
// ---------------------------------------------------------------------------

/// Mailer fake that keeps every message.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<EmailMessage>>,
    failing: bool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mailer whose deliveries always fail.
    pub fn failing() -> Self {
        Self {
            sent: Mutex::default(),
            failing: true,
        }
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Mailer for MemoryMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if self.failing {
            return Err(TeciError::Mail("delivery refused".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryTrigger
// ---------------------------------------------------------------------------

/// Trigger fake. Synchronous triggers complete with a configurable result.
#[derive(Debug)]
pub struct MemoryTrigger {
    requests: Mutex<Vec<TriggerRequest>>,
    result: Mutex<RunResult>,
}

impl Default for MemoryTrigger {
    fn default() -> Self {
        Self {
            requests: Mutex::default(),
            result: Mutex::new(RunResult::Success),
        }
    }
}

impl MemoryTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_result(&self, result: RunResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn requests(&self) -> Vec<TriggerRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl RunTrigger for MemoryTrigger {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerOutcome> {
        self.requests.lock().unwrap().push(request.clone());
        if request.wait {
            Ok(TriggerOutcome::Completed(*self.result.lock().unwrap()))
        } else {
            Ok(TriggerOutcome::Queued)
        }
    }
}
