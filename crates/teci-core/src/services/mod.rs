//! External services the orchestrator talks to.
//!
//! - `CheckoutService`: source control checkout
//! - `ArtifactStore`: per-build artifact archive and retrieval
//! - `Mailer`: email delivery
//! - `RunTrigger`: downstream run invocation
//! - `NodeDirectory`: label -> node lookup for fan-out
//!
//! All async traits are backend-agnostic. In-memory fakes live in
//! [`crate::fakes`].

pub mod fs;
pub mod git;
pub mod sendmail;
pub mod trigger;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::context::{RunResult, Vars};
use crate::error::Result;
use crate::resolver::CheckoutParams;

pub use fs::FsArtifactStore;
pub use git::GitCheckout;
pub use sendmail::SendmailMailer;
pub use trigger::ProcessTrigger;

// ---------------------------------------------------------------------------
// CheckoutService
// ---------------------------------------------------------------------------

/// Branch a checkout ended up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchRef {
    Named(String),
    /// A specific commit was checked out, not a branch.
    Detached,
}

/// Result of a checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckoutOutcome {
    /// Resolved commit hash.
    pub commit: String,
    pub branch: BranchRef,
}

/// Source control checkout.
#[async_trait]
pub trait CheckoutService: Send + Sync {
    /// Check out `params.url` at `params.revision` into
    /// `workspace/params.target_dir`.
    async fn checkout(&self, workspace: &Path, params: &CheckoutParams)
        -> Result<CheckoutOutcome>;
}

// ---------------------------------------------------------------------------
// ArtifactStore
// ---------------------------------------------------------------------------

/// Which build of a job to fetch artifacts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildSelector {
    LastSuccessful,
    Build(u64),
}

/// Per-build artifact archive.
///
/// Guarantees:
/// - `archive` stores every workspace file matching a pattern under the
///   given build and returns their workspace-relative paths.
/// - `fetch` returns the exact bytes archived for `path`.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Archive workspace files matching `patterns` (glob syntax).
    async fn archive(
        &self,
        job: &str,
        build: u64,
        workspace: &Path,
        patterns: &[String],
    ) -> Result<Vec<String>>;

    /// Fetch one archived file. Returns `TeciError::ArtifactNotFound` if the
    /// build or the file is missing.
    async fn fetch(&self, job: &str, path: &str, selector: BuildSelector) -> Result<Vec<u8>>;

    /// Record `build` as the last successful build of `job`.
    async fn mark_successful(&self, job: &str, build: u64) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Mailer
// ---------------------------------------------------------------------------

/// A message handed to the email delivery service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub subject: String,
    pub to: Vec<String>,
    pub from: Option<String>,
    pub body: String,
    /// Workspace glob patterns of files to attach.
    pub attachments: Vec<String>,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<()>;
}

// ---------------------------------------------------------------------------
// RunTrigger
// ---------------------------------------------------------------------------

/// Request to start another job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerRequest {
    pub job: String,
    pub params: Vars,
    /// Block until the triggered run finishes.
    pub wait: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerOutcome {
    /// Fire and forget: the run was started.
    Queued,
    /// Synchronous: the run finished with this result.
    Completed(RunResult),
}

#[async_trait]
pub trait RunTrigger: Send + Sync {
    async fn trigger(&self, request: &TriggerRequest) -> Result<TriggerOutcome>;
}

// ---------------------------------------------------------------------------
// NodeDirectory
// ---------------------------------------------------------------------------

/// Lookup of execution nodes by label.
pub trait NodeDirectory: Send + Sync {
    /// Nodes carrying `label`, in a stable order.
    fn nodes(&self, label: &str) -> Vec<String>;
}

/// Fixed label -> nodes table, usually loaded from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticNodes {
    labels: BTreeMap<String, Vec<String>>,
}

impl StaticNodes {
    pub fn new(labels: BTreeMap<String, Vec<String>>) -> Self {
        Self { labels }
    }
}

impl NodeDirectory for StaticNodes {
    fn nodes(&self, label: &str) -> Vec<String> {
        self.labels.get(label).cloned().unwrap_or_default()
    }
}
