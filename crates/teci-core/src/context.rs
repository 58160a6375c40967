//! Explicit run context: the inputs every resolution step reads from.
//!
//! Run parameters, run-scoped context variables and a snapshot of the
//! process environment are passed around as values. Nothing in this crate
//! reads or writes the real process environment.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Flat string-keyed variable mapping.
pub type Vars = BTreeMap<String, String>;

/// Placeholder replaced with the invoking user's identity.
pub const USER_PLACEHOLDER: &str = "__USER__";

/// Inputs available to a run.
#[derive(Debug, Clone, Default)]
pub struct RunContext {
    /// Run parameters supplied at trigger time. Read-only during the run.
    pub params: Vars,

    /// Run-scoped variables written by checkouts, site config and
    /// inherited revisions.
    pub context: Vars,

    /// Snapshot of the process environment.
    pub env: Vars,

    /// Identity of the invoking user.
    pub user: Option<String>,
}

impl RunContext {
    pub fn new(params: Vars, env: Vars, user: Option<String>) -> Self {
        Self {
            params,
            context: Vars::new(),
            env,
            user,
        }
    }

    /// Replace `__USER__` with the user identity. Values are returned as is
    /// when no user is known.
    pub fn substitute_user(&self, value: &str) -> String {
        match &self.user {
            Some(user) if value.contains(USER_PLACEHOLDER) => {
                value.replace(USER_PLACEHOLDER, user)
            }
            _ => value.to_string(),
        }
    }
}

/// Non-empty lookup: empty strings count as unset.
pub fn lookup<'a>(vars: &'a Vars, key: &str) -> Option<&'a str> {
    vars.get(key).map(String::as_str).filter(|v| !v.is_empty())
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl RunResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunResult::Success => "SUCCESS",
            RunResult::Unstable => "UNSTABLE",
            RunResult::Failure => "FAILURE",
            RunResult::Aborted => "ABORTED",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }

    /// All results, used as the default notification interest set.
    pub fn all() -> Vec<RunResult> {
        vec![
            RunResult::Success,
            RunResult::Unstable,
            RunResult::Failure,
            RunResult::Aborted,
        ]
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the running job, as reported by the CI host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunIdentity {
    pub job_name: String,
    pub build_number: u64,
    /// Defaults to `#<build_number>` when not set.
    pub display_name: Option<String>,
    pub url: Option<String>,
    pub workspace: PathBuf,
    pub host: String,
    pub started_at: DateTime<Utc>,
}

impl RunIdentity {
    pub fn new(job_name: impl Into<String>, build_number: u64, workspace: PathBuf) -> Self {
        Self {
            job_name: job_name.into(),
            build_number,
            display_name: None,
            url: None,
            workspace,
            host: "localhost".to_string(),
            started_at: Utc::now(),
        }
    }

    pub fn display_name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| format!("#{}", self.build_number))
    }
}
