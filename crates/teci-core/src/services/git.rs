//! Git-backed checkout service.

use async_trait::async_trait;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use super::{BranchRef, CheckoutOutcome, CheckoutService};
use crate::error::{Result, TeciError};
use crate::resolver::CheckoutParams;

/// Checks out repositories with the `git` executable.
///
/// A revision naming a remote branch ends up on a local branch of the same
/// name; anything else (tag, commit hash) is checked out detached.
#[derive(Debug, Clone)]
pub struct GitCheckout {
    program: String,
}

impl Default for GitCheckout {
    fn default() -> Self {
        Self {
            program: "git".to_string(),
        }
    }
}

impl GitCheckout {
    pub fn new() -> Self {
        Self::default()
    }

    async fn git(&self, dir: &Path, args: &[&str], component: &str) -> Result<String> {
        debug!(component = %component, args = ?args, "running git");
        let output = Command::new(&self.program)
            .args(args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| TeciError::Checkout {
                component: component.to_string(),
                reason: format!("failed to run git: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TeciError::Checkout {
                component: component.to_string(),
                reason: format!("git {} failed: {}", args.join(" "), stderr.trim()),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl CheckoutService for GitCheckout {
    async fn checkout(
        &self,
        workspace: &Path,
        params: &CheckoutParams,
    ) -> Result<CheckoutOutcome> {
        let component = params.component.as_str();
        let target = workspace.join(&params.target_dir);
        let depth = params.depth.map(|d| format!("--depth={d}"));

        if target.join(".git").exists() {
            self.git(&target, &["remote", "set-url", "origin", &params.url], component)
                .await?;
        } else {
            tokio::fs::create_dir_all(&target).await?;
            let mut args = vec!["clone", "--no-checkout"];
            if let Some(d) = depth.as_deref() {
                args.push(d);
            }
            args.extend([params.url.as_str(), "."]);
            self.git(&target, &args, component).await?;
        }

        let mut fetch = vec!["fetch", "--tags", "origin"];
        if let Some(d) = depth.as_deref() {
            fetch.push(d);
        }
        fetch.push("+refs/heads/*:refs/remotes/origin/*");
        self.git(&target, &fetch, component).await?;

        // ls-remote patterns match on the ref tail, so `v1` would also hit
        // `release/v1`. Only an exact `refs/heads/<rev>` line counts.
        let head_ref = format!("refs/heads/{}", params.revision);
        let heads = self
            .git(&target, &["ls-remote", "--heads", "origin", &head_ref], component)
            .await?;
        let is_branch = heads
            .lines()
            .any(|line| line.split('\t').nth(1) == Some(head_ref.as_str()));

        let branch = if !is_branch {
            self.git(
                &target,
                &["checkout", "--force", "--detach", &params.revision],
                component,
            )
            .await?;
            BranchRef::Detached
        } else {
            let remote_ref = format!("refs/remotes/origin/{}", params.revision);
            self.git(
                &target,
                &["checkout", "--force", "-B", &params.revision, &remote_ref],
                component,
            )
            .await?;
            BranchRef::Named(params.revision.clone())
        };

        let commit = self.git(&target, &["rev-parse", "HEAD"], component).await?;
        if commit.is_empty() {
            return Err(TeciError::Checkout {
                component: component.to_string(),
                reason: "git rev-parse HEAD returned empty output".to_string(),
            });
        }

        Ok(CheckoutOutcome { commit, branch })
    }
}
