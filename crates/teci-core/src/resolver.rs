//! Checkout parameter resolution.
//!
//! URL precedence, first non-empty wins:
//! 1. explicit override
//! 2. run parameter `<component>_repo`
//! 3. context variable `<COMPONENT>_GIT_URL`
//! 4. environment variable `<COMPONENT>_GIT_URL`
//!
//! Revision precedence:
//! 1. explicit override
//! 2. run parameter `<component>_rev`
//! 3. context variable `<COMPONENT>_REV`
//! 4. environment variable `<COMPONENT>_REV`
//! 5. run parameter `<component>_branch`
//! 6. context variable `<COMPONENT>_DEF_BRANCH`
//! 7. [`DEFAULT_BRANCH`]

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::component::{Component, ParamSuffix, VarSuffix};
use crate::context::{lookup, RunContext};
use crate::error::{Result, TeciError};

/// Revision used when no source names one.
pub const DEFAULT_BRANCH: &str = "main";

/// Per-call overrides, highest precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckoutOverrides {
    pub url: Option<String>,
    pub revision: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub depth: Option<u32>,
}

/// Resolved inputs for one checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutParams {
    pub component: Component,
    pub url: String,
    pub revision: String,
    pub target_dir: PathBuf,
    /// Shallow clone depth hint; `None` means full history.
    pub depth: Option<u32>,
}

/// Resolves URLs and revisions against a [`RunContext`]. Read-only.
pub struct Resolver<'a> {
    ctx: &'a RunContext,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Resolve the repository URL, or `None` if no source defines one.
    pub fn resolve_url(&self, component: &Component, url_override: Option<&str>) -> Option<String> {
        let var = component.var(VarSuffix::GitUrl);
        url_override
            .filter(|v| !v.is_empty())
            .or_else(|| lookup(&self.ctx.params, &component.param(ParamSuffix::Repo)))
            .or_else(|| lookup(&self.ctx.context, &var))
            .or_else(|| lookup(&self.ctx.env, &var))
            .map(|url| self.ctx.substitute_user(url))
    }

    /// Resolve the URL of a required component; absence is fatal.
    pub fn require_url(&self, component: &Component, url_override: Option<&str>) -> Result<String> {
        self.resolve_url(component, url_override)
            .ok_or_else(|| TeciError::MissingUrl {
                component: component.to_string(),
                param: component.param(ParamSuffix::Repo),
                var: component.var(VarSuffix::GitUrl),
            })
    }

    /// Resolve the revision or branch to check out. Never fails.
    pub fn resolve_revision(&self, component: &Component, rev_override: Option<&str>) -> String {
        let rev_var = component.var(VarSuffix::Rev);
        rev_override
            .filter(|v| !v.is_empty())
            .or_else(|| lookup(&self.ctx.params, &component.param(ParamSuffix::Rev)))
            .or_else(|| lookup(&self.ctx.context, &rev_var))
            .or_else(|| lookup(&self.ctx.env, &rev_var))
            .or_else(|| lookup(&self.ctx.params, &component.param(ParamSuffix::Branch)))
            .or_else(|| lookup(&self.ctx.context, &component.var(VarSuffix::DefBranch)))
            .unwrap_or(DEFAULT_BRANCH)
            .to_string()
    }

    /// Resolve everything needed to check out `component`.
    pub fn resolve_checkout(
        &self,
        component: &Component,
        overrides: &CheckoutOverrides,
    ) -> Result<CheckoutParams> {
        let url = self.require_url(component, overrides.url.as_deref())?;
        let revision = self.resolve_revision(component, overrides.revision.as_deref());
        let target_dir = overrides
            .target_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(component.as_str()));

        Ok(CheckoutParams {
            component: component.clone(),
            url,
            revision,
            target_dir,
            depth: overrides.depth,
        })
    }
}
