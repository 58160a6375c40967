//! Pipeline configuration, loaded from a TOML job definition.
//!
//! ```toml
//! configuration = "cfg-a"
//! inherit_revisions_from = "te-nightly"
//!
//! [[components]]
//! name = "te"
//!
//! [[components]]
//! name = "ts"
//! depth = 1
//!
//! [action]
//! name = "run"
//! command = ["./run.sh", "--cfg=cfg-a"]
//! timeout_secs = 7200
//!
//! [notify]
//! recipients = "dev@example.com;qa@example.com"
//! when = ["FAILURE", "UNSTABLE"]
//! ```

use anyhow::Context;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use teci_core::{CheckoutOverrides, Component, ParamSpec, RunResult, StaticNodes, Vars};

use crate::stage::StageConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Job name used when the caller does not supply one.
    #[serde(default)]
    pub job: Option<String>,

    /// Identifier of the tested configuration (`CFG`).
    pub configuration: String,

    /// Named lock held around execution. Defaults to `configuration`.
    #[serde(default)]
    pub lock: Option<String>,

    /// Job whose last successful `all.rev` seeds this run's context.
    #[serde(default)]
    pub inherit_revisions_from: Option<String>,

    /// Declared run parameters.
    #[serde(default)]
    pub params: Vec<ParamSpec>,

    /// Required component checkouts, in order.
    #[serde(default)]
    pub components: Vec<ComponentConfig>,

    #[serde(default)]
    pub site_config: Option<SiteConfig>,

    /// Checkout done after the required ones. Skipped when no URL resolves
    /// for it.
    #[serde(default)]
    pub extra_checkout: Option<ComponentConfig>,

    #[serde(default)]
    pub node_prepare: Option<NodePrepare>,

    /// The test/build action. A run without one only checks out.
    #[serde(default)]
    pub action: Option<ActionConfig>,

    #[serde(default)]
    pub stats: Option<StageConfig>,

    /// Extra workspace patterns archived best effort.
    #[serde(default)]
    pub archive: Vec<String>,

    #[serde(default)]
    pub publish_logs: Option<LogPublishing>,

    /// Runs triggered after a successful run.
    #[serde(default)]
    pub downstream: Vec<DownstreamRun>,

    #[serde(default)]
    pub notify: NotifyConfig,

    /// Extra metas with fixed values.
    #[serde(default)]
    pub metas: IndexMap<String, String>,

    /// Metas filled from the run context, then the environment.
    #[serde(default)]
    pub meta_lookups: Vec<String>,

    #[serde(default)]
    pub hooks: HookCommands,

    /// Label -> nodes table for fan-out.
    #[serde(default)]
    pub nodes: StaticNodes,
}

impl PipelineConfig {
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig = toml::from_str(text).context("invalid pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline config {:?}", path))?;
        Self::from_toml(&text).with_context(|| format!("in {:?}", path))
    }

    /// Lock name for the execution stage.
    pub fn lock_name(&self) -> &str {
        self.lock.as_deref().unwrap_or(&self.configuration)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.configuration.is_empty() {
            anyhow::bail!("configuration must not be empty");
        }
        if let Some(action) = &self.action {
            if action.stage.command.is_empty() {
                anyhow::bail!("action {} has empty command", action.stage.name);
            }
        }

        let names: Vec<&Component> = self
            .components
            .iter()
            .map(|c| &c.name)
            .chain(self.site_config.iter().map(|s| &s.name))
            .chain(self.extra_checkout.iter().map(|c| &c.name))
            .collect();
        for (i, name) in names.iter().enumerate() {
            if let Some(other) = names[..i].iter().find(|other| other.shares_vars_with(name)) {
                anyhow::bail!(
                    "components {other} and {name} both use the {}_* variables",
                    name.var_prefix()
                );
            }
        }
        Ok(())
    }
}

/// One component checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ComponentConfig {
    pub name: Component,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
    #[serde(default)]
    pub depth: Option<u32>,
}

impl ComponentConfig {
    pub fn new(name: Component) -> Self {
        Self {
            name,
            url: None,
            revision: None,
            target_dir: None,
            depth: None,
        }
    }

    pub fn overrides(&self) -> CheckoutOverrides {
        CheckoutOverrides {
            url: self.url.clone(),
            revision: self.revision.clone(),
            target_dir: self.target_dir.clone(),
            depth: self.depth,
        }
    }
}

/// Site-specific configuration repository and the dotenv file to load
/// from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SiteConfig {
    pub name: Component,
    /// Path of the dotenv file, relative to the checkout.
    pub file: PathBuf,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub revision: Option<String>,
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

impl SiteConfig {
    pub fn checkout(&self) -> ComponentConfig {
        ComponentConfig {
            name: self.name.clone(),
            url: self.url.clone(),
            revision: self.revision.clone(),
            target_dir: self.target_dir.clone(),
            depth: Some(1),
        }
    }
}

/// Command run on every node carrying `label` before the action. `{node}`
/// in the command is replaced with the node name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodePrepare {
    pub label: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionConfig {
    #[serde(flatten)]
    pub stage: StageConfig,

    /// Workspace-relative directory removed after the action.
    #[serde(default)]
    pub tmp_dir: Option<PathBuf>,

    /// File moved into the workspace after the action.
    #[serde(default)]
    pub result_bundle: Option<PathBuf>,
}

/// When to publish logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishWhen {
    #[default]
    Always,
    OnSuccess,
    OnFailure,
    Never,
}

impl PublishWhen {
    pub fn matches(&self, result: RunResult) -> bool {
        match self {
            PublishWhen::Always => true,
            PublishWhen::OnSuccess => result.is_success(),
            PublishWhen::OnFailure => !result.is_success(),
            PublishWhen::Never => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogPublishing {
    /// Job that imports the logs; triggered synchronously.
    pub job: String,
    #[serde(default)]
    pub when: PublishWhen,
    #[serde(default)]
    pub params: Vars,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownstreamRun {
    pub job: String,
    #[serde(default)]
    pub params: Vars,
    /// Pass `<component>_rev` parameters for every checked-out component.
    #[serde(default = "default_true")]
    pub pass_revisions: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotifyConfig {
    /// `;`-separated addresses.
    #[serde(default)]
    pub recipients: String,
    #[serde(default)]
    pub sender: Option<String>,
    #[serde(default)]
    pub subject_prefix: Option<String>,
    #[serde(default)]
    pub subject_trailer: Option<String>,
    /// Results that trigger a notification.
    #[serde(default = "RunResult::all")]
    pub when: Vec<RunResult>,
    #[serde(default)]
    pub attachments: Vec<String>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            recipients: String::new(),
            sender: None,
            subject_prefix: None,
            subject_trailer: None,
            when: RunResult::all(),
            attachments: Vec::new(),
        }
    }
}

/// Shell commands bound to hook points.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookCommands {
    #[serde(default)]
    pub pre_start: Option<Vec<String>>,
    #[serde(default)]
    pub pre_run: Option<Vec<String>>,
    #[serde(default)]
    pub post_run: Option<Vec<String>>,
    #[serde(default)]
    pub post_always: Option<Vec<String>>,
    #[serde(default)]
    pub on_success: Option<Vec<String>>,
    #[serde(default)]
    pub cleanup: Option<Vec<String>>,
    #[serde(default = "default_hook_timeout")]
    pub timeout_secs: u64,
}

fn default_hook_timeout() -> u64 {
    600
}
