//! Run stage definitions and command stage configuration.

use serde::{Deserialize, Serialize};

/// Fixed stages of a run, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreStart,
    InheritRevisions,
    SiteConfig,
    Checkout,
    ExtraCheckout,
    Lock,
    PreRun,
    NodePrepare,
    Action,
    PostRun,
    Statistics,
    Metadata,
    ArchiveRevisions,
    Archive,
    PublishLogs,
    PostAlways,
    Downstream,
    Cleanup,
    Notify,
}

impl Stage {
    /// Get the stage name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            Stage::PreStart => "pre_start",
            Stage::InheritRevisions => "inherit_revisions",
            Stage::SiteConfig => "site_config",
            Stage::Checkout => "checkout",
            Stage::ExtraCheckout => "extra_checkout",
            Stage::Lock => "lock",
            Stage::PreRun => "pre_run",
            Stage::NodePrepare => "node_prepare",
            Stage::Action => "action",
            Stage::PostRun => "post_run",
            Stage::Statistics => "statistics",
            Stage::Metadata => "metadata",
            Stage::ArchiveRevisions => "archive_revisions",
            Stage::Archive => "archive",
            Stage::PublishLogs => "publish_logs",
            Stage::PostAlways => "post_always",
            Stage::Downstream => "downstream",
            Stage::Cleanup => "cleanup",
            Stage::Notify => "notify",
        }
    }

    /// Stages that run whatever the outcome of the earlier ones.
    pub fn always_runs(&self) -> bool {
        matches!(
            self,
            Stage::Metadata
                | Stage::ArchiveRevisions
                | Stage::Archive
                | Stage::PublishLogs
                | Stage::PostAlways
                | Stage::Cleanup
                | Stage::Notify
        )
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Configuration for an external command stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    /// Command to execute (first element is executable).
    pub command: Vec<String>,

    /// Timeout in seconds; 0 waits forever.
    #[serde(default)]
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl StageConfig {
    /// Create a custom stage configuration.
    pub fn custom(name: impl Into<String>, command: Vec<String>, timeout_secs: u64) -> Self {
        Self {
            name: name.into(),
            command,
            timeout_secs,
            enabled: true,
        }
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::PreStart.name(), "pre_start");
        assert_eq!(Stage::ArchiveRevisions.name(), "archive_revisions");
        assert_eq!(Stage::Notify.to_string(), "notify");
    }

    #[test]
    fn test_always_stages() {
        assert!(Stage::Cleanup.always_runs());
        assert!(Stage::Metadata.always_runs());
        assert!(!Stage::Checkout.always_runs());
        assert!(!Stage::Downstream.always_runs());
    }

    #[test]
    fn test_stage_config_custom() {
        let config = StageConfig::custom("my_stage", vec!["echo".to_string(), "hello".to_string()], 60);
        assert_eq!(config.name, "my_stage");
        assert_eq!(config.timeout_secs, 60);
        assert!(config.enabled);
    }

    #[test]
    fn test_stage_config_disabled() {
        let config = StageConfig::custom("run", vec!["true".to_string()], 0).disabled();
        assert!(!config.enabled);
    }

    #[test]
    fn test_stage_config_serde_defaults() {
        let config: StageConfig =
            serde_json::from_str(r#"{"name":"run","command":["./run.sh"]}"#).unwrap();
        assert_eq!(config.timeout_secs, 0);
        assert!(config.enabled);
    }
}
