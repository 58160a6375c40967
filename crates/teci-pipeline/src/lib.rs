//! teci pipeline - run orchestration for TE test jobs
//!
//! Provides a run orchestrator that:
//! - Resolves and checks out components, recording what was checked out
//! - Executes the test/build action under a named lock
//! - Archives the revision snapshot and metadata, publishes logs and
//!   triggers downstream runs
//! - Mails a notification at the end of every run

pub mod config;
pub mod hooks;
pub mod lock;
pub mod nodes;
pub mod orchestrator;
pub mod runner;
pub mod site;
pub mod stage;
pub mod stats;

// Re-export key types
pub use config::{
    ActionConfig, ComponentConfig, DownstreamRun, HookCommands, LogPublishing, NodePrepare,
    NotifyConfig, PipelineConfig, PublishWhen, SiteConfig,
};
pub use hooks::{command_env, HookContext, Hooks, NoHooks, ShellHooks};
pub use lock::{FileLocks, LocalLocks, LockGuard, LockManager};
pub use nodes::on_nodes;
pub use orchestrator::{
    ArchiveOutcome, Orchestrator, RunAborted, RunReport, Services, StageRecord, TriggeredRun,
    NOTIFY_PARAM,
};
pub use runner::{CommandRunner, StageResult};
pub use site::merge_site_config;
pub use stage::{Stage, StageConfig};
pub use stats::RunStatistics;
