//! teci Core Library
//!
//! Revision resolution and propagation for TE test runs:
//! - `resolver`: effective repository URL and revision per component
//! - `revisions`: the per-run revision store, persisted as `all.rev`
//! - `metadata`: the `meta_data.json` document for the reporting importer
//! - `notify`: the plain-text notification mailed at the end of a run
//! - `services`: checkout, artifact, mail, trigger and node interfaces

pub mod component;
pub mod context;
pub mod error;
pub mod fakes;
pub mod metadata;
pub mod notify;
pub mod obs;
pub mod params;
pub mod resolver;
pub mod revisions;
pub mod services;
pub mod telemetry;

pub use component::{Component, ParamSuffix, VarSuffix};
pub use context::{RunContext, RunIdentity, RunResult, Vars, USER_PLACEHOLDER};
pub use error::{Result, TeciError};
pub use metadata::{
    collect_run_metas, revision_metas, Meta, MetaType, MetadataDocument, Metas, METADATA_FILE, METADATA_VERSION,
};
pub use notify::{NotificationBuffer, PostOutcome};
pub use params::{resolve_params, ParamSpec, PARAMS_FILE};
pub use resolver::{CheckoutOverrides, CheckoutParams, Resolver, DEFAULT_BRANCH};
pub use revisions::{RevisionStore, REVISIONS_FILE};
pub use services::{
    ArtifactStore, BranchRef, BuildSelector, CheckoutOutcome, CheckoutService, EmailMessage,
    FsArtifactStore, GitCheckout, Mailer, NodeDirectory, ProcessTrigger, RunTrigger,
    SendmailMailer, StaticNodes, TriggerOutcome, TriggerRequest,
};
pub use telemetry::init_tracing;

/// teci version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
