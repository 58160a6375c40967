//! Plain-text run notification accumulated across stages and mailed at the
//! end of the run.

use std::collections::BTreeSet;
use tracing::info;

use crate::component::VarSuffix;
use crate::context::{RunContext, RunIdentity, RunResult};
use crate::error::Result;
use crate::revisions::RevisionStore;
use crate::services::{EmailMessage, Mailer};

/// What [`NotificationBuffer::post`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostOutcome {
    /// No recipients were configured.
    Skipped,
    Sent,
}

#[derive(Debug, Clone, Default)]
pub struct NotificationBuffer {
    lines: Vec<String>,
    recipients: BTreeSet<String>,
    sender: Option<String>,
    subject_prefix: Option<String>,
    subject_trailer: Option<String>,
    attachments: Vec<String>,
}

impl NotificationBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the text and write the header lines.
    pub fn start(&mut self, identity: &RunIdentity) {
        self.lines.clear();
        self.append(format!("Workspace: {}", identity.workspace.display()));
        self.append(format!("Job: {}", identity.job_name));
        self.append(format!("Build: {}", identity.display_name()));
        self.append(format!("Host: {}", identity.host));
        if let Some(url) = &identity.url {
            self.append(format!("URL: {url}"));
        }
        self.append(format!("Started: {}", identity.started_at.to_rfc3339()));
        self.append_blank();
    }

    pub fn append(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }

    pub fn append_blank(&mut self) {
        self.lines.push(String::new());
    }

    pub fn append_variable(&mut self, name: &str, value: &str) {
        self.append(format!("{name}={value}"));
    }

    /// Append every `*_REV` entry of `store` as `KEY=value`, sorted, under a
    /// `Revisions:` header.
    pub fn append_all_revisions(&mut self, store: &RevisionStore) {
        let mut revs: Vec<String> = store
            .iter()
            .filter(|(_, key, _)| VarSuffix::of(key) == Some(VarSuffix::Rev))
            .map(|(_, key, value)| format!("{key}={value}"))
            .collect();
        revs.sort();

        self.append("Revisions:");
        self.lines.extend(revs);
    }

    /// Replace the recipient set with a `;`-separated address list.
    pub fn set_recipients(&mut self, addresses: &str) {
        self.recipients.clear();
        self.add_recipients(addresses);
    }

    /// Merge a `;`-separated address list into the recipient set.
    pub fn add_recipients(&mut self, addresses: &str) {
        self.recipients.extend(
            addresses
                .split(';')
                .map(str::trim)
                .filter(|a| !a.is_empty())
                .map(str::to_string),
        );
    }

    pub fn set_sender(&mut self, sender: impl Into<String>) {
        self.sender = Some(sender.into());
    }

    pub fn set_subject_prefix(&mut self, prefix: impl Into<String>) {
        self.subject_prefix = Some(prefix.into());
    }

    pub fn set_subject_trailer(&mut self, trailer: impl Into<String>) {
        self.subject_trailer = Some(trailer.into());
    }

    pub fn set_attachments(&mut self, patterns: Vec<String>) {
        self.attachments = patterns;
    }

    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.recipients.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// `"<prefix> job <display-name>: <RESULT>[ <trailer>]"`.
    pub fn subject(&self, identity: &RunIdentity, result: RunResult) -> String {
        let prefix = self
            .subject_prefix
            .clone()
            .unwrap_or_else(|| format!("[CI {}]", identity.job_name));
        let mut subject = format!("{} job {}: {}", prefix, identity.display_name(), result);
        if let Some(trailer) = self.subject_trailer.as_deref().filter(|t| !t.is_empty()) {
            subject.push(' ');
            subject.push_str(trailer);
        }
        subject
    }

    /// Finish the text with `OK` / `FAIL` and hand it to `mailer`.
    ///
    /// With no recipients nothing is sent. The text is empty afterwards in
    /// every case.
    pub async fn post(
        &mut self,
        result: RunResult,
        identity: &RunIdentity,
        ctx: &RunContext,
        mailer: &dyn Mailer,
    ) -> Result<PostOutcome> {
        if self.recipients.is_empty() {
            info!(job = %identity.job_name, "no notification recipients, not sending");
            self.lines.clear();
            return Ok(PostOutcome::Skipped);
        }

        if self.is_empty() {
            self.start(identity);
        }
        self.append(if result.is_success() { "OK" } else { "FAIL" });

        let message = EmailMessage {
            subject: self.subject(identity, result),
            to: self.recipients.iter().cloned().collect(),
            from: self.sender.as_deref().map(|s| ctx.substitute_user(s)),
            body: self.text(),
            attachments: self.attachments.clone(),
        };
        self.lines.clear();

        mailer.send(&message).await?;
        info!(subject = %message.subject, recipients = message.to.len(), "notification sent");
        Ok(PostOutcome::Sent)
    }
}
