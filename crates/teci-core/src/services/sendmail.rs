use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{EmailMessage, Mailer};
use crate::error::{Result, TeciError};

/// Delivers mail through a local `sendmail -t` compatible program.
///
/// Attachments are not supported by this transport and are dropped with a
/// warning.
#[derive(Debug, Clone)]
pub struct SendmailMailer {
    program: String,
    default_from: String,
}

impl SendmailMailer {
    pub fn new(program: impl Into<String>, default_from: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            default_from: default_from.into(),
        }
    }

    /// RFC 5322 message text for `message`.
    pub fn render(&self, message: &EmailMessage) -> String {
        let from = message.from.as_deref().unwrap_or(&self.default_from);
        let mut out = String::new();
        out.push_str(&format!("From: {}\n", from));
        out.push_str(&format!("To: {}\n", message.to.join(", ")));
        out.push_str(&format!("Subject: {}\n", message.subject));
        out.push_str("Content-Type: text/plain; charset=utf-8\n");
        out.push('\n');
        out.push_str(&message.body);
        if !message.body.ends_with('\n') {
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl Mailer for SendmailMailer {
    async fn send(&self, message: &EmailMessage) -> Result<()> {
        if !message.attachments.is_empty() {
            warn!(
                attachments = ?message.attachments,
                "sendmail transport does not support attachments"
            );
        }

        let text = self.render(message);
        debug!(program = %self.program, to = ?message.to, "sending mail");

        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TeciError::Mail(format!("failed to run {}: {e}", self.program)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(text.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TeciError::Mail(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}
