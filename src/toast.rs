//! User-facing notifications ("toasts"). Purely observational.

use crate::job::{Job, JobKind, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

pub trait Toaster: Send + Sync {
    fn notify(&self, message: &str, severity: Severity);
}

/// Routes notifications into the log.
pub struct LogToaster;

impl Toaster for LogToaster {
    fn notify(&self, message: &str, severity: Severity) {
        match severity {
            Severity::Info | Severity::Success => tracing::info!(%message, "notification"),
            Severity::Warning => tracing::warn!(%message, "notification"),
            Severity::Error => tracing::error!(%message, "notification"),
        }
    }
}

/// One-line outcome summary for a terminal job; `None` while it is still live.
pub fn terminal_summary(job: &Job) -> Option<(Severity, String)> {
    if !job.is_terminal() {
        return None;
    }
    let who = job.target.destination().unwrap_or("recipient");
    let progress = job.progress;
    let reason = job.error.as_deref().unwrap_or("unknown error");

    let summary = match (job.kind, job.status) {
        (JobKind::LocalSequentialSend, JobStatus::Completed) => (
            Severity::Success,
            format!("Sent {} message block(s) to {who}", progress.total),
        ),
        (JobKind::LocalSequentialSend, JobStatus::Cancelled) => (
            Severity::Warning,
            format!("Sending to {who} cancelled after {progress} block(s)"),
        ),
        (JobKind::LocalSequentialSend, _) => (
            Severity::Error,
            format!("Sending to {who} failed at block {progress}: {reason}"),
        ),
        (JobKind::RemoteVerification, JobStatus::Completed) => {
            let valid = job.results.iter().filter(|r| r.exists).count();
            (
                Severity::Success,
                format!(
                    "Verification {} finished: {valid} of {} number(s) on WhatsApp",
                    job.id, progress.total
                ),
            )
        }
        (JobKind::RemoteVerification, JobStatus::Cancelled) => (
            Severity::Warning,
            format!("Verification {} cancelled at {progress}", job.id),
        ),
        (JobKind::RemoteVerification, _) => (
            Severity::Error,
            format!("Verification {} failed: {reason}", job.id),
        ),
    };
    Some(summary)
}
