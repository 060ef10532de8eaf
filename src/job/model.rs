use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error text recorded on every job stopped through a cancel request.
pub const CANCELLED_BY_USER: &str = "Cancelled by user";

/// Which executor owns a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Steps are transmitted one by one by a runner in this process.
    LocalSequentialSend,
    /// Steps run on the verification server; we only mirror its state.
    RemoteVerification,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Error,
    Cancelled,
}

impl JobStatus {
    /// Returns true when no further progress can happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parses the status vocabulary used by the verification server.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" | "queued" => Some(Self::Pending),
            "running" | "processing" | "in_progress" => Some(Self::Running),
            "paused" => Some(Self::Paused),
            "completed" | "done" | "finished" => Some(Self::Completed),
            "error" | "failed" => Some(Self::Error),
            "cancelled" | "canceled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Attempted-steps counter. `current` never exceeds `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
}

impl Progress {
    pub fn new(total: usize) -> Self {
        Self { current: 0, total }
    }

    pub fn is_done(&self) -> bool {
        self.current >= self.total
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.current, self.total)
    }
}

/// Where the work goes and which outbound instances perform it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub destinations: Vec<String>,
    pub channels: Vec<String>,
}

impl Target {
    pub fn single(destination: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            destinations: vec![destination.into()],
            channels: vec![channel.into()],
        }
    }

    pub fn destination(&self) -> Option<&str> {
        self.destinations.first().map(String::as_str)
    }

    pub fn channel(&self) -> Option<&str> {
        self.channels.first().map(String::as_str)
    }
}

/// Flags written by the control surface and observed by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlFlags {
    #[serde(default)]
    pub cancel_requested: bool,
    #[serde(default)]
    pub pause_requested: bool,
}

/// Waits applied by the local runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delays {
    /// Wait before the first step.
    pub start_ms: u64,
    /// Wait between two consecutive steps.
    pub step_ms: u64,
}

impl Delays {
    pub fn new(start_ms: u64, step_ms: u64) -> Self {
        Self { start_ms, step_ms }
    }

    pub fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }

    pub fn step(&self) -> Duration {
        Duration::from_millis(self.step_ms)
    }
}

/// One message block of a combined send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBlock {
    Text {
        text: String,
    },
    Image {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Video {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
    Audio {
        url: String,
    },
    Document {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        file_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl MessageBlock {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Image { .. } => "image",
            Self::Video { .. } => "video",
            Self::Audio { .. } => "audio",
            Self::Document { .. } => "document",
        }
    }

    /// Checks that the block carries a payload worth sending.
    pub fn validate(&self) -> Result<(), String> {
        let missing = match self {
            Self::Text { text } => text.trim().is_empty(),
            Self::Image { url, .. }
            | Self::Video { url, .. }
            | Self::Audio { url }
            | Self::Document { url, .. } => url.trim().is_empty(),
        };
        if missing {
            Err(format!("{} block has no content", self.content_type()))
        } else {
            Ok(())
        }
    }
}

/// Outcome for one number checked by the verification server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub number: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jid: Option<String>,
}

/// One unit of orchestrated work as stored in the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub status: JobStatus,
    #[serde(default)]
    pub steps: Vec<MessageBlock>,
    pub progress: Progress,
    pub target: Target,
    #[serde(default)]
    pub control: ControlFlags,
    #[serde(default)]
    pub delays: Delays,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<VerificationResult>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a pending local send job owned by `context`.
    pub fn local(context: &str, target: Target, steps: Vec<MessageBlock>, delays: Delays) -> Self {
        let now = Utc::now();
        Self {
            id: local_job_id(context),
            kind: JobKind::LocalSequentialSend,
            status: JobStatus::Pending,
            progress: Progress::new(steps.len()),
            steps,
            target,
            control: ControlFlags::default(),
            delays,
            error: None,
            results: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Builds the local mirror of a server-side verification job.
    pub fn remote(remote_id: i64, target: Target, total: usize) -> Self {
        let now = Utc::now();
        Self {
            id: remote_id.to_string(),
            kind: JobKind::RemoteVerification,
            status: JobStatus::Pending,
            steps: Vec::new(),
            progress: Progress::new(total),
            target,
            control: ControlFlags::default(),
            delays: Delays::default(),
            error: None,
            results: Vec::new(),
            started_at: now,
            updated_at: now,
        }
    }

    /// Server-assigned id, for remote jobs only.
    pub fn remote_id(&self) -> Option<i64> {
        match self.kind {
            JobKind::RemoteVerification => self.id.parse().ok(),
            JobKind::LocalSequentialSend => None,
        }
    }

    pub fn is_local(&self) -> bool {
        self.kind == JobKind::LocalSequentialSend
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// `<context>-<unix millis>-<random suffix>`.
pub fn local_job_id(context: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{context}-{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

/// Structured audit record written when a job reaches a terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub job_id: String,
    pub kind: JobKind,
    pub outcome: JobStatus,
    pub destinations: Vec<String>,
    pub channels: Vec<String>,
    pub progress: Progress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub payload: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl AuditRecord {
    /// Generate an audit record from a finished job.
    pub fn from_job(job: &Job, payload: serde_json::Value) -> Self {
        let now = Utc::now();
        let duration = now - job.started_at;

        Self {
            job_id: job.id.clone(),
            kind: job.kind,
            outcome: job.status,
            destinations: job.target.destinations.clone(),
            channels: job.target.channels.clone(),
            progress: job.progress,
            error: job.error.clone(),
            payload,
            started_at: job.started_at,
            finished_at: now,
            duration_ms: duration.num_milliseconds(),
        }
    }
}
