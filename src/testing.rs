//! In-process doubles for the engine's collaborators.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::EngineError;
use crate::history::HistorySink;
use crate::job::{AuditRecord, JobStatus, MessageBlock};
use crate::poller::VerificationAuthority;
use crate::provider::{ProviderError, RemoteJobStatus, RemoteProgress, VerificationRequest};
use crate::runner::{StepExecutor, StepReceipt};
use crate::toast::{Severity, Toaster};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Records every block it is asked to send; optionally fails at one index.
#[derive(Default)]
pub struct ScriptedExecutor {
    fail_at: Option<usize>,
    sent: Mutex<Vec<MessageBlock>>,
}

impl ScriptedExecutor {
    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::default()
        }
    }

    pub fn texts(&self) -> Vec<String> {
        lock(&self.sent)
            .iter()
            .map(|block| match block {
                MessageBlock::Text { text } => text.clone(),
                other => other.content_type().to_string(),
            })
            .collect()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        _channel: &str,
        _destination: &str,
        block: &MessageBlock,
    ) -> Result<StepReceipt, ProviderError> {
        let index = {
            let mut sent = lock(&self.sent);
            sent.push(block.clone());
            sent.len() - 1
        };
        if self.fail_at == Some(index) {
            return Err(ProviderError::ApiError {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        Ok(StepReceipt {
            body: Some(serde_json::json!({ "index": index })),
        })
    }
}

#[derive(Default)]
pub struct RecordingToaster {
    messages: Mutex<Vec<(Severity, String)>>,
}

impl RecordingToaster {
    pub fn messages(&self) -> Vec<(Severity, String)> {
        lock(&self.messages).clone()
    }

    pub fn count(&self) -> usize {
        lock(&self.messages).len()
    }
}

impl Toaster for RecordingToaster {
    fn notify(&self, message: &str, severity: Severity) {
        lock(&self.messages).push((severity, message.to_string()));
    }
}

#[derive(Default)]
pub struct RecordingHistory {
    broken: bool,
    records: Mutex<Vec<AuditRecord>>,
}

impl RecordingHistory {
    /// A sink whose every write fails.
    pub fn broken() -> Self {
        Self {
            broken: true,
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        lock(&self.records).clone()
    }

    pub fn outcomes(&self) -> Vec<JobStatus> {
        lock(&self.records).iter().map(|r| r.outcome).collect()
    }
}

#[async_trait]
impl HistorySink for RecordingHistory {
    async fn record(&self, record: AuditRecord) -> Result<(), EngineError> {
        if self.broken {
            return Err(EngineError::Io(std::io::Error::other("history offline")));
        }
        lock(&self.records).push(record);
        Ok(())
    }
}

pub fn remote_status(status: &str, current: usize, total: usize) -> RemoteJobStatus {
    RemoteJobStatus {
        status: status.to_string(),
        progress: RemoteProgress { current, total },
        results: Vec::new(),
        error: None,
    }
}

/// Scripted verification server. Each id replays its status queue; the last
/// entry repeats forever.
pub struct FakeAuthority {
    next_id: Mutex<i64>,
    scripts: Mutex<HashMap<i64, VecDeque<RemoteJobStatus>>>,
    failures: Mutex<HashMap<i64, usize>>,
    latency: Mutex<HashMap<i64, Duration>>,
    fetches: Mutex<HashMap<i64, usize>>,
    active: Mutex<Vec<i64>>,
    created: Mutex<Vec<VerificationRequest>>,
    commands: Mutex<Vec<(String, i64)>>,
}

impl Default for FakeAuthority {
    fn default() -> Self {
        Self {
            next_id: Mutex::new(100),
            scripts: Mutex::default(),
            failures: Mutex::default(),
            latency: Mutex::default(),
            fetches: Mutex::default(),
            active: Mutex::default(),
            created: Mutex::default(),
            commands: Mutex::default(),
        }
    }
}

impl FakeAuthority {
    pub fn script(&self, job_id: i64, statuses: Vec<RemoteJobStatus>) {
        lock(&self.scripts).insert(job_id, statuses.into());
    }

    pub fn fail_next_fetches(&self, job_id: i64, count: usize) {
        lock(&self.failures).insert(job_id, count);
    }

    pub fn set_latency(&self, job_id: i64, latency: Duration) {
        lock(&self.latency).insert(job_id, latency);
    }

    pub fn set_active(&self, ids: Vec<i64>) {
        *lock(&self.active) = ids;
    }

    pub fn fetches(&self, job_id: i64) -> usize {
        lock(&self.fetches).get(&job_id).copied().unwrap_or(0)
    }

    pub fn created(&self) -> Vec<VerificationRequest> {
        lock(&self.created).clone()
    }

    pub fn commands(&self) -> Vec<(String, i64)> {
        lock(&self.commands).clone()
    }

    fn log(&self, verb: &str, job_id: i64) {
        lock(&self.commands).push((verb.to_string(), job_id));
    }
}

#[async_trait]
impl VerificationAuthority for FakeAuthority {
    async fn create_job(&self, request: &VerificationRequest) -> Result<i64, ProviderError> {
        lock(&self.created).push(request.clone());
        let mut next = lock(&self.next_id);
        let id = *next;
        *next += 1;
        Ok(id)
    }

    async fn fetch_status(&self, job_id: i64) -> Result<RemoteJobStatus, ProviderError> {
        *lock(&self.fetches).entry(job_id).or_insert(0) += 1;
        let latency = lock(&self.latency).get(&job_id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        {
            let mut failures = lock(&self.failures);
            if let Some(left) = failures.get_mut(&job_id) {
                if *left > 0 {
                    *left -= 1;
                    return Err(ProviderError::ApiError {
                        status: 503,
                        message: "server unavailable".to_string(),
                    });
                }
            }
        }

        let mut scripts = lock(&self.scripts);
        let queue = scripts.get_mut(&job_id).ok_or(ProviderError::ApiError {
            status: 404,
            message: format!("job {job_id} not found"),
        })?;
        let status = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        status.ok_or(ProviderError::Decode("empty script".to_string()))
    }

    async fn list_active(&self) -> Result<Vec<i64>, ProviderError> {
        Ok(lock(&self.active).clone())
    }

    async fn pause(&self, job_id: i64) -> Result<(), ProviderError> {
        self.log("pause", job_id);
        Ok(())
    }

    async fn resume(&self, job_id: i64) -> Result<(), ProviderError> {
        self.log("resume", job_id);
        Ok(())
    }

    async fn cancel(&self, job_id: i64) -> Result<(), ProviderError> {
        self.log("cancel", job_id);
        Ok(())
    }
}
