//! Drives one local send job through its steps.
//!
//! The runner is the only writer of a local job's progress. It re-reads the
//! ledger record at every suspension point (pre-start delay, inter-step
//! delay, pause wait, after each executor call) so pause and cancel flags
//! written by any context take effect without shared memory. Waits are
//! `select!`s over the remaining time, the job's cancellation token and its
//! wake signal, so a cancel lands immediately even deep inside a long delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::EngineError;
use crate::history::HistorySink;
use crate::job::{AuditRecord, Job, JobStatus, MessageBlock, StateMachine, Transition};
use crate::notify::ChangeNotifier;
use crate::provider::ProviderError;
use crate::scheduler::JobHandle;
use crate::toast::{Toaster, terminal_summary};

/// Performs the actual transmission of one step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(
        &self,
        channel: &str,
        destination: &str,
        block: &MessageBlock,
    ) -> Result<StepReceipt, ProviderError>;
}

/// What the executor got back for a successful step.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepReceipt {
    pub body: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerSettings {
    /// How often a paused runner re-reads its record.
    pub pause_poll: Duration,
    /// Longest a wait goes without re-reading the record, even with no signal.
    pub recheck: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            pause_poll: Duration::from_millis(500),
            recheck: Duration::from_millis(100),
        }
    }
}

/// Shared collaborators handed to every runner.
#[derive(Clone)]
pub struct RunnerDeps {
    pub notifier: Arc<ChangeNotifier>,
    pub executor: Arc<dyn StepExecutor>,
    pub history: Arc<dyn HistorySink>,
    pub toaster: Arc<dyn Toaster>,
    pub settings: RunnerSettings,
}

enum Flow {
    Continue,
    Cancelled,
    /// Another context already finalized the record.
    Finished(JobStatus),
}

pub(crate) struct StepRunner {
    job_id: String,
    handle: JobHandle,
    deps: RunnerDeps,
    receipts: Vec<Option<serde_json::Value>>,
}

impl StepRunner {
    pub(crate) fn new(job_id: String, handle: JobHandle, deps: RunnerDeps) -> Self {
        Self {
            job_id,
            handle,
            deps,
            receipts: Vec::new(),
        }
    }

    /// Run to a terminal state and return it. Never panics on collaborator
    /// failure; an internal error marks the job as failed when possible.
    pub(crate) async fn run(mut self) -> JobStatus {
        match self.drive().await {
            Ok(status) => status,
            Err(EngineError::Frozen { status, .. }) => self.finalized_elsewhere(status),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Runner failed");
                match self.finish(Transition::Fail(e.to_string())) {
                    Ok(status) => status,
                    Err(e) => {
                        tracing::warn!(job_id = %self.job_id, error = %e, "Could not record runner failure");
                        JobStatus::Error
                    }
                }
            }
        }
    }

    async fn drive(&mut self) -> Result<JobStatus, EngineError> {
        let job = self.reload()?;
        if job.is_terminal() {
            return Ok(job.status);
        }
        if job.status == JobStatus::Pending {
            self.deps.notifier.publish_update(&self.job_id, |j| {
                if j.status == JobStatus::Pending {
                    StateMachine::apply(j, Transition::Start)
                } else {
                    Ok(())
                }
            })?;
            tracing::info!(job_id = %self.job_id, steps = job.steps.len(), "Send job started");
        }

        if job.progress.current == 0 {
            match self.wait(job.delays.start()).await? {
                Flow::Continue => {}
                Flow::Cancelled => return self.finish(Transition::Cancel),
                Flow::Finished(status) => return Ok(self.finalized_elsewhere(status)),
            }
        }

        let total = job.steps.len();
        let mut index = job.progress.current;
        while index < total {
            match self.checkpoint().await? {
                Flow::Continue => {}
                Flow::Cancelled => return self.finish(Transition::Cancel),
                Flow::Finished(status) => return Ok(self.finalized_elsewhere(status)),
            }

            let job = self.reload()?;
            if job.is_terminal() {
                return Ok(self.finalized_elsewhere(job.status));
            }
            let (Some(channel), Some(destination)) = (job.target.channel(), job.target.destination())
            else {
                return Err(EngineError::Validation(format!("job {} has no target", job.id)));
            };
            let block = &job.steps[index];

            tracing::debug!(job_id = %self.job_id, step = index, kind = block.content_type(), "Executing step");
            match self.deps.executor.execute(channel, destination, block).await {
                Ok(receipt) => {
                    self.receipts.push(receipt.body);
                    let job = self.deps.notifier.publish_update(&self.job_id, |j| {
                        StateMachine::apply(j, Transition::Advance(index + 1))
                    })?;
                    self.handle.set_progress(job.progress);
                }
                Err(e) => {
                    tracing::warn!(job_id = %self.job_id, step = index, error = %e, "Step failed, aborting job");
                    self.deps.notifier.publish_update(&self.job_id, |j| {
                        StateMachine::apply(j, Transition::Advance(index + 1))
                    })?;
                    return self.finish(Transition::Fail(e.to_string()));
                }
            }

            index += 1;
            if index < total {
                match self.wait(job.delays.step()).await? {
                    Flow::Continue => {}
                    Flow::Cancelled => return self.finish(Transition::Cancel),
                    Flow::Finished(status) => return Ok(self.finalized_elsewhere(status)),
                }
            }
        }

        self.finish(Transition::Complete)
    }

    /// Observe control flags; blocks for as long as the job is paused.
    async fn checkpoint(&self) -> Result<Flow, EngineError> {
        loop {
            let job = self.reload()?;
            if job.is_terminal() {
                return Ok(Flow::Finished(job.status));
            }
            if job.control.cancel_requested || self.handle.is_cancelled() {
                return Ok(Flow::Cancelled);
            }

            if !job.control.pause_requested {
                if job.status == JobStatus::Paused {
                    self.deps.notifier.publish_update(&self.job_id, |j| {
                        if j.status == JobStatus::Paused {
                            StateMachine::apply(j, Transition::Resume)
                        } else {
                            Ok(())
                        }
                    })?;
                    tracing::info!(job_id = %self.job_id, progress = %job.progress, "Send job resumed");
                }
                return Ok(Flow::Continue);
            }

            if job.status == JobStatus::Running {
                self.deps.notifier.publish_update(&self.job_id, |j| {
                    if j.status == JobStatus::Running {
                        StateMachine::apply(j, Transition::Pause)
                    } else {
                        Ok(())
                    }
                })?;
                tracing::info!(job_id = %self.job_id, progress = %job.progress, "Send job paused");
            }

            tokio::select! {
                _ = self.handle.cancelled() => {}
                _ = self.handle.woken() => {}
                _ = tokio::time::sleep(self.deps.settings.pause_poll) => {}
            }
        }
    }

    /// Wait `duration` of running time. Paused time does not count.
    async fn wait(&self, duration: Duration) -> Result<Flow, EngineError> {
        let mut remaining = duration;
        loop {
            match self.checkpoint().await? {
                Flow::Continue => {}
                stop => return Ok(stop),
            }
            if remaining.is_zero() {
                return Ok(Flow::Continue);
            }

            let slice = remaining.min(self.deps.settings.recheck);
            let started = Instant::now();
            tokio::select! {
                _ = self.handle.cancelled() => {}
                _ = self.handle.woken() => {}
                _ = tokio::time::sleep(slice) => {}
            }
            remaining = remaining.saturating_sub(started.elapsed());
        }
    }

    fn reload(&self) -> Result<Job, EngineError> {
        self.deps
            .notifier
            .ledger()
            .get(&self.job_id)?
            .ok_or_else(|| EngineError::JobNotFound(self.job_id.clone()))
    }

    /// The record is frozen; report its status without sending anything else.
    fn finalized_elsewhere(&self, status: JobStatus) -> JobStatus {
        if let Ok(Some(job)) = self.deps.notifier.ledger().get(&self.job_id) {
            self.handle.set_progress(job.progress);
        }
        tracing::info!(job_id = %self.job_id, %status, "Job finalized elsewhere, runner stopping");
        status
    }

    fn finish(&self, transition: Transition) -> Result<JobStatus, EngineError> {
        let job = self
            .deps
            .notifier
            .publish_update(&self.job_id, |j| StateMachine::apply(j, transition))?;
        self.handle.set_progress(job.progress);
        tracing::info!(
            job_id = %self.job_id,
            status = %job.status,
            progress = %job.progress,
            error = job.error.as_deref().unwrap_or(""),
            "Send job finished",
        );

        let payload = serde_json::json!({
            "steps": job.steps,
            "responses": self.receipts,
        });
        let record = AuditRecord::from_job(&job, payload);
        let history = Arc::clone(&self.deps.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(record).await {
                tracing::warn!(error = %e, "Failed to write job history");
            }
        });

        if let Some((severity, message)) = terminal_summary(&job) {
            self.deps.toaster.notify(&message, severity);
        }
        Ok(job.status)
    }
}
