//! Public entry points for creating and steering jobs.
//!
//! [`JobControl`] validates requests, writes them to the ledger and hands
//! them to the scheduler (local sends) or the poller (remote verifications).
//! Pause, resume and cancel only ever write flags or relay commands; the
//! runner or the server is what actually moves the job.

use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::history::HistorySink;
use crate::job::{AuditRecord, Delays, Job, JobStatus, MessageBlock, StateMachine, Target, Transition};
use crate::ledger::JobLedger;
use crate::notify::{ChangeNotifier, JobChange};
use crate::poller::{PollerSettings, RemotePoller, VerificationAuthority};
use crate::provider::VerificationRequest;
use crate::runner::{RunnerDeps, RunnerSettings, StepExecutor};
use crate::scheduler::{JobHandle, JobScheduler};
use crate::store::Storage;
use crate::toast::{Severity, Toaster, terminal_summary};

/// A combined send: every block goes to one destination through one channel.
#[derive(Debug, Clone)]
pub struct SendJobSpec {
    pub destination: String,
    pub channel: String,
    pub steps: Vec<MessageBlock>,
    /// Falls back to [`EngineSettings::delays`] when unset.
    pub delays: Option<Delays>,
}

#[derive(Debug, Clone)]
pub struct VerifyJobSpec {
    pub channels: Vec<String>,
    pub numbers: Vec<String>,
    pub delay_ms: u64,
}

/// What a control command did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Applied,
    /// The job was already in the requested state.
    Unchanged,
    /// Not applicable to the job as it stands; carries the reason.
    Ignored(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub runner: RunnerSettings,
    pub poller: PollerSettings,
    /// Delays for send jobs created without their own.
    pub delays: Delays,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            runner: RunnerSettings::default(),
            poller: PollerSettings::default(),
            delays: Delays::new(1_000, 2_000),
        }
    }
}

/// External services the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub executor: Arc<dyn StepExecutor>,
    pub authority: Arc<dyn VerificationAuthority>,
    pub history: Arc<dyn HistorySink>,
    pub toaster: Arc<dyn Toaster>,
}

pub struct JobControl {
    context: String,
    settings: EngineSettings,
    notifier: Arc<ChangeNotifier>,
    scheduler: Arc<JobScheduler>,
    poller: RemotePoller,
    authority: Arc<dyn VerificationAuthority>,
    history: Arc<dyn HistorySink>,
    toaster: Arc<dyn Toaster>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobControl {
    /// Build an engine over `storage`. `context` prefixes the ids of local
    /// jobs created here.
    pub fn new(
        storage: Arc<dyn Storage>,
        context: impl Into<String>,
        collaborators: Collaborators,
        settings: EngineSettings,
    ) -> Result<Self, EngineError> {
        let ledger = Arc::new(JobLedger::new(storage));
        let notifier = Arc::new(ChangeNotifier::new(ledger)?);
        let scheduler = Arc::new(JobScheduler::new(RunnerDeps {
            notifier: Arc::clone(&notifier),
            executor: collaborators.executor,
            history: Arc::clone(&collaborators.history),
            toaster: Arc::clone(&collaborators.toaster),
            settings: settings.runner,
        }));
        let poller = RemotePoller::new(
            Arc::clone(&collaborators.authority),
            Arc::clone(&notifier),
            Arc::clone(&collaborators.history),
            Arc::clone(&collaborators.toaster),
            settings.poller,
        );

        Ok(Self {
            context: context.into(),
            settings,
            notifier,
            scheduler,
            poller,
            authority: collaborators.authority,
            history: collaborators.history,
            toaster: collaborators.toaster,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Wire up cross-context notifications and re-attach to remote jobs left
    /// running by an earlier session. Returns how many remote jobs are tracked.
    pub async fn start(&self) -> Result<usize, EngineError> {
        {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(self.notifier.bridge_external(self.shutdown.child_token()));
            tasks.push(self.scheduler.follow_external(self.shutdown.child_token()));
        }
        let resumed = self.poller.resume_tracking().await?;
        tracing::info!(context = %self.context, resumed, "Job engine started");
        Ok(resumed)
    }

    /// Stop every runner, poller and bridge owned by this engine.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.scheduler.shutdown();
        self.poller.shutdown();
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).clear();
        tracing::debug!(context = %self.context, "Job engine stopped");
    }

    pub fn create_send(&self, spec: SendJobSpec) -> Result<JobHandle, EngineError> {
        if spec.steps.is_empty() {
            return Err(EngineError::Validation(
                "a send job needs at least one message block".to_string(),
            ));
        }
        for (index, block) in spec.steps.iter().enumerate() {
            block
                .validate()
                .map_err(|reason| EngineError::Validation(format!("block {}: {reason}", index + 1)))?;
        }
        if spec.destination.trim().is_empty() {
            return Err(EngineError::Validation("destination is required".to_string()));
        }
        if spec.channel.trim().is_empty() {
            return Err(EngineError::Validation("channel is required".to_string()));
        }

        let job = Job::local(
            &self.context,
            Target::single(spec.destination.trim(), spec.channel.trim()),
            spec.steps,
            spec.delays.unwrap_or(self.settings.delays),
        );
        let id = job.id.clone();
        self.notifier.publish(job)?;
        tracing::info!(job_id = %id, "Send job created");
        self.scheduler.spawn(&id)
    }

    pub async fn create_verification(&self, spec: VerifyJobSpec) -> Result<Job, EngineError> {
        let numbers = clean(spec.numbers);
        let channels = clean(spec.channels);
        if numbers.is_empty() {
            return Err(EngineError::Validation(
                "at least one number is required".to_string(),
            ));
        }
        if channels.is_empty() {
            return Err(EngineError::Validation(
                "at least one channel is required".to_string(),
            ));
        }

        let request = VerificationRequest {
            instances: channels.clone(),
            numbers: numbers.clone(),
            delay_ms: spec.delay_ms,
        };
        let remote_id = self.authority.create_job(&request).await?;
        let total = numbers.len();
        let job = Job::remote(
            remote_id,
            Target {
                destinations: numbers,
                channels,
            },
            total,
        );
        self.notifier.publish(job.clone())?;
        self.poller.track(remote_id);
        tracing::info!(remote_id, total, "Verification job created");
        Ok(job)
    }

    pub async fn pause(&self, id: &str) -> Result<ControlOutcome, EngineError> {
        let Some(job) = self.notifier.ledger().get(id)? else {
            return Ok(self.ignored(EngineError::JobNotFound(id.to_string()).to_string()));
        };
        if job.status != JobStatus::Running {
            return Ok(self.refuse(&job, "pause"));
        }

        match job.remote_id() {
            Some(remote_id) => {
                self.poller.pause(remote_id).await?;
                tracing::info!(remote_id, "Pause relayed");
                Ok(ControlOutcome::Applied)
            }
            None if job.control.pause_requested => Ok(ControlOutcome::Unchanged),
            None => self.set_flags(id, "pause", |j| j.control.pause_requested = true),
        }
    }

    pub async fn resume(&self, id: &str) -> Result<ControlOutcome, EngineError> {
        let Some(job) = self.notifier.ledger().get(id)? else {
            return Ok(self.ignored(EngineError::JobNotFound(id.to_string()).to_string()));
        };
        let pending_pause = job.control.pause_requested && !job.is_terminal();
        if job.status != JobStatus::Paused && !pending_pause {
            return Ok(self.refuse(&job, "resume"));
        }

        match job.remote_id() {
            Some(remote_id) => {
                self.poller.resume(remote_id).await?;
                tracing::info!(remote_id, "Resume relayed");
                Ok(ControlOutcome::Applied)
            }
            None => self.set_flags(id, "resume", |j| j.control.pause_requested = false),
        }
    }

    pub async fn cancel(&self, id: &str) -> Result<ControlOutcome, EngineError> {
        let Some(job) = self.notifier.ledger().get(id)? else {
            return Ok(self.ignored(EngineError::JobNotFound(id.to_string()).to_string()));
        };
        if job.status == JobStatus::Cancelled {
            return Ok(ControlOutcome::Unchanged);
        }
        if job.is_terminal() {
            return Ok(self.refuse(&job, "cancel"));
        }

        match job.remote_id() {
            Some(remote_id) => {
                self.poller.cancel(remote_id).await?;
                tracing::info!(remote_id, "Cancel relayed");
                Ok(ControlOutcome::Applied)
            }
            None => {
                let outcome = self.set_flags(id, "cancel", |j| j.control.cancel_requested = true)?;
                self.scheduler.cancel(id);
                Ok(outcome)
            }
        }
    }

    /// Finalize a local job as cancelled when no runner in this process owns
    /// it, e.g. because the process that started it exited mid-run. A job
    /// with a live runner here is cancelled normally.
    pub async fn abandon(&self, id: &str) -> Result<ControlOutcome, EngineError> {
        let Some(job) = self.notifier.ledger().get(id)? else {
            return Ok(self.ignored(EngineError::JobNotFound(id.to_string()).to_string()));
        };
        if !job.is_local() {
            return Ok(self.ignored(format!("job {id} runs remotely and cannot be abandoned")));
        }
        if self.scheduler.is_running(id) || job.is_terminal() {
            return self.cancel(id).await;
        }

        let job = match self
            .notifier
            .publish_update(id, |j| StateMachine::apply(j, Transition::Cancel))
        {
            Ok(job) => job,
            Err(EngineError::Frozen { .. }) => return Ok(self.refuse(&job, "abandon")),
            Err(e) => return Err(e),
        };
        tracing::warn!(job_id = %id, progress = %job.progress, "Orphaned job abandoned");

        if let Some((severity, message)) = terminal_summary(&job) {
            self.toaster.notify(&message, severity);
        }
        let record = AuditRecord::from_job(&job, serde_json::json!({ "steps": job.steps, "abandoned": true }));
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(record).await {
                tracing::warn!(error = %e, "Failed to write job history");
            }
        });
        Ok(ControlOutcome::Applied)
    }

    /// Delete a finished job from the ledger.
    pub fn remove(&self, id: &str) -> Result<ControlOutcome, EngineError> {
        let Some(job) = self.notifier.ledger().get(id)? else {
            return Ok(self.ignored(EngineError::JobNotFound(id.to_string()).to_string()));
        };
        if !job.is_terminal() {
            return Ok(self.refuse(&job, "remove"));
        }

        self.notifier.publish_removal(id)?;
        if let Some(remote_id) = job.remote_id() {
            self.poller.untrack(remote_id);
        }
        tracing::info!(job_id = %id, "Job removed");
        Ok(ControlOutcome::Applied)
    }

    /// Delete every completed, failed or cancelled job; returns what was removed.
    pub fn clear_finished(&self) -> Result<Vec<Job>, EngineError> {
        let removed = self.notifier.publish_removals_where(Job::is_terminal)?;
        for remote_id in removed.iter().filter_map(Job::remote_id) {
            self.poller.untrack(remote_id);
        }
        tracing::info!(count = removed.len(), "Cleared finished jobs");
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, EngineError> {
        self.notifier.ledger().get(id)
    }

    pub fn list(&self) -> Result<Vec<Job>, EngineError> {
        self.notifier.ledger().list()
    }

    /// Live handle of a local job running in this process.
    pub fn handle(&self, id: &str) -> Option<JobHandle> {
        self.scheduler.handle(id)
    }

    pub fn notifier(&self) -> &Arc<ChangeNotifier> {
        &self.notifier
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.notifier.subscribe()
    }

    fn set_flags<F>(&self, id: &str, action: &'static str, f: F) -> Result<ControlOutcome, EngineError>
    where
        F: FnOnce(&mut Job),
    {
        let result = self.notifier.publish_update(id, |j| {
            if j.is_terminal() {
                return Err(EngineError::Frozen {
                    id: j.id.clone(),
                    status: j.status,
                });
            }
            f(j);
            Ok(())
        });
        match result {
            Ok(_) => {
                self.scheduler.wake(id);
                tracing::info!(job_id = %id, action, "Control flag set");
                Ok(ControlOutcome::Applied)
            }
            Err(EngineError::Frozen { id, status }) => Ok(self.ignored(
                EngineError::InvalidState { id, status, action }.to_string(),
            )),
            Err(EngineError::JobNotFound(id)) => {
                Ok(self.ignored(EngineError::JobNotFound(id).to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn refuse(&self, job: &Job, action: &'static str) -> ControlOutcome {
        self.ignored(
            EngineError::InvalidState {
                id: job.id.clone(),
                status: job.status,
                action,
            }
            .to_string(),
        )
    }

    fn ignored(&self, reason: String) -> ControlOutcome {
        tracing::warn!(%reason, "Control command ignored");
        self.toaster.notify(&reason, Severity::Warning);
        ControlOutcome::Ignored(reason)
    }
}

impl Drop for JobControl {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn clean(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
