//! Registry of local runners.
//!
//! [`JobScheduler`] owns one [`JobHandle`] per local job it is currently
//! running and refuses to start a second runner for the same id. Handles are
//! how the control surface (and the external-change follower) reach a runner
//! that is sleeping inside a delay.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::job::{JobStatus, Progress};
use crate::notify::{JobChange, Origin};
use crate::runner::{RunnerDeps, StepRunner};

/// Control and observation handle for one running local job.
#[derive(Clone)]
pub struct JobHandle {
    job_id: String,
    cancel: CancellationToken,
    wake: Arc<Notify>,
    progress: Arc<watch::Sender<Progress>>,
    outcome: Arc<watch::Sender<Option<JobStatus>>>,
}

impl JobHandle {
    pub(crate) fn new(job_id: String, progress: Progress) -> Self {
        Self {
            job_id,
            cancel: CancellationToken::new(),
            wake: Arc::new(Notify::new()),
            progress: Arc::new(watch::Sender::new(progress)),
            outcome: Arc::new(watch::Sender::new(None)),
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Stop the runner at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Make the runner re-read its record now instead of at the next tick.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn progress(&self) -> Progress {
        *self.progress.borrow()
    }

    pub fn watch_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    /// Wait for the runner to reach a terminal state.
    pub async fn finished(&self) -> JobStatus {
        let mut rx = self.outcome.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).unwrap_or(JobStatus::Error),
            Err(_) => JobStatus::Error,
        }
    }

    pub(crate) fn set_progress(&self, progress: Progress) {
        self.progress.send_replace(progress);
    }

    pub(crate) async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub(crate) async fn woken(&self) {
        self.wake.notified().await
    }

    fn settle(&self, status: JobStatus) {
        self.outcome.send_replace(Some(status));
    }
}

pub struct JobScheduler {
    deps: RunnerDeps,
    handles: Arc<Mutex<HashMap<String, JobHandle>>>,
}

impl JobScheduler {
    pub fn new(deps: RunnerDeps) -> Self {
        Self {
            deps,
            handles: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start the runner for local job `job_id`, or return the live handle if
    /// one is already running in this process.
    pub fn spawn(&self, job_id: &str) -> Result<JobHandle, EngineError> {
        let job = self
            .deps
            .notifier
            .ledger()
            .get(job_id)?
            .ok_or_else(|| EngineError::JobNotFound(job_id.to_string()))?;
        if !job.is_local() {
            return Err(EngineError::Validation(format!(
                "job {job_id} runs remotely and cannot be scheduled locally"
            )));
        }

        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = handles.get(job_id) {
            return Ok(existing.clone());
        }

        let handle = JobHandle::new(job.id.clone(), job.progress);
        handles.insert(job.id.clone(), handle.clone());

        let runner = StepRunner::new(job.id.clone(), handle.clone(), self.deps.clone());
        let registry = Arc::clone(&self.handles);
        let settled = handle.clone();
        tokio::spawn(async move {
            let status = runner.run().await;
            registry
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(settled.job_id());
            settled.settle(status);
        });

        tracing::debug!(job_id = %job.id, "Runner spawned");
        Ok(handle)
    }

    pub fn handle(&self, job_id: &str) -> Option<JobHandle> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned()
    }

    pub fn is_running(&self, job_id: &str) -> bool {
        self.handle(job_id).is_some()
    }

    pub fn running(&self) -> Vec<String> {
        self.handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn wake(&self, job_id: &str) {
        if let Some(handle) = self.handle(job_id) {
            handle.wake();
        }
    }

    pub fn cancel(&self, job_id: &str) {
        if let Some(handle) = self.handle(job_id) {
            handle.cancel();
        }
    }

    /// Cancel every runner owned by this process.
    pub fn shutdown(&self) {
        for handle in self.handles.lock().unwrap_or_else(|e| e.into_inner()).values() {
            handle.cancel();
        }
    }

    /// Wake local runners whose records were changed by another context, and
    /// stop those whose records were cancelled or finalized there.
    pub fn follow_external(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let notifier = Arc::clone(&self.deps.notifier);
        let this = Arc::clone(self);
        let subscription = notifier.on_change(move |change| {
            let JobChange::Updated {
                job,
                origin: Origin::External,
            } = change
            else {
                return;
            };
            if let Some(handle) = this.handle(&job.id) {
                if job.is_terminal() {
                    tracing::info!(job_id = %job.id, status = %job.status, "Job finalized by another context");
                    handle.cancel();
                } else if job.control.cancel_requested {
                    tracing::info!(job_id = %job.id, "Cancel requested from another context");
                    handle.cancel();
                } else {
                    handle.wake();
                }
            }
        });

        tokio::spawn(async move {
            cancel.cancelled().await;
            subscription.unsubscribe();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Delays, Job, MessageBlock, StateMachine, Target, Transition};
    use crate::ledger::JobLedger;
    use crate::notify::ChangeNotifier;
    use crate::runner::RunnerSettings;
    use crate::store::SharedMemory;
    use crate::testing::{RecordingHistory, RecordingToaster, ScriptedExecutor};
    use std::time::Duration;

    fn scheduler(memory: &SharedMemory) -> Arc<JobScheduler> {
        let ledger = Arc::new(JobLedger::new(Arc::new(memory.context())));
        Arc::new(JobScheduler::new(RunnerDeps {
            notifier: Arc::new(ChangeNotifier::new(ledger).unwrap()),
            executor: Arc::new(ScriptedExecutor::default()),
            history: Arc::new(RecordingHistory::default()),
            toaster: Arc::new(RecordingToaster::default()),
            settings: RunnerSettings::default(),
        }))
    }

    fn store_job(scheduler: &JobScheduler, delays: Delays) -> Job {
        let job = Job::local(
            "test",
            Target::single("5511", "inst-1"),
            vec![MessageBlock::text("a"), MessageBlock::text("b")],
            delays,
        );
        scheduler.deps.notifier.publish(job.clone()).unwrap();
        job
    }

    #[tokio::test(start_paused = true)]
    async fn one_runner_per_job() {
        let memory = SharedMemory::new();
        let scheduler = scheduler(&memory);
        let job = store_job(&scheduler, Delays::new(1_000, 0));

        let first = scheduler.spawn(&job.id).unwrap();
        let second = scheduler.spawn(&job.id).unwrap();
        assert!(Arc::ptr_eq(&first.outcome, &second.outcome));
        assert_eq!(scheduler.running(), vec![job.id.clone()]);

        assert_eq!(first.finished().await, JobStatus::Completed);
        assert!(!scheduler.is_running(&job.id));
        assert_eq!(first.progress(), Progress { current: 2, total: 2 });
    }

    #[tokio::test(start_paused = true)]
    async fn spawn_rejects_unknown_and_remote_jobs() {
        let memory = SharedMemory::new();
        let scheduler = scheduler(&memory);
        assert!(matches!(scheduler.spawn("ghost"), Err(EngineError::JobNotFound(_))));

        let remote = Job::remote(5, Target::default(), 1);
        scheduler.deps.notifier.publish(remote).unwrap();
        assert!(matches!(scheduler.spawn("5"), Err(EngineError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_runners() {
        let memory = SharedMemory::new();
        let scheduler = scheduler(&memory);
        let job = store_job(&scheduler, Delays::new(60_000, 0));
        let handle = scheduler.spawn(&job.id).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();
        assert_eq!(handle.finished().await, JobStatus::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn external_cancel_reaches_runner() {
        let memory = SharedMemory::new();
        let here = scheduler(&memory);
        let there = scheduler(&memory);
        let stop = CancellationToken::new();
        let _bridge = here.deps.notifier.bridge_external(stop.clone());
        let _follow = here.follow_external(stop.clone());

        let job = store_job(&here, Delays::new(60_000, 0));
        let handle = here.spawn(&job.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        there
            .deps
            .notifier
            .publish_update(&job.id, |j| {
                j.control.cancel_requested = true;
                Ok(())
            })
            .unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(handle.finished().await, JobStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(100));
        stop.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn external_finalize_stops_runner_without_sending() {
        let memory = SharedMemory::new();
        let here = scheduler(&memory);
        let there = scheduler(&memory);
        let stop = CancellationToken::new();
        let _bridge = here.deps.notifier.bridge_external(stop.clone());
        let _follow = here.follow_external(stop.clone());

        let job = store_job(&here, Delays::new(0, 60_000));
        let handle = here.spawn(&job.id).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.progress(), Progress { current: 1, total: 2 });

        there
            .deps
            .notifier
            .publish_update(&job.id, |j| StateMachine::apply(j, Transition::Cancel))
            .unwrap();

        let started = tokio::time::Instant::now();
        assert_eq!(handle.finished().await, JobStatus::Cancelled);
        assert!(started.elapsed() < Duration::from_millis(100));
        let stored = here.deps.notifier.ledger().get(&job.id).unwrap().unwrap();
        assert_eq!(stored.progress, Progress { current: 1, total: 2 });
        stop.cancel();
    }
}
