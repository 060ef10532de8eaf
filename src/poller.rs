//! Mirrors server-side verification jobs into the ledger.
//!
//! Every tracked remote id gets its own task and timer: one immediate fetch,
//! then one per poll interval until the server reports a terminal status.
//! Control commands are relayed to the server untouched; the mirror only
//! changes when a later poll reports the authoritative state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::history::HistorySink;
use crate::job::{AuditRecord, Job, JobKind, JobStatus, StateMachine, Target, Transition};
use crate::notify::ChangeNotifier;
use crate::provider::{ProviderError, RemoteJobStatus, VerificationRequest};
use crate::toast::{Toaster, terminal_summary};

/// The server that owns verification jobs.
#[async_trait]
pub trait VerificationAuthority: Send + Sync {
    async fn create_job(&self, request: &VerificationRequest) -> Result<i64, ProviderError>;

    async fn fetch_status(&self, job_id: i64) -> Result<RemoteJobStatus, ProviderError>;

    /// Ids of every job the server still considers live.
    async fn list_active(&self) -> Result<Vec<i64>, ProviderError>;

    async fn pause(&self, job_id: i64) -> Result<(), ProviderError>;

    async fn resume(&self, job_id: i64) -> Result<(), ProviderError>;

    async fn cancel(&self, job_id: i64) -> Result<(), ProviderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    /// How long a finished job keeps being tracked so its final state shows.
    pub grace: Duration,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            grace: Duration::from_secs(3),
        }
    }
}

enum PollOutcome {
    Active,
    Finished(Job),
    AlreadyFinished,
}

struct PollContext {
    authority: Arc<dyn VerificationAuthority>,
    notifier: Arc<ChangeNotifier>,
    history: Arc<dyn HistorySink>,
    toaster: Arc<dyn Toaster>,
    settings: PollerSettings,
}

struct Tracked {
    generation: u64,
    cancel: CancellationToken,
}

pub struct RemotePoller {
    ctx: Arc<PollContext>,
    tracked: Arc<Mutex<HashMap<i64, Tracked>>>,
    generation: AtomicU64,
    shutdown: CancellationToken,
}

impl RemotePoller {
    pub fn new(
        authority: Arc<dyn VerificationAuthority>,
        notifier: Arc<ChangeNotifier>,
        history: Arc<dyn HistorySink>,
        toaster: Arc<dyn Toaster>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            ctx: Arc::new(PollContext {
                authority,
                notifier,
                history,
                toaster,
                settings,
            }),
            tracked: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }
    }

    /// Start polling `remote_id`. Returns false when it is already tracked.
    pub fn track(&self, remote_id: i64) -> bool {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        if tracked.contains_key(&remote_id) {
            return false;
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        tracked.insert(
            remote_id,
            Tracked {
                generation,
                cancel: cancel.clone(),
            },
        );

        let ctx = Arc::clone(&self.ctx);
        let registry = Arc::clone(&self.tracked);
        tokio::spawn(async move {
            ctx.poll_loop(remote_id, cancel).await;
            let mut tracked = registry.lock().unwrap_or_else(|e| e.into_inner());
            if tracked.get(&remote_id).is_some_and(|t| t.generation == generation) {
                tracked.remove(&remote_id);
            }
        });

        tracing::info!(remote_id, "Tracking remote job");
        true
    }

    /// Stop polling `remote_id`. Returns false when it was not tracked.
    pub fn untrack(&self, remote_id: i64) -> bool {
        let removed = self
            .tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&remote_id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                tracing::info!(remote_id, "Stopped tracking remote job");
                true
            }
            None => false,
        }
    }

    pub fn is_tracked(&self, remote_id: i64) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&remote_id)
    }

    pub fn tracked(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Re-attach to remote jobs left running by an earlier session: every
    /// non-terminal mirror in the ledger plus every job the server lists as
    /// active. Returns how many ids started being tracked.
    pub async fn resume_tracking(&self) -> Result<usize, EngineError> {
        let mut started = 0;
        for job in self.ctx.notifier.ledger().list()? {
            if job.kind != JobKind::RemoteVerification || job.is_terminal() {
                continue;
            }
            if let Some(remote_id) = job.remote_id() {
                if self.track(remote_id) {
                    started += 1;
                }
            }
        }

        match self.ctx.authority.list_active().await {
            Ok(ids) => {
                for remote_id in ids {
                    if self.track(remote_id) {
                        started += 1;
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Could not list active remote jobs"),
        }

        Ok(started)
    }

    pub async fn pause(&self, remote_id: i64) -> Result<(), ProviderError> {
        self.ctx.authority.pause(remote_id).await
    }

    pub async fn resume(&self, remote_id: i64) -> Result<(), ProviderError> {
        self.ctx.authority.resume(remote_id).await
    }

    pub async fn cancel(&self, remote_id: i64) -> Result<(), ProviderError> {
        self.ctx.authority.cancel(remote_id).await
    }

    /// Stop every polling task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

impl PollContext {
    async fn poll_loop(&self, remote_id: i64, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.poll_once(remote_id).await {
                Ok(PollOutcome::Active) => {}
                Ok(PollOutcome::AlreadyFinished) => {
                    tracing::debug!(remote_id, "Mirror already final, not polling");
                    return;
                }
                Ok(PollOutcome::Finished(job)) => {
                    self.announce(&job);
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(self.settings.grace) => {}
                    }
                    return;
                }
                Err(e) => {
                    tracing::warn!(remote_id, error = %e, "Poll failed, retrying next tick");
                }
            }
        }
    }

    async fn poll_once(&self, remote_id: i64) -> Result<PollOutcome, EngineError> {
        let remote = self.authority.fetch_status(remote_id).await?;
        let status = JobStatus::parse(&remote.status).ok_or_else(|| {
            ProviderError::Decode(format!("unknown job status '{}'", remote.status))
        })?;

        let ledger = self.notifier.ledger();
        let id = remote_id.to_string();
        let current = match ledger.get(&id)? {
            Some(job) => job,
            None => {
                let job = Job::remote(remote_id, Target::default(), remote.progress.total);
                self.notifier.publish(job.clone())?;
                job
            }
        };
        if current.is_terminal() {
            return Ok(PollOutcome::AlreadyFinished);
        }

        let mut mirrored = current.clone();
        mirror(&mut mirrored, &remote, status)?;
        if mirrored == current {
            return Ok(PollOutcome::Active);
        }

        let job = self
            .notifier
            .publish_update(&id, |job| mirror(job, &remote, status))?;
        tracing::debug!(remote_id, status = %job.status, progress = %job.progress, "Remote job updated");

        if job.is_terminal() {
            Ok(PollOutcome::Finished(job))
        } else {
            Ok(PollOutcome::Active)
        }
    }

    fn announce(&self, job: &Job) {
        if let Some((severity, message)) = terminal_summary(job) {
            self.toaster.notify(&message, severity);
        }

        let payload = serde_json::json!({ "results": job.results });
        let record = AuditRecord::from_job(job, payload);
        let history = Arc::clone(&self.history);
        tokio::spawn(async move {
            if let Err(e) = history.record(record).await {
                tracing::warn!(error = %e, "Failed to write job history");
            }
        });
    }
}

/// Bring `job` in line with the server's view. Progress and results are
/// copied before the status moves, since a terminal status freezes the record.
fn mirror(job: &mut Job, remote: &RemoteJobStatus, status: JobStatus) -> Result<(), EngineError> {
    let total = remote.progress.total.max(job.progress.current);
    if total != job.progress.total {
        StateMachine::apply(job, Transition::Resize(total))?;
    }
    let current = remote.progress.current.clamp(job.progress.current, total);
    if current != job.progress.current {
        StateMachine::apply(job, Transition::Advance(current))?;
    }
    if job.results != remote.results {
        job.results = remote.results.clone();
    }

    let transition = match (job.status, status) {
        (from, to) if from == to => None,
        (JobStatus::Pending, JobStatus::Running) => Some(Transition::Start),
        (JobStatus::Paused, JobStatus::Running) => Some(Transition::Resume),
        (_, JobStatus::Paused) => Some(Transition::Pause),
        (_, JobStatus::Completed) => Some(Transition::Complete),
        (_, JobStatus::Error) => Some(Transition::Fail(
            remote
                .error
                .clone()
                .unwrap_or_else(|| "verification failed".to_string()),
        )),
        (_, JobStatus::Cancelled) => Some(Transition::Cancel),
        // The server never moves a job back to pending; ignore it if it does.
        (_, JobStatus::Pending) | (_, JobStatus::Running) => None,
    };
    if let Some(transition) = transition {
        StateMachine::apply(job, transition)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Progress, VerificationResult};
    use crate::ledger::JobLedger;
    use crate::store::SharedMemory;
    use crate::testing::{FakeAuthority, RecordingHistory, RecordingToaster, remote_status};
    use crate::toast::Severity;

    struct Fixture {
        poller: RemotePoller,
        authority: Arc<FakeAuthority>,
        notifier: Arc<ChangeNotifier>,
        toaster: Arc<RecordingToaster>,
        history: Arc<RecordingHistory>,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(JobLedger::new(Arc::new(SharedMemory::new().context())));
        let notifier = Arc::new(ChangeNotifier::new(ledger).unwrap());
        let authority = Arc::new(FakeAuthority::default());
        let toaster = Arc::new(RecordingToaster::default());
        let history = Arc::new(RecordingHistory::default());
        let poller = RemotePoller::new(
            authority.clone(),
            Arc::clone(&notifier),
            history.clone(),
            toaster.clone(),
            PollerSettings::default(),
        );
        Fixture {
            poller,
            authority,
            notifier,
            toaster,
            history,
        }
    }

    fn mirror_of(fx: &Fixture, remote_id: i64) -> Job {
        fx.notifier
            .ledger()
            .get(&remote_id.to_string())
            .unwrap()
            .expect("mirror should exist")
    }

    #[tokio::test(start_paused = true)]
    async fn mirror_follows_server_without_being_told() {
        let fx = fixture();
        fx.authority.script(
            7,
            vec![remote_status("paused", 4, 10), remote_status("running", 5, 10)],
        );

        assert!(fx.poller.track(7));
        tokio::time::sleep(Duration::from_millis(10)).await;
        let job = mirror_of(&fx, 7);
        assert_eq!(job.status, JobStatus::Paused);
        assert_eq!(job.progress, Progress { current: 4, total: 10 });

        tokio::time::sleep(Duration::from_secs(2)).await;
        let job = mirror_of(&fx, 7);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.progress, Progress { current: 5, total: 10 });
        assert!(fx.poller.is_tracked(7));
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_announces_once_and_stops() {
        let fx = fixture();
        let mut done = remote_status("completed", 2, 2);
        done.results = vec![
            VerificationResult {
                number: "5511".into(),
                exists: true,
                jid: Some("5511@s.whatsapp.net".into()),
            },
            VerificationResult {
                number: "5522".into(),
                exists: false,
                jid: None,
            },
        ];
        fx.authority.script(3, vec![remote_status("running", 1, 2), done]);

        fx.poller.track(3);
        tokio::time::sleep(Duration::from_millis(2_100)).await;
        let job = mirror_of(&fx, 3);
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.results.len(), 2);
        // Still visible during the grace period.
        assert!(fx.poller.is_tracked(3));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fx.poller.is_tracked(3));
        assert_eq!(fx.authority.fetches(3), 2);
        assert_eq!(
            fx.toaster.messages(),
            vec![(
                Severity::Success,
                "Verification 3 finished: 1 of 2 number(s) on WhatsApp".to_string()
            )]
        );
        assert_eq!(fx.history.outcomes(), vec![JobStatus::Completed]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_poll_retries_on_next_tick() {
        let fx = fixture();
        fx.authority.script(4, vec![remote_status("running", 1, 3)]);
        fx.authority.fail_next_fetches(4, 1);

        fx.poller.track(4);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.notifier.ledger().get("4").unwrap().is_none());
        assert!(fx.poller.is_tracked(4));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mirror_of(&fx, 4).progress.current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn track_is_idempotent_and_untrack_stops_polling() {
        let fx = fixture();
        fx.authority.script(8, vec![remote_status("running", 0, 5)]);

        assert!(fx.poller.track(8));
        assert!(!fx.poller.track(8));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fx.authority.fetches(8), 1);

        assert!(fx.poller.untrack(8));
        assert!(!fx.poller.untrack(8));
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.authority.fetches(8), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_does_not_delay_others() {
        let fx = fixture();
        fx.authority.script(1, vec![remote_status("running", 0, 5)]);
        fx.authority.set_latency(1, Duration::from_secs(60));
        fx.authority.script(2, vec![remote_status("running", 3, 5)]);

        fx.poller.track(1);
        fx.poller.track(2);
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(mirror_of(&fx, 2).progress.current, 3);
        assert!(fx.notifier.ledger().get("1").unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_relayed_without_touching_mirror() {
        let fx = fixture();
        fx.authority.script(5, vec![remote_status("running", 1, 4)]);
        fx.poller.track(5);
        tokio::time::sleep(Duration::from_millis(10)).await;

        fx.poller.pause(5).await.unwrap();
        assert_eq!(fx.authority.commands(), vec![("pause".to_string(), 5)]);
        assert_eq!(mirror_of(&fx, 5).status, JobStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn resume_tracking_picks_up_unfinished_jobs() {
        let fx = fixture();
        let live = Job::remote(11, Target::default(), 3);
        let mut finished = Job::remote(12, Target::default(), 3);
        finished.status = JobStatus::Completed;
        fx.notifier.publish(live).unwrap();
        fx.notifier.publish(finished).unwrap();
        fx.authority.set_active(vec![11, 13]);
        for id in [11, 12, 13] {
            fx.authority.script(id, vec![remote_status("running", 1, 3)]);
        }

        assert_eq!(fx.poller.resume_tracking().await.unwrap(), 2);
        assert_eq!(fx.poller.tracked(), vec![11, 13]);
    }

    #[tokio::test(start_paused = true)]
    async fn already_final_mirror_is_not_announced_again() {
        let fx = fixture();
        let mut finished = Job::remote(21, Target::default(), 1);
        finished.status = JobStatus::Cancelled;
        fx.notifier.publish(finished).unwrap();
        fx.authority.script(21, vec![remote_status("cancelled", 0, 1)]);

        fx.poller.track(21);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!fx.poller.is_tracked(21));
        assert_eq!(fx.toaster.count(), 0);
    }

    #[test]
    fn mirror_never_moves_progress_backwards() {
        let mut job = Job::remote(1, Target::default(), 10);
        mirror(&mut job, &remote_status("running", 6, 10), JobStatus::Running).unwrap();
        mirror(&mut job, &remote_status("running", 4, 10), JobStatus::Running).unwrap();
        assert_eq!(job.progress.current, 6);

        mirror(&mut job, &remote_status("error", 7, 10), JobStatus::Error).unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.progress.current, 7);
        assert_eq!(job.error.as_deref(), Some("verification failed"));
    }
}
