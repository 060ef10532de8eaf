//! Change notifications for ledger records.
//!
//! Local writes go through [`ChangeNotifier`] and are broadcast immediately.
//! Writes from other contexts arrive as storage-level signals; the bridge
//! started by [`ChangeNotifier::bridge_external`] diffs the ledger against the
//! last snapshot and rebroadcasts them as [`Origin::External`] changes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::job::Job;
use crate::ledger::JobLedger;

const CHANNEL_CAPACITY: usize = 1024;

/// Where a change was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Written by this context.
    Local,
    /// Written by another context sharing the same storage.
    External,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobChange {
    Updated { job: Job, origin: Origin },
    Removed { job_id: String, origin: Origin },
}

impl JobChange {
    pub fn job_id(&self) -> &str {
        match self {
            Self::Updated { job, .. } => &job.id,
            Self::Removed { job_id, .. } => job_id,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Self::Updated { origin, .. } | Self::Removed { origin, .. } => *origin,
        }
    }

    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Updated { job, .. } => Some(job),
            Self::Removed { .. } => None,
        }
    }
}

pub struct ChangeNotifier {
    ledger: Arc<JobLedger>,
    sender: broadcast::Sender<JobChange>,
    // Last state announced per job, used to diff external writes.
    snapshot: Mutex<HashMap<String, Job>>,
}

impl ChangeNotifier {
    pub fn new(ledger: Arc<JobLedger>) -> Result<Self, EngineError> {
        let snapshot = ledger
            .list()?
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            ledger,
            sender,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    /// Write `job` and announce it.
    pub fn publish(&self, job: Job) -> Result<(), EngineError> {
        self.ledger.upsert(job.clone())?;
        self.emit(JobChange::Updated {
            job,
            origin: Origin::Local,
        });
        Ok(())
    }

    /// Read-modify-write `id` and announce the result.
    pub fn publish_update<F>(&self, id: &str, f: F) -> Result<Job, EngineError>
    where
        F: FnOnce(&mut Job) -> Result<(), EngineError>,
    {
        let job = self.ledger.update(id, f)?;
        self.emit(JobChange::Updated {
            job: job.clone(),
            origin: Origin::Local,
        });
        Ok(job)
    }

    pub fn publish_removal(&self, id: &str) -> Result<Option<Job>, EngineError> {
        let removed = self.ledger.remove(id)?;
        if removed.is_some() {
            self.emit(JobChange::Removed {
                job_id: id.to_string(),
                origin: Origin::Local,
            });
        }
        Ok(removed)
    }

    pub fn publish_removals_where<P>(&self, predicate: P) -> Result<Vec<Job>, EngineError>
    where
        P: Fn(&Job) -> bool,
    {
        let removed = self.ledger.remove_where(predicate)?;
        for job in &removed {
            self.emit(JobChange::Removed {
                job_id: job.id.clone(),
                origin: Origin::Local,
            });
        }
        Ok(removed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobChange> {
        self.sender.subscribe()
    }

    /// Run `handler` for every change until the returned [`Subscription`] is dropped.
    pub fn on_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(JobChange) + Send + 'static,
    {
        let mut rx = self.subscribe();
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(change) => handler(change),
                        Err(RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Change subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        Subscription { token }
    }

    /// Turn storage-level external writes into [`Origin::External`] changes.
    pub fn bridge_external(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut events = this.ledger.storage().external_changes();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = events.recv() => {
                        match received {
                            Ok(event) if event.key != this.ledger.key() => continue,
                            Ok(_) | Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                        if let Err(e) = this.reconcile() {
                            tracing::warn!(error = %e, "Failed to reload ledger after external write");
                        }
                    }
                }
            }
        })
    }

    /// Diff the ledger against the snapshot and announce every difference as
    /// external. Returns the number of changes emitted.
    pub fn reconcile(&self) -> Result<usize, EngineError> {
        let jobs = self.ledger.list()?;
        let mut changes = Vec::new();
        {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            let mut present = HashSet::new();
            for job in jobs {
                present.insert(job.id.clone());
                if snapshot.get(&job.id) != Some(&job) {
                    snapshot.insert(job.id.clone(), job.clone());
                    changes.push(JobChange::Updated {
                        job,
                        origin: Origin::External,
                    });
                }
            }
            let gone: Vec<String> = snapshot
                .keys()
                .filter(|id| !present.contains(*id))
                .cloned()
                .collect();
            for job_id in gone {
                snapshot.remove(&job_id);
                changes.push(JobChange::Removed {
                    job_id,
                    origin: Origin::External,
                });
            }
        }

        let count = changes.len();
        for change in changes {
            let _ = self.sender.send(change);
        }
        Ok(count)
    }

    fn emit(&self, change: JobChange) {
        {
            let mut snapshot = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
            match &change {
                JobChange::Updated { job, .. } => {
                    snapshot.insert(job.id.clone(), job.clone());
                }
                JobChange::Removed { job_id, .. } => {
                    snapshot.remove(job_id);
                }
            }
        }
        // Zero receivers is fine.
        let _ = self.sender.send(change);
    }
}

/// Handle returned by [`ChangeNotifier::on_change`]; delivery stops when dropped.
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
