//! The job ledger: every [`Job`] record visible to this and cooperating contexts.
//!
//! Records are kept as one JSON array under a single storage key, in creation
//! order. Each operation re-reads storage first, so a context always acts on
//! the freshest record another context may have written. Writes replace the
//! whole record; the last writer wins.

use std::sync::{Arc, Mutex};

use crate::error::EngineError;
use crate::job::Job;
use crate::store::Storage;

/// Storage key under which the ledger lives.
pub const LEDGER_KEY: &str = "wa_jobs";

pub struct JobLedger {
    storage: Arc<dyn Storage>,
    key: String,
    // Serializes read-modify-write cycles within this context.
    lock: Mutex<()>,
}

impl JobLedger {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_key(storage, LEDGER_KEY)
    }

    pub fn with_key(storage: Arc<dyn Storage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn get(&self, id: &str) -> Result<Option<Job>, EngineError> {
        Ok(self.load()?.into_iter().find(|job| job.id == id))
    }

    pub fn list(&self) -> Result<Vec<Job>, EngineError> {
        self.load()
    }

    /// Replace the record for `job.id`, creating it if absent.
    ///
    /// A terminal record only accepts an identical write.
    pub fn upsert(&self, job: Job) -> Result<(), EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load()?;
        match jobs.iter_mut().find(|existing| existing.id == job.id) {
            Some(existing) => {
                if existing.is_terminal() && *existing != job {
                    return Err(EngineError::Frozen {
                        id: job.id,
                        status: existing.status,
                    });
                }
                *existing = job;
            }
            None => jobs.push(job),
        }
        self.store(&jobs)
    }

    /// Read the current record, let `f` modify a copy, and write it back.
    pub fn update<F>(&self, id: &str, f: F) -> Result<Job, EngineError>
    where
        F: FnOnce(&mut Job) -> Result<(), EngineError>,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load()?;
        let slot = jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or_else(|| EngineError::JobNotFound(id.to_string()))?;
        if slot.is_terminal() {
            return Err(EngineError::Frozen {
                id: slot.id.clone(),
                status: slot.status,
            });
        }

        let mut next = slot.clone();
        f(&mut next)?;
        *slot = next.clone();
        self.store(&jobs)?;
        Ok(next)
    }

    pub fn remove(&self, id: &str) -> Result<Option<Job>, EngineError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut jobs = self.load()?;
        let Some(pos) = jobs.iter().position(|job| job.id == id) else {
            return Ok(None);
        };
        let removed = jobs.remove(pos);
        self.store(&jobs)?;
        Ok(Some(removed))
    }

    pub fn remove_where<P>(&self, predicate: P) -> Result<Vec<Job>, EngineError>
    where
        P: Fn(&Job) -> bool,
    {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let (removed, kept): (Vec<Job>, Vec<Job>) =
            self.load()?.into_iter().partition(|job| predicate(job));
        if !removed.is_empty() {
            self.store(&kept)?;
        }
        Ok(removed)
    }

    fn load(&self) -> Result<Vec<Job>, EngineError> {
        match self.storage.read(&self.key)? {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(Vec::new()),
        }
    }

    fn store(&self, jobs: &[Job]) -> Result<(), EngineError> {
        let raw = serde_json::to_string(jobs)?;
        self.storage.write(&self.key, &raw)
    }
}
