use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{EVENT_CAPACITY, Storage, StorageEvent};
use crate::error::EngineError;

/// Directory-backed store: one `<key>.json` file per key.
///
/// Every process pointed at the same directory sees the same data. Writes go
/// through a temp file and a rename so readers never observe a torn value.
/// Changes made by other processes are detected by [`FileStore::watch`].
pub struct FileStore {
    dir: PathBuf,
    // Last content this handle wrote or observed per key.
    seen: Mutex<HashMap<String, String>>,
    events: broadcast::Sender<StorageEvent>,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, EngineError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Self {
            dir,
            seen: Mutex::new(HashMap::new()),
            events,
        };
        // Baseline, so pre-existing files are not reported as external writes.
        store.scan();
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Poll the directory every `interval` and raise an event for each key
    /// whose content changed without going through this handle.
    pub fn watch(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::debug!(dir = %self.dir.display(), "Watching store for external writes");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        for event in self.scan() {
                            tracing::debug!(key = %event.key, "External write detected");
                            let _ = self.events.send(event);
                        }
                    }
                }
            }
        })
    }

    fn scan(&self) -> Vec<StorageEvent> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(dir = %self.dir.display(), error = %e, "Store scan failed");
                return Vec::new();
            }
        };

        let mut changed = Vec::new();
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let Ok(content) = std::fs::read_to_string(&path) else {
                continue;
            };
            if seen.get(key) != Some(&content) {
                seen.insert(key.to_string(), content);
                changed.push(StorageEvent {
                    key: key.to_string(),
                });
            }
        }
        changed
    }
}

impl Storage for FileStore {
    fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        match std::fs::read_to_string(self.path_for(key)) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!("{key}.json.{}.tmp", std::process::id()));
        std::fs::write(&tmp, value)?;
        std::fs::rename(&tmp, &path)?;

        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn external_changes(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}
