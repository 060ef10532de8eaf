use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use super::{EVENT_CAPACITY, Storage, StorageEvent};
use crate::error::EngineError;

#[derive(Default)]
struct Shared {
    data: Mutex<HashMap<String, String>>,
    contexts: Mutex<Vec<(u64, broadcast::Sender<StorageEvent>)>>,
    next_context: AtomicU64,
}

/// In-memory backing store; every [`MemoryStore`] handed out by
/// [`SharedMemory::context`] behaves like a separate process over the same data.
#[derive(Clone, Default)]
pub struct SharedMemory {
    shared: Arc<Shared>,
}

impl SharedMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new context on this store.
    pub fn context(&self) -> MemoryStore {
        let id = self.shared.next_context.fetch_add(1, Ordering::Relaxed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        self.shared
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, events.clone()));
        MemoryStore {
            shared: Arc::clone(&self.shared),
            id,
            events,
        }
    }
}

pub struct MemoryStore {
    shared: Arc<Shared>,
    id: u64,
    events: broadcast::Sender<StorageEvent>,
}

impl Storage for MemoryStore {
    fn read(&self, key: &str) -> Result<Option<String>, EngineError> {
        let data = self.shared.data.lock().unwrap_or_else(|e| e.into_inner());
        Ok(data.get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.shared
            .data
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());

        let contexts = self.shared.contexts.lock().unwrap_or_else(|e| e.into_inner());
        for (id, sender) in contexts.iter() {
            if *id != self.id {
                // No receivers just means nobody in that context is listening.
                let _ = sender.send(StorageEvent {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    fn external_changes(&self) -> broadcast::Receiver<StorageEvent> {
        self.events.subscribe()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.shared
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != self.id);
    }
}
