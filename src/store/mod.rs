//! Durable key-value storage shared between execution contexts.
//!
//! A [`Storage`] handle belongs to one context (one process, or one simulated
//! view in tests). Writes made through *other* handles on the same backing
//! store surface on [`Storage::external_changes`]; a handle never hears about
//! its own writes.

mod file;
mod memory;

pub use file::FileStore;
pub use memory::{MemoryStore, SharedMemory};

use tokio::sync::broadcast;

use crate::error::EngineError;

/// Capacity of the per-context external change channel.
const EVENT_CAPACITY: usize = 256;

/// A key was written by another context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
}

pub trait Storage: Send + Sync {
    fn read(&self, key: &str) -> Result<Option<String>, EngineError>;

    fn write(&self, key: &str, value: &str) -> Result<(), EngineError>;

    /// Signal raised whenever another context writes a key.
    fn external_changes(&self) -> broadcast::Receiver<StorageEvent>;
}
