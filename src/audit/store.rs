//! Durable backends for the audit log.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Mutex;

use crate::audit::types::SecurityEvent;
use crate::storage::{JsonlError, JsonlFile};

/// Ordered append-only persistence for security events.
pub trait EventStore: Send + Sync + Debug {
    /// Durably append one event. Must not return `Ok` before the write is durable.
    fn append(&self, event: &SecurityEvent) -> Result<(), JsonlError>;

    /// Every persisted event in append order.
    fn load(&self) -> Result<Vec<SecurityEvent>, JsonlError>;
}

/// Volatile store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<SecurityEvent>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl EventStore for InMemoryEventStore {
    fn append(&self, event: &SecurityEvent) -> Result<(), JsonlError> {
        self.events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }

    fn load(&self) -> Result<Vec<SecurityEvent>, JsonlError> {
        Ok(self
            .events
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}

/// One JSON object per line, synced on every append.
#[derive(Debug)]
pub struct JsonlEventStore {
    file: JsonlFile,
}

impl JsonlEventStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JsonlError> {
        Ok(Self {
            file: JsonlFile::open(path)?,
        })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[cfg(test)]
    pub(crate) fn file(&self) -> &JsonlFile {
        &self.file
    }
}

impl EventStore for JsonlEventStore {
    fn append(&self, event: &SecurityEvent) -> Result<(), JsonlError> {
        self.file.append(event)
    }

    fn load(&self) -> Result<Vec<SecurityEvent>, JsonlError> {
        self.file.load()
    }
}
