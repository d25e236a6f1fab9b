use agenda_core::EngineResult;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use uuid::Uuid;

/// Current version of the persisted envelope format.
pub const FORMAT_VERSION: u32 = 1;

/// A row type that can live in a [`Table`].
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn id(&self) -> &str;
}

/// Typed handle on a named table. Several tables may share one row type,
/// e.g. executable jobs and dead-letter jobs.
pub struct Table<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Table<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Table<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Table<T> {}

impl<T> fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Table({})", self.name)
    }
}

/// Metadata for persistence operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceMetadata {
    /// Version of the persistence format
    pub format_version: u32,
    /// ID of the store instance that performed the save
    pub instance_id: Uuid,
    /// When this data was saved
    pub saved_at: DateTime<Utc>,
    /// Incremented on every successful commit
    pub revision: u64,
}

impl PersistenceMetadata {
    pub fn new(instance_id: Uuid, revision: u64) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            instance_id,
            saved_at: Utc::now(),
            revision,
        }
    }
}

/// Point-in-time snapshot of every table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSnapshot {
    /// Raw JSON bytes of the [`crate::StoreState`]
    pub data: Vec<u8>,
    pub metadata: PersistenceMetadata,
}

/// Held while a commit validates and writes, so that separate processes
/// sharing one backend serialize their commits. Released on drop.
#[derive(Debug, Default)]
pub struct BackendLock {
    file: Option<std::fs::File>,
}

impl BackendLock {
    pub fn none() -> Self {
        Self { file: None }
    }

    pub fn file(file: std::fs::File) -> Self {
        Self { file: Some(file) }
    }
}

impl Drop for BackendLock {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(e) = fs2::FileExt::unlock(&file) {
                tracing::warn!("Failed to release backend file lock: {}", e);
            }
        }
    }
}

/// Durable storage behind a [`crate::Store`].
/// Implementations handle different backends (memory, file, ...).
pub trait PersistenceBackend: Send + Sync {
    /// Load the latest snapshot, `None` if nothing was ever saved
    fn load(&self) -> EngineResult<Option<StoreSnapshot>>;

    /// Cheap check for writes by other processes; returns the new snapshot
    /// only when the backend looks different from what this instance last saw
    fn load_if_changed(&self) -> EngineResult<Option<StoreSnapshot>>;

    /// Authoritative check used under [`BackendLock`] before a commit
    fn load_if_newer(&self, known_revision: u64) -> EngineResult<Option<StoreSnapshot>>;

    /// Persist a snapshot
    fn save(&self, snapshot: StoreSnapshot) -> EngineResult<PersistenceMetadata>;

    /// Take the cross-process commit lock
    fn lock_exclusive(&self) -> EngineResult<BackendLock>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}
