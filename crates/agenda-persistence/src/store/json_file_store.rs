use crate::store::atomic_writer::AtomicWriter;
use crate::traits::{
    BackendLock, PersistenceBackend, PersistenceMetadata, StoreSnapshot, FORMAT_VERSION,
};
use agenda_core::{EngineError, EngineResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use uuid::Uuid;

/// Wrapper structure for the JSON file format
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonEnvelope {
    pub version: u32,
    pub metadata: PersistenceMetadata,
    pub data: serde_json::Value,
}

/// Modified time and size of the store file, used to notice writes by other
/// processes without reading the whole file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified_time: SystemTime,
    size: u64,
}

impl FileStamp {
    fn of(path: &Path) -> std::io::Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(metadata) => Ok(Some(Self {
                modified_time: metadata.modified()?,
                size: metadata.len(),
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// JSON file-based persistence backend.
///
/// The whole store is one JSON envelope. Commits from several processes are
/// serialized through an OS lock on a sibling `.lock` file, which makes the
/// version checks of [`crate::Store`] hold across processes.
#[derive(Debug)]
pub struct JsonFileBackend {
    path: PathBuf,
    lock_path: PathBuf,
    instance_id: Uuid,
    last_seen: Mutex<Option<FileStamp>>,
}

impl JsonFileBackend {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_instance_id(path, Uuid::new_v4())
    }

    /// Create a backend with a specific instance ID
    /// (useful for testing or coordinating across instances)
    pub fn with_instance_id(path: impl AsRef<Path>, instance_id: Uuid) -> Self {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        Self {
            path,
            lock_path: PathBuf::from(lock_path),
            instance_id,
            last_seen: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_envelope(&self) -> EngineResult<Option<JsonEnvelope>> {
        let stamp = FileStamp::of(&self.path)?;
        if stamp.is_none() {
            return Ok(None);
        }

        let file_bytes = AtomicWriter::read_all(&self.path)?;
        let envelope: JsonEnvelope = serde_json::from_slice(&file_bytes)?;
        if envelope.version != FORMAT_VERSION {
            return Err(EngineError::Serialization(format!(
                "Unsupported format version: {}",
                envelope.version
            )));
        }

        *self.last_seen.lock() = stamp;
        Ok(Some(envelope))
    }

    fn into_snapshot(envelope: JsonEnvelope) -> EngineResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            data: serde_json::to_vec(&envelope.data)?,
            metadata: envelope.metadata,
        })
    }
}

impl PersistenceBackend for JsonFileBackend {
    fn load(&self) -> EngineResult<Option<StoreSnapshot>> {
        match self.read_envelope()? {
            Some(envelope) => {
                tracing::info!(
                    "Loaded store revision {} from {}",
                    envelope.metadata.revision,
                    self.path.display()
                );
                Ok(Some(Self::into_snapshot(envelope)?))
            }
            None => Ok(None),
        }
    }

    fn load_if_changed(&self) -> EngineResult<Option<StoreSnapshot>> {
        let current = FileStamp::of(&self.path)?;
        if current.is_none() || current == *self.last_seen.lock() {
            return Ok(None);
        }
        tracing::debug!("External change detected in {}", self.path.display());
        self.load()
    }

    fn load_if_newer(&self, known_revision: u64) -> EngineResult<Option<StoreSnapshot>> {
        match self.read_envelope()? {
            Some(envelope) if envelope.metadata.revision > known_revision => {
                tracing::debug!(
                    "Store revision {} is newer than {}, reloading",
                    envelope.metadata.revision,
                    known_revision
                );
                Ok(Some(Self::into_snapshot(envelope)?))
            }
            _ => Ok(None),
        }
    }

    fn save(&self, mut snapshot: StoreSnapshot) -> EngineResult<PersistenceMetadata> {
        snapshot.metadata.instance_id = self.instance_id;
        snapshot.metadata.saved_at = chrono::Utc::now();

        let envelope = JsonEnvelope {
            version: FORMAT_VERSION,
            metadata: snapshot.metadata.clone(),
            data: serde_json::from_slice(&snapshot.data)?,
        };
        let json_bytes = serde_json::to_vec_pretty(&envelope)?;

        AtomicWriter::write_atomic(&self.path, &json_bytes)?;
        *self.last_seen.lock() = FileStamp::of(&self.path)?;

        tracing::debug!(
            "Saved revision {} ({} bytes) to {}",
            snapshot.metadata.revision,
            json_bytes.len(),
            self.path.display()
        );
        Ok(snapshot.metadata)
    }

    fn lock_exclusive(&self) -> EngineResult<BackendLock> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&self.lock_path)?;
        fs2::FileExt::lock_exclusive(&file)?;
        Ok(BackendLock::file(file))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
