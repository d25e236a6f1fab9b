use crate::traits::{BackendLock, PersistenceBackend, PersistenceMetadata, StoreSnapshot};
use agenda_core::EngineResult;

/// Keeps nothing beyond the process lifetime. The [`crate::Store`] image is
/// the only copy, so there is never anything newer to load.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryBackend;

impl PersistenceBackend for MemoryBackend {
    fn load(&self) -> EngineResult<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn load_if_changed(&self) -> EngineResult<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn load_if_newer(&self, _known_revision: u64) -> EngineResult<Option<StoreSnapshot>> {
        Ok(None)
    }

    fn save(&self, snapshot: StoreSnapshot) -> EngineResult<PersistenceMetadata> {
        Ok(snapshot.metadata)
    }

    fn lock_exclusive(&self) -> EngineResult<BackendLock> {
        Ok(BackendLock::none())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}
