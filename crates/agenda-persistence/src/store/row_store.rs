use crate::state::{Change, Row, StoreState};
use crate::store::json_file_store::JsonFileBackend;
use crate::store::memory_store::MemoryBackend;
use crate::traits::{PersistenceBackend, PersistenceMetadata, StoreSnapshot};
use crate::transaction::Transaction;
use agenda_core::EngineResult;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

struct Image {
    state: StoreState,
    revision: u64,
}

/// Shared row store. Transactions read through it and commit into it; the
/// backend decides how durable the committed image is.
pub struct Store {
    image: Mutex<Image>,
    backend: Box<dyn PersistenceBackend>,
    instance_id: Uuid,
}

impl Store {
    /// Open a store over a backend, loading whatever it already holds
    pub fn open(backend: impl PersistenceBackend + 'static) -> EngineResult<Arc<Self>> {
        let (state, revision) = match backend.load()? {
            Some(snapshot) => Self::decode(&snapshot)?,
            None => (StoreState::default(), 0),
        };
        tracing::debug!(
            "Opened store at {} (revision {})",
            backend.describe(),
            revision
        );
        Ok(Arc::new(Self {
            image: Mutex::new(Image { state, revision }),
            backend: Box::new(backend),
            instance_id: Uuid::new_v4(),
        }))
    }

    pub fn in_memory() -> Arc<Self> {
        Arc::new(Self {
            image: Mutex::new(Image {
                state: StoreState::default(),
                revision: 0,
            }),
            backend: Box::new(MemoryBackend),
            instance_id: Uuid::new_v4(),
        })
    }

    /// Open (or create on first commit) a JSON file store
    pub fn json_file(path: impl AsRef<Path>) -> EngineResult<Arc<Self>> {
        Self::open(JsonFileBackend::new(path))
    }

    /// Begin a new unit of work
    pub fn begin(self: &Arc<Self>) -> Transaction {
        Transaction::new(Arc::clone(self))
    }

    pub fn revision(&self) -> u64 {
        self.image.lock().revision
    }

    pub fn row_count(&self, table: &str) -> EngineResult<usize> {
        let mut image = self.image.lock();
        self.refresh(&mut image)?;
        Ok(image.state.row_count(table))
    }

    pub(crate) fn read_row(&self, table: &str, id: &str) -> EngineResult<Option<Row>> {
        let mut image = self.image.lock();
        self.refresh(&mut image)?;
        Ok(image.state.get(table, id).cloned())
    }

    pub(crate) fn read_table(&self, table: &str) -> EngineResult<Vec<(String, Row)>> {
        let mut image = self.image.lock();
        self.refresh(&mut image)?;
        Ok(image.state.rows(table))
    }

    /// Validate and apply a transaction's changes atomically.
    ///
    /// Order: cross-process lock, in-process image lock, authoritative reload,
    /// version checks, apply, persist. A failed persist is undone in memory.
    pub(crate) fn commit(&self, changes: Vec<Change>) -> EngineResult<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let _backend_lock = self.backend.lock_exclusive()?;
        let mut image = self.image.lock();

        if let Some(snapshot) = self.backend.load_if_newer(image.revision)? {
            let (state, revision) = Self::decode(&snapshot)?;
            image.state = state;
            image.revision = revision;
        }

        image.state.validate(&changes)?;
        let change_count = changes.len();
        let undo = image.state.apply(changes);
        let revision = image.revision + 1;

        let snapshot = match Self::encode(&image.state, self.instance_id, revision) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                image.state.undo(undo);
                return Err(e);
            }
        };
        if let Err(e) = self.backend.save(snapshot) {
            tracing::warn!("Persisting revision {} failed: {}", revision, e);
            image.state.undo(undo);
            return Err(e);
        }

        image.revision = revision;
        tracing::trace!("Committed {} changes as revision {}", change_count, revision);
        Ok(())
    }

    fn refresh(&self, image: &mut Image) -> EngineResult<()> {
        if let Some(snapshot) = self.backend.load_if_changed()? {
            let (state, revision) = Self::decode(&snapshot)?;
            if revision >= image.revision {
                image.state = state;
                image.revision = revision;
            }
        }
        Ok(())
    }

    fn decode(snapshot: &StoreSnapshot) -> EngineResult<(StoreState, u64)> {
        let state: StoreState = serde_json::from_slice(&snapshot.data)?;
        Ok((state, snapshot.metadata.revision))
    }

    fn encode(state: &StoreState, instance_id: Uuid, revision: u64) -> EngineResult<StoreSnapshot> {
        Ok(StoreSnapshot {
            data: serde_json::to_vec(state)?,
            metadata: PersistenceMetadata::new(instance_id, revision),
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("backend", &self.backend.describe())
            .field("revision", &self.revision())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{BackendLock, Entity, Table};
    use agenda_core::EngineError;
    use mockall::mock;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Counter {
        id: String,
        value: i64,
    }

    impl Entity for Counter {
        fn id(&self) -> &str {
            &self.id
        }
    }

    const COUNTERS: Table<Counter> = Table::new("counters");

    fn counter(id: &str, value: i64) -> Counter {
        Counter {
            id: id.to_string(),
            value,
        }
    }

    mock! {
        Backend {}
        impl PersistenceBackend for Backend {
            fn load(&self) -> EngineResult<Option<StoreSnapshot>>;
            fn load_if_changed(&self) -> EngineResult<Option<StoreSnapshot>>;
            fn load_if_newer(&self, known_revision: u64) -> EngineResult<Option<StoreSnapshot>>;
            fn save(&self, snapshot: StoreSnapshot) -> EngineResult<PersistenceMetadata>;
            fn lock_exclusive(&self) -> EngineResult<BackendLock>;
            fn describe(&self) -> String;
        }
    }

    #[test]
    fn test_failed_save_leaves_image_untouched() {
        let mut backend = MockBackend::new();
        backend.expect_load().returning(|| Ok(None));
        backend.expect_load_if_changed().returning(|| Ok(None));
        backend.expect_load_if_newer().returning(|_| Ok(None));
        backend.expect_lock_exclusive().returning(|| Ok(BackendLock::none()));
        backend.expect_describe().returning(|| "mock".to_string());
        backend
            .expect_save()
            .times(1)
            .returning(|_| Err(EngineError::Persistence("disk full".into())));

        let store = Store::open(backend).unwrap();
        let mut tx = store.begin();
        tx.insert(COUNTERS, &counter("a", 1)).unwrap();
        assert!(matches!(tx.commit(), Err(EngineError::Persistence(_))));

        assert_eq!(store.revision(), 0);
        assert_eq!(store.row_count("counters").unwrap(), 0);
    }

    #[test]
    fn test_two_file_stores_share_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let first = Store::json_file(&path).unwrap();
        let second = Store::json_file(&path).unwrap();

        let mut tx = first.begin();
        tx.insert(COUNTERS, &counter("a", 1)).unwrap();
        tx.commit().unwrap();

        // Both read version 1, the second writer loses
        let mut tx1 = first.begin();
        let mut tx2 = second.begin();
        let mut c1 = tx1.find(COUNTERS, "a").unwrap().unwrap();
        let mut c2 = tx2.find(COUNTERS, "a").unwrap().unwrap();
        c1.value = 10;
        c2.value = 20;
        tx1.update(COUNTERS, &c1).unwrap();
        tx2.update(COUNTERS, &c2).unwrap();

        tx1.commit().unwrap();
        let err = tx2.commit().unwrap_err();
        assert!(err.is_optimistic_locking());

        let mut tx = second.begin();
        assert_eq!(tx.find(COUNTERS, "a").unwrap().unwrap().value, 10);
    }

    #[test]
    fn test_reopen_file_store_keeps_rows() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        {
            let store = Store::json_file(&path).unwrap();
            let mut tx = store.begin();
            tx.insert(COUNTERS, &counter("a", 3)).unwrap();
            tx.commit().unwrap();
        }

        let store = Store::json_file(&path).unwrap();
        assert_eq!(store.revision(), 1);
        let mut tx = store.begin();
        assert_eq!(tx.find(COUNTERS, "a").unwrap(), Some(counter("a", 3)));
    }
}
