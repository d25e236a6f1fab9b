//! Unit of work over a [`Store`].
//!
//! A transaction caches every row it reads (the session cache), so repeated
//! reads inside one command see the same data, and buffers every write until
//! [`Transaction::commit`]. Nothing is visible to other transactions before
//! that, and a failed or dropped transaction leaves the store untouched.

use crate::state::Change;
use crate::store::Store;
use crate::traits::{Entity, Table};
use agenda_core::{EngineError, EngineResult};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowStatus {
    Clean,
    Inserted,
    Updated,
    Deleted,
}

#[derive(Debug, Clone)]
struct CachedRow {
    /// Version seen in the store, `None` if the row did not exist
    read_version: Option<u64>,
    /// Current value inside this transaction, `None` if absent
    data: Option<serde_json::Value>,
    status: RowStatus,
}

type CacheKey = (&'static str, String);

pub struct Transaction {
    store: Arc<Store>,
    cache: HashMap<CacheKey, CachedRow>,
}

impl Transaction {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        Self {
            store,
            cache: HashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn load(&mut self, table: &'static str, id: &str) -> EngineResult<&mut CachedRow> {
        let key = (table, id.to_string());
        if !self.cache.contains_key(&key) {
            let row = self.store.read_row(table, id)?;
            self.cache.insert(
                key.clone(),
                CachedRow {
                    read_version: row.as_ref().map(|r| r.version),
                    data: row.map(|r| r.data),
                    status: RowStatus::Clean,
                },
            );
        }
        self.cache
            .get_mut(&key)
            .ok_or_else(|| EngineError::Internal(format!("cache miss for {} {}", table, id)))
    }

    /// Find a row by id, reading through the session cache
    pub fn find<T: Entity>(&mut self, table: Table<T>, id: &str) -> EngineResult<Option<T>> {
        let cached = self.load(table.name(), id)?;
        match &cached.data {
            Some(data) => Ok(Some(serde_json::from_value(data.clone())?)),
            None => Ok(None),
        }
    }

    /// All rows of a table matching `filter`, ordered by id. Rows written
    /// earlier in this transaction are included; deleted ones are not.
    pub fn query<T, F>(&mut self, table: Table<T>, filter: F) -> EngineResult<Vec<T>>
    where
        T: Entity,
        F: Fn(&T) -> bool,
    {
        for (id, row) in self.store.read_table(table.name())? {
            self.cache
                .entry((table.name(), id))
                .or_insert_with(|| CachedRow {
                    read_version: Some(row.version),
                    data: Some(row.data),
                    status: RowStatus::Clean,
                });
        }

        let mut matches: Vec<(&String, T)> = Vec::new();
        for ((name, id), cached) in &self.cache {
            if *name != table.name() {
                continue;
            }
            if let Some(data) = &cached.data {
                let entity: T = serde_json::from_value(data.clone())?;
                if filter(&entity) {
                    matches.push((id, entity));
                }
            }
        }
        matches.sort_by(|a, b| a.0.cmp(b.0));
        Ok(matches.into_iter().map(|(_, entity)| entity).collect())
    }

    /// Insert a new row. Two transactions inserting the same id race; the
    /// second commit fails with an optimistic locking error.
    pub fn insert<T: Entity>(&mut self, table: Table<T>, entity: &T) -> EngineResult<()> {
        let data = serde_json::to_value(entity)?;
        let key = (table.name(), entity.id().to_string());
        match self.cache.get_mut(&key) {
            Some(cached) if cached.data.is_some() => Err(EngineError::IllegalState(format!(
                "{} {} already exists",
                table.name(),
                entity.id()
            ))),
            Some(cached) => {
                cached.status = match cached.read_version {
                    // Deleted earlier in this transaction: net effect is an update
                    Some(_) => RowStatus::Updated,
                    None => RowStatus::Inserted,
                };
                cached.data = Some(data);
                Ok(())
            }
            None => {
                self.cache.insert(
                    key,
                    CachedRow {
                        read_version: None,
                        data: Some(data),
                        status: RowStatus::Inserted,
                    },
                );
                Ok(())
            }
        }
    }

    /// Replace an existing row. The commit checks the row still has the
    /// version this transaction first read.
    pub fn update<T: Entity>(&mut self, table: Table<T>, entity: &T) -> EngineResult<()> {
        let data = serde_json::to_value(entity)?;
        let cached = self.load(table.name(), entity.id())?;
        if cached.data.is_none() {
            return Err(EngineError::NotFound(format!(
                "{} {}",
                table.name(),
                entity.id()
            )));
        }
        if cached.status != RowStatus::Inserted {
            cached.status = RowStatus::Updated;
        }
        cached.data = Some(data);
        Ok(())
    }

    /// Delete a row; returns false if it did not exist
    pub fn delete<T: Entity>(&mut self, table: Table<T>, id: &str) -> EngineResult<bool> {
        let cached = self.load(table.name(), id)?;
        if cached.data.is_none() {
            return Ok(false);
        }
        cached.data = None;
        cached.status = match cached.read_version {
            Some(_) => RowStatus::Deleted,
            None => RowStatus::Clean,
        };
        Ok(true)
    }

    /// Whether any write is pending
    pub fn is_dirty(&self) -> bool {
        self.cache
            .values()
            .any(|cached| cached.status != RowStatus::Clean)
    }

    fn changes(&mut self) -> EngineResult<Vec<Change>> {
        let mut changes = Vec::new();
        for ((table, id), cached) in self.cache.drain() {
            let change = match (cached.status, cached.read_version, cached.data) {
                (RowStatus::Clean, _, _) => continue,
                (RowStatus::Inserted, _, Some(data)) => Change::Insert { table, id, data },
                (RowStatus::Updated, Some(expected_version), Some(data)) => Change::Update {
                    table,
                    id,
                    expected_version,
                    data,
                },
                (RowStatus::Deleted, Some(expected_version), None) => Change::Delete {
                    table,
                    id,
                    expected_version,
                },
                (status, _, _) => {
                    return Err(EngineError::Internal(format!(
                        "inconsistent {:?} row {} {}",
                        status, table, id
                    )))
                }
            };
            changes.push(change);
        }
        Ok(changes)
    }

    /// Write all buffered changes, or none of them
    pub fn commit(mut self) -> EngineResult<()> {
        let changes = self.changes()?;
        self.store.commit(changes)
    }

    /// Discard all buffered changes
    pub fn rollback(mut self) {
        let discarded = self.cache.values().filter(|c| c.status != RowStatus::Clean).count();
        self.cache.clear();
        tracing::trace!("Rolled back transaction with {} pending writes", discarded);
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("cached_rows", &self.cache.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        owner: Option<String>,
    }

    impl Entity for Item {
        fn id(&self) -> &str {
            &self.id
        }
    }

    const ITEMS: Table<Item> = Table::new("items");
    const ARCHIVE: Table<Item> = Table::new("archive");

    fn item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            owner: None,
        }
    }

    fn seeded(store: &Arc<Store>, ids: &[&str]) {
        let mut tx = store.begin();
        for id in ids {
            tx.insert(ITEMS, &item(id)).unwrap();
        }
        tx.commit().unwrap();
    }

    #[test]
    fn test_reads_are_repeatable_within_transaction() {
        let store = Store::in_memory();
        seeded(&store, &["a"]);

        let mut reader = store.begin();
        assert!(reader.find(ITEMS, "a").unwrap().unwrap().owner.is_none());

        let mut writer = store.begin();
        let mut a = writer.find(ITEMS, "a").unwrap().unwrap();
        a.owner = Some("w".into());
        writer.update(ITEMS, &a).unwrap();
        writer.commit().unwrap();

        // Cached value, not the concurrently committed one
        assert!(reader.find(ITEMS, "a").unwrap().unwrap().owner.is_none());
        assert!(store.begin().find(ITEMS, "a").unwrap().unwrap().owner.is_some());
    }

    #[test]
    fn test_concurrent_updates_one_wins() {
        let store = Store::in_memory();
        seeded(&store, &["a"]);

        let mut tx1 = store.begin();
        let mut tx2 = store.begin();
        let mut a1 = tx1.find(ITEMS, "a").unwrap().unwrap();
        let mut a2 = tx2.find(ITEMS, "a").unwrap().unwrap();
        a1.owner = Some("one".into());
        a2.owner = Some("two".into());
        tx1.update(ITEMS, &a1).unwrap();
        tx2.update(ITEMS, &a2).unwrap();

        tx1.commit().unwrap();
        match tx2.commit() {
            Err(EngineError::OptimisticLocking { table, id }) => {
                assert_eq!(table, "items");
                assert_eq!(id, "a");
            }
            other => panic!("expected optimistic locking failure, got {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_inserts_of_same_id_conflict() {
        let store = Store::in_memory();
        let mut tx1 = store.begin();
        let mut tx2 = store.begin();
        assert!(tx1.find(ITEMS, "lock").unwrap().is_none());
        assert!(tx2.find(ITEMS, "lock").unwrap().is_none());
        tx1.insert(ITEMS, &item("lock")).unwrap();
        tx2.insert(ITEMS, &item("lock")).unwrap();

        tx1.commit().unwrap();
        assert!(tx2.commit().unwrap_err().is_optimistic_locking());
    }

    #[test]
    fn test_query_merges_pending_writes() {
        let store = Store::in_memory();
        seeded(&store, &["a", "b", "c"]);

        let mut tx = store.begin();
        tx.delete(ITEMS, "b").unwrap();
        tx.insert(ITEMS, &item("d")).unwrap();
        let ids: Vec<String> = tx
            .query(ITEMS, |_| true)
            .unwrap()
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_move_between_tables_is_atomic() {
        let store = Store::in_memory();
        seeded(&store, &["a"]);

        let mut tx = store.begin();
        let a = tx.find(ITEMS, "a").unwrap().unwrap();
        tx.delete(ITEMS, "a").unwrap();
        tx.insert(ARCHIVE, &a).unwrap();
        tx.rollback();

        assert_eq!(store.row_count("items").unwrap(), 1);
        assert_eq!(store.row_count("archive").unwrap(), 0);

        let mut tx = store.begin();
        tx.delete(ITEMS, "a").unwrap();
        tx.insert(ARCHIVE, &a).unwrap();
        tx.commit().unwrap();

        assert_eq!(store.row_count("items").unwrap(), 0);
        assert_eq!(store.row_count("archive").unwrap(), 1);
    }

    #[test]
    fn test_insert_then_delete_is_noop() {
        let store = Store::in_memory();
        let mut tx = store.begin();
        tx.insert(ITEMS, &item("x")).unwrap();
        assert!(tx.delete(ITEMS, "x").unwrap());
        assert!(!tx.is_dirty());
        tx.commit().unwrap();
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn test_update_of_missing_row_fails() {
        let store = Store::in_memory();
        let mut tx = store.begin();
        assert!(matches!(
            tx.update(ITEMS, &item("ghost")),
            Err(EngineError::NotFound(_))
        ));
    }
}
