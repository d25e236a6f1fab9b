//! In-memory image of every table and the compare-and-set commit rules.

use agenda_core::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One stored row. `version` starts at 1 and grows with every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Row {
    pub version: u64,
    pub data: serde_json::Value,
}

/// A buffered write produced by a [`crate::Transaction`].
#[derive(Debug, Clone)]
pub enum Change {
    Insert {
        table: &'static str,
        id: String,
        data: serde_json::Value,
    },
    Update {
        table: &'static str,
        id: String,
        expected_version: u64,
        data: serde_json::Value,
    },
    Delete {
        table: &'static str,
        id: String,
        expected_version: u64,
    },
}

impl Change {
    fn key(&self) -> (&'static str, &str) {
        match self {
            Change::Insert { table, id, .. }
            | Change::Update { table, id, .. }
            | Change::Delete { table, id, .. } => (table, id.as_str()),
        }
    }
}

/// Previous value of a row touched by [`StoreState::apply`], for undo.
pub type UndoLog = Vec<(String, String, Option<Row>)>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    tables: BTreeMap<String, BTreeMap<String, Row>>,
}

impl StoreState {
    pub fn get(&self, table: &str, id: &str) -> Option<&Row> {
        self.tables.get(table).and_then(|rows| rows.get(id))
    }

    pub fn rows(&self, table: &str) -> Vec<(String, Row)> {
        self.tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .map(|(id, row)| (id.clone(), row.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn row_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, BTreeMap::len)
    }

    /// Check every change against the current versions. All or nothing:
    /// the first conflict fails the whole set.
    pub fn validate(&self, changes: &[Change]) -> EngineResult<()> {
        for change in changes {
            let (table, id) = change.key();
            let current = self.get(table, id);
            let conflict = match change {
                Change::Insert { .. } => current.is_some(),
                Change::Update {
                    expected_version, ..
                }
                | Change::Delete {
                    expected_version, ..
                } => current.map(|row| row.version) != Some(*expected_version),
            };
            if conflict {
                return Err(EngineError::optimistic_locking(table, id));
            }
        }
        Ok(())
    }

    /// Apply already validated changes and return what they replaced.
    pub fn apply(&mut self, changes: Vec<Change>) -> UndoLog {
        let mut undo = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                Change::Insert { table, id, data } => {
                    let rows = self.tables.entry(table.to_string()).or_default();
                    let previous = rows.insert(id.clone(), Row { version: 1, data });
                    undo.push((table.to_string(), id, previous));
                }
                Change::Update {
                    table,
                    id,
                    expected_version,
                    data,
                } => {
                    let rows = self.tables.entry(table.to_string()).or_default();
                    let previous = rows.insert(
                        id.clone(),
                        Row {
                            version: expected_version + 1,
                            data,
                        },
                    );
                    undo.push((table.to_string(), id, previous));
                }
                Change::Delete { table, id, .. } => {
                    let previous = self
                        .tables
                        .get_mut(table)
                        .and_then(|rows| rows.remove(&id));
                    undo.push((table.to_string(), id, previous));
                }
            }
        }
        undo
    }

    /// Revert an [`UndoLog`], newest change first.
    pub fn undo(&mut self, undo: UndoLog) {
        for (table, id, previous) in undo.into_iter().rev() {
            let rows = self.tables.entry(table).or_default();
            match previous {
                Some(row) => {
                    rows.insert(id, row);
                }
                None => {
                    rows.remove(&id);
                }
            }
        }
    }
}
