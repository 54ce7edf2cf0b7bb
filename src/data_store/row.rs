use std::fmt;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Store-generated identifier of a row.
///
/// Identifiers are handed out in increasing order, so ordering by id is the
/// same as ordering by allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowId(pub u64);

impl fmt::Display for RowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single row of the table under test.
///
/// `last_modified` is owned by the store: it is stamped when an insert or
/// update is flushed and cannot be set by callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    id: RowId,
    value: String,
    last_modified: SystemTime,
}

impl Row {
    pub(crate) fn new(id: RowId, value: String, last_modified: SystemTime) -> Self {
        Self {
            id,
            value,
            last_modified,
        }
    }

    pub fn id(&self) -> RowId {
        self.id
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Changes the value. The change reaches the store only through
    /// [`Transaction::update`](crate::Transaction::update).
    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = value.into();
    }

    pub fn last_modified(&self) -> SystemTime {
        self.last_modified
    }

    pub(crate) fn touch(&mut self, at: SystemTime) {
        self.last_modified = at;
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Row(id={}, value={:?})", self.id, self.value)
    }
}

/// Sort order for table scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowOrder {
    #[default]
    ById,
    /// Most recently modified first; ties broken by the higher id.
    LastModifiedDesc,
}

impl RowOrder {
    pub(crate) fn sort(self, rows: &mut [Row]) {
        match self {
            RowOrder::ById => rows.sort_by_key(|row| row.id),
            RowOrder::LastModifiedDesc => rows.sort_by(|a, b| {
                b.last_modified
                    .cmp(&a.last_modified)
                    .then_with(|| b.id.cmp(&a.id))
            }),
        }
    }
}
