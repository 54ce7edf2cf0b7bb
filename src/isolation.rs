use std::fmt;

use serde::{Deserialize, Serialize};

/// Defines the isolation levels a transaction can run at.
///
/// Isolation only changes how a transaction *reads*. Writers always see and
/// lock what they write, regardless of the level they were opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionIsolation {
    /// **Read Uncommitted:**
    ///
    /// Dirty reads are allowed. A read of a row that another transaction has flushed
    /// but not yet committed returns the in-flight value immediately, and a scan
    /// includes rows whose insert has been flushed but not committed. Readers never
    /// wait on row locks at this level.
    ReadUncommitted,
    /// **Read Committed:**
    ///
    /// Only committed data is returned. On a locking backend, a read of a row that
    /// is exclusively locked by an uncommitted writer waits until that writer
    /// commits or rolls back. On a versioned backend the read returns the last
    /// committed version without waiting.
    ReadCommitted,
}

impl TransactionIsolation {
    /// Whether reads at this level may return values that are not yet committed.
    pub fn observes_uncommitted(self) -> bool {
        matches!(self, TransactionIsolation::ReadUncommitted)
    }

    /// The numeric code conventionally used by SQL drivers for this level.
    pub fn code(self) -> u8 {
        match self {
            TransactionIsolation::ReadUncommitted => 1,
            TransactionIsolation::ReadCommitted => 2,
        }
    }
}

impl fmt::Display for TransactionIsolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionIsolation::ReadUncommitted => f.write_str("READ_UNCOMMITTED"),
            TransactionIsolation::ReadCommitted => f.write_str("READ_COMMITTED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_read_uncommitted_observes_dirty_data() {
        assert!(TransactionIsolation::ReadUncommitted.observes_uncommitted());
        assert!(!TransactionIsolation::ReadCommitted.observes_uncommitted());
    }

    #[test]
    fn display_uses_sql_names() {
        assert_eq!(TransactionIsolation::ReadCommitted.to_string(), "READ_COMMITTED");
        assert_eq!(TransactionIsolation::ReadUncommitted.code(), 1);
    }
}
