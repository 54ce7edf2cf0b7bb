use ahash::AHashMap as HashMap;
use log::{debug, warn};
use std::sync::Arc;
use std::time::SystemTime;

use crate::TransactionIsolation;
use crate::cancel::CancelToken;
use crate::config::StoreProfile;
use crate::data_store::row::{Row, RowId, RowOrder};
use crate::data_store::row_table::{RowMutation, RowTable};
use crate::errors::{IsoprobeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnState {
    Active,
    Committed,
    RolledBack,
}

/// Represents a single transaction against the row table.
///
/// Inserts and updates are staged in the transaction's write set and reach the
/// table only on [`flush`](Transaction::flush) or [`commit`](Transaction::commit).
/// A flushed row is visible to dirty readers and exclusively locked until the
/// transaction ends. Dropping an active transaction rolls it back.
pub struct Transaction {
    /// Unique identifier for the transaction.
    id: u64,
    /// The isolation level reads in this transaction run at.
    isolation_level: TransactionIsolation,
    /// Reference to the shared table.
    table: Arc<RowTable>,
    /// Profile of the store that opened this transaction.
    profile: StoreProfile,
    /// Staged changes not yet flushed, keyed by row id.
    write_set: HashMap<RowId, RowMutation>,
    state: TxnState,
}

impl Transaction {
    pub(crate) fn new(
        id: u64,
        isolation_level: TransactionIsolation,
        table: Arc<RowTable>,
        profile: StoreProfile,
    ) -> Self {
        Self {
            id,
            isolation_level,
            table,
            profile,
            write_set: HashMap::new(),
            state: TxnState::Active,
        }
    }

    /// Returns the unique identifier of the transaction.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn isolation_level(&self) -> TransactionIsolation {
        self.isolation_level
    }

    /// Stages a new row and returns it with its store-generated id.
    ///
    /// The row's `last_modified` is provisional until the row is flushed.
    pub fn insert(&mut self, value: impl Into<String>) -> Result<Row> {
        self.ensure_active()?;
        let id = self.table.allocate_id();
        let row = Row::new(id, value.into(), SystemTime::now());
        self.write_set.insert(id, RowMutation::Insert(row.clone()));
        Ok(row)
    }

    /// Stages a changed row. An update of a row inserted by this transaction and
    /// not yet flushed folds into that insert.
    pub fn update(&mut self, row: Row) -> Result<()> {
        self.ensure_active()?;
        let id = row.id();
        let staged = match self.write_set.get(&id) {
            Some(RowMutation::Insert(_)) => RowMutation::Insert(row),
            _ => RowMutation::Update(row),
        };
        self.write_set.insert(id, staged);
        Ok(())
    }

    /// Reads one row at this transaction's isolation level. Staged changes of
    /// this transaction are returned first.
    pub fn find_by_id(&mut self, id: RowId) -> Result<Option<Row>> {
        self.find_by_id_with(id, None)
    }

    /// Like [`find_by_id`](Self::find_by_id), abandoning a lock wait once `cancel` fires.
    pub fn find_by_id_cancellable(
        &mut self,
        id: RowId,
        cancel: &CancelToken,
    ) -> Result<Option<Row>> {
        self.find_by_id_with(id, Some(cancel))
    }

    fn find_by_id_with(
        &mut self,
        id: RowId,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Row>> {
        self.ensure_active()?;
        if let Some(staged) = self.write_set.get(&id) {
            return Ok(Some(staged.clone().into_row()));
        }
        self.table.read(self.id, id, self.isolation_level, cancel)
    }

    /// Reads every visible row at this transaction's isolation level.
    pub fn find_all(&mut self, order: RowOrder) -> Result<Vec<Row>> {
        self.find_all_with(order, None)
    }

    pub fn find_all_cancellable(
        &mut self,
        order: RowOrder,
        cancel: &CancelToken,
    ) -> Result<Vec<Row>> {
        self.find_all_with(order, Some(cancel))
    }

    fn find_all_with(
        &mut self,
        order: RowOrder,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Row>> {
        self.ensure_active()?;
        let mut rows = self.table.scan(self.id, self.isolation_level, cancel)?;
        // Overlay what is staged but not flushed yet.
        for staged in self.write_set.values() {
            let staged = staged.clone().into_row();
            match rows.iter_mut().find(|row| row.id() == staged.id()) {
                Some(existing) => *existing = staged,
                None => rows.push(staged),
            }
        }
        order.sort(&mut rows);
        Ok(rows)
    }

    /// Sends every staged change to the table without committing.
    ///
    /// Returns the flushed rows in id order, with `last_modified` set by the store.
    /// Blocks if another transaction holds a lock on one of the rows.
    ///
    /// If any change cannot be applied, the whole transaction is rolled back,
    /// including changes flushed earlier, and every later call on it fails
    /// with `TransactionAborted`.
    pub fn flush(&mut self) -> Result<Vec<Row>> {
        self.ensure_active()?;
        if self.write_set.is_empty() {
            return Ok(Vec::new());
        }
        let mut mutations: Vec<RowMutation> = self.write_set.drain().map(|(_, m)| m).collect();
        mutations.sort_by_key(RowMutation::id);

        if self.profile.log_parameters() {
            for mutation in &mutations {
                debug!("txn {} flushing {:?}", self.id, mutation);
            }
        }
        let flushed = match self
            .table
            .apply(self.id, mutations, self.profile.batch_writing(), None)
        {
            Ok(flushed) => flushed,
            Err(e) => {
                warn!("txn {} flush failed, rolling back: {e}", self.id);
                self.abort();
                return Err(e);
            }
        };
        debug!("txn {} flushed {} row(s)", self.id, flushed.len());
        Ok(flushed)
    }

    /// Flushes anything still staged, then publishes the changes and releases
    /// the row locks.
    pub fn commit(mut self) -> Result<()> {
        self.flush()?;
        self.table.commit(self.id);
        self.state = TxnState::Committed;
        Ok(())
    }

    /// Discards staged and flushed changes and releases the row locks.
    pub fn rollback(mut self) {
        self.abort();
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            TxnState::Active => Ok(()),
            TxnState::Committed | TxnState::RolledBack => {
                Err(IsoprobeError::TransactionAborted { id: self.id })
            }
        }
    }

    fn abort(&mut self) {
        self.write_set.clear();
        self.table.rollback(self.id);
        self.state = TxnState::RolledBack;
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxnState::Active {
            warn!("txn {} dropped without commit, rolling back", self.id);
            self.abort();
        }
    }
}
