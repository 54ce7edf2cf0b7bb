use std::sync::Arc;

use log::info;

use crate::TransactionIsolation;
use crate::cancel::CancelToken;
use crate::data_store::row::{Row, RowId, RowOrder};
use crate::errors::{IsoprobeError, Result};
use crate::gate::RendezvousGate;
use crate::store::Store;
use crate::transaction::Transaction;

/// Isolation the writers open their transactions at. It has no effect on what
/// a writer writes and is only set for parity with the readers.
const WRITER_ISOLATION: TransactionIsolation = TransactionIsolation::ReadCommitted;

/// Transactional operations driven by the experiments.
///
/// The write operations take a [`RendezvousGate`] and pause twice: before
/// writing (`started`) and after the flush, before the commit (`flushed`).
/// That lets the caller decide exactly when the write happens and when it
/// becomes committed.
#[derive(Clone)]
pub struct IsolationService {
    store: Arc<Store>,
}

impl IsolationService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Inserts a row with `value` under the gate's control and returns it once committed.
    pub fn create(&self, value: &str, gate: &RendezvousGate) -> Result<Row> {
        let mut txn = self.store.begin(WRITER_ISOLATION);
        log_isolation(&txn);

        gate.started.acquire()?;
        txn.insert(value)?;
        let row = single_row(txn.flush()?)?;
        gate.flush_point.release();

        gate.flushed.acquire()?;
        txn.commit()?;
        info!("Transaction released");
        Ok(row)
    }

    /// Changes the value of row `id` under the gate's control and returns it once committed.
    ///
    /// Fails with `NotFound` before touching the gate if the row does not exist.
    pub fn update(&self, id: RowId, new_value: &str, gate: &RendezvousGate) -> Result<Row> {
        let mut txn = self.store.begin(WRITER_ISOLATION);
        log_isolation(&txn);
        let mut row = txn.find_by_id(id)?.ok_or(IsoprobeError::NotFound { id })?;

        gate.started.acquire()?;
        row.set_value(new_value);
        txn.update(row)?;
        let row = single_row(txn.flush()?)?;
        gate.flush_point.release();

        gate.flushed.acquire()?;
        txn.commit()?;
        info!("Transaction released");
        Ok(row)
    }

    pub fn find(&self, id: RowId, isolation: TransactionIsolation) -> Result<Row> {
        self.read(isolation, |txn| txn.find_by_id(id))?
            .ok_or(IsoprobeError::NotFound { id })
    }

    /// Like [`find`](Self::find); a lock wait ends with `InterruptedWait` once `cancel` fires.
    pub fn find_cancellable(
        &self,
        id: RowId,
        isolation: TransactionIsolation,
        cancel: &CancelToken,
    ) -> Result<Row> {
        self.read(isolation, |txn| txn.find_by_id_cancellable(id, cancel))?
            .ok_or(IsoprobeError::NotFound { id })
    }

    pub fn find_all(&self, isolation: TransactionIsolation) -> Result<Vec<Row>> {
        self.read(isolation, |txn| txn.find_all(RowOrder::ById))
    }

    pub fn find_all_cancellable(
        &self,
        isolation: TransactionIsolation,
        cancel: &CancelToken,
    ) -> Result<Vec<Row>> {
        self.read(isolation, |txn| txn.find_all_cancellable(RowOrder::ById, cancel))
    }

    pub fn find_all_by_last_modified_desc(
        &self,
        isolation: TransactionIsolation,
    ) -> Result<Vec<Row>> {
        self.read(isolation, |txn| txn.find_all(RowOrder::LastModifiedDesc))
    }

    pub fn find_uncommitted(&self, id: RowId) -> Result<Row> {
        self.find(id, TransactionIsolation::ReadUncommitted)
    }

    pub fn find_committed(&self, id: RowId) -> Result<Row> {
        self.find(id, TransactionIsolation::ReadCommitted)
    }

    pub fn find_all_uncommitted(&self) -> Result<Vec<Row>> {
        self.find_all(TransactionIsolation::ReadUncommitted)
    }

    pub fn find_all_committed(&self) -> Result<Vec<Row>> {
        self.find_all(TransactionIsolation::ReadCommitted)
    }

    fn read<T, F>(&self, isolation: TransactionIsolation, op: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction) -> Result<T>,
    {
        let mut txn = self.store.begin(isolation);
        log_isolation(&txn);
        let out = op(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }
}

fn log_isolation(txn: &Transaction) {
    info!(
        "Isolation level is {} ({}) for txn {}",
        txn.isolation_level(),
        txn.isolation_level().code(),
        txn.id()
    );
}

fn single_row(mut rows: Vec<Row>) -> Result<Row> {
    match (rows.pop(), rows.is_empty()) {
        (Some(row), true) => Ok(row),
        _ => Err(IsoprobeError::StorageError(
            "expected exactly one flushed row".to_string(),
        )),
    }
}
