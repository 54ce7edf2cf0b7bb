use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arrow::record_batch::RecordBatch;
use log::info;

use crate::arrow_utils::rows_to_record_batch;
use crate::config::{ConcurrencyControl, StoreConfig};
use crate::data_store::row::{Row, RowOrder};
use crate::data_store::row_table::RowTable;
use crate::errors::{IsoprobeError, Result};
use crate::recorder::LifecycleRecorder;
use crate::transaction::Transaction;
use crate::TransactionIsolation;

/// Isoprobe Prelude
pub mod prelude {
    pub use crate::TransactionIsolation;
    pub use crate::cancel::*;
    pub use crate::config::*;
    pub use crate::data_store::row::*;
    pub use crate::errors::*;
    pub use crate::experiment::*;
    pub use crate::gate::*;
    pub use crate::recorder::*;
    pub use crate::service::{IsolationService, SampleService};
    pub use crate::store::Store;
    pub use crate::transaction::*;
}

/// The main entry point: a handle on the row table that opens transactions.
pub struct Store {
    /// The table every transaction of this store works on.
    table: Arc<RowTable>,
    /// A globally increasing counter for generating unique transaction IDs.
    transaction_counter: Arc<AtomicU64>,
    config: StoreConfig,
}

impl Store {
    /// Opens a store on a fresh, empty table.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_recorder(config, Arc::new(LifecycleRecorder::new()))
    }

    /// Opens a store on a fresh table whose lifecycle callbacks go to `recorder`.
    pub fn with_recorder(config: StoreConfig, recorder: Arc<LifecycleRecorder>) -> Self {
        let table = Arc::new(RowTable::new(
            config.concurrency_control,
            config.lock_poll_interval,
            recorder,
        ));
        info!(
            "opened store with profile '{}' ({:?})",
            config.profile.name(),
            config.concurrency_control
        );
        Self {
            table,
            transaction_counter: Arc::new(AtomicU64::new(1)),
            config,
        }
    }

    /// Opens a second store on the table of `self`, sharing its transaction ids.
    ///
    /// Profiles that drop and create their schema clear the table first. The
    /// table keeps its own concurrency control and lock poll interval.
    pub fn open_on(&self, config: StoreConfig) -> Result<Self> {
        if config.profile.drop_and_create() {
            let dropped = self.table.delete_all()?;
            info!("profile '{}' dropped {dropped} row(s)", config.profile.name());
        }
        Ok(Self {
            table: Arc::clone(&self.table),
            transaction_counter: Arc::clone(&self.transaction_counter),
            config,
        })
    }

    /// Starts a new transaction at `isolation`.
    pub fn begin(&self, isolation: TransactionIsolation) -> Transaction {
        let transaction_id = self.transaction_counter.fetch_add(1, Ordering::SeqCst);
        Transaction::new(
            transaction_id,
            isolation,
            Arc::clone(&self.table),
            self.config.profile,
        )
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn recorder(&self) -> &Arc<LifecycleRecorder> {
        self.table.recorder()
    }

    /// Concurrency control of the underlying table, which may differ from
    /// `config()` for a store opened with [`open_on`](Self::open_on).
    pub fn concurrency_control(&self) -> ConcurrencyControl {
        self.table.concurrency_control()
    }

    /// Whether committed-only reads wait on rows locked by uncommitted writers.
    pub fn blocks_committed_reads(&self) -> bool {
        self.concurrency_control() == ConcurrencyControl::Locking
    }

    /// Number of threads currently parked on a row lock.
    pub fn lock_waiters(&self) -> usize {
        self.table.lock_waiters()
    }

    pub fn locked_rows(&self) -> usize {
        self.table.locked_rows()
    }

    /// Inserts and commits a row in a transaction of its own.
    pub fn save(&self, value: impl Into<String>) -> Result<Row> {
        let mut txn = self.begin(TransactionIsolation::ReadCommitted);
        txn.insert(value)?;
        let saved = txn
            .flush()?
            .pop()
            .ok_or_else(|| IsoprobeError::StorageError("insert flushed no row".to_string()))?;
        txn.commit()?;
        Ok(saved)
    }

    /// Removes every row; used to reset between experiments.
    pub fn delete_all(&self) -> Result<usize> {
        self.table.delete_all()
    }

    /// Scans the table at `isolation` and returns the rows as an Arrow batch.
    pub fn export_snapshot(&self, isolation: TransactionIsolation) -> Result<RecordBatch> {
        let mut txn = self.begin(isolation);
        let rows = txn.find_all(RowOrder::ById)?;
        txn.commit()?;
        rows_to_record_batch(&rows)
    }
}
