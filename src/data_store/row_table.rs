use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::TransactionIsolation;
use crate::cancel::CancelToken;
use crate::config::ConcurrencyControl;
use crate::data_store::row::{Row, RowId};
use crate::errors::{IsoprobeError, Result};
use crate::recorder::LifecycleRecorder;

/// Identifier of the transaction owning a row lock.
pub type TxnId = u64;

/// A staged change handed to the table when a transaction flushes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowMutation {
    /// Adds a row whose id was previously taken from [`RowTable::allocate_id`].
    Insert(Row),
    /// Replaces the value of an existing row.
    Update(Row),
}

impl RowMutation {
    pub fn id(&self) -> RowId {
        match self {
            RowMutation::Insert(row) | RowMutation::Update(row) => row.id(),
        }
    }

    pub fn into_row(self) -> Row {
        match self {
            RowMutation::Insert(row) | RowMutation::Update(row) => row,
        }
    }
}

/// Version flushed by a transaction that has not ended yet. Its presence is
/// the exclusive lock on the row.
#[derive(Debug)]
struct DirtyVersion {
    owner: TxnId,
    row: Row,
}

#[derive(Debug, Default)]
struct RowSlot {
    /// `None` while the insert that created the slot is uncommitted.
    committed: Option<Row>,
    dirty: Option<DirtyVersion>,
}

impl RowSlot {
    /// Owner of the lock on this row, unless that owner is `txn` itself.
    fn lock_holder_for(&self, txn: TxnId) -> Option<TxnId> {
        self.dirty
            .as_ref()
            .map(|d| d.owner)
            .filter(|owner| *owner != txn)
    }

    fn visible_to(&self, reader: TxnId, isolation: TransactionIsolation) -> Option<&Row> {
        match &self.dirty {
            Some(dirty) if dirty.owner == reader || isolation.observes_uncommitted() => {
                Some(&dirty.row)
            }
            _ => self.committed.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct TableState {
    slots: BTreeMap<RowId, RowSlot>,
    lock_waiters: usize,
    /// Lock holders each parked transaction is waiting on.
    waits_for: HashMap<TxnId, Vec<TxnId>>,
}

impl TableState {
    /// Whether `txn` is reachable from `holders` through the wait graph, i.e.
    /// parking `txn` behind them would close a cycle.
    fn waits_on(&self, holders: &[TxnId], txn: TxnId) -> bool {
        let mut seen = HashSet::new();
        let mut pending = holders.to_vec();
        while let Some(next) = pending.pop() {
            if next == txn {
                return true;
            }
            if seen.insert(next) {
                if let Some(further) = self.waits_for.get(&next) {
                    pending.extend_from_slice(further);
                }
            }
        }
        false
    }
}

/// The single table every experiment reads and writes.
///
/// Flushed writes become exclusive row locks held until the writing
/// transaction commits or rolls back. Under [`ConcurrencyControl::Locking`]
/// committed-only reads wait on those locks; dirty reads never do.
///
/// A wait that would complete a cycle of transactions waiting on each other
/// fails with [`IsoprobeError::Deadlock`] instead of parking.
pub struct RowTable {
    state: Mutex<TableState>,
    /// Notified whenever a transaction ends and drops its locks.
    lock_released: Condvar,
    next_id: AtomicU64,
    concurrency_control: ConcurrencyControl,
    poll_interval: Duration,
    recorder: Arc<LifecycleRecorder>,
}

impl RowTable {
    pub fn new(
        concurrency_control: ConcurrencyControl,
        poll_interval: Duration,
        recorder: Arc<LifecycleRecorder>,
    ) -> Self {
        Self {
            state: Mutex::new(TableState::default()),
            lock_released: Condvar::new(),
            next_id: AtomicU64::new(1),
            concurrency_control,
            poll_interval,
            recorder,
        }
    }

    pub fn concurrency_control(&self) -> ConcurrencyControl {
        self.concurrency_control
    }

    pub fn recorder(&self) -> &Arc<LifecycleRecorder> {
        &self.recorder
    }

    /// Hands out the next row id. Ids of rolled back inserts are not reused.
    pub fn allocate_id(&self) -> RowId {
        RowId(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    /// Number of threads currently parked on a row lock.
    pub fn lock_waiters(&self) -> usize {
        self.state.lock().lock_waiters
    }

    /// Number of rows currently locked by uncommitted writers.
    pub fn locked_rows(&self) -> usize {
        self.state
            .lock()
            .slots
            .values()
            .filter(|slot| slot.dirty.is_some())
            .count()
    }

    /// Applies staged mutations on behalf of `owner`, locking every touched row.
    ///
    /// With `batch` set, all mutations are applied under one acquisition of the
    /// table mutex; otherwise the mutex is re-acquired per mutation. Returns the
    /// rows as flushed, with `last_modified` stamped.
    pub fn apply(
        &self,
        owner: TxnId,
        mutations: Vec<RowMutation>,
        batch: bool,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Row>> {
        let mut flushed = Vec::with_capacity(mutations.len());
        if batch {
            let mut state = self.state.lock();
            for mutation in mutations {
                flushed.push(self.apply_one(&mut state, owner, mutation, cancel)?);
            }
        } else {
            for mutation in mutations {
                let mut state = self.state.lock();
                flushed.push(self.apply_one(&mut state, owner, mutation, cancel)?);
            }
        }
        Ok(flushed)
    }

    fn apply_one(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        owner: TxnId,
        mutation: RowMutation,
        cancel: Option<&CancelToken>,
    ) -> Result<Row> {
        let id = mutation.id();
        // Writers always wait for another writer's lock, whatever the backend.
        while let Some(holder) = state
            .slots
            .get(&id)
            .and_then(|slot| slot.lock_holder_for(owner))
        {
            self.wait_for_lock(state, owner, vec![holder], cancel)?;
        }

        let now = SystemTime::now();
        match mutation {
            RowMutation::Insert(mut row) => {
                row.touch(now);
                self.recorder.record(format!("pre-persist {id}"));
                let slot = state.slots.entry(id).or_default();
                slot.dirty = Some(DirtyVersion {
                    owner,
                    row: row.clone(),
                });
                trace!("txn {owner} locked new row {id}");
                Ok(row)
            }
            RowMutation::Update(mut row) => {
                let slot = state
                    .slots
                    .get_mut(&id)
                    .filter(|slot| {
                        slot.visible_to(owner, TransactionIsolation::ReadCommitted)
                            .is_some()
                    })
                    .ok_or(IsoprobeError::NotFound { id })?;
                row.touch(now);
                self.recorder.record(format!("pre-update {id}"));
                slot.dirty = Some(DirtyVersion {
                    owner,
                    row: row.clone(),
                });
                trace!("txn {owner} locked row {id}");
                Ok(row)
            }
        }
    }

    /// Reads one row as seen by `reader` at `isolation`.
    pub fn read(
        &self,
        reader: TxnId,
        id: RowId,
        isolation: TransactionIsolation,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<Row>> {
        let mut state = self.state.lock();
        loop {
            let holders = self.blocking_holders(&state, reader, isolation, Some(id));
            if holders.is_empty() {
                break;
            }
            debug!("txn {reader} waiting on lock of row {id} at {isolation}");
            self.wait_for_lock(&mut state, reader, holders, cancel)?;
        }
        Ok(state
            .slots
            .get(&id)
            .and_then(|slot| slot.visible_to(reader, isolation))
            .cloned())
    }

    /// Reads every row visible to `reader` at `isolation`, in id order.
    ///
    /// A committed-only scan on a locking table waits until no row is locked by
    /// another transaction, so an uncommitted insert blocks the whole scan.
    pub fn scan(
        &self,
        reader: TxnId,
        isolation: TransactionIsolation,
        cancel: Option<&CancelToken>,
    ) -> Result<Vec<Row>> {
        let mut state = self.state.lock();
        loop {
            let holders = self.blocking_holders(&state, reader, isolation, None);
            if holders.is_empty() {
                break;
            }
            debug!("txn {reader} scan waiting on row locks at {isolation}");
            self.wait_for_lock(&mut state, reader, holders, cancel)?;
        }
        Ok(state
            .slots
            .values()
            .filter_map(|slot| slot.visible_to(reader, isolation))
            .cloned()
            .collect())
    }

    /// Owners of the locks a read by `reader` has to wait for; empty if it may
    /// proceed.
    fn blocking_holders(
        &self,
        state: &TableState,
        reader: TxnId,
        isolation: TransactionIsolation,
        id: Option<RowId>,
    ) -> Vec<TxnId> {
        if isolation.observes_uncommitted()
            || self.concurrency_control == ConcurrencyControl::Versioned
        {
            return Vec::new();
        }
        match id {
            Some(id) => state
                .slots
                .get(&id)
                .and_then(|slot| slot.lock_holder_for(reader))
                .into_iter()
                .collect(),
            None => {
                let mut holders: Vec<TxnId> = state
                    .slots
                    .values()
                    .filter_map(|slot| slot.lock_holder_for(reader))
                    .collect();
                holders.sort_unstable();
                holders.dedup();
                holders
            }
        }
    }

    /// Parks `waiter` behind `holders` until some transaction releases its
    /// locks, the poll interval elapses, or `cancel` fires.
    ///
    /// Fails with `Deadlock` without parking if one of `holders` is itself,
    /// directly or transitively, waiting on `waiter`.
    fn wait_for_lock(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        waiter: TxnId,
        holders: Vec<TxnId>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if state.waits_on(&holders, waiter) {
            let holder = holders.first().copied().unwrap_or(waiter);
            warn!("txn {waiter} would deadlock waiting on {holders:?}");
            return Err(IsoprobeError::Deadlock {
                txn: waiter,
                holder,
            });
        }
        state.waits_for.insert(waiter, holders);
        let parked = self.park(state, cancel);
        state.waits_for.remove(&waiter);
        parked
    }

    /// Waits once on the lock-release condition, bounded by the poll interval.
    fn park(
        &self,
        state: &mut MutexGuard<'_, TableState>,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(IsoprobeError::InterruptedWait(
                "lock wait cancelled".to_string(),
            ));
        }
        state.lock_waiters += 1;
        self.lock_released.wait_for(state, self.poll_interval);
        state.lock_waiters -= 1;
        if cancel.is_some_and(CancelToken::is_cancelled) {
            return Err(IsoprobeError::InterruptedWait(
                "lock wait cancelled".to_string(),
            ));
        }
        Ok(())
    }

    /// Publishes every version flushed by `owner` and releases its locks.
    pub fn commit(&self, owner: TxnId) -> usize {
        let mut state = self.state.lock();
        let mut published = 0;
        for slot in state.slots.values_mut() {
            if slot.dirty.as_ref().is_some_and(|d| d.owner == owner) {
                if let Some(dirty) = slot.dirty.take() {
                    slot.committed = Some(dirty.row);
                    published += 1;
                }
            }
        }
        drop(state);
        self.lock_released.notify_all();
        debug!("txn {owner} committed {published} rows");
        published
    }

    /// Discards every version flushed by `owner` and releases its locks.
    pub fn rollback(&self, owner: TxnId) -> usize {
        let mut state = self.state.lock();
        let mut discarded = 0;
        state.slots.retain(|_, slot| {
            if slot.dirty.as_ref().is_some_and(|d| d.owner == owner) {
                slot.dirty = None;
                discarded += 1;
            }
            slot.committed.is_some() || slot.dirty.is_some()
        });
        drop(state);
        self.lock_released.notify_all();
        if discarded > 0 {
            debug!("txn {owner} rolled back {discarded} rows");
        }
        discarded
    }

    /// Removes every row. Waits, like any bulk delete, for row locks held by
    /// running transactions.
    pub fn delete_all(&self) -> Result<usize> {
        let mut state = self.state.lock();
        while state.slots.values().any(|slot| slot.dirty.is_some()) {
            self.park(&mut state, None)?;
        }
        let removed = state.slots.len();
        state.slots.clear();
        Ok(removed)
    }
}
