//! The experiment driver.
//!
//! Each scenario seeds the table, runs one gate-controlled writer on a
//! background thread and checks, from the driver thread and from a probe
//! thread, what readers at a given isolation level can see while the writer
//! holds an uncommitted flush.
//!
//! The gate orders the writer's checkpoints exactly. What it cannot tell is
//! whether a probe read is blocked or merely slow; the driver first waits for
//! the probe to park on a row lock and then keeps watching it for
//! [`HarnessConfig::observation_window`]. That last step is time based and can
//! flake on an overloaded machine.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError, bounded};
use log::{info, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::TransactionIsolation;
use crate::cancel::CancelToken;
use crate::config::{ConcurrencyControl, HarnessConfig};
use crate::data_store::row::{Row, RowId};
use crate::errors::{IsoprobeError, Result};
use crate::gate::RendezvousGate;
use crate::service::IsolationService;
use crate::store::Store;

const SEED_VALUE: &str = "first";
const INSERTED_VALUE: &str = "second";
const ORIGINAL_VALUE: &str = "originalValue";
const UPDATED_VALUE: &str = "updatedValue";

/// What one scenario observed.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentReport {
    pub name: &'static str,
    pub concurrency_control: ConcurrencyControl,
    /// Values returned by the read taken before the writer was released.
    pub before_write: Vec<String>,
    /// Values returned while the writer held its uncommitted flush.
    pub in_flight: Vec<String>,
    /// Whether the committed-only probe was still pending after the observation
    /// window. `None` for scenarios without a probe.
    pub probe_blocked: Option<bool>,
    /// Committed values after the writer finished.
    pub committed: Vec<String>,
    pub elapsed: Duration,
}

/// Fails with `AssertionFailure` carrying `message` unless `condition` holds.
pub fn ensure(condition: bool, message: impl FnOnce() -> String) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(IsoprobeError::AssertionFailure(message()))
    }
}

/// Retries `attempt` every `poll` until it succeeds or `timeout` elapses.
///
/// Only `AssertionFailure` is retried; any other error ends the wait at once.
pub fn await_until<T, F>(timeout: Duration, poll: Duration, mut attempt: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(IsoprobeError::AssertionFailure(message)) => {
                if Instant::now() >= deadline {
                    return Err(IsoprobeError::AssertionFailure(format!(
                        "not satisfied within {timeout:?}: {message}"
                    )));
                }
                thread::sleep(poll);
            }
            Err(other) => return Err(other),
        }
    }
}

/// A writer operation running on its own thread.
pub struct BackgroundWriter {
    done: Receiver<Result<Row>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundWriter {
    pub fn spawn<F>(name: &str, op: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Row> + Send + 'static,
    {
        let (tx, done) = bounded(1);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(op());
            })
            .map_err(|e| IsoprobeError::StorageError(format!("cannot spawn writer: {e}")))?;
        Ok(Self {
            done,
            handle: Some(handle),
        })
    }

    /// Waits at most `timeout` for the writer to finish and returns its result.
    pub fn join_timeout(mut self, timeout: Duration) -> Result<Row> {
        match self.done.recv_timeout(timeout) {
            Ok(result) => {
                if let Some(handle) = self.handle.take() {
                    let _ = handle.join();
                }
                result
            }
            Err(RecvTimeoutError::Timeout) => Err(IsoprobeError::AssertionFailure(format!(
                "writer did not terminate within {timeout:?}"
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(IsoprobeError::StorageError(
                "writer thread panicked".to_string(),
            )),
        }
    }
}

/// A cancellable read running on its own thread.
pub struct Probe<T> {
    done: Receiver<Result<T>>,
    /// Outcome taken off the channel by `is_done` and not handed out yet.
    outcome: Mutex<Option<Result<T>>>,
    cancel: CancelToken,
    started_at: Instant,
}

impl<T: Send + 'static> Probe<T> {
    pub fn spawn<F>(name: &str, op: F) -> Result<Self>
    where
        F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
    {
        let (tx, done) = bounded(1);
        let cancel = CancelToken::new();
        let probe_cancel = cancel.clone();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _ = tx.send(op(&probe_cancel));
            })
            .map_err(|e| IsoprobeError::StorageError(format!("cannot spawn probe: {e}")))?;
        Ok(Self {
            done,
            outcome: Mutex::new(None),
            cancel,
            started_at: Instant::now(),
        })
    }

    /// Whether the read has returned, successfully or not. A probe thread
    /// that panicked counts as done.
    pub fn is_done(&self) -> bool {
        let mut outcome = self.outcome.lock();
        if outcome.is_some() {
            return true;
        }
        match self.done.try_recv() {
            Ok(result) => {
                *outcome = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            Err(TryRecvError::Disconnected) => {
                *outcome = Some(Err(probe_panicked()));
                true
            }
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Waits at most `timeout` for the read; `None` if it is still pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        if let Some(result) = self.outcome.lock().take() {
            return Some(result);
        }
        match self.done.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(probe_panicked())),
        }
    }

    /// Abandons the read. Never fails and never waits for the probe thread; a
    /// read parked on a row lock gives up within one lock poll interval.
    pub fn cancel(self) {
        warn!("cancelling probe after {:?}", self.elapsed());
        self.cancel.cancel();
    }
}

/// Runs the isolation scenarios against one store.
pub struct Experiment {
    store: Arc<Store>,
    service: IsolationService,
    config: HarnessConfig,
}

impl Experiment {
    pub fn new(store: Arc<Store>, config: HarnessConfig) -> Self {
        let service = IsolationService::new(Arc::clone(&store));
        Self {
            store,
            service,
            config,
        }
    }

    pub fn service(&self) -> &IsolationService {
        &self.service
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Runs every scenario in turn, stopping at the first failure.
    pub fn run_all(&self) -> Result<Vec<ExperimentReport>> {
        Ok(vec![
            self.read_uncommitted_sees_insert()?,
            self.read_committed_blocks_on_insert()?,
            self.read_uncommitted_sees_update()?,
            self.read_committed_blocks_on_update()?,
        ])
    }

    /// A row inserted by a concurrent writer is visible to a READ_UNCOMMITTED scan
    /// once flushed, before the writer commits.
    pub fn read_uncommitted_sees_insert(&self) -> Result<ExperimentReport> {
        let started_at = Instant::now();
        self.store.delete_all()?;
        self.store.save(SEED_VALUE)?;
        let gate = Arc::new(RendezvousGate::new());
        let writer = self.spawn_create(INSERTED_VALUE, &gate)?;

        guarded(&gate, || {
            let mut before_write = None;
            let (timeout, poll) = (self.config.eventual_timeout, self.config.poll_interval);
            let in_flight = await_until(timeout, poll, || {
                let all = self.uncommitted_scan()?;
                info!("uncommitted scan: {}", describe(&all));
                if before_write.is_none() {
                    // The first scan is taken before the writer may insert.
                    before_write = Some(values(&all));
                    gate.started.release();
                }
                ensure(all.len() == 2, || format!("expected 2 rows, saw {}", all.len()))?;
                Ok(all)
            })?;

            gate.flushed.release();
            writer.join_timeout(self.config.join_timeout)?;
            let committed = self.service.find_all_committed()?;
            ensure(committed.len() == 2, || {
                format!("expected 2 committed rows, saw {}", committed.len())
            })?;

            Ok(self.report(
                "read_uncommitted_sees_insert",
                before_write.unwrap_or_default(),
                values(&in_flight),
                None,
                values(&committed),
                started_at,
            ))
        })
    }

    /// A READ_COMMITTED scan blocks while a concurrent insert is flushed but not
    /// committed, and sees the row after the commit.
    pub fn read_committed_blocks_on_insert(&self) -> Result<ExperimentReport> {
        let started_at = Instant::now();
        self.store.delete_all()?;
        self.store.save(SEED_VALUE)?;
        let gate = Arc::new(RendezvousGate::new());
        let writer = self.spawn_create(INSERTED_VALUE, &gate)?;

        guarded(&gate, || {
            self.await_writer_at_start(&gate)?;
            let before = self.service.find_all_committed()?;
            ensure(before.len() == 1, || {
                format!("expected 1 row before the insert, saw {}", before.len())
            })?;
            gate.started.release();
            self.await_flush(&gate)?;

            let service = self.service.clone();
            let probe = Probe::spawn("committed-scan-probe", move |cancel| {
                service.find_all_cancellable(TransactionIsolation::ReadCommitted, cancel)
            })?;
            let (probe_blocked, in_flight) = self.observe_probe(probe, |rows| {
                ensure(rows.len() == 1, || {
                    format!("snapshot scan should see 1 committed row, saw {}", rows.len())
                })?;
                Ok(values(rows))
            })?;

            gate.flushed.release();
            writer.join_timeout(self.config.join_timeout)?;
            // The insert is committed now.
            let committed = self.service.find_all_committed()?;
            ensure(committed.len() == 2, || {
                format!("expected 2 committed rows, saw {}", committed.len())
            })?;

            Ok(self.report(
                "read_committed_blocks_on_insert",
                values(&before),
                in_flight,
                Some(probe_blocked),
                values(&committed),
                started_at,
            ))
        })
    }

    /// A READ_UNCOMMITTED read sees a concurrent update once it is flushed, before
    /// the writer commits.
    pub fn read_uncommitted_sees_update(&self) -> Result<ExperimentReport> {
        let started_at = Instant::now();
        self.store.delete_all()?;
        let seed = self.store.save(ORIGINAL_VALUE)?;
        let gate = Arc::new(RendezvousGate::new());
        let writer = self.spawn_update(seed.id(), UPDATED_VALUE, &gate)?;

        guarded(&gate, || {
            let first = self.uncommitted_read(seed.id())?;
            info!("read before flush {first}");
            ensure(first.value() == ORIGINAL_VALUE, || {
                format!("expected {ORIGINAL_VALUE:?} before the update, saw {:?}", first.value())
            })?;
            gate.started.release();

            let seen = await_until(self.config.eventual_timeout, self.config.poll_interval, || {
                let row = self.uncommitted_read(seed.id())?;
                info!("{row}");
                ensure(row.value() == UPDATED_VALUE, || {
                    format!("expected {UPDATED_VALUE:?}, saw {:?}", row.value())
                })?;
                Ok(row)
            })?;

            gate.flushed.release();
            writer.join_timeout(self.config.join_timeout)?;
            let committed = self.service.find_committed(seed.id())?;
            ensure(committed.value() == UPDATED_VALUE, || {
                format!("expected committed {UPDATED_VALUE:?}, saw {:?}", committed.value())
            })?;

            Ok(self.report(
                "read_uncommitted_sees_update",
                vec![first.value().to_string()],
                vec![seen.value().to_string()],
                None,
                vec![committed.value().to_string()],
                started_at,
            ))
        })
    }

    /// A READ_COMMITTED read of a row updated by a concurrent, flushed but
    /// uncommitted writer blocks until the commit and then sees the new value.
    pub fn read_committed_blocks_on_update(&self) -> Result<ExperimentReport> {
        let started_at = Instant::now();
        self.store.delete_all()?;
        let seed = self.store.save(ORIGINAL_VALUE)?;
        let gate = Arc::new(RendezvousGate::new());
        let writer = self.spawn_update(seed.id(), UPDATED_VALUE, &gate)?;

        guarded(&gate, || {
            let first = self.service.find_committed(seed.id())?;
            info!("read before flush {first}");
            gate.started.release();
            self.await_flush(&gate)?;

            let service = self.service.clone();
            let id = seed.id();
            let probe = Probe::spawn("committed-read-probe", move |cancel| {
                service.find_cancellable(id, TransactionIsolation::ReadCommitted, cancel)
            })?;
            let (probe_blocked, in_flight) = self.observe_probe(probe, |row| {
                ensure(row.value() == ORIGINAL_VALUE, || {
                    format!("snapshot read should see {ORIGINAL_VALUE:?}, saw {:?}", row.value())
                })?;
                Ok(vec![row.value().to_string()])
            })?;

            gate.flushed.release();
            writer.join_timeout(self.config.join_timeout)?;
            // The update is committed now.
            let committed = self.service.find_committed(seed.id())?;
            ensure(committed.value() == UPDATED_VALUE, || {
                format!("expected committed {UPDATED_VALUE:?}, saw {:?}", committed.value())
            })?;

            Ok(self.report(
                "read_committed_blocks_on_update",
                vec![first.value().to_string()],
                in_flight,
                Some(probe_blocked),
                vec![committed.value().to_string()],
                started_at,
            ))
        })
    }

    fn spawn_create(
        &self,
        value: &'static str,
        gate: &Arc<RendezvousGate>,
    ) -> Result<BackgroundWriter> {
        let service = self.service.clone();
        let gate = Arc::clone(gate);
        BackgroundWriter::spawn("create-writer", move || service.create(value, &gate))
    }

    fn spawn_update(
        &self,
        id: RowId,
        value: &'static str,
        gate: &Arc<RendezvousGate>,
    ) -> Result<BackgroundWriter> {
        let service = self.service.clone();
        let gate = Arc::clone(gate);
        BackgroundWriter::spawn("update-writer", move || service.update(id, value, &gate))
    }

    /// READ_UNCOMMITTED scan that must return within
    /// [`HarnessConfig::prompt_read_bound`].
    fn uncommitted_scan(&self) -> Result<Vec<Row>> {
        let service = self.service.clone();
        read_within("uncommitted scan", self.config.prompt_read_bound, move |cancel| {
            service.find_all_cancellable(TransactionIsolation::ReadUncommitted, cancel)
        })
    }

    /// READ_UNCOMMITTED read of one row that must return within
    /// [`HarnessConfig::prompt_read_bound`].
    fn uncommitted_read(&self, id: RowId) -> Result<Row> {
        let service = self.service.clone();
        read_within("uncommitted read", self.config.prompt_read_bound, move |cancel| {
            service.find_cancellable(id, TransactionIsolation::ReadUncommitted, cancel)
        })
    }

    /// Waits until the writer has opened its transaction and parked on `started`.
    fn await_writer_at_start(&self, gate: &RendezvousGate) -> Result<()> {
        await_until(self.config.settle_delay, self.config.poll_interval, || {
            ensure(gate.started.waiters() == 1, || {
                "writer has not reached the started checkpoint".to_string()
            })
        })
    }

    /// Waits for the writer's flush to reach the table.
    fn await_flush(&self, gate: &RendezvousGate) -> Result<()> {
        let flushed = gate.flush_point.acquire_timeout(self.config.settle_delay)?;
        ensure(flushed, || {
            format!("writer did not flush within {:?}", self.config.settle_delay)
        })
    }

    /// Watches a committed-only probe while the writer holds its flush.
    ///
    /// On a locking store the probe must still be pending after the observation
    /// window and is then cancelled. On a versioned store it must return at once;
    /// `check` validates what it returned. Returns whether the probe blocked and
    /// the values it saw.
    fn observe_probe<T, C>(&self, probe: Probe<T>, check: C) -> Result<(bool, Vec<String>)>
    where
        T: Send + 'static,
        C: FnOnce(&T) -> Result<Vec<String>>,
    {
        if !self.store.blocks_committed_reads() {
            let result = probe.wait_timeout(self.config.observation_window).ok_or_else(|| {
                IsoprobeError::AssertionFailure(
                    "versioned store should not block a committed read".to_string(),
                )
            })??;
            return Ok((false, check(&result)?));
        }

        let parked = await_until(self.config.settle_delay, self.config.poll_interval, || {
            ensure(self.store.lock_waiters() > 0 || probe.is_done(), || {
                "probe has not reached the row lock".to_string()
            })
        });
        if parked.is_err() {
            warn!("probe never parked on a row lock, observing anyway");
        }
        thread::sleep(self.config.observation_window);
        let blocked = !probe.is_done();
        if !blocked {
            if let Some(Err(e)) = probe.wait_timeout(Duration::ZERO) {
                return Err(e);
            }
        }
        ensure(blocked, || {
            "should block as an update lock prevents read".to_string()
        })?;
        probe.cancel();
        Ok((true, Vec::new()))
    }

    fn report(
        &self,
        name: &'static str,
        before_write: Vec<String>,
        in_flight: Vec<String>,
        probe_blocked: Option<bool>,
        committed: Vec<String>,
        started_at: Instant,
    ) -> ExperimentReport {
        let report = ExperimentReport {
            name,
            concurrency_control: self.store.concurrency_control(),
            before_write,
            in_flight,
            probe_blocked,
            committed,
            elapsed: started_at.elapsed(),
        };
        info!("{name} passed in {:?}", report.elapsed);
        report
    }
}

/// Runs `body`; on failure interrupts the gate so a writer parked at a
/// checkpoint aborts and rolls back instead of hanging.
fn guarded<T>(gate: &RendezvousGate, body: impl FnOnce() -> Result<T>) -> Result<T> {
    let outcome = body();
    if let Err(e) = &outcome {
        warn!("experiment failed, interrupting writer: {e}");
        gate.interrupt_all();
    }
    outcome
}

/// Runs `op` on a probe thread and fails with `AssertionFailure` unless it
/// returns within `bound`. A read still pending at the bound is cancelled.
pub fn read_within<T, F>(name: &str, bound: Duration, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&CancelToken) -> Result<T> + Send + 'static,
{
    let probe = Probe::spawn(name, op)?;
    match probe.wait_timeout(bound) {
        Some(result) => result,
        None => {
            probe.cancel();
            Err(IsoprobeError::AssertionFailure(format!(
                "{name} should return without delay but took longer than {bound:?}"
            )))
        }
    }
}

fn probe_panicked() -> IsoprobeError {
    IsoprobeError::StorageError("probe thread panicked".to_string())
}

fn values(rows: &[Row]) -> Vec<String> {
    rows.iter().map(|row| row.value().to_string()).collect()
}

fn describe(rows: &[Row]) -> String {
    rows.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
