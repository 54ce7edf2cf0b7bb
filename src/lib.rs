pub mod errors;
pub mod isolation;
pub mod data_store;
pub mod transaction;
pub mod store;
pub mod cancel;
pub mod gate;
pub mod config;
pub mod recorder;
pub mod service;
pub mod experiment;
pub mod arrow_utils;

// Re-export key types and structs for easier access
pub use errors::{IsoprobeError, Result};
pub use isolation::TransactionIsolation;
pub use data_store::row::{Row, RowId, RowOrder};
pub use data_store::row_table::{RowMutation, RowTable};
pub use transaction::Transaction;
pub use store::{Store, prelude};
pub use cancel::CancelToken;
pub use gate::{RendezvousGate, Signal};
pub use config::{ConcurrencyControl, HarnessConfig, StoreConfig, StoreProfile};
pub use recorder::LifecycleRecorder;
pub use service::{IsolationService, SampleService};
pub use experiment::{BackgroundWriter, Experiment, ExperimentReport, Probe};
