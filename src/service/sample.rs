use std::sync::Arc;

use log::debug;
use rand::Rng;
use rand::distr::Alphanumeric;

use crate::TransactionIsolation;
use crate::data_store::row::{Row, RowOrder};
use crate::errors::Result;
use crate::store::Store;

const VALUE_LEN: usize = 32;

/// Plain read-modify-write operations, each in one committed transaction.
pub struct SampleService {
    store: Arc<Store>,
}

impl SampleService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Inserts a row with a random value.
    pub fn add_first_entity(&self) -> Result<Row> {
        self.store.save(random_value())
    }

    /// Gives the most recently modified row a new random value.
    ///
    /// Returns the updated row, or `None` when the table is empty.
    pub fn update_newest(&self) -> Result<Option<Row>> {
        let mut txn = self.store.begin(TransactionIsolation::ReadCommitted);
        let newest = txn.find_all(RowOrder::LastModifiedDesc)?.into_iter().next();
        let Some(mut row) = newest else {
            txn.commit()?;
            return Ok(None);
        };

        row.set_value(random_value());
        txn.update(row)?;
        // Flush before the follow-up scan, as a query would auto-flush.
        let updated = txn.flush()?.pop();
        let visible = txn.find_all(RowOrder::ById)?;
        debug!("update_newest sees {} row(s)", visible.len());
        txn.commit()?;
        Ok(updated)
    }
}

fn random_value() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(VALUE_LEN)
        .map(char::from)
        .collect()
}
