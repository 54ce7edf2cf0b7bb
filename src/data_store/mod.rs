/// The row type and scan ordering.
pub mod row;
/// The lock-based table shared by all transactions.
pub mod row_table;
