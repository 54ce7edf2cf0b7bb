use arrow::array::{Array, ArrayRef, StringArray, TimestampMillisecondArray, UInt64Array};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::data_store::row::{Row, RowId};
use crate::errors::{IsoprobeError, Result};

/// Schema of an exported table snapshot: `id`, `value`, `last_modified`.
pub fn row_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("id", DataType::UInt64, false),
        Field::new("value", DataType::Utf8, false),
        Field::new(
            "last_modified",
            DataType::Timestamp(TimeUnit::Millisecond, None),
            false,
        ),
    ]))
}

/// Converts rows into a single RecordBatch with [`row_schema`].
pub fn rows_to_record_batch(rows: &[Row]) -> Result<RecordBatch> {
    let ids = UInt64Array::from_iter_values(rows.iter().map(|row| row.id().0));
    let values = StringArray::from_iter_values(rows.iter().map(|row| row.value()));
    let millis = rows
        .iter()
        .map(|row| epoch_millis(row.last_modified()))
        .collect::<Result<Vec<i64>>>()?;
    let last_modified = TimestampMillisecondArray::from(millis);

    let columns: Vec<ArrayRef> = vec![Arc::new(ids), Arc::new(values), Arc::new(last_modified)];
    Ok(RecordBatch::try_new(row_schema(), columns)?)
}

/// Reads rows back from a batch produced by [`rows_to_record_batch`].
///
/// Timestamps come back truncated to milliseconds.
pub fn record_batch_to_rows(batch: &RecordBatch) -> Result<Vec<Row>> {
    if batch.schema() != row_schema() {
        return Err(IsoprobeError::StorageError(
            "Schema mismatch between snapshot and row schema".to_string(),
        ));
    }
    let ids = batch
        .column(0)
        .as_any()
        .downcast_ref::<UInt64Array>()
        .ok_or_else(|| IsoprobeError::StorageError("id column is not a UInt64Array".to_string()))?;
    let values = batch
        .column(1)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| {
            IsoprobeError::StorageError("value column is not a StringArray".to_string())
        })?;
    let last_modified = batch
        .column(2)
        .as_any()
        .downcast_ref::<TimestampMillisecondArray>()
        .ok_or_else(|| {
            IsoprobeError::StorageError("last_modified column is not a timestamp array".to_string())
        })?;

    let mut rows = Vec::with_capacity(batch.num_rows());
    for i in 0..batch.num_rows() {
        if ids.is_null(i) || values.is_null(i) || last_modified.is_null(i) {
            return Err(IsoprobeError::StorageError(format!("null cell in snapshot row {i}")));
        }
        let millis = u64::try_from(last_modified.value(i))
            .map_err(|e| IsoprobeError::StorageError(e.to_string()))?;
        rows.push(Row::new(
            RowId(ids.value(i)),
            values.value(i).to_string(),
            UNIX_EPOCH + Duration::from_millis(millis),
        ));
    }
    Ok(rows)
}

/// Writes `batch` as an Arrow IPC stream.
pub fn write_ipc<W: Write>(batch: &RecordBatch, writer: W) -> Result<()> {
    let mut stream = StreamWriter::try_new(writer, &batch.schema())?;
    stream.write(batch)?;
    stream.finish()?;
    Ok(())
}

/// Reads every batch of an Arrow IPC stream.
pub fn read_ipc<R: Read>(reader: R) -> Result<Vec<RecordBatch>> {
    let stream = StreamReader::try_new(reader, None)?;
    let batches = stream.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(batches)
}

fn epoch_millis(at: SystemTime) -> Result<i64> {
    let since = at
        .duration_since(UNIX_EPOCH)
        .map_err(|e| IsoprobeError::StorageError(e.to_string()))?;
    i64::try_from(since.as_millis()).map_err(|e| IsoprobeError::StorageError(e.to_string()))
}
