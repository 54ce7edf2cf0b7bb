mod common;

use std::thread;
use std::time::Duration;

use isoprobe::{
    ConcurrencyControl, IsoprobeError, RowId, RowOrder, SampleService, StoreConfig, StoreProfile,
    TransactionIsolation,
};

use common::{setup_store, setup_store_with_profile};

const RC: TransactionIsolation = TransactionIsolation::ReadCommitted;
const RU: TransactionIsolation = TransactionIsolation::ReadUncommitted;

#[test]
fn test_transaction_ids_increment() {
    let store = setup_store(ConcurrencyControl::Locking);
    let first = store.begin(RC).id();
    let second = store.begin(RC).id();
    assert_eq!(second, first + 1);
}

#[test]
fn test_basic_insert_commit() {
    let store = setup_store(ConcurrencyControl::Locking);

    let mut txn = store.begin(RC);
    let row = txn.insert("first").unwrap();
    txn.commit().unwrap();

    for isolation in [RC, RU] {
        let mut reader = store.begin(isolation);
        let read = reader.find_by_id(row.id()).unwrap().unwrap();
        assert_eq!(read.value(), "first");
        reader.commit().unwrap();
    }
}

#[test]
fn test_staged_insert_is_invisible_until_flush() {
    let store = setup_store(ConcurrencyControl::Locking);

    let mut txn = store.begin(RC);
    let row = txn.insert("staged").unwrap();
    // Own staged writes are visible to the writer.
    assert_eq!(txn.find_all(RowOrder::ById).unwrap().len(), 1);

    let mut dirty_reader = store.begin(RU);
    assert!(dirty_reader.find_by_id(row.id()).unwrap().is_none());
    assert_eq!(store.locked_rows(), 0);

    txn.flush().unwrap();
    assert_eq!(store.locked_rows(), 1);
    assert_eq!(dirty_reader.find_by_id(row.id()).unwrap().unwrap().value(), "staged");
    txn.commit().unwrap();
    assert_eq!(store.locked_rows(), 0);
}

#[test]
fn test_basic_rollback() {
    let store = setup_store(ConcurrencyControl::Locking);
    store.save("first").unwrap();

    let mut txn = store.begin(RC);
    let row = txn.insert("second").unwrap();
    txn.flush().unwrap();
    txn.rollback();

    let mut reader = store.begin(RU);
    assert!(reader.find_by_id(row.id()).unwrap().is_none());
    assert_eq!(reader.find_all(RowOrder::ById).unwrap().len(), 1);
    assert_eq!(store.locked_rows(), 0);
}

#[test]
fn test_dropped_transaction_rolls_back() {
    let store = setup_store(ConcurrencyControl::Locking);
    let seed = store.save("originalValue").unwrap();

    {
        let mut txn = store.begin(RC);
        let mut row = txn.find_by_id(seed.id()).unwrap().unwrap();
        row.set_value("updatedValue");
        txn.update(row).unwrap();
        txn.flush().unwrap();
        assert_eq!(store.locked_rows(), 1);
    }

    assert_eq!(store.locked_rows(), 0);
    let mut reader = store.begin(RC);
    assert_eq!(reader.find_by_id(seed.id()).unwrap().unwrap().value(), "originalValue");
}

#[test]
fn test_update_of_missing_row_fails_on_flush() {
    let store = setup_store(ConcurrencyControl::Locking);
    let seed = store.save("gone").unwrap();
    store.delete_all().unwrap();

    let mut txn = store.begin(RC);
    txn.update(seed).unwrap();
    let err = txn.flush().unwrap_err();
    assert!(matches!(err, IsoprobeError::NotFound { .. }));
}

#[test]
fn test_last_modified_is_set_by_store() {
    let store = setup_store(ConcurrencyControl::Locking);
    let older = store.save("older").unwrap();
    thread::sleep(Duration::from_millis(5));
    let newer = store.save("newer").unwrap();
    assert!(newer.last_modified() > older.last_modified());

    let mut txn = store.begin(RC);
    let ordered = txn.find_all(RowOrder::LastModifiedDesc).unwrap();
    let values: Vec<&str> = ordered.iter().map(|r| r.value()).collect();
    assert_eq!(values, vec!["newer", "older"]);

    // Touching the older row makes it the newest.
    thread::sleep(Duration::from_millis(5));
    let mut row = txn.find_by_id(older.id()).unwrap().unwrap();
    row.set_value("older, touched");
    txn.update(row).unwrap();
    txn.commit().unwrap();

    let mut txn = store.begin(RC);
    let ordered = txn.find_all(RowOrder::LastModifiedDesc).unwrap();
    assert_eq!(ordered[0].id(), older.id());
}

#[test]
fn test_delete_all_clears_table() {
    let store = setup_store(ConcurrencyControl::Locking);
    store.save("a").unwrap();
    store.save("b").unwrap();
    assert_eq!(store.delete_all().unwrap(), 2);

    let mut txn = store.begin(RU);
    assert!(txn.find_all(RowOrder::ById).unwrap().is_empty());
    assert!(txn.find_by_id(RowId(1)).unwrap().is_none());
}

#[test]
fn test_lifecycle_callbacks_are_recorded_per_store() {
    let store = setup_store(ConcurrencyControl::Locking);
    let other = setup_store(ConcurrencyControl::Locking);

    let row = store.save("first").unwrap();
    let mut txn = store.begin(RC);
    let mut loaded = txn.find_by_id(row.id()).unwrap().unwrap();
    loaded.set_value("second");
    txn.update(loaded).unwrap();
    txn.commit().unwrap();

    assert_eq!(
        store.recorder().messages(),
        vec![format!("pre-persist {}", row.id()), format!("pre-update {}", row.id())]
    );
    assert!(other.recorder().is_empty());
}

#[test]
fn test_insert_then_update_before_flush_is_one_insert() {
    let store = setup_store_with_profile(StoreProfile::EclipseLink, ConcurrencyControl::Locking);

    let mut txn = store.begin(RC);
    let mut row = txn.insert("draft").unwrap();
    row.set_value("final");
    txn.update(row.clone()).unwrap();
    let flushed = txn.flush().unwrap();
    txn.commit().unwrap();

    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].value(), "final");
    assert_eq!(store.recorder().messages(), vec![format!("pre-persist {}", row.id())]);
}

#[test]
fn test_drop_and_create_profile_clears_shared_table() {
    let store = setup_store(ConcurrencyControl::Locking);
    store.save("left over").unwrap();

    let hibernate = store.open_on(StoreConfig::for_profile(StoreProfile::Hibernate)).unwrap();
    assert_eq!(hibernate.begin(RC).find_all(RowOrder::ById).unwrap().len(), 1);

    let eclipse = store.open_on(StoreConfig::for_profile(StoreProfile::EclipseLink)).unwrap();
    assert!(eclipse.begin(RC).find_all(RowOrder::ById).unwrap().is_empty());
    assert!(store.begin(RC).find_all(RowOrder::ById).unwrap().is_empty());
}

#[test]
fn test_sample_service_updates_newest_row() {
    let store = setup_store(ConcurrencyControl::Locking);
    let service = SampleService::new(store.clone());

    assert!(service.update_newest().unwrap().is_none());

    let first = service.add_first_entity().unwrap();
    thread::sleep(Duration::from_millis(5));
    let second = service.add_first_entity().unwrap();
    assert_eq!(second.value().len(), 32);
    assert_ne!(first.value(), second.value());

    let updated = service.update_newest().unwrap().unwrap();
    assert_eq!(updated.id(), second.id());
    assert_ne!(updated.value(), second.value());

    let mut txn = store.begin(RC);
    let stored = txn.find_by_id(second.id()).unwrap().unwrap();
    assert_eq!(stored.value(), updated.value());
    let untouched = txn.find_by_id(first.id()).unwrap().unwrap();
    assert_eq!(untouched.value(), first.value());
}

#[test]
fn test_failed_flush_rolls_back_earlier_changes() {
    let store = setup_store(ConcurrencyControl::Locking);

    let mut txn = store.begin(RC);
    let staged = txn.insert("a").unwrap();
    // A row with a higher id that disappears before the flush.
    let gone = store.save("b").unwrap();
    store.delete_all().unwrap();
    txn.update(gone).unwrap();

    // The insert is applied first, then the update fails.
    let err = txn.flush().unwrap_err();
    assert!(matches!(err, IsoprobeError::NotFound { .. }));
    assert_eq!(store.locked_rows(), 0);

    let mut reader = store.begin(RU);
    assert!(reader.find_by_id(staged.id()).unwrap().is_none());
    assert!(reader.find_all(RowOrder::ById).unwrap().is_empty());

    assert!(matches!(txn.insert("c"), Err(IsoprobeError::TransactionAborted { .. })));
    let err = txn.commit().unwrap_err();
    assert!(matches!(err, IsoprobeError::TransactionAborted { .. }));
    assert!(reader.find_all(RowOrder::ById).unwrap().is_empty());
}
