//! SQLite centre-hint store integration tests.
//!
//! Run with: `cargo test --features persistence --test hint_persistence`

use group_tracker::{CenterHint, HintStore, SqliteHintStore};
use tempfile::TempDir;

fn hint(ts: u64, source: &str) -> CenterHint {
    CenterHint {
        lat: 21.4225,
        lng: 39.8262,
        timestamp_ms: ts,
        source: source.to_string(),
    }
}

fn open_store(dir: &TempDir) -> SqliteHintStore {
    let db_path = dir.path().join("hints.db");
    SqliteHintStore::open(db_path.to_str().unwrap()).expect("failed to open hint store")
}

#[test]
fn test_save_take_round() {
    let store = SqliteHintStore::in_memory().unwrap();
    assert_eq!(store.revision().unwrap(), 0);
    assert!(store.take().unwrap().is_none());

    store.save(hint(1_000, "lost_found")).unwrap();
    assert_eq!(store.revision().unwrap(), 1);
    assert_eq!(store.take().unwrap(), Some(hint(1_000, "lost_found")));
    assert!(store.take().unwrap().is_none());
    assert_eq!(store.revision().unwrap(), 1);
}

#[test]
fn test_latest_save_wins() {
    let store = SqliteHintStore::in_memory().unwrap();
    store.save(hint(1, "a")).unwrap();
    store.save(hint(2, "b")).unwrap();
    assert_eq!(store.revision().unwrap(), 2);
    assert_eq!(store.take().unwrap().unwrap().source, "b");
}

#[test]
fn test_hint_survives_reopen() {
    let dir = TempDir::new().expect("failed to create temp dir");
    {
        let store = open_store(&dir);
        store.save(hint(42, "notification")).unwrap();
    }

    // Another screen (or a restarted app) opens the same file
    let store = open_store(&dir);
    assert_eq!(store.revision().unwrap(), 1);
    let taken = store.take().unwrap().unwrap();
    assert_eq!(taken.timestamp_ms, 42);
    assert_eq!(taken.source, "notification");

    let store = open_store(&dir);
    assert!(store.take().unwrap().is_none());
}
