//! Cross-screen "centre the map here" hints.
//!
//! Other parts of an application (a lost-and-found report, a notification)
//! leave a [`CenterHint`] in a [`HintStore`]. The map session checks the
//! store's revision once per tick and consumes a hint only when the revision
//! has moved, so an idle store costs one integer comparison.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::{Position, Result, TrackerError};

/// A request to re-centre the map on a point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CenterHint {
    pub lat: f64,
    pub lng: f64,
    pub timestamp_ms: u64,
    /// Free-form origin tag, e.g. "lost_found"
    pub source: String,
}

impl CenterHint {
    pub fn position(&self) -> Position {
        Position::new(self.lat, self.lng)
    }

    /// True when the hint is no older than `max_age_ms` at `now_ms`.
    pub fn is_fresh(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.timestamp_ms) <= max_age_ms
    }
}

/// Shared storage for at most one pending hint.
pub trait HintStore: Send + Sync {
    /// Replace any pending hint and bump the revision.
    fn save(&self, hint: CenterHint) -> Result<()>;

    /// Remove and return the pending hint.
    fn take(&self) -> Result<Option<CenterHint>>;

    /// Increases on every save.
    fn revision(&self) -> Result<u64>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    hint: Option<CenterHint>,
    revision: u64,
}

/// In-process hint store; clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryHintStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryHintStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>> {
        self.inner.lock().map_err(|_| TrackerError::Internal {
            message: "hint store lock poisoned".to_string(),
        })
    }
}

impl HintStore for MemoryHintStore {
    fn save(&self, hint: CenterHint) -> Result<()> {
        let mut inner = self.lock()?;
        inner.hint = Some(hint);
        inner.revision += 1;
        Ok(())
    }

    fn take(&self) -> Result<Option<CenterHint>> {
        Ok(self.lock()?.hint.take())
    }

    fn revision(&self) -> Result<u64> {
        Ok(self.lock()?.revision)
    }
}

#[cfg(feature = "persistence")]
pub use self::sqlite::SqliteHintStore;

#[cfg(feature = "persistence")]
mod sqlite {
    use std::sync::Mutex;

    use log::info;
    use rusqlite::{params, Connection, OptionalExtension};

    use super::{CenterHint, HintStore};
    use crate::{Result, TrackerError};

    /// SQLite-backed hint store, shareable across screens and restarts.
    pub struct SqliteHintStore {
        db: Mutex<Connection>,
    }

    impl SqliteHintStore {
        /// Open (or create) the store at `db_path`.
        pub fn open(db_path: &str) -> Result<Self> {
            let conn = Connection::open(db_path)?;
            Self::init_schema(&conn)?;
            info!("[HintStore] Opened {}", db_path);
            Ok(Self {
                db: Mutex::new(conn),
            })
        }

        /// In-memory database, mostly for tests.
        pub fn in_memory() -> Result<Self> {
            let conn = Connection::open_in_memory()?;
            Self::init_schema(&conn)?;
            Ok(Self {
                db: Mutex::new(conn),
            })
        }

        fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
            conn.execute_batch(
                r#"
                -- Single pending hint
                CREATE TABLE IF NOT EXISTS center_hint (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    lat REAL NOT NULL,
                    lng REAL NOT NULL,
                    timestamp_ms INTEGER NOT NULL,
                    source TEXT NOT NULL
                );

                -- Save counter, survives take()
                CREATE TABLE IF NOT EXISTS center_hint_revision (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    revision INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO center_hint_revision (id, revision) VALUES (1, 0);
                "#,
            )
        }

        fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
            self.db.lock().map_err(|_| TrackerError::Persistence {
                message: "hint database lock poisoned".to_string(),
            })
        }
    }

    impl HintStore for SqliteHintStore {
        fn save(&self, hint: CenterHint) -> Result<()> {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR REPLACE INTO center_hint (id, lat, lng, timestamp_ms, source)
                 VALUES (1, ?1, ?2, ?3, ?4)",
                params![hint.lat, hint.lng, hint.timestamp_ms as i64, hint.source],
            )?;
            tx.execute(
                "UPDATE center_hint_revision SET revision = revision + 1 WHERE id = 1",
                [],
            )?;
            tx.commit()?;
            Ok(())
        }

        fn take(&self) -> Result<Option<CenterHint>> {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let hint = tx
                .query_row(
                    "SELECT lat, lng, timestamp_ms, source FROM center_hint WHERE id = 1",
                    [],
                    |row| {
                        Ok(CenterHint {
                            lat: row.get(0)?,
                            lng: row.get(1)?,
                            timestamp_ms: row.get::<_, i64>(2)?.max(0) as u64,
                            source: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            tx.execute("DELETE FROM center_hint WHERE id = 1", [])?;
            tx.commit()?;
            Ok(hint)
        }

        fn revision(&self) -> Result<u64> {
            let conn = self.conn()?;
            let revision: i64 = conn.query_row(
                "SELECT revision FROM center_hint_revision WHERE id = 1",
                [],
                |row| row.get(0),
            )?;
            Ok(revision.max(0) as u64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hint(ts: u64) -> CenterHint {
        CenterHint {
            lat: 21.4225,
            lng: 39.8262,
            timestamp_ms: ts,
            source: "lost_found".to_string(),
        }
    }

    #[test]
    fn test_memory_store_take_consumes() {
        let store = MemoryHintStore::new();
        assert_eq!(store.revision().unwrap(), 0);
        assert!(store.take().unwrap().is_none());

        store.save(hint(10)).unwrap();
        assert_eq!(store.revision().unwrap(), 1);
        assert_eq!(store.take().unwrap(), Some(hint(10)));
        assert!(store.take().unwrap().is_none());
        // Taking does not move the revision
        assert_eq!(store.revision().unwrap(), 1);
    }

    #[test]
    fn test_clones_share_slot() {
        let store = MemoryHintStore::new();
        let other_screen = store.clone();
        other_screen.save(hint(1)).unwrap();
        other_screen.save(hint(2)).unwrap();
        assert_eq!(store.revision().unwrap(), 2);
        assert_eq!(store.take().unwrap().unwrap().timestamp_ms, 2);
    }

    #[test]
    fn test_freshness() {
        let h = hint(1_000);
        assert!(h.is_fresh(1_000, 600_000));
        assert!(h.is_fresh(601_000, 600_000));
        assert!(!h.is_fresh(601_001, 600_000));
        // Clock skew: a hint from the future counts as fresh
        assert!(h.is_fresh(0, 600_000));
    }
}
