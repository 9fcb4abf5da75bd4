//! Goal store over the embedded database
//! Two tables with identical shape: `meta` holds value goals,
//! `activation_meta` holds activation-time goals

use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::StoreError;
use crate::slot::{DurableSlot, SledSlot};
use crate::snapshot;

/// Fallback goal for a device with no stored value for a period.
pub const DEFAULT_VALUE_GOAL: f64 = 10_000.0;
/// Fallback activation goal for daily periods.
pub const DEFAULT_DAILY_ACTIVATION_GOAL: f64 = 24.0;
/// Fallback activation goal for every other filter type.
pub const DEFAULT_ACTIVATION_GOAL: f64 = 720.0;

/// Activation fallback for a filter type
pub fn activation_default(filter_type: &str) -> f64 {
    if filter_type == "daily" {
        DEFAULT_DAILY_ACTIVATION_GOAL
    } else {
        DEFAULT_ACTIVATION_GOAL
    }
}

/// One stored goal row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaRecord {
    pub device_id: String,
    pub filter_type: String,
    pub period_index: i64,
    pub value: f64,
    /// Seconds since the Unix epoch. Rewritten together with the row on upsert.
    pub created_at: f64,
    /// Seconds since the Unix epoch.
    pub updated_at: f64,
}

/// A goal value as callers hand it in; numeric strings are parsed on save
#[derive(Debug, Clone)]
pub enum GoalValue {
    Number(f64),
    Text(String),
}

impl GoalValue {
    fn as_f64(&self) -> Result<f64, StoreError> {
        match self {
            Self::Number(value) => Ok(*value),
            Self::Text(raw) => raw
                .trim()
                .parse::<f64>()
                .map_err(|_| StoreError::InvalidValue(raw.clone())),
        }
    }
}

impl From<f64> for GoalValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for GoalValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl From<&str> for GoalValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for GoalValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

#[derive(Debug, Clone, Copy)]
enum Table {
    Meta,
    ActivationMeta,
}

impl Table {
    fn name(self) -> &'static str {
        match self {
            Self::Meta => "meta",
            Self::ActivationMeta => "activation_meta",
        }
    }
}

/// Store owning the live database handle and its durable slot.
/// Construct one at application start and pass it by reference.
pub struct MetaStore {
    conn: Mutex<Connection>,
    slot: Box<dyn DurableSlot>,
}

impl MetaStore {
    /// Open the store over a durable slot.
    /// Restores a previously persisted image if the slot holds one,
    /// otherwise creates an empty database and persists the schema.
    pub fn open(slot: impl DurableSlot + 'static) -> Result<Self, StoreError> {
        let slot: Box<dyn DurableSlot> = Box::new(slot);

        let (conn, fresh) = match slot.load()? {
            Some(raw) => {
                let image = snapshot::decode(&raw)?;
                debug!(bytes = image.len(), "Restoring goal database from slot");
                (snapshot::restore(&image)?, false)
            }
            None => (Connection::open_in_memory()?, true),
        };

        // Idempotent; also upgrades images persisted before a table existed
        create_tables(&conn)?;

        let store = Self {
            conn: Mutex::new(conn),
            slot,
        };
        if fresh {
            let conn = store.lock()?;
            store.persist(&conn)?;
            info!("Created empty goal database");
        }
        Ok(store)
    }

    /// Open the store over the default on-disk slot location
    pub fn open_default() -> Result<Self, StoreError> {
        Self::open(SledSlot::open_default()?)
    }

    // --- Value goals (meta) ---

    /// Load the stored value goal for a triple, `None` when absent
    pub fn load_value(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<Option<f64>, StoreError> {
        self.load_from(Table::Meta, device_id, filter_type, period_index)
    }

    /// Load a value goal, falling back to [`DEFAULT_VALUE_GOAL`]
    pub fn load_value_or_default(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<f64, StoreError> {
        Ok(self
            .load_value(device_id, filter_type, period_index)?
            .unwrap_or(DEFAULT_VALUE_GOAL))
    }

    /// Upsert a value goal and persist the database
    pub fn save_value(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
        value: impl Into<GoalValue>,
    ) -> Result<(), StoreError> {
        self.save_into(Table::Meta, device_id, filter_type, period_index, value.into())
    }

    // --- Activation goals (activation_meta) ---

    /// Load the stored activation goal for a triple, `None` when absent
    pub fn load_activation(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<Option<f64>, StoreError> {
        self.load_from(Table::ActivationMeta, device_id, filter_type, period_index)
    }

    /// Load an activation goal, falling back per [`activation_default`]
    pub fn load_activation_or_default(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<f64, StoreError> {
        Ok(self
            .load_activation(device_id, filter_type, period_index)?
            .unwrap_or_else(|| activation_default(filter_type)))
    }

    /// Upsert an activation goal and persist the database
    pub fn save_activation(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
        value: impl Into<GoalValue>,
    ) -> Result<(), StoreError> {
        self.save_into(
            Table::ActivationMeta,
            device_id,
            filter_type,
            period_index,
            value.into(),
        )
    }

    // --- Listing, deletion, reset ---

    /// All value-goal rows for a device, most recently updated first
    pub fn list_all(&self, device_id: &str) -> Result<Vec<MetaRecord>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT device_id, filter_type, period_index, value, created_at, updated_at
             FROM meta
             WHERE device_id = ?1
             ORDER BY updated_at DESC, id DESC",
        )?;
        let records = stmt
            .query_map(params![device_id], |row| {
                Ok(MetaRecord {
                    device_id: row.get(0)?,
                    filter_type: row.get(1)?,
                    period_index: row.get(2)?,
                    value: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<MetaRecord>, rusqlite::Error>>()?;
        Ok(records)
    }

    /// Delete a value goal if present; persists afterward either way
    pub fn delete_value(
        &self,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let affected = conn.execute(
            "DELETE FROM meta
             WHERE device_id = ?1 AND filter_type = ?2 AND period_index = ?3",
            params![device_id, filter_type, period_index],
        )?;
        self.persist(&conn)?;
        debug!(device_id, filter_type, period_index, affected, "Deleted goal");
        Ok(())
    }

    /// Delete every row from both tables and persist
    pub fn clear_all(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM meta", [])?;
        conn.execute("DELETE FROM activation_meta", [])?;
        self.persist(&conn)?;
        info!("Cleared all stored goals");
        Ok(())
    }

    // --- Internals ---

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn load_from(
        &self,
        table: Table,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
    ) -> Result<Option<f64>, StoreError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT value FROM {}
             WHERE device_id = ?1 AND filter_type = ?2 AND period_index = ?3",
            table.name()
        );
        let value = conn
            .query_row(&sql, params![device_id, filter_type, period_index], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn save_into(
        &self,
        table: Table,
        device_id: &str,
        filter_type: &str,
        period_index: i64,
        value: GoalValue,
    ) -> Result<(), StoreError> {
        let value = value.as_f64()?;
        let now = now_ts();
        let conn = self.lock()?;
        // REPLACE rewrites the whole row on conflict, so created_at tracks the
        // latest upsert rather than the first insert
        let sql = format!(
            "INSERT OR REPLACE INTO {}
             (device_id, filter_type, period_index, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
            table.name()
        );
        conn.execute(&sql, params![device_id, filter_type, period_index, value, now])?;
        self.persist(&conn)?;
        debug!(
            table = table.name(),
            device_id, filter_type, period_index, value, "Saved goal"
        );
        Ok(())
    }

    /// Serialize the whole database and overwrite the slot.
    /// Called under the connection lock so no mutation lands between
    /// the change and its snapshot.
    fn persist(&self, conn: &Connection) -> Result<(), StoreError> {
        let image = snapshot::export(conn)?;
        let encoded = snapshot::encode(&image)?;
        self.slot.store(&encoded)?;
        Ok(())
    }
}

/// Current Unix timestamp as REAL seconds with millisecond precision
fn now_ts() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

fn create_tables(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS meta (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            filter_type TEXT NOT NULL,
            period_index INTEGER NOT NULL,
            value REAL NOT NULL,
            created_at REAL NOT NULL,
            updated_at REAL NOT NULL,
            UNIQUE(device_id, filter_type, period_index)
        );
        CREATE TABLE IF NOT EXISTS activation_meta (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_id TEXT NOT NULL,
            filter_type TEXT NOT NULL,
            period_index INTEGER NOT NULL,
            value REAL NOT NULL,
            created_at REAL NOT NULL,
            updated_at REAL NOT NULL,
            UNIQUE(device_id, filter_type, period_index)
        );",
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slot::MemorySlot;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::tempdir;

    fn memory_store() -> MetaStore {
        MetaStore::open(MemorySlot::new()).unwrap()
    }

    #[test]
    fn test_defaults_for_unsaved_triples() {
        let store = memory_store();
        assert_eq!(store.load_value("dev1", "daily", 0).unwrap(), None);
        assert_eq!(
            store.load_value_or_default("dev1", "daily", 0).unwrap(),
            10_000.0
        );
        assert_eq!(
            store.load_activation_or_default("dev1", "daily", 0).unwrap(),
            24.0
        );
        assert_eq!(
            store.load_activation_or_default("dev1", "weekly", 0).unwrap(),
            720.0
        );
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let store = memory_store();
        store.save_value("dev1", "daily", 3, 1234.5).unwrap();
        assert_eq!(store.load_value("dev1", "daily", 3).unwrap(), Some(1234.5));

        // Numeric strings are coerced to reals
        store.save_value("dev1", "weekly", 1, "250.25").unwrap();
        assert_eq!(store.load_value("dev1", "weekly", 1).unwrap(), Some(250.25));
    }

    #[test]
    fn test_non_numeric_string_is_rejected() {
        let store = memory_store();
        let err = store.save_value("dev1", "daily", 0, "lots").unwrap_err();
        assert!(matches!(err, StoreError::InvalidValue(_)));
        assert_eq!(store.load_value("dev1", "daily", 0).unwrap(), None);
    }

    #[test]
    fn test_upsert_keeps_one_row_per_triple() {
        let store = memory_store();
        store.save_value("dev1", "daily", 1, 5.0).unwrap();
        let first = store.list_all("dev1").unwrap().remove(0);

        std::thread::sleep(Duration::from_millis(10));
        store.save_value("dev1", "daily", 1, 9.0).unwrap();

        let rows = store.list_all("dev1").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 9.0);
        assert!(rows[0].updated_at > first.updated_at);
    }

    #[test]
    fn test_list_all_orders_most_recent_first() {
        let store = memory_store();
        store.save_value("dev1", "daily", 1, 5.0).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        store.save_value("dev1", "weekly", 2, 9.0).unwrap();
        // Another device's rows are not listed
        store.save_value("dev2", "daily", 1, 7_i64).unwrap();

        let rows = store.list_all("dev1").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].filter_type, "weekly");
        assert_eq!(rows[1].filter_type, "daily");
    }

    #[test]
    fn test_delete_restores_default() {
        let store = memory_store();
        store.save_value("dev1", "daily", 1, 55.0).unwrap();
        store.delete_value("dev1", "daily", 1).unwrap();
        assert_eq!(store.load_value("dev1", "daily", 1).unwrap(), None);
        assert_eq!(
            store.load_value_or_default("dev1", "daily", 1).unwrap(),
            10_000.0
        );

        // Deleting a triple that was never saved is a no-op
        store.delete_value("ghost", "daily", 9).unwrap();
    }

    #[test]
    fn test_clear_all_empties_both_tables() {
        let store = memory_store();
        store.save_value("dev1", "daily", 1, 5.0).unwrap();
        store.save_activation("dev1", "daily", 1, 8.0).unwrap();

        store.clear_all().unwrap();

        assert!(store.list_all("dev1").unwrap().is_empty());
        assert_eq!(store.load_value("dev1", "daily", 1).unwrap(), None);
        assert_eq!(
            store.load_activation_or_default("dev1", "daily", 1).unwrap(),
            24.0
        );
    }

    #[test]
    fn test_reopen_from_shared_slot_reproduces_state() {
        let slot = Arc::new(MemorySlot::new());
        let store = MetaStore::open(Arc::clone(&slot)).unwrap();
        store.save_value("dev1", "daily", 1, 42.0).unwrap();
        store.save_activation("dev1", "daily", 1, 12.0).unwrap();
        let before = store.list_all("dev1").unwrap();
        drop(store);

        let reopened = MetaStore::open(slot).unwrap();
        assert_eq!(reopened.load_value("dev1", "daily", 1).unwrap(), Some(42.0));
        assert_eq!(
            reopened.load_activation("dev1", "daily", 1).unwrap(),
            Some(12.0)
        );
        let after = reopened.list_all("dev1").unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].value, after[0].value);
        assert_eq!(before[0].updated_at, after[0].updated_at);
    }

    #[test]
    fn test_restart_with_sled_slot() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("goals.db");
        {
            let store = MetaStore::open(SledSlot::open(&path).unwrap()).unwrap();
            store.save_value("dev1", "monthly", 4, "880").unwrap();
        }

        let store = MetaStore::open(SledSlot::open(&path).unwrap()).unwrap();
        assert_eq!(store.load_value("dev1", "monthly", 4).unwrap(), Some(880.0));
    }

    /// Slot that can be told to refuse writes
    struct FlakySlot {
        inner: MemorySlot,
        fail_writes: AtomicBool,
    }

    impl DurableSlot for FlakySlot {
        fn load(&self) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.load()
        }

        fn store(&self, bytes: &[u8]) -> Result<(), StoreError> {
            if self.fail_writes.load(Ordering::Relaxed) {
                return Err(StoreError::Slot("write refused".to_string()));
            }
            self.inner.store(bytes)
        }
    }

    #[test]
    fn test_mutation_stands_when_persist_fails() {
        let slot = Arc::new(FlakySlot {
            inner: MemorySlot::new(),
            fail_writes: AtomicBool::new(false),
        });
        let store = MetaStore::open(Arc::clone(&slot)).unwrap();

        slot.fail_writes.store(true, Ordering::Relaxed);
        assert!(store.save_value("dev1", "daily", 1, 5.0).is_err());

        // In-memory row survives; the slot still holds the pre-mutation image
        assert_eq!(store.load_value("dev1", "daily", 1).unwrap(), Some(5.0));
        slot.fail_writes.store(false, Ordering::Relaxed);
        store.save_value("dev1", "daily", 2, 6.0).unwrap();

        drop(store);
        let reopened = MetaStore::open(slot).unwrap();
        assert_eq!(reopened.load_value("dev1", "daily", 1).unwrap(), Some(5.0));
        assert_eq!(reopened.load_value("dev1", "daily", 2).unwrap(), Some(6.0));
    }
}
