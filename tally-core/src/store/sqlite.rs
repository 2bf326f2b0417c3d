//! SQLite-backed event store

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use super::schema;
use super::EventStore;
use crate::context::ClientContext;
use crate::error::Result;
use crate::event::{EventRecord, Params};

/// Summary of a stored event, readable without a [`ClientContext`]
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub name: String,
    pub timestamp: i64,
    pub params: Params,
    pub has_post_data: bool,
}

/// Database handle (single connection)
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // FULL sync: a stored event must survive power loss
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Bring the schema up to [`schema::SCHEMA_VERSION`]
    pub fn run_migrations(&self) -> Result<()> {
        let mut conn = self.conn();
        schema::run_migrations(&mut conn)
    }

    /// Current on-disk schema version
    pub fn schema_version(&self) -> Result<i32> {
        let conn = self.conn();
        schema::get_schema_version(&conn)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        // A panic mid-statement leaves SQLite itself consistent
        self.conn
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Preferences
    // ============================================

    /// Read a persisted preference
    pub fn get_preference(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM preferences WHERE key = ?1",
                [key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Insert or replace a persisted preference
    pub fn set_preference(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            r#"
            INSERT INTO preferences (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Read a boolean flag stored as a preference
    pub fn get_flag(&self, key: &str) -> Result<bool> {
        Ok(self.get_preference(key)?.as_deref() == Some("true"))
    }

    /// Set a boolean flag stored as a preference
    pub fn set_flag(&self, key: &str) -> Result<()> {
        self.set_preference(key, "true")
    }

    /// Set a flag, returning `true` only for the caller that changed it.
    pub fn claim_flag(&self, key: &str) -> Result<bool> {
        let conn = self.conn();
        let changed = conn.execute(
            r#"
            INSERT INTO preferences (key, value) VALUES (?1, 'true')
            ON CONFLICT(key) DO UPDATE SET value = 'true' WHERE value <> 'true'
            "#,
            [key],
        )?;
        Ok(changed == 1)
    }

    // ============================================
    // Diagnostics
    // ============================================

    /// List stored events without rebuilding their checksums
    pub fn list_pending(&self, limit: usize) -> Result<Vec<StoredEvent>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, name, timestamp, post_data IS NOT NULL FROM events ORDER BY id ASC LIMIT ?1",
        )?;

        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(StoredEvent {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    timestamp: row.get(2)?,
                    params: Params::new(),
                    has_post_data: row.get(3)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|mut event| {
                event.params = load_params(&conn, event.id)?;
                Ok(event)
            })
            .collect()
    }
}

impl EventStore for SqliteStore {
    fn append(&self, record: &EventRecord) -> Result<i64> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        tx.execute(
            r#"
            INSERT INTO events (name, timestamp, bundle_id, app_version, sdk_version, post_data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.name(),
                record.timestamp(),
                record.bundle_id(),
                record.app_version(),
                record.sdk_version(),
                record.post_data(),
            ],
        )?;
        let id = tx.last_insert_rowid();

        {
            let mut stmt =
                tx.prepare("INSERT INTO event_params (event_id, key, value) VALUES (?1, ?2, ?3)")?;
            for (key, value) in record.params() {
                stmt.execute(params![id, key, value])?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    fn remove(&self, id: i64) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM events WHERE id = ?1", [id])?;
        tx.execute("DELETE FROM event_params WHERE event_id = ?1", [id])?;
        tx.commit()?;
        Ok(())
    }

    fn load_all(&self, ctx: &ClientContext) -> Result<Vec<EventRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, name, timestamp, bundle_id, app_version, sdk_version, post_data
            FROM events ORDER BY id ASC
            "#,
        )?;

        type Row = (i64, String, i64, String, String, String, Option<String>);
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<std::result::Result<Vec<Row>, _>>()?;

        let mut events = Vec::with_capacity(rows.len());
        for (id, name, timestamp, bundle_id, app_version, sdk_version, post_data) in rows {
            let params = load_params(&conn, id)?;
            match EventRecord::restore(
                id,
                name,
                params,
                post_data,
                timestamp,
                bundle_id,
                app_version,
                sdk_version,
                ctx,
            ) {
                Ok(event) => events.push(event),
                Err(e) => tracing::warn!(id, error = %e, "Skipping unreadable stored event"),
            }
        }

        Ok(events)
    }

    fn migrate(&self, old_version: i32, new_version: i32) -> Result<()> {
        let mut conn = self.conn();
        schema::migrate(&mut conn, old_version, new_version)
    }

    fn pending_count(&self) -> Result<usize> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(count as usize)
    }
}

fn load_params(conn: &Connection, event_id: i64) -> Result<Params> {
    let mut stmt = conn.prepare("SELECT key, value FROM event_params WHERE event_id = ?1")?;
    let params = stmt
        .query_map([event_id], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<std::result::Result<Params, _>>()?;
    Ok(params)
}
