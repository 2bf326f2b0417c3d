//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! Every step is additive and safe to re-run: tables use `IF NOT EXISTS`
//! and columns are only added when `PRAGMA table_info` does not list them.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 4;

/// One upgrade step
enum Step {
    /// Batch of `IF NOT EXISTS` statements
    Sql(&'static str),
    /// `ALTER TABLE <table> ADD COLUMN <column> <definition>`
    AddColumn {
        table: &'static str,
        column: &'static str,
        definition: &'static str,
    },
}

/// Upgrade steps, indexed by target version - 1
const STEPS: &[Step] = &[
    // Version 1: pending events and their parameters
    Step::Sql(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            name         TEXT NOT NULL,
            timestamp    INTEGER NOT NULL,
            bundle_id    TEXT NOT NULL,
            app_version  TEXT NOT NULL
        );

        -- No foreign key: the store deletes both sets together
        CREATE TABLE IF NOT EXISTS event_params (
            event_id     INTEGER NOT NULL,
            key          TEXT NOT NULL,
            value        TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_event_params_event ON event_params(event_id, key);
        "#,
    ),
    // Version 2: SDK version snapshot
    Step::AddColumn {
        table: "events",
        column: "sdk_version",
        definition: "TEXT NOT NULL DEFAULT ''",
    },
    // Version 3: raw POST payload
    Step::AddColumn {
        table: "events",
        column: "post_data",
        definition: "TEXT",
    },
    // Version 4: small persisted flags and identity values
    Step::Sql(
        r#"
        CREATE TABLE IF NOT EXISTS preferences (
            key          TEXT PRIMARY KEY,
            value        TEXT NOT NULL
        );
        "#,
    ),
];

/// Apply the steps in `(old_version, new_version]`.
///
/// The recorded version only moves forward.
pub fn migrate(conn: &mut Connection, old_version: i32, new_version: i32) -> crate::error::Result<()> {
    let new_version = new_version.min(SCHEMA_VERSION);
    if new_version <= old_version {
        return Ok(());
    }

    let tx = conn.transaction()?;
    for version in (old_version.max(0) + 1)..=new_version {
        tracing::info!(version, "Running migration");
        match &STEPS[(version - 1) as usize] {
            Step::Sql(sql) => tx.execute_batch(sql)?,
            Step::AddColumn {
                table,
                column,
                definition,
            } => {
                if column_exists(&tx, table, column)? {
                    tracing::debug!(table, column, "Column already present, skipping");
                } else {
                    tx.execute_batch(&format!(
                        "ALTER TABLE {} ADD COLUMN {} {};",
                        table, column, definition
                    ))?;
                }
            }
        }
    }
    let recorded = get_schema_version(&tx)?.max(new_version);
    tx.execute_batch(&format!("PRAGMA user_version = {};", recorded))?;
    tx.commit()?;

    tracing::info!(
        from = old_version,
        to = new_version,
        "Migrations complete"
    );
    Ok(())
}

/// Run all pending migrations
pub fn run_migrations(conn: &mut Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    migrate(conn, current_version, SCHEMA_VERSION)
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names.iter().any(|name| name == column))
}
