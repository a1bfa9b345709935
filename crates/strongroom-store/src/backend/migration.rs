//! Schema steps for the SQLite backend.
//!
//! The schema version lives in SQLite's `user_version` pragma: step `n`
//! brings a database from version `n` to `n + 1`. A store written by a newer
//! build is refused rather than opened with a schema we do not know.

use rusqlite::Connection;
use tracing::{debug, info};

use super::{BackendError, BackendErrorCode, BackendResult};

struct Step {
    description: &'static str,
    sql: &'static str,
}

/// In order; append new steps at the end.
const STEPS: &[Step] = &[
    Step {
        description: "config, profiles, items",
        sql: r#"
            CREATE TABLE config (
                name  TEXT PRIMARY KEY,
                value BLOB NOT NULL
            );

            CREATE TABLE profiles (
                id   INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE items (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                profile_id INTEGER NOT NULL REFERENCES profiles(id) ON DELETE CASCADE,
                kind       INTEGER NOT NULL CHECK(kind IN (1, 2)),
                category   TEXT NOT NULL,
                name       TEXT NOT NULL,
                value      BLOB NOT NULL,
                tags       BLOB NOT NULL,
                UNIQUE(profile_id, kind, category, name)
            );
            CREATE INDEX idx_items_scan ON items(profile_id, kind, category);
        "#,
    },
];

fn schema_error(message: String) -> BackendError {
    BackendError::new(BackendErrorCode::Backend, format!("store schema: {message}"))
}

/// Version this build writes.
pub fn latest_version() -> u32 {
    STEPS.len() as u32
}

pub fn schema_version(conn: &Connection) -> BackendResult<u32> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .map_err(|e| schema_error(format!("cannot read version: {e}")))
}

/// Bring `conn` up to [`latest_version`].
pub fn run_all(conn: &Connection) -> BackendResult<()> {
    let found = schema_version(conn)?;
    let latest = latest_version();
    if found > latest {
        return Err(schema_error(format!(
            "version {found} is newer than supported version {latest}"
        )));
    }

    for (index, step) in STEPS.iter().enumerate().skip(found as usize) {
        let target = index as u32 + 1;
        debug!(target, description = step.description, "upgrading store schema");

        // Dropping the transaction on an early return rolls the step back.
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| schema_error(format!("cannot begin step {target}: {e}")))?;
        tx.execute_batch(step.sql)
            .map_err(|e| schema_error(format!("step {target} failed: {e}")))?;
        tx.pragma_update(None, "user_version", target)
            .map_err(|e| schema_error(format!("cannot record step {target}: {e}")))?;
        tx.commit()
            .map_err(|e| schema_error(format!("cannot commit step {target}: {e}")))?;
    }

    if found < latest {
        info!(from = found, to = latest, "store schema upgraded");
    }
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────
