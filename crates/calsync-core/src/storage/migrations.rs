//! Storage migrations for the persisted sync state.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table is the storage-version marker.

use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};

/// Current schema version.
///
/// Increment this when adding new migrations.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Prefix older builds stored in front of remote identifiers.
const LEGACY_EXTERNAL_ID_PREFIX: &str = "outlook-";

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn);

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Create the schema_version table if it doesn't exist.
fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Get the current schema version from the database.
///
/// Returns 0 if no version is set (initial database).
pub fn get_schema_version(conn: &Connection) -> i32 {
    conn.query_row("SELECT version FROM schema_version", [], |row| {
        row.get::<_, i32>(0)
    })
    .unwrap_or_else(|e| {
        if !matches!(e, rusqlite::Error::QueryReturnedNoRows) {
            tracing::warn!(error = %e, "failed to read schema_version");
        }
        0
    })
}

/// Set the schema version in the database.
fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: baseline. The `kv` table is created by `Database::migrate`.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    set_schema_version(conn, 1)?;
    Ok(())
}

/// Migration v2: normalize legacy event records.
///
/// - strips the `outlook-` prefix older builds put on `externalId`
/// - fills a missing `localVersion`/`syncedVersion` with 0
///
/// An events blob that does not parse is left alone; the event store
/// quarantines it on load.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;

    let raw: Option<String> = tx
        .query_row("SELECT value FROM kv WHERE key = 'events'", [], |row| {
            row.get(0)
        })
        .optional()?;

    if let Some(raw) = raw {
        if let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&raw) {
            let changed = normalize_legacy_events(&mut value);
            if changed > 0 {
                tx.execute(
                    "UPDATE kv SET value = ?1 WHERE key = 'events'",
                    params![value.to_string()],
                )?;
                tracing::info!(events = changed, "normalized legacy event records");
            }
        }
    }

    set_schema_version(&tx, 2)?;
    tx.commit()?;
    Ok(())
}

/// Returns the number of event records that were rewritten.
fn normalize_legacy_events(value: &mut serde_json::Value) -> usize {
    let Some(events) = value.as_array_mut() else {
        return 0;
    };

    let mut changed = 0;
    for event in events.iter_mut() {
        let Some(obj) = event.as_object_mut() else {
            continue;
        };
        let mut touched = false;

        let legacy = obj
            .get("externalId")
            .and_then(|v| v.as_str())
            .and_then(|ext| ext.strip_prefix(LEGACY_EXTERNAL_ID_PREFIX))
            .map(str::to_string);
        if let Some(stripped) = legacy {
            obj.insert("externalId".into(), serde_json::Value::String(stripped));
            touched = true;
        }
        for field in ["localVersion", "syncedVersion"] {
            if !obj.contains_key(field) {
                obj.insert(field.into(), serde_json::Value::from(0u64));
                touched = true;
            }
        }

        if touched {
            changed += 1;
        }
    }
    changed
}
