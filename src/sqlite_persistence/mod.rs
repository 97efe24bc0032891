mod versioned_schema;

pub use versioned_schema::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub const BASE_DB_VERSION: usize = 310;

/// Opens an existing database or creates a new one with the latest schema.
///
/// Existing databases are validated against the schema matching their
/// `user_version` and migrated forward when older.
pub fn open_versioned<P: AsRef<Path>>(
    db_path: P,
    schemas: &[VersionedSchema],
    label: &str,
) -> Result<Connection> {
    let db_path = db_path.as_ref();
    let conn = if db_path.exists() {
        Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("Failed to open {} database at {:?}", label, db_path))?
    } else {
        let conn = Connection::open(db_path)?;
        schemas
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        info!("Created new {} database at {:?}", label, db_path);
        conn
    };

    conn.execute("PRAGMA foreign_keys = ON;", [])?;

    let db_version = conn
        .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
        .context("Failed to read database version")?
        - BASE_DB_VERSION as i64;

    if db_version < 0 {
        bail!(
            "{} database version {} is too old, does not contain base db version {}",
            label,
            db_version,
            BASE_DB_VERSION
        );
    }
    let version = db_version as usize;

    if version >= schemas.len() {
        bail!(
            "{} database version {} is too new (max supported: {})",
            label,
            version,
            schemas.len() - 1
        );
    }

    schemas
        .get(version)
        .context("Failed to get schema")?
        .validate(&conn)?;

    migrate_if_needed(&conn, schemas, version, label)?;
    Ok(conn)
}

/// Creates a fresh in-memory database with the latest schema.
pub fn open_in_memory(schemas: &[VersionedSchema]) -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schemas
        .last()
        .context("No schemas defined")?
        .create(&conn)?;
    Ok(conn)
}

fn migrate_if_needed(
    conn: &Connection,
    schemas: &[VersionedSchema],
    current_version: usize,
    label: &str,
) -> Result<()> {
    let target_version = schemas.len() - 1;
    if current_version >= target_version {
        return Ok(());
    }

    info!(
        "Migrating {} database from version {} to {}",
        label, current_version, target_version
    );

    for schema in schemas.iter().skip(current_version + 1) {
        if let Some(migration_fn) = schema.migration {
            info!("Running {} migration to version {}", label, schema.version);
            migration_fn(conn)?;
        }
    }

    conn.execute(
        &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
        [],
    )?;
    Ok(())
}
