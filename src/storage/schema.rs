//! Accounts database schema and migrations.
//!
//! The schema version lives in `PRAGMA user_version` so that every process
//! sharing the file agrees on it without an extra bookkeeping table.

use rusqlite::{Connection, TransactionBehavior};

use crate::error::{AccountsError, Result};

const ACCOUNTS_MIGRATIONS: &[Migration] = &[Migration {
    version: 1,
    sql: include_str!("../../migrations/001_accounts.sql"),
}];

/// Schema version written by the latest migration.
pub const SCHEMA_VERSION: i32 = 1;

/// Run schema migrations for the accounts database.
///
/// Returns the latest schema version applied.
///
/// # Errors
/// Returns an error if reading the schema version or applying any migration
/// fails. Callers sharing the file with other processes install a busy
/// timeout first so that concurrent first-time opens wait for each other.
pub fn run_migrations(conn: &mut Connection) -> Result<i32> {
    let mut current_version = get_schema_version(conn)?;

    for migration in ACCOUNTS_MIGRATIONS {
        if migration.version > current_version {
            apply_migration(conn, migration)?;
            current_version = migration.version;
        }
    }

    Ok(current_version)
}

/// Read `PRAGMA user_version`.
///
/// # Errors
/// Returns an error if the pragma cannot be read.
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| AccountsError::Db(format!("read schema version: {e}")))
}

#[derive(Debug, Clone, Copy)]
struct Migration {
    version: i32,
    sql: &'static str,
}

fn apply_migration(conn: &mut Connection, migration: &Migration) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Exclusive)
        .map_err(|e| AccountsError::Db(format!("begin migration: {e}")))?;

    // Another process may have migrated while we waited for the lock.
    let version: i32 = tx
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .map_err(|e| AccountsError::Db(format!("re-read schema version: {e}")))?;
    if version >= migration.version {
        return Ok(());
    }

    tx.execute_batch(migration.sql).map_err(|e| {
        AccountsError::Db(format!("apply migration {}: {e}", migration.version))
    })?;

    tx.execute_batch(&format!("PRAGMA user_version = {}", migration.version))
        .map_err(|e| {
            AccountsError::Db(format!("record migration {}: {e}", migration.version))
        })?;

    tx.commit().map_err(|e| {
        AccountsError::Db(format!("commit migration {}: {e}", migration.version))
    })?;

    tracing::debug!(version = migration.version, "Applied accounts schema migration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
            .unwrap();
        stmt.query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap()
    }

    #[test]
    fn migrations_create_all_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 0);

        let version = run_migrations(&mut conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
        assert_eq!(get_schema_version(&conn).unwrap(), SCHEMA_VERSION);

        let tables = table_names(&conn);
        for expected in ["Accounts", "Services", "Settings", "Signatures"] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }
    }

    #[test]
    fn migrations_are_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        assert_eq!(run_migrations(&mut conn).unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn deleting_an_account_cascades_to_settings() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute_batch(
            "INSERT INTO Accounts (id, name, provider, enabled) VALUES (1, 'a', 'p', 1);
             INSERT INTO Settings (account, service, key, type, value) VALUES (1, 0, 'k', 's', 'v');
             DELETE FROM Accounts WHERE id = 1;",
        )
        .unwrap();
        let remaining: i64 = conn
            .query_row("SELECT COUNT(*) FROM Settings", [], |row| row.get(0))
            .unwrap();
        assert_eq!(remaining, 0);
    }

    #[test]
    fn settings_are_unique_per_account_service_key() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        conn.execute(
            "INSERT INTO Settings (account, service, key, type, value) \
             VALUES (1, 0, 'k', 's', 'a')",
            [],
        )
        .unwrap();
        let dup = conn.execute(
            "INSERT INTO Settings (account, service, key, type, value) \
             VALUES (1, 0, 'k', 's', 'b')",
            [],
        );
        assert!(dup.is_err());
    }
}
