//! The shared accounts database.
//!
//! Every process using the accounts store opens the same `SQLite` file. Writes
//! are serialized with `BEGIN EXCLUSIVE`; contention is not hidden behind
//! `SQLite`'s own busy handler but surfaced to two explicit protocols:
//!
//! - **Non-blocking**: [`Store::begin_transaction`] returns `None` when the
//!   lock is held elsewhere and the caller re-queues the commit.
//! - **Blocking**: [`Store::begin_transaction_blocking`] sleeps with
//!   exponential backoff until the lock is acquired or the retry budget
//!   runs out.
//!
//! Reads go through [`Store::query`], which retries on contention until the
//! configured database timeout elapses.

use std::cell::Cell;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use rusqlite::{Connection, ErrorCode, Row, ToSql};

use crate::error::{AccountsError, Result};
use crate::storage::schema::run_migrations;

/// File name of the accounts database inside its directory.
pub const DB_FILE_NAME: &str = "accounts.db";

/// Default bound on how long reads wait for a locked database.
pub const DEFAULT_DB_TIMEOUT: Duration = Duration::from_millis(5000);

/// Pause between read attempts while the database is locked.
const QUERY_RETRY_INTERVAL: Duration = Duration::from_millis(10);

// =============================================================================
// Options
// =============================================================================

/// Backoff schedule for blocking commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// First sleep after a busy `BEGIN EXCLUSIVE`.
    pub initial_backoff: Duration,
    /// Upper bound for a single sleep; the delay doubles until it gets here.
    pub max_backoff: Duration,
    /// Total time after which the commit fails with `DbLocked`.
    pub give_up_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            give_up_after: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to use after `current`.
    #[must_use]
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max_backoff)
    }
}

/// Options for opening a [`Store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub db_timeout: Duration,
    pub abort_on_timeout: bool,
    pub commit_retry: RetryPolicy,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            db_timeout: DEFAULT_DB_TIMEOUT,
            abort_on_timeout: false,
            commit_retry: RetryPolicy::default(),
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub const fn with_db_timeout(mut self, timeout: Duration) -> Self {
        self.db_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_abort_on_timeout(mut self, abort: bool) -> Self {
        self.abort_on_timeout = abort;
        self
    }

    #[must_use]
    pub const fn with_commit_retry(mut self, policy: RetryPolicy) -> Self {
        self.commit_retry = policy;
        self
    }
}

// =============================================================================
// Store
// =============================================================================

/// Connection to the accounts database with its locking protocols.
#[derive(Debug)]
pub struct Store {
    conn: Connection,
    path: Option<PathBuf>,
    db_timeout: Cell<Duration>,
    abort_on_timeout: Cell<bool>,
    commit_retry: RetryPolicy,
}

impl Store {
    /// Open (creating if needed) `accounts.db` inside `dir`.
    ///
    /// # Errors
    /// Returns an error if the directory cannot be created or the database
    /// cannot be opened or migrated.
    pub fn open_in_dir(dir: &Path, options: StoreOptions) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Self::open(&dir.join(DB_FILE_NAME), options)
    }

    /// Open (creating if needed) the database at `path`.
    ///
    /// # Errors
    /// Returns an error if the database cannot be opened or migrated.
    pub fn open(path: &Path, options: StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| AccountsError::Db(format!("open {}: {e}", path.display())))?;
        let store = Self::init(conn, Some(path.to_path_buf()), options)?;
        tracing::debug!(path = %path.display(), "Opened accounts database");
        Ok(store)
    }

    /// Open a private in-memory database.
    ///
    /// # Errors
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn, None, StoreOptions::default())
    }

    fn init(mut conn: Connection, path: Option<PathBuf>, options: StoreOptions) -> Result<Self> {
        // Let concurrent first opens wait for each other while the schema
        // is created; afterwards contention is reported, not waited out.
        conn.busy_timeout(options.db_timeout)?;
        run_migrations(&mut conn)?;
        conn.execute_batch("PRAGMA synchronous = 1")?;
        let journal: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        tracing::trace!(journal_mode = %journal, "Configured journal mode");
        conn.busy_timeout(Duration::ZERO)?;

        Ok(Self {
            conn,
            path,
            db_timeout: Cell::new(options.db_timeout),
            abort_on_timeout: Cell::new(options.abort_on_timeout),
            commit_retry: options.commit_retry,
        })
    }

    /// Path of the database file, `None` for in-memory databases.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    #[must_use]
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }

    #[must_use]
    pub fn db_timeout(&self) -> Duration {
        self.db_timeout.get()
    }

    pub fn set_db_timeout(&self, timeout: Duration) {
        self.db_timeout.set(timeout);
    }

    #[must_use]
    pub fn abort_on_db_timeout(&self) -> bool {
        self.abort_on_timeout.get()
    }

    pub fn set_abort_on_db_timeout(&self, abort: bool) {
        self.abort_on_timeout.set(abort);
    }

    #[must_use]
    pub const fn commit_retry(&self) -> RetryPolicy {
        self.commit_retry
    }

    // ===== Write path =====

    /// Try to take the exclusive write lock.
    ///
    /// Returns `Ok(None)` when another connection holds the lock.
    ///
    /// # Errors
    /// Returns an error for failures other than lock contention.
    pub fn begin_transaction(&self) -> Result<Option<ExclusiveTransaction<'_>>> {
        let begin = self
            .conn
            .prepare_cached("BEGIN EXCLUSIVE")
            .and_then(|mut stmt| stmt.execute([]));
        match begin {
            Ok(_) => {
                tracing::trace!("Acquired exclusive lock");
                Ok(Some(ExclusiveTransaction {
                    store: self,
                    finished: false,
                }))
            }
            Err(e) if is_busy(&e) => {
                tracing::debug!("Database busy, exclusive lock not acquired");
                Ok(None)
            }
            Err(e) => Err(AccountsError::Db(format!("begin transaction: {e}"))),
        }
    }

    /// Take the exclusive write lock, sleeping with exponential backoff while
    /// it is held elsewhere.
    ///
    /// # Errors
    /// Returns `DbLocked` once the retry budget is exhausted.
    pub fn begin_transaction_blocking(&self) -> Result<ExclusiveTransaction<'_>> {
        let policy = self.commit_retry;
        let started = Instant::now();
        let mut delay = policy.initial_backoff;

        loop {
            if let Some(tx) = self.begin_transaction()? {
                return Ok(tx);
            }
            if started.elapsed() + delay > policy.give_up_after {
                tracing::warn!(
                    waited_ms = duration_ms(started.elapsed()),
                    "Giving up on exclusive lock"
                );
                return Err(AccountsError::DbLocked {
                    waited_ms: duration_ms(started.elapsed()),
                });
            }
            tracing::debug!(delay_ms = duration_ms(delay), "Waiting for exclusive lock");
            thread::sleep(delay);
            delay = policy.next_delay(delay);
        }
    }

    fn commit(&self) -> Result<()> {
        self.conn
            .prepare_cached("COMMIT")
            .and_then(|mut stmt| stmt.execute([]))
            .map(|_| ())
            .map_err(|e| AccountsError::Db(format!("commit: {e}")))
    }

    fn rollback(&self) {
        if let Err(e) = self
            .conn
            .prepare_cached("ROLLBACK")
            .and_then(|mut stmt| stmt.execute([]))
        {
            tracing::warn!(error = %e, "Rollback failed");
        }
    }

    // ===== Read path =====

    /// Run a query, mapping every row with `map_row`.
    ///
    /// Lock contention is retried until the database timeout elapses.
    ///
    /// # Errors
    /// Returns `DbLocked` on timeout (or aborts the process when configured
    /// to), or the statement's error.
    pub fn query<T, F>(&self, sql: &str, params: &[&dyn ToSql], mut map_row: F) -> Result<Vec<T>>
    where
        F: FnMut(&Row<'_>) -> rusqlite::Result<T>,
    {
        let started = Instant::now();
        loop {
            let attempt = self.conn.prepare_cached(sql).and_then(|mut stmt| {
                let rows = stmt
                    .query_map(params, &mut map_row)?
                    .collect::<rusqlite::Result<Vec<T>>>();
                rows
            });
            match attempt {
                Ok(rows) => {
                    tracing::trace!(sql, rows = rows.len(), "Query finished");
                    return Ok(rows);
                }
                Err(e) if is_busy(&e) => self.wait_for_lock(started)?,
                Err(e) => return Err(AccountsError::Db(format!("query failed: {e}"))),
            }
        }
    }

    /// Run a single write statement outside an exclusive transaction.
    ///
    /// # Errors
    /// Same as [`Store::query`].
    pub fn execute(&self, sql: &str, params: &[&dyn ToSql]) -> Result<usize> {
        let started = Instant::now();
        loop {
            match self
                .conn
                .prepare_cached(sql)
                .and_then(|mut stmt| stmt.execute(params))
            {
                Ok(changed) => return Ok(changed),
                Err(e) if is_busy(&e) => self.wait_for_lock(started)?,
                Err(e) => return Err(AccountsError::Db(format!("statement failed: {e}"))),
            }
        }
    }

    fn wait_for_lock(&self, started: Instant) -> Result<()> {
        let waited = started.elapsed();
        if waited >= self.db_timeout.get() {
            if self.abort_on_timeout.get() {
                tracing::error!(
                    waited_ms = duration_ms(waited),
                    "Accounts database locked past its timeout, aborting"
                );
                eprintln!("accounts database locked for {} ms, aborting", duration_ms(waited));
                std::process::abort();
            }
            return Err(AccountsError::DbLocked {
                waited_ms: duration_ms(waited),
            });
        }
        thread::sleep(QUERY_RETRY_INTERVAL);
        Ok(())
    }

    // ===== Maintenance =====

    /// Copy the database into a standalone file at `dest`.
    ///
    /// The write-ahead log is checkpointed first so the copy is complete.
    ///
    /// # Errors
    /// Returns an error if `dest` exists or the copy fails.
    pub fn backup_to(&self, dest: &Path) -> Result<()> {
        if dest.exists() {
            return Err(AccountsError::Db(format!(
                "backup target {} already exists",
                dest.display()
            )));
        }
        self.conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|e| AccountsError::Db(format!("checkpoint: {e}")))?;
        let target = dest.to_string_lossy().into_owned();
        self.execute("VACUUM INTO ?1", &[&target])?;
        tracing::info!(dest = %dest.display(), "Backed up accounts database");
        Ok(())
    }
}

// =============================================================================
// Exclusive transaction
// =============================================================================

/// A held `BEGIN EXCLUSIVE` lock.
///
/// Dropping it without calling [`ExclusiveTransaction::execute`] rolls back.
#[derive(Debug)]
pub struct ExclusiveTransaction<'a> {
    store: &'a Store,
    finished: bool,
}

impl ExclusiveTransaction<'_> {
    /// Run `f` and commit, or roll back if it fails.
    ///
    /// # Errors
    /// Returns the error of `f`, or the commit error.
    pub fn execute<T>(mut self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.finished = true;
        match f(&self.store.conn) {
            Ok(value) => {
                if let Err(e) = self.store.commit() {
                    self.store.rollback();
                    return Err(e);
                }
                tracing::trace!("Transaction committed");
                Ok(value)
            }
            Err(e) => {
                tracing::debug!(error = %e, "Transaction failed, rolling back");
                self.store.rollback();
                Err(e)
            }
        }
    }
}

impl Drop for ExclusiveTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.rollback();
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::params;

    fn fast_options() -> StoreOptions {
        StoreOptions::default()
            .with_db_timeout(Duration::from_millis(100))
            .with_commit_retry(RetryPolicy {
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(20),
                give_up_after: Duration::from_millis(80),
            })
    }

    fn lock_holder(path: &Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("BEGIN EXCLUSIVE").unwrap();
        conn
    }

    #[test]
    fn execute_commits_on_success() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.begin_transaction().unwrap().unwrap();
        tx.execute(|conn| {
            conn.execute("INSERT INTO Accounts (name) VALUES ('a')", [])?;
            Ok(())
        })
        .unwrap();

        let names = store
            .query("SELECT name FROM Accounts", &[], |row| row.get::<_, String>(0))
            .unwrap();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[test]
    fn execute_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let tx = store.begin_transaction().unwrap().unwrap();
        let result: Result<()> = tx.execute(|conn| {
            conn.execute("INSERT INTO Accounts (name) VALUES ('a')", [])?;
            conn.execute("INSERT INTO NoSuchTable VALUES (1)", [])?;
            Ok(())
        });
        assert!(matches!(result, Err(AccountsError::Db(_))));

        let count = store
            .query("SELECT COUNT(*) FROM Accounts", &[], |row| row.get::<_, i64>(0))
            .unwrap();
        assert_eq!(count, vec![0]);
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = Store::open_in_memory().unwrap();
        {
            let tx = store.begin_transaction().unwrap().unwrap();
            drop(tx);
        }
        // A second BEGIN would fail if the first were still open.
        assert!(store.begin_transaction().unwrap().is_some());
    }

    #[test]
    fn busy_database_reports_none_then_locked() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path(), fast_options()).unwrap();
        let holder = lock_holder(&dir.path().join(DB_FILE_NAME));

        assert!(store.begin_transaction().unwrap().is_none());
        let err = store.begin_transaction_blocking().unwrap_err();
        assert!(matches!(err, AccountsError::DbLocked { .. }));
        assert!(err.is_retryable());

        holder.execute_batch("ROLLBACK").unwrap();
        assert!(store.begin_transaction().unwrap().is_some());
    }

    #[test]
    fn blocking_begin_waits_for_release() {
        let dir = tempfile::tempdir().unwrap();
        let options = fast_options().with_commit_retry(RetryPolicy {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            give_up_after: Duration::from_secs(10),
        });
        let store = Store::open_in_dir(dir.path(), options).unwrap();
        let path = dir.path().join(DB_FILE_NAME);
        let holder = lock_holder(&path);

        let release = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            holder.execute_batch("COMMIT").unwrap();
        });

        let tx = store.begin_transaction_blocking().unwrap();
        tx.execute(|conn| {
            conn.execute(
                "INSERT INTO Accounts (name, provider, enabled) VALUES (?1, ?2, ?3)",
                params!["late", "p", true],
            )?;
            Ok(())
        })
        .unwrap();
        release.join().unwrap();
    }

    #[test]
    fn timeout_accessors_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.db_timeout(), DEFAULT_DB_TIMEOUT);
        store.set_db_timeout(Duration::from_millis(250));
        store.set_abort_on_db_timeout(true);
        assert_eq!(store.db_timeout(), Duration::from_millis(250));
        assert!(store.abort_on_db_timeout());
    }

    #[test]
    fn backup_copies_accounts() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open_in_dir(dir.path(), StoreOptions::default()).unwrap();
        store
            .execute("INSERT INTO Accounts (name) VALUES (?1)", &[&"kept"])
            .unwrap();

        let dest = dir.path().join("backup.db");
        store.backup_to(&dest).unwrap();
        assert!(store.backup_to(&dest).is_err());

        let copy = Connection::open(&dest).unwrap();
        let name: String = copy
            .query_row("SELECT name FROM Accounts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "kept");
    }
}
