//! Durable ledger of executed tests and attributed violations.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OpenFlags, params};
use serde::Serialize;

use crate::config::{BuildInfo, StoreLocation};
use crate::error::{LedgerError, Result};
use crate::violator::{TestRecord, ViolationRecord};

/// Table and index definitions, applied to every freshly created store.
pub const SCHEMA: &str = "\
CREATE TABLE IF NOT EXISTS violations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    branch VARCHAR(255),
    revision VARCHAR(255),
    submitstamp INTEGER,
    module VARCHAR(255) NOT NULL,
    class_name VARCHAR(255) NOT NULL,
    method_name VARCHAR(255) NOT NULL,
    syscall VARCHAR(20) NOT NULL,
    syscall_args VARCHAR(255)
);
CREATE INDEX IF NOT EXISTS ix_build ON violations (branch, revision, submitstamp);
CREATE INDEX IF NOT EXISTS ix_individual_test ON violations (module, class_name, method_name);
CREATE INDEX IF NOT EXISTS ix_syscall_signature ON violations (syscall, syscall_args);
CREATE TABLE IF NOT EXISTS tests (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    branch VARCHAR(255),
    revision VARCHAR(255),
    submitstamp INTEGER,
    module VARCHAR(255) NOT NULL,
    class_name VARCHAR(255) NOT NULL,
    method_name VARCHAR(255) NOT NULL
);
";

const INSERT_TEST: &str = "INSERT INTO tests \
    (branch, revision, submitstamp, module, class_name, method_name) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)";

const INSERT_VIOLATION: &str = "INSERT INTO violations \
    (branch, revision, submitstamp, module, class_name, method_name, syscall, syscall_args) \
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)";

const VIOLATION_COUNTS: &str = "SELECT class_name, method_name, syscall, COUNT(syscall) AS count \
    FROM violations \
    GROUP BY class_name, method_name, syscall \
    ORDER BY count DESC, class_name, method_name, syscall";

/// Occurrences of one syscall within one test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationCount {
    pub class_name: String,
    pub method_name: String,
    pub syscall: String,
    pub count: i64,
}

/// Single-connection SQLite store.
///
/// Writes are best effort: `add_test` and `add_violation` log failures and
/// carry on, since a telemetry hiccup must never abort the test run.
#[derive(Debug)]
pub struct ViolationStore {
    conn: Mutex<Connection>,
    build: BuildInfo,
}

impl ViolationStore {
    /// Starts a fresh store at `location`, deleting any previous file there.
    pub fn create(location: &StoreLocation, build: BuildInfo) -> Result<Self> {
        let path = location.path();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = MEMORY;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(
            store = %location,
            branch = %build.branch,
            revision = %build.revision,
            "violation store created"
        );

        Ok(Self {
            conn: Mutex::new(conn),
            build,
        })
    }

    /// Opens a store written by an earlier run, read-only.
    pub fn open_existing(location: &StoreLocation) -> Result<Self> {
        let path = location.path();
        ensure_store_file(path)?;
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            build: BuildInfo::default(),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_test(&self, test: &TestRecord) {
        if let Err(error) = self.try_add_test(test) {
            tracing::error!(
                %error,
                class = %test.class_name,
                method = %test.method_name,
                "exception inserting test info"
            );
        }
    }

    pub fn try_add_test(&self, test: &TestRecord) -> Result<()> {
        self.conn().execute(
            INSERT_TEST,
            params![
                self.build.branch,
                self.build.revision,
                self.build.submitstamp,
                test.module,
                test.class_name,
                test.method_name,
            ],
        )?;
        Ok(())
    }

    pub fn add_violation(&self, record: &ViolationRecord) {
        if let Err(error) = self.try_add_violation(record) {
            tracing::error!(
                %error,
                class = %record.class_name,
                syscall = %record.syscall,
                "exception inserting violation"
            );
        }
    }

    pub fn try_add_violation(&self, record: &ViolationRecord) -> Result<()> {
        self.conn().execute(
            INSERT_VIOLATION,
            params![
                self.build.branch,
                self.build.revision,
                self.build.submitstamp,
                record.module,
                record.class_name,
                record.method_name,
                record.syscall,
                record.syscall_args,
            ],
        )?;
        Ok(())
    }

    /// Violation groups by (class, method, syscall), most frequent first.
    pub fn violation_counts(&self) -> Result<Vec<ViolationCount>> {
        let conn = self.conn();
        let mut statement = conn.prepare(VIOLATION_COUNTS)?;
        let rows = statement.query_map([], |row| {
            Ok(ViolationCount {
                class_name: row.get(0)?,
                method_name: row.get(1)?,
                syscall: row.get(2)?,
                count: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn test_count(&self) -> Result<i64> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM tests", [], |row| row.get(0))?)
    }
}

fn ensure_store_file(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(LedgerError::MissingPath {
            path: path.to_path_buf(),
        })
    }
}
