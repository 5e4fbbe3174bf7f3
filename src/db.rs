//! Local SQLite database layer for Stitchpay.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations and the managed
//! connection state shared by the settlement engine and the store modules.

use rusqlite::Connection;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/stitchpay.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = data_dir.join("stitchpay.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)
                .map_err(|e| format!("Database open failed after retry: {e}"))?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, String> {
    let conn = Connection::open(path).map_err(|e| format!("sqlite open: {e}"))?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )
    .map_err(|e| format!("pragma setup: {e}"))?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), String> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("create schema_version: {e}"))?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: Core tables — staff, piece-work entries, advance ledger,
/// settlement receipts.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- staff (workers; id is the authoritative join key, name is display-only)
        CREATE TABLE IF NOT EXISTS staff (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            branch_id TEXT NOT NULL,
            role TEXT DEFAULT 'operator',
            is_active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- work_entries (one row per completed unit of piece-work)
        CREATE TABLE IF NOT EXISTS work_entries (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            operation TEXT,
            pieces INTEGER NOT NULL DEFAULT 0,
            weight REAL NOT NULL DEFAULT 0,
            amount REAL NOT NULL DEFAULT 0 CHECK (amount >= 0),
            paid INTEGER NOT NULL DEFAULT 0,
            paid_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- advance_ledger (money owed back by a worker; consumed oldest-first)
        CREATE TABLE IF NOT EXISTS advance_ledger (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            amount REAL NOT NULL CHECK (amount >= 0),
            outstanding INTEGER NOT NULL DEFAULT 1,
            cleared_at TEXT,
            note TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        -- settlement_receipts (append-only audit trail)
        CREATE TABLE IF NOT EXISTS settlement_receipts (
            id TEXT PRIMARY KEY,
            branch_id TEXT NOT NULL,
            staff_id TEXT NOT NULL,
            staff_name TEXT,
            total_pieces INTEGER NOT NULL DEFAULT 0,
            total_weight REAL NOT NULL DEFAULT 0,
            gross_amount REAL NOT NULL DEFAULT 0,
            advance_deducted REAL NOT NULL DEFAULT 0,
            payable_amount REAL NOT NULL DEFAULT 0,
            payment_method TEXT NOT NULL DEFAULT 'cash',
            entry_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_staff_branch_name ON staff(branch_id, name);
        CREATE INDEX IF NOT EXISTS idx_work_entries_staff ON work_entries(staff_id, branch_id, paid);
        CREATE INDEX IF NOT EXISTS idx_work_entries_created_at ON work_entries(created_at);
        CREATE INDEX IF NOT EXISTS idx_receipts_staff ON settlement_receipts(staff_id, branch_id);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        format!("migration v1: {e}")
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: Ledger row kind tag (plain advance vs. bonus deposit) and
/// the covering index for the FIFO consumption scan.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE advance_ledger ADD COLUMN kind TEXT NOT NULL DEFAULT 'advance'
            CHECK (kind IN ('advance', 'bonus_deposit'));

        CREATE INDEX IF NOT EXISTS idx_ledger_fifo
            ON advance_ledger(staff_id, branch_id, outstanding, created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        format!("migration v2: {e}")
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: Operation tag on receipts (which production stage was
/// settled — cutting, sewing, finishing).
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        ALTER TABLE settlement_receipts ADD COLUMN operation TEXT;

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        format!("migration v3: {e}")
    })?;

    info!("Applied migration v3");
    Ok(())
}

/// Run all migrations on the given connection (test helper, not public API).
#[cfg(test)]
pub fn run_migrations_for_test(conn: &Connection) {
    run_migrations(conn).expect("run_migrations should succeed in test");
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_all_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "advance_ledger",
            "schema_version",
            "settlement_receipts",
            "staff",
            "work_entries",
        ] {
            assert!(tables.iter().any(|t| t == expected), "missing {expected}");
        }

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_ledger_amount_check_rejects_negative() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let result = conn.execute(
            "INSERT INTO advance_ledger (id, branch_id, staff_id, amount, created_at, updated_at)
             VALUES ('adv-1', 'br-1', 'stf-1', -5.0, datetime('now'), datetime('now'))",
            [],
        );
        assert!(result.is_err(), "negative ledger amount must be rejected");
    }

    #[test]
    fn test_ledger_kind_check_rejects_unknown_tag() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let result = conn.execute(
            "INSERT INTO advance_ledger (id, branch_id, staff_id, amount, kind, created_at, updated_at)
             VALUES ('adv-1', 'br-1', 'stf-1', 5.0, 'mystery', datetime('now'), datetime('now'))",
            [],
        );
        assert!(result.is_err(), "unknown ledger kind must be rejected");
    }
}
