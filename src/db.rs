//! Local SQLite database layer for Courtside POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, the settings
//! store, and the shared connection state the engine operations run against.
//! All monetary columns are INTEGER minor units, never REAL.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{EngineError, EngineResult};

/// Shared state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the shared connection, mapping a poisoned mutex to a typed error.
    pub(crate) fn lock(&self) -> EngineResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Internal("database lock poisoned".to_string()))
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `{data_dir}/courtside.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> EngineResult<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| EngineError::Internal(format!("create data dir: {e}")))?;

    let db_path = data_dir.join("courtside.db");
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
            open_and_configure(&db_path)?
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
fn open_and_configure(path: &Path) -> EngineResult<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> EngineResult<()> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

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
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: settings store and the checkout aggregate tables.
fn migrate_v1(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- checkouts (billing documents)
        CREATE TABLE IF NOT EXISTS checkouts (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL DEFAULT 'open'
                CHECK (status IN ('open', 'partial', 'completed', 'cancelled')),
            source_reservation_id TEXT,
            total_amount INTEGER NOT NULL DEFAULT 0,
            created_by TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- payer_accounts (sub-bills within a checkout)
        CREATE TABLE IF NOT EXISTS payer_accounts (
            id TEXT PRIMARY KEY,
            checkout_id TEXT NOT NULL REFERENCES checkouts(id) ON DELETE CASCADE,
            name TEXT NOT NULL,
            players TEXT NOT NULL DEFAULT '[]',
            split_rule TEXT NOT NULL DEFAULT '{\"type\":\"by_item\"}',
            position INTEGER NOT NULL DEFAULT 0,
            total_amount INTEGER NOT NULL DEFAULT 0,
            paid_amount INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'unpaid'
                CHECK (status IN ('unpaid', 'partial', 'paid')),
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- line_items
        CREATE TABLE IF NOT EXISTS line_items (
            id TEXT PRIMARY KEY,
            checkout_id TEXT NOT NULL REFERENCES checkouts(id) ON DELETE CASCADE,
            kind TEXT NOT NULL
                CHECK (kind IN ('court', 'merchandise', 'equipment', 'surcharge', 'discount')),
            name TEXT NOT NULL,
            quantity INTEGER NOT NULL DEFAULT 1,
            unit_price INTEGER NOT NULL DEFAULT 0,
            discount INTEGER NOT NULL DEFAULT 0,
            total_price INTEGER NOT NULL DEFAULT 0,
            account_id TEXT REFERENCES payer_accounts(id) ON DELETE SET NULL,
            player_ids TEXT NOT NULL DEFAULT '[]',
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Indexes
        CREATE INDEX IF NOT EXISTS idx_checkouts_status ON checkouts(status);
        CREATE INDEX IF NOT EXISTS idx_accounts_checkout ON payer_accounts(checkout_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_checkout ON line_items(checkout_id);
        CREATE INDEX IF NOT EXISTS idx_line_items_account ON line_items(account_id);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        EngineError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: shifts and the cash ledger.
///
/// The partial unique index enforces "at most one open shift" at the
/// database level; the open/close operations rely on it even under
/// concurrent writers.
fn migrate_v2(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        -- shifts (cash drawer working periods)
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            staff_id TEXT NOT NULL,
            opening_balance INTEGER NOT NULL DEFAULT 0,
            closing_balance INTEGER,
            expected_closing INTEGER,
            variance INTEGER,
            status TEXT NOT NULL DEFAULT 'open'
                CHECK (status IN ('open', 'closed')),
            notes TEXT,
            opened_at TEXT DEFAULT (datetime('now')),
            closed_at TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_single_open
            ON shifts(status) WHERE status = 'open';
        CREATE INDEX IF NOT EXISTS idx_shifts_opened_at ON shifts(opened_at);

        -- ledger_entries (append-only; no update/delete path exists in code)
        CREATE TABLE IF NOT EXISTS ledger_entries (
            id TEXT PRIMARY KEY,
            shift_id TEXT NOT NULL REFERENCES shifts(id),
            entry_type TEXT NOT NULL
                CHECK (entry_type IN ('cash_in', 'cash_out', 'sale_cash', 'refund_cash', 'qr_in', 'shift_payout')),
            amount INTEGER NOT NULL CHECK (amount > 0),
            description TEXT NOT NULL,
            reference_type TEXT,
            reference_id TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_ledger_shift ON ledger_entries(shift_id);
        CREATE INDEX IF NOT EXISTS idx_ledger_type ON ledger_entries(entry_type);
        CREATE INDEX IF NOT EXISTS idx_ledger_created_at ON ledger_entries(created_at);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        EngineError::from(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

/// Migration v3: payments.
fn migrate_v3(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS payments (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES payer_accounts(id),
            method TEXT NOT NULL CHECK (method IN ('cash', 'payment_request')),
            amount INTEGER NOT NULL CHECK (amount > 0),
            cash_received INTEGER,
            cash_change INTEGER,
            request_reference TEXT,
            confirmed_at TEXT,
            ledger_entry_id TEXT,
            staff_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_payments_account ON payments(account_id);
        CREATE INDEX IF NOT EXISTS idx_payments_confirmed_at ON payments(confirmed_at);

        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        EngineError::from(e)
    })?;

    info!("Applied migration v3");
    Ok(())
}

/// Migration v4: refund audit columns on payments, ledger reference index.
fn migrate_v4(conn: &Connection) -> EngineResult<()> {
    conn.execute_batch(
        "
        ALTER TABLE payments ADD COLUMN refunded_at TEXT;
        ALTER TABLE payments ADD COLUMN refund_reason TEXT;
        ALTER TABLE payments ADD COLUMN refund_staff_id TEXT;

        CREATE INDEX IF NOT EXISTS idx_ledger_reference ON ledger_entries(reference_id);

        INSERT INTO schema_version (version) VALUES (4);
        ",
    )
    .map_err(|e| {
        error!("Migration v4 failed: {e}");
        EngineError::from(e)
    })?;

    info!("Applied migration v4");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> EngineResult<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
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
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "checkouts",
            "ledger_entries",
            "line_items",
            "local_settings",
            "payer_accounts",
            "payments",
            "schema_version",
            "shifts",
        ] {
            assert!(
                tables.iter().any(|t| t == expected),
                "missing table {expected}, got {tables:?}"
            );
        }

        let version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_version",
                [],
                |row| row.get(0),
            )
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should be a no-op");

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .expect("count versions");
        assert_eq!(count, CURRENT_SCHEMA_VERSION as i64);
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .expect("read pragma");
        assert_eq!(fk, 1);
    }

    #[test]
    fn test_single_open_shift_unique_index() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shifts (id, staff_id, opening_balance, status) VALUES ('s1', 'anna', 5000, 'open')",
            [],
        )
        .expect("first open shift inserts");

        let second = conn.execute(
            "INSERT INTO shifts (id, staff_id, opening_balance, status) VALUES ('s2', 'ben', 4000, 'open')",
            [],
        );
        assert!(second.is_err(), "second open shift must violate the unique index");

        // A closed shift alongside the open one is fine
        conn.execute(
            "INSERT INTO shifts (id, staff_id, opening_balance, status, closed_at) VALUES ('s3', 'ben', 4000, 'closed', datetime('now'))",
            [],
        )
        .expect("closed shifts are not constrained");
    }

    #[test]
    fn test_checkout_cascade_deletes_items_and_accounts() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute("INSERT INTO checkouts (id) VALUES ('c1')", [])
            .expect("insert checkout");
        conn.execute(
            "INSERT INTO payer_accounts (id, checkout_id, name, position) VALUES ('a1', 'c1', 'Court A', 0)",
            [],
        )
        .expect("insert account");
        conn.execute(
            "INSERT INTO line_items (id, checkout_id, kind, name, quantity, unit_price, total_price, account_id)
             VALUES ('i1', 'c1', 'court', 'Court 1, 60 min', 1, 50000, 50000, 'a1')",
            [],
        )
        .expect("insert item");

        conn.execute("DELETE FROM checkouts WHERE id = 'c1'", [])
            .expect("delete checkout");

        let items: i64 = conn
            .query_row("SELECT COUNT(*) FROM line_items", [], |row| row.get(0))
            .expect("count items");
        let accounts: i64 = conn
            .query_row("SELECT COUNT(*) FROM payer_accounts", [], |row| row.get(0))
            .expect("count accounts");
        assert_eq!(items, 0);
        assert_eq!(accounts, 0);
    }

    #[test]
    fn test_ledger_amount_check_rejects_non_positive() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO shifts (id, staff_id, opening_balance, status) VALUES ('s1', 'anna', 0, 'open')",
            [],
        )
        .expect("insert shift");

        let bad = conn.execute(
            "INSERT INTO ledger_entries (id, shift_id, entry_type, amount, description)
             VALUES ('l1', 's1', 'cash_in', 0, 'nothing')",
            [],
        );
        assert!(bad.is_err(), "zero-amount ledger entries must be rejected");
    }

    #[test]
    fn test_migration_v4_refund_columns() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let cols: Vec<String> = {
            let mut stmt = conn
                .prepare("PRAGMA table_info(payments)")
                .expect("table_info");
            stmt.query_map([], |row| row.get::<_, String>(1))
                .expect("query columns")
                .filter_map(|r| r.ok())
                .collect()
        };
        assert!(cols.iter().any(|c| c == "refunded_at"), "got {cols:?}");
        assert!(cols.iter().any(|c| c == "refund_reason"));
        assert!(cols.iter().any(|c| c == "refund_staff_id"));
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert_eq!(get_setting(&conn, "checkout", "include_court_price"), None);

        set_setting(&conn, "checkout", "include_court_price", "false").expect("set");
        assert_eq!(
            get_setting(&conn, "checkout", "include_court_price").as_deref(),
            Some("false")
        );

        // Upsert overwrites
        set_setting(&conn, "checkout", "include_court_price", "true").expect("upsert");
        assert_eq!(
            get_setting(&conn, "checkout", "include_court_price").as_deref(),
            Some("true")
        );

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM local_settings WHERE setting_category = 'checkout'",
                [],
                |row| row.get(0),
            )
            .expect("count");
        assert_eq!(count, 1);
    }
}
