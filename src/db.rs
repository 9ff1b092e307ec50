//! Local SQLite database layer for Bloom POS.
//!
//! Uses rusqlite with WAL mode. Provides schema migrations, settings
//! helpers, and managed state for use across Tauri commands. All monetary
//! columns are INTEGER cents; no floating-point amount is ever persisted.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// Tauri managed state holding the database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 4;

/// Initialize the database at `{app_data_dir}/bloom-pos.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(app_data_dir: &Path) -> Result<DbState, String> {
    fs::create_dir_all(app_data_dir).map_err(|e| format!("Failed to create data dir: {e}"))?;

    let db_path = app_data_dir.join("bloom-pos.db");
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
    if current < 4 {
        migrate_v4(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, customers, employees, orders.
fn migrate_v1(conn: &Connection) -> Result<(), String> {
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

        -- customers
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT PRIMARY KEY,
            first_name TEXT NOT NULL DEFAULT '',
            last_name TEXT NOT NULL DEFAULT '',
            email TEXT,
            phone TEXT,
            is_guest INTEGER NOT NULL DEFAULT 0,
            is_house_account INTEGER NOT NULL DEFAULT 0,
            house_account_terms TEXT DEFAULT 'NET_30',
            house_account_notes TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- employees (referenced by created_by / employee_id columns)
        CREATE TABLE IF NOT EXISTS employees (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            role TEXT NOT NULL DEFAULT 'staff',
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT DEFAULT (datetime('now'))
        );

        -- name counters for human-readable sequential numbers (PT-, RF-, orders)
        CREATE TABLE IF NOT EXISTS counters (
            prefix TEXT PRIMARY KEY,
            current_value INTEGER NOT NULL DEFAULT 0
        );

        -- orders
        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            order_number INTEGER,
            customer_id TEXT REFERENCES customers(id) ON DELETE SET NULL,
            status TEXT NOT NULL DEFAULT 'DRAFT'
                CHECK (status IN ('DRAFT', 'PAID', 'IN_DESIGN', 'READY', 'OUT_FOR_DELIVERY',
                                  'COMPLETED', 'CANCELLED', 'REFUNDED')),
            payment_status TEXT NOT NULL DEFAULT 'UNPAID'
                CHECK (payment_status IN ('UNPAID', 'PARTIALLY_PAID', 'PAID',
                                          'PARTIALLY_REFUNDED', 'REFUNDED')),
            order_type TEXT NOT NULL DEFAULT 'PICKUP'
                CHECK (order_type IN ('PICKUP', 'DELIVERY', 'GIFT_CARD')),
            delivery_fee_cents INTEGER NOT NULL DEFAULT 0,
            tax_cents INTEGER NOT NULL DEFAULT 0,
            discount_cents INTEGER NOT NULL DEFAULT 0,
            payment_amount_cents INTEGER NOT NULL DEFAULT 0,
            notes TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- order_items
        CREATE TABLE IF NOT EXISTS order_items (
            id TEXT PRIMARY KEY,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            description TEXT NOT NULL,
            unit_price_cents INTEGER NOT NULL DEFAULT 0,
            quantity INTEGER NOT NULL DEFAULT 1,
            row_total_cents INTEGER NOT NULL DEFAULT 0,
            taxable INTEGER NOT NULL DEFAULT 1,
            product_id TEXT,
            category_id TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_orders_customer ON orders(customer_id);
        CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);
        CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);
        ",
    )
    .map_err(|e| format!("migration v1: {e}"))?;

    record_migration(conn, 1)
}

/// Migration v2: payment transactions, legs, order links, refunds.
fn migrate_v2(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS payment_transactions (
            id TEXT PRIMARY KEY,
            transaction_number TEXT UNIQUE NOT NULL,
            channel TEXT NOT NULL DEFAULT 'POS'
                CHECK (channel IN ('POS', 'PHONE', 'WEBSITE')),
            total_amount_cents INTEGER NOT NULL,
            tax_amount_cents INTEGER NOT NULL DEFAULT 0,
            tip_amount_cents INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'COMPLETED'
                CHECK (status IN ('COMPLETED', 'PARTIALLY_REFUNDED', 'REFUNDED')),
            customer_id TEXT REFERENCES customers(id) ON DELETE SET NULL,
            employee_id TEXT,
            notes TEXT,
            receipt_email TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS payment_methods (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL REFERENCES payment_transactions(id) ON DELETE CASCADE,
            method TEXT NOT NULL
                CHECK (method IN ('CASH', 'CARD', 'CHECK', 'COD', 'HOUSE_ACCOUNT',
                                  'GIFT_CARD', 'STORE_CREDIT', 'OFFLINE', 'EXTERNAL')),
            provider TEXT NOT NULL DEFAULT 'INTERNAL'
                CHECK (provider IN ('STRIPE', 'SQUARE', 'INTERNAL')),
            amount_cents INTEGER NOT NULL,
            provider_transaction_id TEXT,
            card_last4 TEXT,
            card_brand TEXT,
            card_fingerprint TEXT,
            gift_card_number TEXT,
            check_number TEXT,
            cash_received_cents INTEGER,
            change_given_cents INTEGER,
            reference TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS order_payments (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL REFERENCES payment_transactions(id) ON DELETE CASCADE,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            amount_cents INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS refunds (
            id TEXT PRIMARY KEY,
            transaction_id TEXT NOT NULL REFERENCES payment_transactions(id) ON DELETE CASCADE,
            refund_number TEXT UNIQUE NOT NULL,
            amount_cents INTEGER NOT NULL,
            refund_type TEXT NOT NULL CHECK (refund_type IN ('FULL', 'PARTIAL')),
            reason TEXT NOT NULL,
            employee_id TEXT,
            item_breakdown TEXT NOT NULL DEFAULT '[]',
            tax_refunded_cents INTEGER NOT NULL DEFAULT 0,
            delivery_fee_refunded_cents INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS refund_methods (
            id TEXT PRIMARY KEY,
            refund_id TEXT NOT NULL REFERENCES refunds(id) ON DELETE CASCADE,
            method TEXT NOT NULL
                CHECK (method IN ('CASH', 'CARD', 'CHECK', 'COD', 'HOUSE_ACCOUNT',
                                  'GIFT_CARD', 'STORE_CREDIT', 'OFFLINE', 'EXTERNAL')),
            provider TEXT NOT NULL DEFAULT 'INTERNAL'
                CHECK (provider IN ('STRIPE', 'SQUARE', 'INTERNAL')),
            amount_cents INTEGER NOT NULL,
            provider_refund_id TEXT,
            status TEXT NOT NULL DEFAULT 'completed'
        );

        CREATE TABLE IF NOT EXISTS order_refunds (
            id TEXT PRIMARY KEY,
            refund_id TEXT NOT NULL REFERENCES refunds(id) ON DELETE CASCADE,
            order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
            amount_cents INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_payment_methods_tx ON payment_methods(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_order_payments_tx ON order_payments(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_order_payments_order ON order_payments(order_id);
        CREATE INDEX IF NOT EXISTS idx_refunds_tx ON refunds(transaction_id);
        CREATE INDEX IF NOT EXISTS idx_order_refunds_order ON order_refunds(order_id);
        ",
    )
    .map_err(|e| format!("migration v2: {e}"))?;

    record_migration(conn, 2)
}

/// Migration v3: house account ledger, gift cards, discounts.
fn migrate_v3(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- Append-only ledger. Entries are never updated or deleted in place;
        -- corrections are new entries. Ordered by (created_at, id).
        CREATE TABLE IF NOT EXISTS house_account_ledger (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
            entry_type TEXT NOT NULL
                CHECK (entry_type IN ('CHARGE', 'PAYMENT', 'ADJUSTMENT')),
            amount_cents INTEGER NOT NULL,
            balance_cents INTEGER NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            reference TEXT,
            order_id TEXT REFERENCES orders(id) ON DELETE SET NULL,
            created_by TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS gift_cards (
            id TEXT PRIMARY KEY,
            card_number TEXT UNIQUE NOT NULL,
            card_type TEXT NOT NULL DEFAULT 'PHYSICAL'
                CHECK (card_type IN ('PHYSICAL', 'DIGITAL')),
            status TEXT NOT NULL DEFAULT 'INACTIVE'
                CHECK (status IN ('INACTIVE', 'ACTIVE', 'DEPLETED')),
            initial_value_cents INTEGER NOT NULL DEFAULT 0,
            balance_cents INTEGER NOT NULL DEFAULT 0,
            purchased_by TEXT,
            recipient_name TEXT,
            recipient_email TEXT,
            message TEXT,
            purchase_transaction_id TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS gift_card_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            card_id TEXT NOT NULL REFERENCES gift_cards(id) ON DELETE CASCADE,
            entry_type TEXT NOT NULL
                CHECK (entry_type IN ('ACTIVATION', 'REDEMPTION', 'ADJUSTMENT')),
            amount_cents INTEGER NOT NULL,
            balance_cents INTEGER NOT NULL,
            transaction_id TEXT,
            employee_id TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS discounts (
            id TEXT PRIMARY KEY,
            code TEXT UNIQUE,
            name TEXT NOT NULL,
            description TEXT,
            discount_type TEXT NOT NULL
                CHECK (discount_type IN ('FIXED_AMOUNT', 'PERCENTAGE', 'FREE_SHIPPING',
                                         'SALE_PRICE', 'BUY_X_GET_Y_FREE')),
            trigger_type TEXT NOT NULL
                CHECK (trigger_type IN ('COUPON_CODE', 'AUTOMATIC_PRODUCT', 'AUTOMATIC_CATEGORY')),
            value INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            minimum_order_cents INTEGER,
            usage_limit INTEGER,
            usage_count INTEGER NOT NULL DEFAULT 0,
            per_customer_limit INTEGER,
            start_date TEXT,
            end_date TEXT,
            stackable INTEGER NOT NULL DEFAULT 1,
            priority INTEGER NOT NULL DEFAULT 0,
            applicable_products TEXT NOT NULL DEFAULT '[]',
            applicable_categories TEXT NOT NULL DEFAULT '[]',
            pos_only INTEGER NOT NULL DEFAULT 0,
            web_only INTEGER NOT NULL DEFAULT 0,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        -- Append-only usage records, counted against usage limits.
        CREATE TABLE IF NOT EXISTS discount_usages (
            id TEXT PRIMARY KEY,
            discount_id TEXT NOT NULL REFERENCES discounts(id) ON DELETE CASCADE,
            customer_id TEXT,
            order_id TEXT,
            transaction_id TEXT,
            created_at TEXT DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_ha_ledger_customer
            ON house_account_ledger(customer_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_gift_card_entries_card ON gift_card_entries(card_id);
        CREATE INDEX IF NOT EXISTS idx_discount_usages_discount
            ON discount_usages(discount_id, customer_id);
        ",
    )
    .map_err(|e| format!("migration v3: {e}"))?;

    record_migration(conn, 3)
}

/// Migration v4: post-commit action queue and card fingerprint matching.
fn migrate_v4(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "
        -- Ordered post-commit side effects, run best-effort after the
        -- payment transaction commits. Failures never roll back the commit.
        CREATE TABLE IF NOT EXISTS post_commit_queue (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            transaction_id TEXT NOT NULL,
            action_type TEXT NOT NULL
                CHECK (action_type IN ('GIFT_CARD_ACTIVATION', 'GIFT_CARD_REDEMPTION',
                                       'DISCOUNT_USAGE', 'RECEIPT_EMAIL', 'PRINT_JOB',
                                       'CARD_FINGERPRINT_MATCH')),
            payload TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'completed', 'failed')),
            attempts INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS customer_card_fingerprints (
            id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
            fingerprint TEXT NOT NULL,
            card_last4 TEXT,
            card_brand TEXT,
            created_at TEXT DEFAULT (datetime('now')),
            UNIQUE(customer_id, fingerprint)
        );

        CREATE INDEX IF NOT EXISTS idx_post_commit_status ON post_commit_queue(status);
        CREATE INDEX IF NOT EXISTS idx_card_fingerprints ON customer_card_fingerprints(fingerprint);
        ",
    )
    .map_err(|e| format!("migration v4: {e}"))?;

    record_migration(conn, 4)
}

fn record_migration(conn: &Connection, version: i32) -> Result<(), String> {
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )
    .map_err(|e| format!("record migration v{version}: {e}"))?;
    info!("Applied migration v{version}");
    Ok(())
}

// ---------------------------------------------------------------------------
// Counters
// ---------------------------------------------------------------------------

/// Increment and return the next value of a named counter.
///
/// Must be called inside the caller's write transaction so the increment
/// commits (or rolls back) together with the row that consumes the number.
pub fn next_counter_value(conn: &Connection, prefix: &str) -> Result<i64, String> {
    conn.execute(
        "INSERT INTO counters (prefix, current_value) VALUES (?1, 1)
         ON CONFLICT(prefix) DO UPDATE SET current_value = current_value + 1",
        params![prefix],
    )
    .map_err(|e| format!("bump counter {prefix}: {e}"))?;

    conn.query_row(
        "SELECT current_value FROM counters WHERE prefix = ?1",
        params![prefix],
        |row| row.get(0),
    )
    .map_err(|e| format!("read counter {prefix}: {e}"))
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a setting value, or `None` if it does not exist.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), String> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )
    .map_err(|e| format!("set_setting: {e}"))?;
    Ok(())
}

/// Get all settings grouped by category as JSON.
pub fn get_all_settings(conn: &Connection) -> serde_json::Value {
    let mut stmt = match conn.prepare(
        "SELECT setting_category, setting_key, setting_value FROM local_settings ORDER BY setting_category, setting_key",
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("get_all_settings prepare: {e}");
            return serde_json::json!({});
        }
    };

    let mut result = serde_json::Map::new();

    let rows = match stmt.query_map([], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    }) {
        Ok(r) => r,
        Err(e) => {
            error!("get_all_settings query: {e}");
            return serde_json::json!({});
        }
    };

    for (cat, key, val) in rows.flatten() {
        let category = result.entry(cat).or_insert_with(|| serde_json::json!({}));
        if let serde_json::Value::Object(ref mut map) = category {
            map.insert(key, serde_json::Value::String(val));
        }
    }

    serde_json::Value::Object(result)
}

/// Delete all settings in a category.
#[allow(dead_code)]
pub fn delete_all_settings(conn: &Connection, category: &str) -> Result<(), String> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1",
        params![category],
    )
    .map_err(|e| format!("delete_all_settings: {e}"))?;
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
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "customers",
            "employees",
            "counters",
            "orders",
            "order_items",
            "payment_transactions",
            "payment_methods",
            "order_payments",
            "refunds",
            "refund_methods",
            "order_refunds",
            "house_account_ledger",
            "gift_cards",
            "gift_card_entries",
            "discounts",
            "discount_usages",
            "post_commit_queue",
            "customer_card_fingerprints",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should be a no-op");

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
    fn test_ledger_entry_type_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO customers (id, first_name) VALUES ('cust-1', 'Iris')",
            [],
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO house_account_ledger (customer_id, entry_type, amount_cents, balance_cents)
             VALUES ('cust-1', 'WITHDRAWAL', 100, 100)",
            [],
        );
        assert!(bad.is_err(), "invalid entry_type should be rejected");
    }

    #[test]
    fn test_payment_method_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO payment_transactions (id, transaction_number, total_amount_cents)
             VALUES ('tx-1', 'PT-00001', 1000)",
            [],
        )
        .unwrap();

        let bad = conn.execute(
            "INSERT INTO payment_methods (id, transaction_id, method, amount_cents)
             VALUES ('pm-bad', 'tx-1', 'BITCOIN', 1000)",
            [],
        );
        assert!(bad.is_err(), "invalid method should be rejected");
    }

    #[test]
    fn test_payment_methods_cascade_with_transaction() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO payment_transactions (id, transaction_number, total_amount_cents)
             VALUES ('tx-2', 'PT-00002', 500)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO payment_methods (id, transaction_id, method, amount_cents)
             VALUES ('pm-1', 'tx-2', 'CASH', 500)",
            [],
        )
        .unwrap();

        conn.execute("DELETE FROM payment_transactions WHERE id = 'tx-2'", [])
            .unwrap();

        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM payment_methods WHERE transaction_id = 'tx-2'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(count, 0, "legs should cascade-delete with transaction");
    }

    #[test]
    fn test_next_counter_value_sequences() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        assert_eq!(next_counter_value(&conn, "PT").unwrap(), 1);
        assert_eq!(next_counter_value(&conn, "PT").unwrap(), 2);
        assert_eq!(next_counter_value(&conn, "RF").unwrap(), 1);
        assert_eq!(next_counter_value(&conn, "PT").unwrap(), 3);
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "store", "name", "Bloom Florist").expect("set");
        let val = get_setting(&conn, "store", "name");
        assert_eq!(val, Some("Bloom Florist".to_string()));

        set_setting(&conn, "store", "name", "Bloom & Co").expect("update");
        let val = get_setting(&conn, "store", "name");
        assert_eq!(val, Some("Bloom & Co".to_string()));

        delete_all_settings(&conn, "store").expect("delete");
        let val = get_setting(&conn, "store", "name");
        assert!(val.is_none());
    }
}
