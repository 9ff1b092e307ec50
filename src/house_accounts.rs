//! House account ledger.
//!
//! Append-only balance history per customer: CHARGE entries post when an
//! order is paid on account, PAYMENT entries when the customer settles,
//! ADJUSTMENT entries for corrections. Every entry stores the running
//! balance after itself; entries are never updated or deleted in place.
//!
//! Postings are transactional read-modify-append under `BEGIN IMMEDIATE`
//! so the running balance is never computed from a stale read. A busy
//! database retries the whole posting (re-read, recompute, re-append)
//! instead of surfacing the collision to the operator.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use crate::db::DbState;

/// Attempts for a posting that keeps hitting a locked database.
const POST_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Charge,
    Payment,
    Adjustment,
}

impl EntryType {
    fn as_str(&self) -> &'static str {
        match self {
            EntryType::Charge => "CHARGE",
            EntryType::Payment => "PAYMENT",
            EntryType::Adjustment => "ADJUSTMENT",
        }
    }
}

/// Latest ledger entry for a customer, ordered by `(created_at, id)`.
fn latest_balance(conn: &Connection, customer_id: &str) -> Result<i64, String> {
    conn.query_row(
        "SELECT balance_cents FROM house_account_ledger
         WHERE customer_id = ?1
         ORDER BY created_at DESC, id DESC
         LIMIT 1",
        params![customer_id],
        |row| row.get(0),
    )
    .optional()
    .map(|balance| balance.unwrap_or(0))
    .map_err(|e| format!("query latest balance: {e}"))
}

fn require_customer(conn: &Connection, customer_id: &str) -> Result<(), String> {
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM customers WHERE id = ?1",
            params![customer_id],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if exists == 0 {
        return Err(format!("Customer not found: {customer_id}"));
    }
    Ok(())
}

fn is_busy(err: &str) -> bool {
    err.contains("database is locked") || err.contains("database table is locked")
}

// ---------------------------------------------------------------------------
// Posting
// ---------------------------------------------------------------------------

/// Append one ledger entry inside the caller's transaction.
///
/// Reads the latest balance and writes `balance = previous + amount` in the
/// same transaction, which is what keeps the chain intact under concurrent
/// postings.
pub fn post_entry_on_conn(
    conn: &Connection,
    customer_id: &str,
    entry_type: EntryType,
    amount_cents: i64,
    description: &str,
    reference: Option<&str>,
    order_id: Option<&str>,
    created_by: Option<&str>,
) -> Result<Value, String> {
    let previous = latest_balance(conn, customer_id)?;
    let balance = previous + amount_cents;
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT INTO house_account_ledger (
            customer_id, entry_type, amount_cents, balance_cents,
            description, reference, order_id, created_by, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            customer_id,
            entry_type.as_str(),
            amount_cents,
            balance,
            description,
            reference,
            order_id,
            created_by,
            now,
        ],
    )
    .map_err(|e| format!("insert ledger entry: {e}"))?;

    let entry_id = conn.last_insert_rowid();

    Ok(serde_json::json!({
        "id": entry_id,
        "customerId": customer_id,
        "type": entry_type.as_str(),
        "amountCents": amount_cents,
        "balanceCents": balance,
        "description": description,
        "reference": reference,
        "orderId": order_id,
        "createdBy": created_by,
        "createdAt": now,
    }))
}

/// Post an entry in its own transaction, retrying on a locked database.
fn post_entry(
    db: &DbState,
    customer_id: &str,
    entry_type: EntryType,
    amount_cents: i64,
    description: &str,
    reference: Option<&str>,
    created_by: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    require_customer(&conn, customer_id)?;

    let mut attempt = 0;
    loop {
        attempt += 1;

        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| format!("begin transaction: {e}"))?;

        let result = post_entry_on_conn(
            &conn,
            customer_id,
            entry_type,
            amount_cents,
            description,
            reference,
            None,
            created_by,
        );

        match result {
            Ok(entry) => {
                conn.execute_batch("COMMIT")
                    .map_err(|e| format!("commit: {e}"))?;
                return Ok(entry);
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                if is_busy(&e) && attempt < POST_RETRIES {
                    warn!(customer_id, attempt, "Ledger posting hit a locked database, retrying");
                    continue;
                }
                return Err(e);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Current balance: balance of the most recent entry, 0 with no history.
pub fn get_balance(db: &DbState, customer_id: &str) -> Result<i64, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    require_customer(&conn, customer_id)?;
    latest_balance(&conn, customer_id)
}

/// Record a payment received against the account.
///
/// Payments always reduce the balance: the stored amount is `-|amount|`.
/// Rejects non-positive amounts.
pub fn apply_payment(
    db: &DbState,
    customer_id: &str,
    amount_cents: i64,
    reference: Option<&str>,
    notes: Option<&str>,
    employee_id: Option<&str>,
) -> Result<Value, String> {
    if amount_cents <= 0 {
        return Err("Payment amount must be greater than zero".into());
    }

    let mut description = String::from("Payment received");
    if let Some(r) = reference.filter(|r| !r.trim().is_empty()) {
        description.push_str(&format!(" - {r}"));
    }
    if let Some(n) = notes.filter(|n| !n.trim().is_empty()) {
        description.push_str(&format!(" ({n})"));
    }

    let entry = post_entry(
        db,
        customer_id,
        EntryType::Payment,
        -amount_cents.abs(),
        &description,
        reference,
        employee_id,
    )?;

    info!(customer_id, amount = amount_cents, "House account payment applied");
    Ok(serde_json::json!({ "success": true, "entry": entry }))
}

/// Record a signed balance adjustment. Rejects zero amounts and blank
/// descriptions.
pub fn add_adjustment(
    db: &DbState,
    customer_id: &str,
    amount_cents: i64,
    description: &str,
    employee_id: Option<&str>,
) -> Result<Value, String> {
    if amount_cents == 0 {
        return Err("Adjustment amount must be non-zero".into());
    }
    if description.trim().is_empty() {
        return Err("Adjustment description is required".into());
    }

    let entry = post_entry(
        db,
        customer_id,
        EntryType::Adjustment,
        amount_cents,
        description.trim(),
        None,
        employee_id,
    )?;

    info!(customer_id, amount = amount_cents, "House account adjustment added");
    Ok(serde_json::json!({ "success": true, "entry": entry }))
}

// ---------------------------------------------------------------------------
// Statements
// ---------------------------------------------------------------------------

fn start_of_day(date: &str) -> String {
    format!("{date}T00:00:00")
}

fn end_of_day(date: &str) -> String {
    format!("{date}T23:59:59.999999+00:00")
}

/// Generate a statement for `[from, to]` (inclusive, `YYYY-MM-DD`).
///
/// `openingBalance` is the balance of the latest entry strictly before
/// `from`; `closingBalance` is the balance of the last in-range entry, or
/// the opening balance when the range is empty.
pub fn generate_statement(
    db: &DbState,
    customer_id: &str,
    from: Option<&str>,
    to: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let customer = conn
        .query_row(
            "SELECT first_name, last_name, email, phone, house_account_terms
             FROM customers WHERE id = ?1",
            params![customer_id],
            |row| {
                Ok(serde_json::json!({
                    "id": customer_id,
                    "firstName": row.get::<_, String>(0)?,
                    "lastName": row.get::<_, String>(1)?,
                    "email": row.get::<_, Option<String>>(2)?,
                    "phone": row.get::<_, Option<String>>(3)?,
                    "terms": row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "NET_30".into()),
                }))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Customer not found: {customer_id}"),
            _ => format!("query customer: {e}"),
        })?;

    let opening_balance: i64 = match from {
        Some(from_date) => conn
            .query_row(
                "SELECT balance_cents FROM house_account_ledger
                 WHERE customer_id = ?1 AND created_at < ?2
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![customer_id, start_of_day(from_date)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| format!("query opening balance: {e}"))?
            .unwrap_or(0),
        None => 0,
    };

    let mut sql = String::from(
        "SELECT id, entry_type, amount_cents, balance_cents, description,
                reference, order_id, created_at
         FROM house_account_ledger
         WHERE customer_id = ?1",
    );
    let mut bind: Vec<String> = vec![customer_id.to_string()];
    if let Some(from_date) = from {
        bind.push(start_of_day(from_date));
        sql.push_str(&format!(" AND created_at >= ?{}", bind.len()));
    }
    if let Some(to_date) = to {
        bind.push(end_of_day(to_date));
        sql.push_str(&format!(" AND created_at <= ?{}", bind.len()));
    }
    sql.push_str(" ORDER BY created_at ASC, id ASC");

    let mut stmt = conn.prepare(&sql).map_err(|e| e.to_string())?;
    let entries: Vec<Value> = stmt
        .query_map(rusqlite::params_from_iter(bind.iter()), |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, i64>(0)?,
                "type": row.get::<_, String>(1)?,
                "amountCents": row.get::<_, i64>(2)?,
                "balanceCents": row.get::<_, i64>(3)?,
                "description": row.get::<_, String>(4)?,
                "reference": row.get::<_, Option<String>>(5)?,
                "orderId": row.get::<_, Option<String>>(6)?,
                "createdAt": row.get::<_, String>(7)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let closing_balance = entries
        .last()
        .and_then(|e| e["balanceCents"].as_i64())
        .unwrap_or(opening_balance);

    let partition = |kind: &str| -> Vec<Value> {
        entries
            .iter()
            .filter(|e| e["type"] == kind)
            .cloned()
            .collect()
    };

    Ok(serde_json::json!({
        "customer": customer,
        "statementPeriod": { "from": from, "to": to },
        "openingBalance": opening_balance,
        "charges": partition("CHARGE"),
        "payments": partition("PAYMENT"),
        "adjustments": partition("ADJUSTMENT"),
        "closingBalance": closing_balance,
    }))
}

/// List house-account customers with their current balance and last
/// activity. With `has_balance_only`, zero-balance accounts are skipped.
pub fn list_accounts(db: &DbState, has_balance_only: bool) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id, first_name, last_name, email, phone, house_account_terms
             FROM customers
             WHERE is_house_account = 1
             ORDER BY last_name ASC, first_name ASC",
        )
        .map_err(|e| e.to_string())?;

    type CustomerRow = (String, String, String, Option<String>, Option<String>, Option<String>);
    let customers: Vec<CustomerRow> = stmt
        .query_map([], |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut accounts = Vec::new();
    for (id, first, last, email, phone, terms) in customers {
        let latest: Option<(i64, String)> = conn
            .query_row(
                "SELECT balance_cents, created_at FROM house_account_ledger
                 WHERE customer_id = ?1
                 ORDER BY created_at DESC, id DESC
                 LIMIT 1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| format!("query latest entry: {e}"))?;

        let (balance, last_activity) = match latest {
            Some((b, at)) => (b, Some(at)),
            None => (0, None),
        };
        if has_balance_only && balance == 0 {
            continue;
        }

        accounts.push(serde_json::json!({
            "customerId": id,
            "customerName": format!("{first} {last}").trim().to_string(),
            "email": email,
            "phone": phone,
            "terms": terms.unwrap_or_else(|| "NET_30".into()),
            "currentBalanceCents": balance,
            "lastActivity": last_activity,
        }));
    }

    Ok(serde_json::json!({ "accounts": accounts }))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;
    use std::sync::Arc;

    fn test_db() -> DbState {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        db::run_migrations_for_test(&conn);
        DbState {
            conn: std::sync::Mutex::new(conn),
            db_path: std::path::PathBuf::from(":memory:"),
        }
    }

    fn seed_customer(db: &DbState, id: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO customers (id, first_name, last_name, is_house_account)
             VALUES (?1, 'Fern', 'Gardner', 1)",
            params![id],
        )
        .unwrap();
    }

    #[test]
    fn test_balance_starts_at_zero() {
        let db = test_db();
        seed_customer(&db, "cust-1");
        assert_eq!(get_balance(&db, "cust-1").unwrap(), 0);
    }

    #[test]
    fn test_balance_unknown_customer() {
        let db = test_db();
        let err = get_balance(&db, "ghost").unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_payment_then_adjustment_scenario() {
        // applyPayment(5000) -> {PAYMENT, -5000, balance -5000};
        // addAdjustment(2000) -> {ADJUSTMENT, 2000, balance -3000}.
        let db = test_db();
        seed_customer(&db, "cust-2");

        let payment = apply_payment(&db, "cust-2", 5000, None, None, None).unwrap();
        assert_eq!(payment["entry"]["type"], "PAYMENT");
        assert_eq!(payment["entry"]["amountCents"], -5000);
        assert_eq!(payment["entry"]["balanceCents"], -5000);

        let adjustment = add_adjustment(&db, "cust-2", 2000, "correction", None).unwrap();
        assert_eq!(adjustment["entry"]["type"], "ADJUSTMENT");
        assert_eq!(adjustment["entry"]["amountCents"], 2000);
        assert_eq!(adjustment["entry"]["balanceCents"], -3000);

        assert_eq!(get_balance(&db, "cust-2").unwrap(), -3000);
    }

    #[test]
    fn test_apply_payment_rejects_non_positive() {
        let db = test_db();
        seed_customer(&db, "cust-3");
        assert!(apply_payment(&db, "cust-3", 0, None, None, None).is_err());
        assert!(apply_payment(&db, "cust-3", -100, None, None, None).is_err());
        // Nothing was written
        assert_eq!(get_balance(&db, "cust-3").unwrap(), 0);
    }

    #[test]
    fn test_add_adjustment_rejects_zero_and_blank_description() {
        let db = test_db();
        seed_customer(&db, "cust-4");
        assert!(add_adjustment(&db, "cust-4", 0, "x", None).is_err());
        assert!(add_adjustment(&db, "cust-4", 100, "  ", None).is_err());
    }

    #[test]
    fn test_payment_description_includes_reference_and_notes() {
        let db = test_db();
        seed_customer(&db, "cust-5");
        let result =
            apply_payment(&db, "cust-5", 1000, Some("CHK 442"), Some("June invoice"), None)
                .unwrap();
        assert_eq!(
            result["entry"]["description"],
            "Payment received - CHK 442 (June invoice)"
        );
    }

    #[test]
    fn test_ledger_monotonic_chaining() {
        // For all n: ledger[n].balance == ledger[n-1].balance + ledger[n].amount
        let db = test_db();
        seed_customer(&db, "cust-6");

        apply_payment(&db, "cust-6", 2500, None, None, None).unwrap();
        add_adjustment(&db, "cust-6", 10000, "Opening charge carried over", None).unwrap();
        apply_payment(&db, "cust-6", 4000, None, None, None).unwrap();
        add_adjustment(&db, "cust-6", -500, "Goodwill credit", None).unwrap();

        let conn = db.conn.lock().unwrap();
        let entries: Vec<(i64, i64)> = conn
            .prepare(
                "SELECT amount_cents, balance_cents FROM house_account_ledger
                 WHERE customer_id = 'cust-6' ORDER BY created_at ASC, id ASC",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        let mut previous = 0i64;
        for (amount, balance) in entries {
            assert_eq!(balance, previous + amount, "chain broken");
            previous = balance;
        }
        assert_eq!(previous, 2500 * -1 + 10000 - 4000 - 500);
    }

    #[test]
    fn test_concurrent_postings_keep_chain_intact() {
        // Two operators posting against the same account concurrently.
        // Postings serialize on the connection, and the chain invariant
        // must hold across every interleaving.
        let db = Arc::new(test_db());
        seed_customer(&db, "cust-7");

        let mut handles = Vec::new();
        for t in 0..4 {
            let db = Arc::clone(&db);
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    if (t + i) % 2 == 0 {
                        apply_payment(&db, "cust-7", 100, None, None, None).unwrap();
                    } else {
                        add_adjustment(&db, "cust-7", 100, "charge", None).unwrap();
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let conn = db.conn.lock().unwrap();
        let entries: Vec<(i64, i64)> = conn
            .prepare(
                "SELECT amount_cents, balance_cents FROM house_account_ledger
                 WHERE customer_id = 'cust-7' ORDER BY created_at ASC, id ASC",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert_eq!(entries.len(), 100);
        let mut previous = 0i64;
        for (amount, balance) in &entries {
            assert_eq!(*balance, previous + amount, "lost update corrupted the chain");
            previous = *balance;
        }
        let total: i64 = entries.iter().map(|(amount, _)| amount).sum();
        assert_eq!(previous, total);
    }

    #[test]
    fn test_statement_partitions_and_balances() {
        let db = test_db();
        seed_customer(&db, "cust-8");

        // Backdated entry establishing the opening balance
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO house_account_ledger
                    (customer_id, entry_type, amount_cents, balance_cents, description, created_at)
                 VALUES ('cust-8', 'CHARGE', 7000, 7000, 'Order 100', '2020-01-05T10:00:00+00:00')",
                [],
            )
            .unwrap();
        }

        // In-range entries (posted now)
        apply_payment(&db, "cust-8", 3000, Some("CHK 9"), None, None).unwrap();
        add_adjustment(&db, "cust-8", -500, "Damaged stems credit", None).unwrap();

        let today = Utc::now().format("%Y-%m-%d").to_string();
        let statement =
            generate_statement(&db, "cust-8", Some("2020-02-01"), Some(&today)).unwrap();

        assert_eq!(statement["openingBalance"], 7000);
        assert_eq!(statement["charges"].as_array().unwrap().len(), 0);
        assert_eq!(statement["payments"].as_array().unwrap().len(), 1);
        assert_eq!(statement["adjustments"].as_array().unwrap().len(), 1);
        assert_eq!(statement["closingBalance"], 3500);
    }

    #[test]
    fn test_statement_empty_range_closing_equals_opening() {
        let db = test_db();
        seed_customer(&db, "cust-9");
        {
            let conn = db.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO house_account_ledger
                    (customer_id, entry_type, amount_cents, balance_cents, description, created_at)
                 VALUES ('cust-9', 'CHARGE', 4200, 4200, 'Order 7', '2020-01-05T10:00:00+00:00')",
                [],
            )
            .unwrap();
        }

        let statement =
            generate_statement(&db, "cust-9", Some("2020-02-01"), Some("2020-02-28")).unwrap();
        assert_eq!(statement["openingBalance"], 4200);
        assert_eq!(statement["closingBalance"], 4200);
        assert_eq!(statement["payments"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn test_statement_unknown_customer() {
        let db = test_db();
        let err = generate_statement(&db, "ghost", None, None).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_list_accounts_filters_zero_balances() {
        let db = test_db();
        seed_customer(&db, "cust-a");
        seed_customer(&db, "cust-b");
        apply_payment(&db, "cust-a", 2000, None, None, None).unwrap();

        let all = list_accounts(&db, false).unwrap();
        assert_eq!(all["accounts"].as_array().unwrap().len(), 2);

        let with_balance = list_accounts(&db, true).unwrap();
        let accounts = with_balance["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert_eq!(accounts[0]["customerId"], "cust-a");
        assert_eq!(accounts[0]["currentBalanceCents"], -2000);
    }
}
