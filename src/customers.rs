//! Customer lookups for the POS flow.
//!
//! Walk-in sales attach to a shared guest customer row. Card fingerprints
//! recorded at payment time allow best-effort repeat-customer matching on
//! later transactions; matching never blocks a payment.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;

/// Well-known id of the shared walk-in customer.
const GUEST_CUSTOMER_ID: &str = "guest-walk-in";

fn customer_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<Value> {
    Ok(serde_json::json!({
        "id": row.get::<_, String>(0)?,
        "firstName": row.get::<_, String>(1)?,
        "lastName": row.get::<_, String>(2)?,
        "email": row.get::<_, Option<String>>(3)?,
        "phone": row.get::<_, Option<String>>(4)?,
        "isGuest": row.get::<_, i64>(5)? != 0,
        "isHouseAccount": row.get::<_, i64>(6)? != 0,
    }))
}

const CUSTOMER_COLUMNS: &str =
    "id, first_name, last_name, email, phone, is_guest, is_house_account";

// ---------------------------------------------------------------------------
// Guest customer
// ---------------------------------------------------------------------------

/// Return the shared walk-in customer id, creating the row on first use.
pub fn get_or_create_guest(conn: &Connection) -> Result<String, String> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM customers WHERE id = ?1",
            params![GUEST_CUSTOMER_ID],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| format!("query guest customer: {e}"))?;

    if let Some(id) = existing {
        return Ok(id);
    }

    conn.execute(
        "INSERT INTO customers (id, first_name, last_name, is_guest, created_at, updated_at)
         VALUES (?1, 'Walk-in', 'Customer', 1, ?2, ?2)",
        params![GUEST_CUSTOMER_ID, Utc::now().to_rfc3339()],
    )
    .map_err(|e| format!("create guest customer: {e}"))?;

    info!("guest customer created");
    Ok(GUEST_CUSTOMER_ID.to_string())
}

// ---------------------------------------------------------------------------
// CRUD-lite
// ---------------------------------------------------------------------------

/// Create a customer from a loose payload. Only names are required.
pub fn create_customer(db: &DbState, payload: &Value) -> Result<Value, String> {
    let first_name = payload["firstName"]
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or("Missing firstName")?;
    let last_name = payload["lastName"].as_str().map(str::trim).unwrap_or("");
    let email = payload["email"].as_str().map(str::trim).filter(|s| !s.is_empty());
    let phone = payload["phone"].as_str().map(str::trim).filter(|s| !s.is_empty());

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO customers (id, first_name, last_name, email, phone, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
        params![id, first_name, last_name, email, phone, now],
    )
    .map_err(|e| format!("insert customer: {e}"))?;

    info!(customer_id = %id, "customer created");
    Ok(serde_json::json!({ "success": true, "customerId": id }))
}

/// Look up a customer by id.
pub fn get_customer(db: &DbState, customer_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.query_row(
        &format!("SELECT {CUSTOMER_COLUMNS} FROM customers WHERE id = ?1"),
        params![customer_id],
        customer_json,
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => format!("Customer not found: {customer_id}"),
        _ => format!("query customer: {e}"),
    })
}

/// Search customers by name, email, or phone fragment.
pub fn search(db: &DbState, query: &str) -> Result<Value, String> {
    let term = format!("%{}%", query.trim());
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CUSTOMER_COLUMNS} FROM customers
             WHERE first_name LIKE ?1 OR last_name LIKE ?1
                OR email LIKE ?1 OR phone LIKE ?1
             ORDER BY last_name ASC, first_name ASC
             LIMIT 25"
        ))
        .map_err(|e| e.to_string())?;

    let customers: Vec<Value> = stmt
        .query_map(params![term], customer_json)
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    Ok(serde_json::json!({ "customers": customers }))
}

/// Flip the house-account flag for a customer.
pub fn set_house_account_enabled(
    db: &DbState,
    customer_id: &str,
    enabled: bool,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let updated = conn
        .execute(
            "UPDATE customers SET is_house_account = ?1, updated_at = ?2 WHERE id = ?3",
            params![enabled as i64, Utc::now().to_rfc3339(), customer_id],
        )
        .map_err(|e| format!("update customer: {e}"))?;
    if updated == 0 {
        return Err(format!("Customer not found: {customer_id}"));
    }
    Ok(serde_json::json!({ "success": true, "isHouseAccount": enabled }))
}

// ---------------------------------------------------------------------------
// Card fingerprint matching
// ---------------------------------------------------------------------------

/// Record a card fingerprint seen on a customer's payment. Duplicate
/// fingerprints for the same customer are ignored.
pub fn record_card_fingerprint(
    db: &DbState,
    customer_id: &str,
    fingerprint: &str,
    card_last4: Option<&str>,
    card_brand: Option<&str>,
) -> Result<Value, String> {
    if fingerprint.trim().is_empty() {
        return Err("Fingerprint is required".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    conn.execute(
        "INSERT INTO customer_card_fingerprints (id, customer_id, fingerprint, card_last4, card_brand)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(customer_id, fingerprint) DO NOTHING",
        params![
            Uuid::new_v4().to_string(),
            customer_id,
            fingerprint.trim(),
            card_last4,
            card_brand,
        ],
    )
    .map_err(|e| format!("insert fingerprint: {e}"))?;

    Ok(serde_json::json!({ "success": true }))
}

/// Find customers whose saved cards match a fingerprint. Best-effort: a
/// query failure returns an empty match list rather than an error so the
/// payment flow is never blocked.
pub fn match_by_fingerprint(db: &DbState, fingerprint: &str) -> Value {
    let conn = match db.conn.lock() {
        Ok(c) => c,
        Err(e) => {
            warn!("fingerprint match unavailable: {e}");
            return serde_json::json!({ "matches": [] });
        }
    };

    let mut stmt = match conn.prepare(&format!(
        "SELECT DISTINCT {CUSTOMER_COLUMNS} FROM customers c
         JOIN customer_card_fingerprints f ON f.customer_id = c.id
         WHERE f.fingerprint = ?1 AND c.is_guest = 0"
    )) {
        Ok(s) => s,
        Err(e) => {
            warn!("fingerprint match query failed: {e}");
            return serde_json::json!({ "matches": [] });
        }
    };

    let matches: Vec<Value> = stmt
        .query_map(params![fingerprint.trim()], customer_json)
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();

    serde_json::json!({ "matches": matches })
}

// ===========================================================================
// Tests
// ===========================================================================
