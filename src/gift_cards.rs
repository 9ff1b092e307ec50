//! Gift card ledger: balance lookup, activation, redemption.
//!
//! Physical cards exist as INACTIVE stock rows (preprinted numbers) and
//! are activated when sold; digital cards are created at sale time with a
//! generated number and require a recipient email. Balance changes append
//! `gift_card_entries` rows carrying the balance after each entry.
//!
//! Redemption *reservation* (earmarking during checkout) is in-memory in
//! the checkout session; the ledger only changes after the payment
//! transaction commits.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

use crate::db::DbState;
use crate::money::format_dollars;
use crate::orders::GiftCardType;

/// Card amounts are bounded the same way the storefront sells them.
pub const MIN_CARD_CENTS: i64 = 2_500;
pub const MAX_CARD_CENTS: i64 = 30_000;

/// Activation details for one card being sold.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CardActivation {
    #[serde(default)]
    pub card_number: Option<String>,
    pub amount_cents: i64,
    #[serde(default = "default_card_type")]
    pub card_type: GiftCardType,
    #[serde(default)]
    pub recipient_name: Option<String>,
    #[serde(default)]
    pub recipient_email: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_card_type() -> GiftCardType {
    GiftCardType::Physical
}

/// Generate a digital card number: `GC-` + 12 hex chars from a v4 uuid.
fn generate_card_number() -> String {
    let raw = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
    format!("GC-{}", &raw[..12])
}

// ---------------------------------------------------------------------------
// Lookup
// ---------------------------------------------------------------------------

/// Look up a card by number, returning its balance and status.
pub fn lookup(db: &DbState, card_number: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    lookup_on_conn(&conn, card_number)
}

pub fn lookup_on_conn(conn: &Connection, card_number: &str) -> Result<Value, String> {
    let number = card_number.trim().to_ascii_uppercase();
    conn.query_row(
        "SELECT id, card_number, card_type, status, initial_value_cents, balance_cents,
                recipient_name, recipient_email
         FROM gift_cards WHERE card_number = ?1",
        params![number],
        |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "cardNumber": row.get::<_, String>(1)?,
                "cardType": row.get::<_, String>(2)?,
                "status": row.get::<_, String>(3)?,
                "initialValueCents": row.get::<_, i64>(4)?,
                "balanceCents": row.get::<_, i64>(5)?,
                "recipientName": row.get::<_, Option<String>>(6)?,
                "recipientEmail": row.get::<_, Option<String>>(7)?,
            }))
        },
    )
    .map_err(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => format!("Gift card not found: {card_number}"),
        _ => format!("query gift card: {e}"),
    })
}

/// Spendable balance for a card number; zero for inactive cards.
pub fn available_balance(db: &DbState, card_number: &str) -> Result<i64, String> {
    let card = lookup(db, card_number)?;
    if card["status"] != "ACTIVE" {
        return Ok(0);
    }
    Ok(card["balanceCents"].as_i64().unwrap_or(0))
}

// ---------------------------------------------------------------------------
// Activation
// ---------------------------------------------------------------------------

/// Validate activation details without touching the database. Used as the
/// checkout gate before any payment is collected.
pub fn validate_activations(cards: &[CardActivation]) -> Result<(), String> {
    if cards.is_empty() {
        return Err("At least one gift card is required".into());
    }
    for card in cards {
        if card.amount_cents < MIN_CARD_CENTS || card.amount_cents > MAX_CARD_CENTS {
            return Err(format!(
                "Each card amount must be between {} and {}",
                format_dollars(MIN_CARD_CENTS),
                format_dollars(MAX_CARD_CENTS)
            ));
        }
        match card.card_type {
            GiftCardType::Physical => {
                if card.card_number.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err("Physical cards require a card number".into());
                }
            }
            GiftCardType::Digital => {
                if card
                    .recipient_email
                    .as_deref()
                    .map(str::trim)
                    .unwrap_or("")
                    .is_empty()
                {
                    return Err("Digital cards require a recipient email".into());
                }
            }
        }
    }
    Ok(())
}

/// Activate purchased cards inside the caller's transaction.
///
/// Physical cards must exist as INACTIVE stock; digital cards are created
/// with a generated number. Each activation appends an ACTIVATION entry.
/// Returns the activated cards as JSON.
pub fn activate_cards_on_conn(
    conn: &Connection,
    cards: &[CardActivation],
    purchased_by: Option<&str>,
    transaction_id: Option<&str>,
    employee_id: Option<&str>,
) -> Result<Vec<Value>, String> {
    validate_activations(cards)?;

    let now = Utc::now().to_rfc3339();
    let mut activated = Vec::with_capacity(cards.len());

    for card in cards {
        let (card_id, card_number) = match card.card_type {
            GiftCardType::Physical => {
                let number = card
                    .card_number
                    .as_deref()
                    .expect("validated above")
                    .trim()
                    .to_ascii_uppercase();
                let existing: Option<(String, String)> = conn
                    .query_row(
                        "SELECT id, status FROM gift_cards WHERE card_number = ?1",
                        params![number],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()
                    .map_err(|e| format!("query stock card: {e}"))?;

                let (id, status) = existing
                    .ok_or_else(|| format!("Physical gift card {number} not found"))?;
                if status != "INACTIVE" {
                    return Err(format!(
                        "Gift card {number} is already {}",
                        status.to_ascii_lowercase()
                    ));
                }

                conn.execute(
                    "UPDATE gift_cards SET
                        status = 'ACTIVE',
                        initial_value_cents = ?1,
                        balance_cents = ?1,
                        purchased_by = ?2,
                        recipient_name = ?3,
                        recipient_email = ?4,
                        message = ?5,
                        purchase_transaction_id = ?6,
                        updated_at = ?7
                     WHERE id = ?8",
                    params![
                        card.amount_cents,
                        purchased_by,
                        card.recipient_name,
                        card.recipient_email,
                        card.message,
                        transaction_id,
                        now,
                        id,
                    ],
                )
                .map_err(|e| format!("activate card: {e}"))?;
                (id, number)
            }
            GiftCardType::Digital => {
                let id = Uuid::new_v4().to_string();
                let number = generate_card_number();
                conn.execute(
                    "INSERT INTO gift_cards (
                        id, card_number, card_type, status, initial_value_cents,
                        balance_cents, purchased_by, recipient_name, recipient_email,
                        message, purchase_transaction_id, created_at, updated_at
                    ) VALUES (?1, ?2, 'DIGITAL', 'ACTIVE', ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        id,
                        number,
                        card.amount_cents,
                        purchased_by,
                        card.recipient_name,
                        card.recipient_email,
                        card.message,
                        transaction_id,
                        now,
                    ],
                )
                .map_err(|e| format!("create digital card: {e}"))?;
                (id, number)
            }
        };

        conn.execute(
            "INSERT INTO gift_card_entries (card_id, entry_type, amount_cents, balance_cents,
                                            transaction_id, employee_id, created_at)
             VALUES (?1, 'ACTIVATION', ?2, ?2, ?3, ?4, ?5)",
            params![card_id, card.amount_cents, transaction_id, employee_id, now],
        )
        .map_err(|e| format!("insert activation entry: {e}"))?;

        info!(card_number = %card_number, amount = card.amount_cents, "Gift card activated");

        activated.push(serde_json::json!({
            "id": card_id,
            "cardNumber": card_number,
            "cardType": card.card_type.as_str(),
            "balanceCents": card.amount_cents,
            "recipientName": card.recipient_name,
            "recipientEmail": card.recipient_email,
        }));
    }

    Ok(activated)
}

/// Activate purchased cards in their own transaction (post-commit path).
pub fn activate_cards(
    db: &DbState,
    cards: &[CardActivation],
    purchased_by: Option<&str>,
    transaction_id: Option<&str>,
    employee_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    match activate_cards_on_conn(&conn, cards, purchased_by, transaction_id, employee_id) {
        Ok(activated) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(serde_json::json!({ "success": true, "cards": activated }))
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Redemption
// ---------------------------------------------------------------------------

/// Redeem `amount_cents` from a card inside the caller's transaction.
///
/// Guards active status and sufficient balance, decrements the card,
/// appends a REDEMPTION entry, and flips the card to DEPLETED at zero.
pub fn redeem_on_conn(
    conn: &Connection,
    card_number: &str,
    amount_cents: i64,
    transaction_id: Option<&str>,
    employee_id: Option<&str>,
) -> Result<Value, String> {
    if amount_cents <= 0 {
        return Err("Redemption amount must be positive".into());
    }

    let number = card_number.trim().to_ascii_uppercase();
    let (card_id, status, balance): (String, String, i64) = conn
        .query_row(
            "SELECT id, status, balance_cents FROM gift_cards WHERE card_number = ?1",
            params![number],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Gift card not found: {card_number}"),
            _ => format!("query gift card: {e}"),
        })?;

    if status != "ACTIVE" {
        return Err(format!(
            "Gift card {number} is {}",
            status.to_ascii_lowercase()
        ));
    }
    if amount_cents > balance {
        return Err(format!(
            "Gift card balance {} is less than {}",
            format_dollars(balance),
            format_dollars(amount_cents)
        ));
    }

    let new_balance = balance - amount_cents;
    let new_status = if new_balance == 0 { "DEPLETED" } else { "ACTIVE" };
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "UPDATE gift_cards SET balance_cents = ?1, status = ?2, updated_at = ?3 WHERE id = ?4",
        params![new_balance, new_status, now, card_id],
    )
    .map_err(|e| format!("debit card: {e}"))?;

    conn.execute(
        "INSERT INTO gift_card_entries (card_id, entry_type, amount_cents, balance_cents,
                                        transaction_id, employee_id, created_at)
         VALUES (?1, 'REDEMPTION', ?2, ?3, ?4, ?5, ?6)",
        params![card_id, -amount_cents, new_balance, transaction_id, employee_id, now],
    )
    .map_err(|e| format!("insert redemption entry: {e}"))?;

    info!(card_number = %number, amount = amount_cents, new_balance, "Gift card redeemed");

    Ok(serde_json::json!({
        "success": true,
        "cardNumber": number,
        "redeemedCents": amount_cents,
        "balanceCents": new_balance,
        "status": new_status,
    }))
}

/// Redeem in a standalone transaction (post-commit path).
pub fn redeem(
    db: &DbState,
    card_number: &str,
    amount_cents: i64,
    transaction_id: Option<&str>,
    employee_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    match redeem_on_conn(&conn, card_number, amount_cents, transaction_id, employee_id) {
        Ok(result) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            Ok(result)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use rusqlite::Connection;

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

    fn seed_stock_card(db: &DbState, number: &str) {
        let conn = db.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO gift_cards (id, card_number, card_type, status)
             VALUES (?1, ?2, 'PHYSICAL', 'INACTIVE')",
            params![format!("gc-{number}"), number],
        )
        .unwrap();
    }

    fn physical(number: &str, amount: i64) -> CardActivation {
        CardActivation {
            card_number: Some(number.to_string()),
            amount_cents: amount,
            card_type: GiftCardType::Physical,
            recipient_name: Some("Daisy".into()),
            recipient_email: None,
            message: None,
        }
    }

    fn digital(email: &str, amount: i64) -> CardActivation {
        CardActivation {
            card_number: None,
            amount_cents: amount,
            card_type: GiftCardType::Digital,
            recipient_name: None,
            recipient_email: Some(email.to_string()),
            message: Some("Happy birthday".into()),
        }
    }

    #[test]
    fn test_validate_activations_gates() {
        assert!(validate_activations(&[]).is_err());
        // Amount bounds
        assert!(validate_activations(&[physical("GC-1", 100)]).is_err());
        assert!(validate_activations(&[physical("GC-1", 99_999)]).is_err());
        // Physical without number
        let mut bad = physical("GC-1", 5000);
        bad.card_number = None;
        assert!(validate_activations(&[bad]).is_err());
        // Digital without email
        let mut bad = digital("a@b.com", 5000);
        bad.recipient_email = None;
        assert!(validate_activations(&[bad]).is_err());
        // Valid
        assert!(validate_activations(&[physical("GC-1", 5000), digital("a@b.com", 2500)]).is_ok());
    }

    #[test]
    fn test_activate_physical_stock_card() {
        let db = test_db();
        seed_stock_card(&db, "GC-AA11");

        let result = activate_cards(&db, &[physical("gc-aa11", 5000)], Some("Walk-in"), None, None)
            .unwrap();
        assert_eq!(result["success"], true);
        assert_eq!(result["cards"][0]["cardNumber"], "GC-AA11");
        assert_eq!(result["cards"][0]["balanceCents"], 5000);

        let card = lookup(&db, "GC-AA11").unwrap();
        assert_eq!(card["status"], "ACTIVE");
        assert_eq!(card["balanceCents"], 5000);
    }

    #[test]
    fn test_activate_unknown_physical_card_fails() {
        let db = test_db();
        let err = activate_cards(&db, &[physical("GC-NOPE", 5000)], None, None, None).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn test_activate_already_active_card_fails_atomically() {
        let db = test_db();
        seed_stock_card(&db, "GC-BB22");
        activate_cards(&db, &[physical("GC-BB22", 5000)], None, None, None).unwrap();

        // Batch of one good stock card + one already-active card must not
        // leave the good card activated.
        seed_stock_card(&db, "GC-CC33");
        let err = activate_cards(
            &db,
            &[physical("GC-CC33", 2500), physical("GC-BB22", 2500)],
            None,
            None,
            None,
        )
        .unwrap_err();
        assert!(err.contains("already"));

        let card = lookup(&db, "GC-CC33").unwrap();
        assert_eq!(card["status"], "INACTIVE", "rollback should undo activation");
    }

    #[test]
    fn test_activate_digital_generates_number() {
        let db = test_db();
        let result =
            activate_cards(&db, &[digital("iris@example.com", 2500)], None, Some("tx-1"), None)
                .unwrap();
        let number = result["cards"][0]["cardNumber"].as_str().unwrap();
        assert!(number.starts_with("GC-"));
        assert_eq!(number.len(), 15);

        let card = lookup(&db, number).unwrap();
        assert_eq!(card["cardType"], "DIGITAL");
        assert_eq!(card["recipientEmail"], "iris@example.com");
    }

    #[test]
    fn test_redeem_decrements_and_chains_entries() {
        let db = test_db();
        seed_stock_card(&db, "GC-DD44");
        activate_cards(&db, &[physical("GC-DD44", 10000)], None, None, None).unwrap();

        let first = redeem(&db, "GC-DD44", 3000, Some("tx-1"), None).unwrap();
        assert_eq!(first["balanceCents"], 7000);
        let second = redeem(&db, "GC-DD44", 7000, Some("tx-2"), None).unwrap();
        assert_eq!(second["balanceCents"], 0);
        assert_eq!(second["status"], "DEPLETED");

        // Entries chain: activation +10000/10000, redemptions -3000/7000, -7000/0
        let conn = db.conn.lock().unwrap();
        let entries: Vec<(String, i64, i64)> = conn
            .prepare(
                "SELECT entry_type, amount_cents, balance_cents FROM gift_card_entries
                 WHERE card_id = 'gc-GC-DD44' ORDER BY id",
            )
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();
        assert_eq!(
            entries,
            vec![
                ("ACTIVATION".to_string(), 10000, 10000),
                ("REDEMPTION".to_string(), -3000, 7000),
                ("REDEMPTION".to_string(), -7000, 0),
            ]
        );
    }

    #[test]
    fn test_redeem_insufficient_balance() {
        let db = test_db();
        seed_stock_card(&db, "GC-EE55");
        activate_cards(&db, &[physical("GC-EE55", 2500)], None, None, None).unwrap();

        let err = redeem(&db, "GC-EE55", 2600, None, None).unwrap_err();
        assert!(err.contains("less than"));

        // Balance untouched
        assert_eq!(available_balance(&db, "GC-EE55").unwrap(), 2500);
    }

    #[test]
    fn test_redeem_inactive_card_rejected() {
        let db = test_db();
        seed_stock_card(&db, "GC-FF66");
        let err = redeem(&db, "GC-FF66", 1000, None, None).unwrap_err();
        assert!(err.contains("inactive"));
    }

    #[test]
    fn test_available_balance_zero_for_inactive() {
        let db = test_db();
        seed_stock_card(&db, "GC-GG77");
        assert_eq!(available_balance(&db, "GC-GG77").unwrap(), 0);
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let db = test_db();
        seed_stock_card(&db, "GC-HH88");
        let card = lookup(&db, "gc-hh88").unwrap();
        assert_eq!(card["cardNumber"], "GC-HH88");
    }
}
