//! Post-commit side-effect queue.
//!
//! Side effects of a payment (gift-card activation and redemption,
//! discount usage recording, receipt email, print job, card-fingerprint
//! matching) run after the transaction has committed, never inside it.
//! Each action is enqueued in the same write transaction as the payment,
//! then executed best-effort in order. A failed action records its error
//! and is surfaced to the operator; it never rolls back the payment.

use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};

use crate::customers;
use crate::db::DbState;
use crate::discounts;
use crate::gift_cards::{self, CardActivation};
use crate::notifications::Notifier;

/// One queued action.
#[derive(Debug, Clone)]
pub struct Action {
    pub action_type: &'static str,
    pub payload: Value,
}

pub const GIFT_CARD_ACTIVATION: &str = "GIFT_CARD_ACTIVATION";
pub const GIFT_CARD_REDEMPTION: &str = "GIFT_CARD_REDEMPTION";
pub const DISCOUNT_USAGE: &str = "DISCOUNT_USAGE";
pub const RECEIPT_EMAIL: &str = "RECEIPT_EMAIL";
pub const PRINT_JOB: &str = "PRINT_JOB";
pub const CARD_FINGERPRINT_MATCH: &str = "CARD_FINGERPRINT_MATCH";

/// Enqueue actions inside the caller's transaction so the queue rows
/// commit (or roll back) together with the payment.
pub fn enqueue(
    conn: &Connection,
    transaction_id: &str,
    actions: &[Action],
) -> Result<(), String> {
    for action in actions {
        conn.execute(
            "INSERT INTO post_commit_queue (transaction_id, action_type, payload)
             VALUES (?1, ?2, ?3)",
            params![transaction_id, action.action_type, action.payload.to_string()],
        )
        .map_err(|e| format!("enqueue {}: {e}", action.action_type))?;
    }
    Ok(())
}

/// Execute every pending action for a transaction, in queue order.
///
/// Returns the list of failure messages (`"<action> failed: <err>"`);
/// an empty list means every side effect landed.
pub fn run_pending(db: &DbState, notifier: &dyn Notifier, transaction_id: &str) -> Vec<String> {
    let pending: Vec<(i64, String, String)> = {
        let conn = match db.conn.lock() {
            Ok(c) => c,
            Err(e) => return vec![format!("post-commit queue unavailable: {e}")],
        };
        let mut stmt = match conn.prepare(
            "SELECT id, action_type, payload FROM post_commit_queue
             WHERE transaction_id = ?1 AND status = 'pending'
             ORDER BY id ASC",
        ) {
            Ok(s) => s,
            Err(e) => return vec![format!("post-commit queue query failed: {e}")],
        };
        stmt.query_map(params![transaction_id], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default()
    };

    let mut failures = Vec::new();

    for (queue_id, action_type, raw_payload) in pending {
        let payload: Value = serde_json::from_str(&raw_payload).unwrap_or(Value::Null);
        let result = run_action(db, notifier, &action_type, &payload);

        match &result {
            Ok(()) => mark_done(db, queue_id),
            Err(e) => {
                warn!(action = %action_type, queue_id, "post-commit action failed: {e}");
                mark_failed(db, queue_id, e);
                failures.push(format!("{action_type} failed: {e}"));
            }
        }
    }

    failures
}

fn run_action(
    db: &DbState,
    notifier: &dyn Notifier,
    action_type: &str,
    payload: &Value,
) -> Result<(), String> {
    match action_type {
        GIFT_CARD_ACTIVATION => {
            let cards: Vec<CardActivation> =
                serde_json::from_value(payload["cards"].clone())
                    .map_err(|e| format!("invalid activation payload: {e}"))?;
            gift_cards::activate_cards(
                db,
                &cards,
                payload["purchasedBy"].as_str(),
                payload["transactionId"].as_str(),
                payload["employeeId"].as_str(),
            )?;
            Ok(())
        }
        GIFT_CARD_REDEMPTION => {
            let card_number = payload["cardNumber"]
                .as_str()
                .ok_or("redemption payload missing cardNumber")?;
            let amount = payload["amountCents"]
                .as_i64()
                .ok_or("redemption payload missing amountCents")?;
            gift_cards::redeem(
                db,
                card_number,
                amount,
                payload["transactionId"].as_str(),
                payload["employeeId"].as_str(),
            )?;
            Ok(())
        }
        DISCOUNT_USAGE => {
            let discount_id = payload["discountId"]
                .as_str()
                .ok_or("usage payload missing discountId")?;
            discounts::record_usage(
                db,
                discount_id,
                payload["customerId"].as_str(),
                payload["orderId"].as_str(),
                payload["transactionId"].as_str(),
            )?;
            Ok(())
        }
        RECEIPT_EMAIL => notifier.send_receipt_email(payload),
        PRINT_JOB => notifier.submit_print_job(payload),
        CARD_FINGERPRINT_MATCH => {
            let customer_id = payload["customerId"]
                .as_str()
                .ok_or("fingerprint payload missing customerId")?;
            let fingerprint = payload["fingerprint"]
                .as_str()
                .ok_or("fingerprint payload missing fingerprint")?;
            customers::record_card_fingerprint(
                db,
                customer_id,
                fingerprint,
                payload["cardLast4"].as_str(),
                payload["cardBrand"].as_str(),
            )?;
            Ok(())
        }
        other => Err(format!("unknown action type {other}")),
    }
}

fn mark_done(db: &DbState, queue_id: i64) {
    if let Ok(conn) = db.conn.lock() {
        let _ = conn.execute(
            "UPDATE post_commit_queue SET status = 'completed', attempts = attempts + 1,
                    updated_at = datetime('now')
             WHERE id = ?1",
            params![queue_id],
        );
    }
}

fn mark_failed(db: &DbState, queue_id: i64, error: &str) {
    if let Ok(conn) = db.conn.lock() {
        let _ = conn.execute(
            "UPDATE post_commit_queue SET status = 'failed', attempts = attempts + 1,
                    last_error = ?1, updated_at = datetime('now')
             WHERE id = ?2",
            params![error, queue_id],
        );
    }
}

/// Retry a previously failed action by id (operator remediation).
pub fn retry_action(db: &DbState, notifier: &dyn Notifier, queue_id: i64) -> Result<Value, String> {
    let (action_type, raw_payload, status): (String, String, String) = {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row(
            "SELECT action_type, payload, status FROM post_commit_queue WHERE id = ?1",
            params![queue_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Queue entry not found: {queue_id}"),
            _ => format!("query queue entry: {e}"),
        })?
    };

    if status == "completed" {
        return Ok(serde_json::json!({ "success": true, "alreadyCompleted": true }));
    }

    let payload: Value = serde_json::from_str(&raw_payload).unwrap_or(Value::Null);
    match run_action(db, notifier, &action_type, &payload) {
        Ok(()) => {
            mark_done(db, queue_id);
            info!(queue_id, action = %action_type, "post-commit action retried successfully");
            Ok(serde_json::json!({ "success": true }))
        }
        Err(e) => {
            mark_failed(db, queue_id, &e);
            Err(format!("{action_type} failed: {e}"))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
