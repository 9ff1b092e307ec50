//! Payment transaction commitment.
//!
//! Converts a finalized list of payment legs plus order/customer context
//! into one atomically-committed transaction row. Everything that must not
//! survive a failure — the transaction, its legs, the order links, the
//! PAID flips, house-account charges, and the queued side effects — lands
//! in a single `BEGIN IMMEDIATE` write. Side effects themselves run after
//! commit (see `post_commit`).

use chrono::Utc;
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::house_accounts::{self, EntryType};
use crate::money::MIN_BALANCE;
use crate::orders;
use crate::post_commit;
use crate::tender::PaymentLeg;

/// Context for one transaction commit.
#[derive(Debug, Clone)]
pub struct CreateTransaction {
    pub customer_id: String,
    pub employee_id: Option<String>,
    pub channel: String,
    pub total_amount_cents: i64,
    pub tax_amount_cents: i64,
    pub tip_amount_cents: i64,
    pub notes: Option<String>,
    pub receipt_email: Option<String>,
    pub legs: Vec<PaymentLeg>,
    pub order_ids: Vec<String>,
}

/// Next human-readable transaction number (`PT-00001`), sequenced inside
/// the caller's transaction.
pub fn next_transaction_number(conn: &Connection) -> Result<String, String> {
    let value = db::next_counter_value(conn, "PT")?;
    Ok(format!("PT-{value:05}"))
}

/// Commit a multi-leg payment transaction.
///
/// Preconditions: at least one leg and one order, and the legs must sum to
/// the transaction total within the one-cent tolerance. Post-commit
/// actions passed in `side_effects` are enqueued in the same write so a
/// rollback discards them too.
pub fn create_transaction(
    db: &DbState,
    data: &CreateTransaction,
    side_effects: &[post_commit::Action],
) -> Result<Value, String> {
    if data.legs.is_empty() {
        return Err("At least one payment method is required".into());
    }
    if data.order_ids.is_empty() {
        return Err("At least one order is required".into());
    }

    let legs_total: i64 = data.legs.iter().map(|l| l.amount_cents).sum();
    if (legs_total - data.total_amount_cents).abs() > MIN_BALANCE {
        return Err("Payment methods total does not match transaction total".into());
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    // Customer must exist before we open the write transaction.
    let customer_exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM customers WHERE id = ?1",
            params![data.customer_id],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if customer_exists == 0 {
        return Err(format!("Customer not found: {}", data.customer_id));
    }

    let transaction_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<String, String> {
        let transaction_number = next_transaction_number(&conn)?;

        conn.execute(
            "INSERT INTO payment_transactions (
                id, transaction_number, channel, total_amount_cents, tax_amount_cents,
                tip_amount_cents, status, customer_id, employee_id, notes,
                receipt_email, created_at, completed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'COMPLETED', ?7, ?8, ?9, ?10, ?11, ?11)",
            params![
                transaction_id,
                transaction_number,
                data.channel,
                data.total_amount_cents,
                data.tax_amount_cents,
                data.tip_amount_cents,
                data.customer_id,
                data.employee_id,
                data.notes,
                data.receipt_email,
                now,
            ],
        )
        .map_err(|e| format!("insert transaction: {e}"))?;

        for leg in &data.legs {
            conn.execute(
                "INSERT INTO payment_methods (
                    id, transaction_id, method, provider, amount_cents,
                    provider_transaction_id, card_last4, card_brand, card_fingerprint,
                    gift_card_number, check_number, cash_received_cents,
                    change_given_cents, reference, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                params![
                    Uuid::new_v4().to_string(),
                    transaction_id,
                    leg.method.as_str(),
                    leg.provider.as_str(),
                    leg.amount_cents,
                    leg.provider_transaction_id,
                    leg.card_last4,
                    leg.card_brand,
                    leg.card_fingerprint,
                    leg.gift_card_number,
                    leg.check_number,
                    leg.cash_received_cents,
                    leg.change_given_cents,
                    leg.reference,
                    now,
                ],
            )
            .map_err(|e| format!("insert payment leg: {e}"))?;
        }

        // Link each order for its own payment amount and flip it to PAID.
        for order_id in &data.order_ids {
            let order_amount: i64 = conn
                .query_row(
                    "SELECT payment_amount_cents FROM orders WHERE id = ?1",
                    params![order_id],
                    |row| row.get(0),
                )
                .map_err(|_| format!("Order not found: {order_id}"))?;

            conn.execute(
                "INSERT INTO order_payments (id, transaction_id, order_id, amount_cents)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    transaction_id,
                    order_id,
                    order_amount,
                ],
            )
            .map_err(|e| format!("insert order payment: {e}"))?;
        }
        orders::mark_orders_paid(&conn, &data.order_ids)?;

        // House-account legs post CHARGE entries to the ledger in the same
        // write, keeping the running balance consistent with the payment.
        for leg in &data.legs {
            if leg.method == crate::tender::PaymentMethod::HouseAccount {
                house_accounts::post_entry_on_conn(
                    &conn,
                    &data.customer_id,
                    EntryType::Charge,
                    leg.amount_cents,
                    &format!("Order charge - {transaction_number}"),
                    Some(&transaction_number),
                    data.order_ids.first().map(String::as_str),
                    data.employee_id.as_deref(),
                )?;
            }
        }

        post_commit::enqueue(&conn, &transaction_id, side_effects)?;

        Ok(transaction_number)
    })();

    let transaction_number = match result {
        Ok(number) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            number
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!("transaction commit failed: {e}");
            return Err(e);
        }
    };

    info!(
        transaction_number = %transaction_number,
        total = data.total_amount_cents,
        legs = data.legs.len(),
        orders = data.order_ids.len(),
        "Payment transaction committed"
    );

    get_transaction_on_conn(&conn, &transaction_id)
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get a transaction with nested legs, order links, and refunds.
pub fn get_transaction(db: &DbState, transaction_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    get_transaction_on_conn(&conn, transaction_id)
}

fn get_transaction_on_conn(conn: &Connection, transaction_id: &str) -> Result<Value, String> {
    let mut transaction = conn
        .query_row(
            "SELECT id, transaction_number, channel, total_amount_cents, tax_amount_cents,
                    tip_amount_cents, status, customer_id, employee_id, notes,
                    receipt_email, created_at, completed_at
             FROM payment_transactions WHERE id = ?1",
            params![transaction_id],
            |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "transactionNumber": row.get::<_, String>(1)?,
                    "channel": row.get::<_, String>(2)?,
                    "totalAmountCents": row.get::<_, i64>(3)?,
                    "taxAmountCents": row.get::<_, i64>(4)?,
                    "tipAmountCents": row.get::<_, i64>(5)?,
                    "status": row.get::<_, String>(6)?,
                    "customerId": row.get::<_, Option<String>>(7)?,
                    "employeeId": row.get::<_, Option<String>>(8)?,
                    "notes": row.get::<_, Option<String>>(9)?,
                    "receiptEmail": row.get::<_, Option<String>>(10)?,
                    "createdAt": row.get::<_, Option<String>>(11)?,
                    "completedAt": row.get::<_, Option<String>>(12)?,
                }))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                format!("Transaction not found: {transaction_id}")
            }
            _ => format!("query transaction: {e}"),
        })?;

    let mut leg_stmt = conn
        .prepare(
            "SELECT method, provider, amount_cents, provider_transaction_id, card_last4,
                    card_brand, gift_card_number, check_number, cash_received_cents,
                    change_given_cents, reference
             FROM payment_methods WHERE transaction_id = ?1 ORDER BY created_at ASC, id ASC",
        )
        .map_err(|e| e.to_string())?;
    let legs: Vec<Value> = leg_stmt
        .query_map(params![transaction_id], |row| {
            Ok(serde_json::json!({
                "method": row.get::<_, String>(0)?,
                "provider": row.get::<_, String>(1)?,
                "amountCents": row.get::<_, i64>(2)?,
                "providerTransactionId": row.get::<_, Option<String>>(3)?,
                "cardLast4": row.get::<_, Option<String>>(4)?,
                "cardBrand": row.get::<_, Option<String>>(5)?,
                "giftCardNumber": row.get::<_, Option<String>>(6)?,
                "checkNumber": row.get::<_, Option<String>>(7)?,
                "cashReceivedCents": row.get::<_, Option<i64>>(8)?,
                "changeGivenCents": row.get::<_, Option<i64>>(9)?,
                "reference": row.get::<_, Option<String>>(10)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut link_stmt = conn
        .prepare(
            "SELECT op.order_id, op.amount_cents, o.order_number, o.payment_status
             FROM order_payments op
             JOIN orders o ON o.id = op.order_id
             WHERE op.transaction_id = ?1",
        )
        .map_err(|e| e.to_string())?;
    let order_payments: Vec<Value> = link_stmt
        .query_map(params![transaction_id], |row| {
            Ok(serde_json::json!({
                "orderId": row.get::<_, String>(0)?,
                "amountCents": row.get::<_, i64>(1)?,
                "orderNumber": row.get::<_, Option<i64>>(2)?,
                "paymentStatus": row.get::<_, String>(3)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut refund_stmt = conn
        .prepare(
            "SELECT refund_number, amount_cents, refund_type, reason, created_at
             FROM refunds WHERE transaction_id = ?1 ORDER BY created_at ASC",
        )
        .map_err(|e| e.to_string())?;
    let refunds: Vec<Value> = refund_stmt
        .query_map(params![transaction_id], |row| {
            Ok(serde_json::json!({
                "refundNumber": row.get::<_, String>(0)?,
                "amountCents": row.get::<_, i64>(1)?,
                "refundType": row.get::<_, String>(2)?,
                "reason": row.get::<_, String>(3)?,
                "createdAt": row.get::<_, Option<String>>(4)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    transaction["paymentMethods"] = Value::Array(legs);
    transaction["orderPayments"] = Value::Array(order_payments);
    transaction["refunds"] = Value::Array(refunds);
    Ok(transaction)
}

/// Transaction history for a customer, newest first.
pub fn list_customer_transactions(db: &DbState, customer_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(
            "SELECT id FROM payment_transactions
             WHERE customer_id = ?1 ORDER BY created_at DESC, id DESC",
        )
        .map_err(|e| e.to_string())?;
    let ids: Vec<String> = stmt
        .query_map(params![customer_id], |row| row.get(0))
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut transactions = Vec::with_capacity(ids.len());
    for id in ids {
        transactions.push(get_transaction_on_conn(&conn, &id)?);
    }

    Ok(serde_json::json!({ "transactions": transactions }))
}

/// Daily totals and per-method breakdown for the back office.
pub fn daily_summary(db: &DbState, date: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let day_start = format!("{date}T00:00:00");
    let day_end = format!("{date}T23:59:59.999999+00:00");

    let (count, total, tax, tips): (i64, i64, i64, i64) = conn
        .query_row(
            "SELECT COUNT(*), COALESCE(SUM(total_amount_cents), 0),
                    COALESCE(SUM(tax_amount_cents), 0), COALESCE(SUM(tip_amount_cents), 0)
             FROM payment_transactions
             WHERE created_at >= ?1 AND created_at <= ?2",
            params![day_start, day_end],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )
        .map_err(|e| format!("query daily totals: {e}"))?;

    let mut stmt = conn
        .prepare(
            "SELECT pm.method || '_' || pm.provider, COUNT(*), SUM(pm.amount_cents)
             FROM payment_methods pm
             JOIN payment_transactions pt ON pt.id = pm.transaction_id
             WHERE pt.created_at >= ?1 AND pt.created_at <= ?2
             GROUP BY pm.method, pm.provider",
        )
        .map_err(|e| e.to_string())?;

    let mut breakdown = serde_json::Map::new();
    let rows = stmt
        .query_map(params![day_start, day_end], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(|e| e.to_string())?;
    for (key, method_count, method_total) in rows.flatten() {
        breakdown.insert(
            key,
            serde_json::json!({ "count": method_count, "amountCents": method_total }),
        );
    }

    Ok(serde_json::json!({
        "date": date,
        "totalTransactions": count,
        "totalAmountCents": total,
        "totalTaxCents": tax,
        "totalTipsCents": tips,
        "paymentMethodBreakdown": breakdown,
    }))
}

// ===========================================================================
// Tests
// ===========================================================================
