//! Refund engine.
//!
//! Reverses all or part of a committed payment transaction while keeping
//! refund amounts, tender attribution, and order status consistent.
//!
//! **Shape of a refund:** one `refunds` row (RF-NNNNN), one or more
//! `refund_methods` (the tenders receiving the reversal, which may differ
//! from the original payment tenders), and one `order_refunds` row per
//! affected order. All three always sum to the same total.
//!
//! **Provider boundary:** a real card reversal calls the provider API
//! *before* the database transaction opens; the network call cannot be
//! wrapped in the local write. Manual/offline tenders never call out.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::house_accounts::{self, EntryType};
use crate::money::prorate;
use crate::orders;
use crate::providers::ProviderFactory;
use crate::tender::{PaymentMethod, Provider};

// ---------------------------------------------------------------------------
// Refundable amounts
// ---------------------------------------------------------------------------

/// Amount still refundable for an order: its payment amount minus every
/// refund already attributed to it.
pub fn refundable_amount(conn: &Connection, order_id: &str) -> Result<i64, String> {
    let payment_amount: i64 = conn
        .query_row(
            "SELECT payment_amount_cents FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Order not found: {order_id}"),
            _ => format!("query order: {e}"),
        })?;

    let refunded: i64 = conn
        .query_row(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM order_refunds WHERE order_id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .unwrap_or(0);

    Ok((payment_amount - refunded).max(0))
}

/// Refund summary for an order, consumed by the refund modal.
pub fn get_order_refund_summary(db: &DbState, order_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let payment_amount: i64 = conn
        .query_row(
            "SELECT payment_amount_cents FROM orders WHERE id = ?1",
            params![order_id],
            |row| row.get(0),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Order not found: {order_id}"),
            _ => format!("query order: {e}"),
        })?;
    let refundable = refundable_amount(&conn, order_id)?;

    Ok(serde_json::json!({
        "orderId": order_id,
        "paymentAmountCents": payment_amount,
        "refundedCents": payment_amount - refundable,
        "refundableCents": refundable,
    }))
}

// ---------------------------------------------------------------------------
// Itemized refund draft
// ---------------------------------------------------------------------------

/// One order item available for an itemized refund.
#[derive(Debug, Clone)]
pub struct DraftItem {
    pub order_item_id: String,
    pub description: String,
    pub row_total_cents: i64,
    pub refund_cents: i64,
}

/// Headless state for building a PARTIAL refund.
///
/// Tax defaults to proration over the refunded item share and recomputes
/// on every item edit, until the operator sets it manually; from then on
/// the override is sticky for the rest of the draft.
#[derive(Debug)]
pub struct RefundDraft {
    items: Vec<DraftItem>,
    original_tax_cents: i64,
    delivery_fee_cents: i64,
    delivery_fee_refund_cents: i64,
    tax_refund_cents: i64,
    tax_overridden: bool,
}

impl RefundDraft {
    pub fn new(items: Vec<DraftItem>, original_tax_cents: i64, delivery_fee_cents: i64) -> Self {
        RefundDraft {
            items,
            original_tax_cents,
            delivery_fee_cents,
            delivery_fee_refund_cents: 0,
            tax_refund_cents: 0,
            tax_overridden: false,
        }
    }

    /// Load the draft for an order from its item rows.
    pub fn for_order(db: &DbState, order_id: &str) -> Result<Self, String> {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        let (tax, delivery_fee): (i64, i64) = conn
            .query_row(
                "SELECT tax_cents, delivery_fee_cents FROM orders WHERE id = ?1",
                params![order_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => format!("Order not found: {order_id}"),
                _ => format!("query order: {e}"),
            })?;

        let mut stmt = conn
            .prepare(
                "SELECT id, description, row_total_cents FROM order_items
                 WHERE order_id = ?1 ORDER BY rowid ASC",
            )
            .map_err(|e| e.to_string())?;
        let items: Vec<DraftItem> = stmt
            .query_map(params![order_id], |row| {
                Ok(DraftItem {
                    order_item_id: row.get(0)?,
                    description: row.get(1)?,
                    row_total_cents: row.get(2)?,
                    refund_cents: 0,
                })
            })
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();

        Ok(RefundDraft::new(items, tax, delivery_fee))
    }

    fn item_row_total(&self) -> i64 {
        self.items.iter().map(|i| i.row_total_cents).sum()
    }

    pub fn item_refund_total(&self) -> i64 {
        self.items.iter().map(|i| i.refund_cents).sum()
    }

    /// Set the refund amount for one item. Each item refund is capped at
    /// that item's row total. Recomputes prorated tax unless overridden.
    pub fn set_item_refund(&mut self, order_item_id: &str, amount_cents: i64) -> Result<(), String> {
        let item = self
            .items
            .iter_mut()
            .find(|i| i.order_item_id == order_item_id)
            .ok_or_else(|| format!("Order item not found: {order_item_id}"))?;
        if amount_cents < 0 {
            return Err("Item refund cannot be negative".into());
        }
        if amount_cents > item.row_total_cents {
            return Err(format!(
                "Item refund exceeds the item total for {}",
                item.description
            ));
        }
        item.refund_cents = amount_cents;

        if !self.tax_overridden {
            self.tax_refund_cents = prorate(
                self.original_tax_cents,
                self.item_refund_total(),
                self.item_row_total(),
            );
        }
        Ok(())
    }

    /// Set the delivery-fee refund, capped at the original fee.
    pub fn set_delivery_fee_refund(&mut self, amount_cents: i64) -> Result<(), String> {
        if amount_cents < 0 || amount_cents > self.delivery_fee_cents {
            return Err("Delivery fee refund exceeds the original fee".into());
        }
        self.delivery_fee_refund_cents = amount_cents;
        Ok(())
    }

    /// Manually set the tax refund. From here on auto-proration stops for
    /// this draft, even if items keep changing.
    pub fn set_tax_refund(&mut self, amount_cents: i64) -> Result<(), String> {
        if amount_cents < 0 {
            return Err("Tax refund cannot be negative".into());
        }
        self.tax_refund_cents = amount_cents;
        self.tax_overridden = true;
        Ok(())
    }

    pub fn tax_refund_cents(&self) -> i64 {
        self.tax_refund_cents
    }

    pub fn delivery_fee_refund_cents(&self) -> i64 {
        self.delivery_fee_refund_cents
    }

    pub fn total_cents(&self) -> i64 {
        self.item_refund_total() + self.tax_refund_cents + self.delivery_fee_refund_cents
    }

    /// Item breakdown as stored on the refund row.
    pub fn item_breakdown(&self) -> Value {
        Value::Array(
            self.items
                .iter()
                .filter(|i| i.refund_cents > 0)
                .map(|i| {
                    serde_json::json!({
                        "orderItemId": i.order_item_id,
                        "description": i.description,
                        "rowTotalCents": i.row_total_cents,
                        "refundCents": i.refund_cents,
                    })
                })
                .collect(),
        )
    }

    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "items": self.items.iter().map(|i| serde_json::json!({
                "orderItemId": i.order_item_id,
                "description": i.description,
                "rowTotalCents": i.row_total_cents,
                "refundCents": i.refund_cents,
            })).collect::<Vec<_>>(),
            "itemRefundTotalCents": self.item_refund_total(),
            "taxRefundCents": self.tax_refund_cents,
            "taxOverridden": self.tax_overridden,
            "deliveryFeeRefundCents": self.delivery_fee_refund_cents,
            "totalCents": self.total_cents(),
        })
    }
}

// ---------------------------------------------------------------------------
// Processing
// ---------------------------------------------------------------------------

/// One tender receiving part of the reversal.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefundMethod {
    pub method: PaymentMethod,
    #[serde(default = "default_provider")]
    pub provider: Provider,
    pub amount_cents: i64,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    #[serde(default)]
    pub provider_refund_id: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_provider() -> Provider {
    Provider::Internal
}

/// Per-order attribution of the refund total.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRefund {
    pub order_id: String,
    pub amount_cents: i64,
}

/// Full refund request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRefund {
    pub transaction_id: String,
    pub refund_type: String,
    pub total_amount_cents: i64,
    pub reason: String,
    #[serde(default)]
    pub employee_id: Option<String>,
    pub order_refunds: Vec<OrderRefund>,
    #[serde(default)]
    pub item_breakdown: Option<Value>,
    #[serde(default)]
    pub tax_refunded_cents: i64,
    #[serde(default)]
    pub delivery_fee_refunded_cents: i64,
    pub refund_methods: Vec<RefundMethod>,
}

/// True when this method needs a live provider reversal.
fn needs_provider_call(method: &RefundMethod) -> bool {
    method.method == PaymentMethod::Card
        && matches!(method.provider, Provider::Stripe | Provider::Square)
        && method.provider_refund_id.is_none()
}

/// Process a refund end to end.
///
/// Validation gates run before any write; provider reversals run outside
/// the database transaction; all local persistence is one atomic write.
pub fn process_refund(
    db: &DbState,
    factory: &dyn ProviderFactory,
    data: &ProcessRefund,
) -> Result<Value, String> {
    // -- Validation gates (no writes yet) ---------------------------------
    if data.refund_methods.is_empty() {
        return Err("A refund method is required".into());
    }
    if data.reason.trim().is_empty() {
        return Err("A refund reason is required".into());
    }
    if data.total_amount_cents <= 0 {
        return Err("Refund amount must be greater than zero".into());
    }
    if data.refund_type != "FULL" && data.refund_type != "PARTIAL" {
        return Err(format!("Invalid refund type: {}", data.refund_type));
    }
    if data.order_refunds.is_empty() {
        return Err("At least one order refund is required".into());
    }

    let methods_total: i64 = data.refund_methods.iter().map(|m| m.amount_cents).sum();
    if methods_total != data.total_amount_cents {
        return Err("Refund methods total does not match refund amount".into());
    }
    let orders_total: i64 = data.order_refunds.iter().map(|o| o.amount_cents).sum();
    if orders_total != data.total_amount_cents {
        return Err("Order refund amounts do not match refund amount".into());
    }

    {
        let conn = db.conn.lock().map_err(|e| e.to_string())?;

        let tx_exists: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM payment_transactions WHERE id = ?1",
                params![data.transaction_id],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if tx_exists == 0 {
            return Err(format!("Transaction not found: {}", data.transaction_id));
        }

        // Refund bound: no order's cumulative refunds may exceed what was
        // paid for it.
        for order_refund in &data.order_refunds {
            if order_refund.amount_cents < 0 {
                return Err("Order refund amounts cannot be negative".into());
            }
            let refundable = refundable_amount(&conn, &order_refund.order_id)?;
            if order_refund.amount_cents > refundable {
                return Err(format!(
                    "Refund for order {} exceeds its refundable amount",
                    order_refund.order_id
                ));
            }
        }
    }

    // -- Provider reversals (outside the DB transaction) ------------------
    let mut resolved_methods = data.refund_methods.clone();
    for method in &mut resolved_methods {
        if !needs_provider_call(method) {
            continue;
        }
        let charge_id = method
            .provider_transaction_id
            .as_deref()
            .ok_or("Card refund requires the original provider transaction id")?;

        let client = factory.client(method.provider)?;
        let provider_refund = client.refund(charge_id, method.amount_cents)?;
        info!(
            provider = client.name(),
            refund_id = %provider_refund.refund_id,
            amount = method.amount_cents,
            "provider refund confirmed"
        );
        method.provider_refund_id = Some(provider_refund.refund_id);
        method.status = Some(provider_refund.status);
    }

    // -- Atomic local persistence -----------------------------------------
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    let refund_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<String, String> {
        let refund_number = format!("RF-{:05}", db::next_counter_value(&conn, "RF")?);

        conn.execute(
            "INSERT INTO refunds (
                id, transaction_id, refund_number, amount_cents, refund_type, reason,
                employee_id, item_breakdown, tax_refunded_cents,
                delivery_fee_refunded_cents, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                refund_id,
                data.transaction_id,
                refund_number,
                data.total_amount_cents,
                data.refund_type,
                data.reason.trim(),
                data.employee_id,
                data.item_breakdown
                    .clone()
                    .unwrap_or_else(|| Value::Array(Vec::new()))
                    .to_string(),
                data.tax_refunded_cents,
                data.delivery_fee_refunded_cents,
                now,
            ],
        )
        .map_err(|e| format!("insert refund: {e}"))?;

        for method in &resolved_methods {
            conn.execute(
                "INSERT INTO refund_methods (
                    id, refund_id, method, provider, amount_cents,
                    provider_refund_id, status
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    Uuid::new_v4().to_string(),
                    refund_id,
                    method.method.as_str(),
                    method.provider.as_str(),
                    method.amount_cents,
                    method.provider_refund_id,
                    method.status.as_deref().unwrap_or("completed"),
                ],
            )
            .map_err(|e| format!("insert refund method: {e}"))?;
        }

        for order_refund in &data.order_refunds {
            conn.execute(
                "INSERT INTO order_refunds (id, refund_id, order_id, amount_cents)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    Uuid::new_v4().to_string(),
                    refund_id,
                    order_refund.order_id,
                    order_refund.amount_cents,
                ],
            )
            .map_err(|e| format!("insert order refund: {e}"))?;
        }

        // Refunding back onto the house account credits the ledger.
        let house_account_total: i64 = resolved_methods
            .iter()
            .filter(|m| m.method == PaymentMethod::HouseAccount)
            .map(|m| m.amount_cents)
            .sum();
        if house_account_total > 0 {
            let customer_id: Option<String> = conn
                .query_row(
                    "SELECT customer_id FROM payment_transactions WHERE id = ?1",
                    params![data.transaction_id],
                    |row| row.get(0),
                )
                .unwrap_or(None);
            if let Some(customer_id) = customer_id {
                house_accounts::post_entry_on_conn(
                    &conn,
                    &customer_id,
                    EntryType::Adjustment,
                    -house_account_total,
                    &format!("Refund - {refund_number}"),
                    Some(&refund_number),
                    None,
                    data.employee_id.as_deref(),
                )?;
            }
        }

        // Order statuses from cumulative refunds.
        let order_ids: Vec<String> = data
            .order_refunds
            .iter()
            .map(|o| o.order_id.clone())
            .collect();
        orders::recalculate_payment_statuses(&conn, &order_ids)?;

        // Parent transaction status from the sum of all its refunds.
        let (total_refunded, tx_total): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE((SELECT SUM(amount_cents) FROM refunds WHERE transaction_id = ?1), 0),
                        total_amount_cents
                 FROM payment_transactions WHERE id = ?1",
                params![data.transaction_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .map_err(|e| format!("query refund totals: {e}"))?;
        let tx_status = if total_refunded >= tx_total {
            "REFUNDED"
        } else {
            "PARTIALLY_REFUNDED"
        };
        conn.execute(
            "UPDATE payment_transactions SET status = ?1 WHERE id = ?2",
            params![tx_status, data.transaction_id],
        )
        .map_err(|e| format!("update transaction status: {e}"))?;

        Ok(refund_number)
    })();

    match result {
        Ok(refund_number) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
            info!(
                refund_number = %refund_number,
                amount = data.total_amount_cents,
                "Refund processed"
            );
            drop(conn);
            get_refund(db, &refund_number)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!("refund persistence failed: {e}");
            Err(e)
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get a refund with its methods and order attributions.
pub fn get_refund(db: &DbState, refund_number: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let (refund_id, mut refund) = conn
        .query_row(
            "SELECT id, transaction_id, refund_number, amount_cents, refund_type, reason,
                    employee_id, item_breakdown, tax_refunded_cents,
                    delivery_fee_refunded_cents, created_at
             FROM refunds WHERE refund_number = ?1",
            params![refund_number],
            |row| {
                let id: String = row.get(0)?;
                let breakdown: String = row.get(7)?;
                Ok((
                    id,
                    serde_json::json!({
                        "transactionId": row.get::<_, String>(1)?,
                        "refundNumber": row.get::<_, String>(2)?,
                        "amountCents": row.get::<_, i64>(3)?,
                        "refundType": row.get::<_, String>(4)?,
                        "reason": row.get::<_, String>(5)?,
                        "employeeId": row.get::<_, Option<String>>(6)?,
                        "itemBreakdown": serde_json::from_str::<Value>(&breakdown)
                            .unwrap_or_else(|_| Value::Array(Vec::new())),
                        "taxRefundedCents": row.get::<_, i64>(8)?,
                        "deliveryFeeRefundedCents": row.get::<_, i64>(9)?,
                        "createdAt": row.get::<_, Option<String>>(10)?,
                    }),
                ))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Refund not found: {refund_number}"),
            _ => format!("query refund: {e}"),
        })?;

    let mut method_stmt = conn
        .prepare(
            "SELECT method, provider, amount_cents, provider_refund_id, status
             FROM refund_methods WHERE refund_id = ?1",
        )
        .map_err(|e| e.to_string())?;
    let methods: Vec<Value> = method_stmt
        .query_map(params![refund_id], |row| {
            Ok(serde_json::json!({
                "method": row.get::<_, String>(0)?,
                "provider": row.get::<_, String>(1)?,
                "amountCents": row.get::<_, i64>(2)?,
                "providerRefundId": row.get::<_, Option<String>>(3)?,
                "status": row.get::<_, String>(4)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut order_stmt = conn
        .prepare(
            "SELECT order_id, amount_cents FROM order_refunds WHERE refund_id = ?1",
        )
        .map_err(|e| e.to_string())?;
    let order_refunds: Vec<Value> = order_stmt
        .query_map(params![refund_id], |row| {
            Ok(serde_json::json!({
                "orderId": row.get::<_, String>(0)?,
                "amountCents": row.get::<_, i64>(1)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    refund["refundMethods"] = Value::Array(methods);
    refund["orderRefunds"] = Value::Array(order_refunds);
    Ok(refund)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::providers::test_support::{MockFactory, MockProvider};
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

    /// Seed a customer, a PAID order, and a COMPLETED cash transaction.
    fn seed_paid_order(db: &DbState, suffix: &str, amount: i64) -> (String, String) {
        let conn = db.conn.lock().unwrap();
        let customer_id = format!("cust-{suffix}");
        let order_id = format!("ord-{suffix}");
        let tx_id = format!("tx-{suffix}");
        conn.execute(
            "INSERT INTO customers (id, first_name, last_name) VALUES (?1, 'Iris', 'Bloom')",
            params![customer_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO orders (id, customer_id, status, payment_status, payment_amount_cents, tax_cents)
             VALUES (?1, ?2, 'PAID', 'PAID', ?3, 0)",
            params![order_id, customer_id, amount],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO payment_transactions (id, transaction_number, total_amount_cents, customer_id)
             VALUES (?1, ?2, ?3, ?4)",
            params![tx_id, format!("PT-{suffix}"), amount, customer_id],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO payment_methods (id, transaction_id, method, amount_cents)
             VALUES (?1, ?2, 'CASH', ?3)",
            params![format!("pm-{suffix}"), tx_id, amount],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO order_payments (id, transaction_id, order_id, amount_cents)
             VALUES (?1, ?2, ?3, ?4)",
            params![format!("op-{suffix}"), tx_id, order_id, amount],
        )
        .unwrap();
        (order_id, tx_id)
    }

    fn cash_refund(tx_id: &str, order_id: &str, amount: i64) -> ProcessRefund {
        ProcessRefund {
            transaction_id: tx_id.to_string(),
            refund_type: "PARTIAL".to_string(),
            total_amount_cents: amount,
            reason: "Customer returned items".to_string(),
            employee_id: Some("emp-1".to_string()),
            order_refunds: vec![OrderRefund {
                order_id: order_id.to_string(),
                amount_cents: amount,
            }],
            item_breakdown: None,
            tax_refunded_cents: 0,
            delivery_fee_refunded_cents: 0,
            refund_methods: vec![RefundMethod {
                method: PaymentMethod::Cash,
                provider: Provider::Internal,
                amount_cents: amount,
                provider_transaction_id: None,
                provider_refund_id: None,
                status: None,
            }],
        }
    }

    #[test]
    fn test_full_refund_flips_statuses() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "f1", 8000);
        let factory = MockFactory(MockProvider::succeeding());

        let mut data = cash_refund(&tx_id, &order_id, 8000);
        data.refund_type = "FULL".to_string();
        let refund = process_refund(&db, &factory, &data).unwrap();
        assert_eq!(refund["refundNumber"], "RF-00001");
        assert_eq!(refund["amountCents"], 8000);

        let conn = db.conn.lock().unwrap();
        let order_status: String = conn
            .query_row(
                "SELECT payment_status FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(order_status, "REFUNDED");
        let tx_status: String = conn
            .query_row(
                "SELECT status FROM payment_transactions WHERE id = ?1",
                params![tx_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tx_status, "REFUNDED");
        // No provider calls for cash
        assert_eq!(factory.0.calls.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_partial_refund_statuses() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "p1", 8000);
        let factory = MockFactory(MockProvider::succeeding());

        process_refund(&db, &factory, &cash_refund(&tx_id, &order_id, 3000)).unwrap();

        let conn = db.conn.lock().unwrap();
        let order_status: String = conn
            .query_row(
                "SELECT payment_status FROM orders WHERE id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(order_status, "PARTIALLY_REFUNDED");
        let tx_status: String = conn
            .query_row(
                "SELECT status FROM payment_transactions WHERE id = ?1",
                params![tx_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tx_status, "PARTIALLY_REFUNDED");
    }

    #[test]
    fn test_refund_bound_enforced_cumulatively() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "b1", 5000);
        let factory = MockFactory(MockProvider::succeeding());

        process_refund(&db, &factory, &cash_refund(&tx_id, &order_id, 3000)).unwrap();
        // 3000 already refunded; another 3000 would exceed paymentAmount
        let err =
            process_refund(&db, &factory, &cash_refund(&tx_id, &order_id, 3000)).unwrap_err();
        assert!(err.contains("exceeds its refundable amount"));
        // 2000 exactly exhausts it
        process_refund(&db, &factory, &cash_refund(&tx_id, &order_id, 2000)).unwrap();

        let conn = db.conn.lock().unwrap();
        let refunded: i64 = conn
            .query_row(
                "SELECT SUM(amount_cents) FROM order_refunds WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(refunded, 5000);
    }

    #[test]
    fn test_validation_gates() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "v1", 5000);
        let factory = MockFactory(MockProvider::succeeding());

        // Missing reason
        let mut no_reason = cash_refund(&tx_id, &order_id, 1000);
        no_reason.reason = "  ".to_string();
        assert!(process_refund(&db, &factory, &no_reason)
            .unwrap_err()
            .contains("reason"));

        // No methods
        let mut no_methods = cash_refund(&tx_id, &order_id, 1000);
        no_methods.refund_methods.clear();
        assert!(process_refund(&db, &factory, &no_methods)
            .unwrap_err()
            .contains("refund method"));

        // Zero amount
        let mut zero = cash_refund(&tx_id, &order_id, 1000);
        zero.total_amount_cents = 0;
        zero.refund_methods[0].amount_cents = 0;
        zero.order_refunds[0].amount_cents = 0;
        assert!(process_refund(&db, &factory, &zero)
            .unwrap_err()
            .contains("greater than zero"));

        // Method sum mismatch
        let mut mismatch = cash_refund(&tx_id, &order_id, 1000);
        mismatch.refund_methods[0].amount_cents = 900;
        assert!(process_refund(&db, &factory, &mismatch)
            .unwrap_err()
            .contains("does not match"));

        // Unknown transaction
        let ghost = cash_refund("tx-ghost", &order_id, 1000);
        assert!(process_refund(&db, &factory, &ghost)
            .unwrap_err()
            .contains("not found"));

        // None of the failures persisted anything
        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM refunds", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_card_refund_calls_provider_and_stores_refund_id() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "c1", 6000);
        let mock = MockProvider::succeeding();
        let factory = MockFactory(std::sync::Arc::clone(&mock));

        let mut data = cash_refund(&tx_id, &order_id, 6000);
        data.refund_methods = vec![RefundMethod {
            method: PaymentMethod::Card,
            provider: Provider::Stripe,
            amount_cents: 6000,
            provider_transaction_id: Some("pi_original".to_string()),
            provider_refund_id: None,
            status: None,
        }];

        let refund = process_refund(&db, &factory, &data).unwrap();
        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("pi_original".to_string(), 6000));
        assert_eq!(
            refund["refundMethods"][0]["providerRefundId"],
            "re_mock_6000"
        );
    }

    #[test]
    fn test_card_refund_with_existing_refund_id_skips_provider() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "c2", 6000);
        let mock = MockProvider::succeeding();
        let factory = MockFactory(std::sync::Arc::clone(&mock));

        let mut data = cash_refund(&tx_id, &order_id, 6000);
        data.refund_methods = vec![RefundMethod {
            method: PaymentMethod::Card,
            provider: Provider::Stripe,
            amount_cents: 6000,
            provider_transaction_id: Some("pi_original".to_string()),
            provider_refund_id: Some("re_done".to_string()),
            status: Some("succeeded".to_string()),
        }];

        process_refund(&db, &factory, &data).unwrap();
        assert_eq!(mock.calls.lock().unwrap().len(), 0);
    }

    #[test]
    fn test_provider_failure_persists_nothing() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "c3", 6000);
        let factory = MockFactory(MockProvider::failing("card declined"));

        let mut data = cash_refund(&tx_id, &order_id, 6000);
        data.refund_methods = vec![RefundMethod {
            method: PaymentMethod::Card,
            provider: Provider::Square,
            amount_cents: 6000,
            provider_transaction_id: Some("sq_pay_1".to_string()),
            provider_refund_id: None,
            status: None,
        }];

        let err = process_refund(&db, &factory, &data).unwrap_err();
        assert!(err.contains("declined"));

        let conn = db.conn.lock().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM refunds", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn test_card_refund_requires_original_charge_id() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "c4", 6000);
        let factory = MockFactory(MockProvider::succeeding());

        let mut data = cash_refund(&tx_id, &order_id, 6000);
        data.refund_methods = vec![RefundMethod {
            method: PaymentMethod::Card,
            provider: Provider::Stripe,
            amount_cents: 6000,
            provider_transaction_id: None,
            provider_refund_id: None,
            status: None,
        }];

        let err = process_refund(&db, &factory, &data).unwrap_err();
        assert!(err.contains("provider transaction id"));
    }

    #[test]
    fn test_house_account_refund_credits_ledger() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "h1", 4000);
        let factory = MockFactory(MockProvider::succeeding());

        let mut data = cash_refund(&tx_id, &order_id, 4000);
        data.refund_methods = vec![RefundMethod {
            method: PaymentMethod::HouseAccount,
            provider: Provider::Internal,
            amount_cents: 4000,
            provider_transaction_id: None,
            provider_refund_id: None,
            status: None,
        }];

        process_refund(&db, &factory, &data).unwrap();

        let conn = db.conn.lock().unwrap();
        let (entry_type, amount, balance): (String, i64, i64) = conn
            .query_row(
                "SELECT entry_type, amount_cents, balance_cents FROM house_account_ledger
                 WHERE customer_id = 'cust-h1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(entry_type, "ADJUSTMENT");
        assert_eq!(amount, -4000);
        assert_eq!(balance, -4000);
    }

    #[test]
    fn test_split_refund_across_two_tenders() {
        let db = test_db();
        let (order_id, tx_id) = seed_paid_order(&db, "s1", 10000);
        let factory = MockFactory(MockProvider::succeeding());

        let mut data = cash_refund(&tx_id, &order_id, 10000);
        data.refund_methods = vec![
            RefundMethod {
                method: PaymentMethod::Cash,
                provider: Provider::Internal,
                amount_cents: 4000,
                provider_transaction_id: None,
                provider_refund_id: None,
                status: None,
            },
            RefundMethod {
                method: PaymentMethod::StoreCredit,
                provider: Provider::Internal,
                amount_cents: 6000,
                provider_transaction_id: None,
                provider_refund_id: None,
                status: None,
            },
        ];

        let refund = process_refund(&db, &factory, &data).unwrap();
        let methods = refund["refundMethods"].as_array().unwrap();
        let sum: i64 = methods.iter().map(|m| m["amountCents"].as_i64().unwrap()).sum();
        assert_eq!(sum, refund["amountCents"].as_i64().unwrap());
        let orders_sum: i64 = refund["orderRefunds"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["amountCents"].as_i64().unwrap())
            .sum();
        assert_eq!(orders_sum, 10000);
    }

    // -- Draft -------------------------------------------------------------

    fn draft_with_two_items() -> RefundDraft {
        RefundDraft::new(
            vec![
                DraftItem {
                    order_item_id: "item-1".into(),
                    description: "Rose bouquet".into(),
                    row_total_cents: 2000,
                    refund_cents: 0,
                },
                DraftItem {
                    order_item_id: "item-2".into(),
                    description: "Vase".into(),
                    row_total_cents: 6000,
                    refund_cents: 0,
                },
            ],
            800,
            500,
        )
    }

    #[test]
    fn test_draft_tax_proration_scenario() {
        // Items sum to 8000, tax 800; refunding 2000 of items prorates
        // tax to round(800 * 2000/8000) = 200.
        let mut draft = draft_with_two_items();
        draft.set_item_refund("item-1", 2000).unwrap();
        assert_eq!(draft.item_refund_total(), 2000);
        assert_eq!(draft.tax_refund_cents(), 200);
        assert_eq!(draft.total_cents(), 2200);
    }

    #[test]
    fn test_draft_tax_override_is_sticky() {
        let mut draft = draft_with_two_items();
        draft.set_item_refund("item-1", 2000).unwrap();
        assert_eq!(draft.tax_refund_cents(), 200);

        draft.set_tax_refund(150).unwrap();
        // Later item edits no longer recompute tax
        draft.set_item_refund("item-2", 6000).unwrap();
        assert_eq!(draft.tax_refund_cents(), 150);
        assert_eq!(draft.total_cents(), 8000 + 150);
    }

    #[test]
    fn test_draft_item_refund_capped_at_row_total() {
        let mut draft = draft_with_two_items();
        let err = draft.set_item_refund("item-1", 2001).unwrap_err();
        assert!(err.contains("exceeds the item total"));
        assert!(draft.set_item_refund("item-1", -1).is_err());
        assert!(draft.set_item_refund("missing", 100).is_err());
    }

    #[test]
    fn test_draft_delivery_fee_capped() {
        let mut draft = draft_with_two_items();
        assert!(draft.set_delivery_fee_refund(501).is_err());
        draft.set_delivery_fee_refund(500).unwrap();
        assert_eq!(draft.delivery_fee_refund_cents(), 500);
    }

    #[test]
    fn test_draft_breakdown_only_lists_refunded_items() {
        let mut draft = draft_with_two_items();
        draft.set_item_refund("item-2", 1500).unwrap();
        let breakdown = draft.item_breakdown();
        let list = breakdown.as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["orderItemId"], "item-2");
        assert_eq!(list[0]["refundCents"], 1500);
    }
}
