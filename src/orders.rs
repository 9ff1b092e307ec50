//! Order creation and payment-status derivation.
//!
//! POS carts become orders at payment time: one order per checkout, with
//! item rows, delivery fee, tax, and the discount already applied. An
//! order's `payment_status` is always derived from its settled payments
//! and refunds, never assigned ad hoc.

use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::money::prorate;
use crate::tender::PaymentMethod;

/// Gift card flavor for cart lines that sell a card.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GiftCardType {
    Physical,
    Digital,
}

impl GiftCardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GiftCardType::Physical => "PHYSICAL",
            GiftCardType::Digital => "DIGITAL",
        }
    }
}

/// One line of the POS cart.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub description: String,
    pub unit_price_cents: i64,
    #[serde(default = "default_quantity")]
    pub quantity: i64,
    #[serde(default = "default_taxable")]
    pub taxable: bool,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    /// Present when this line sells a gift card that must be activated
    /// before the payment can complete.
    #[serde(default)]
    pub gift_card_type: Option<GiftCardType>,
    /// Set when the line references an existing draft order instead of a
    /// new custom product.
    #[serde(default)]
    pub draft_order_id: Option<String>,
}

fn default_quantity() -> i64 {
    1
}

fn default_taxable() -> bool {
    true
}

impl CartItem {
    pub fn row_total_cents(&self) -> i64 {
        self.unit_price_cents * self.quantity
    }

    pub fn is_gift_card(&self) -> bool {
        self.gift_card_type.is_some()
    }
}

/// Totals context for the order created from a cart.
#[derive(Debug, Clone, Default)]
pub struct OrderContext {
    pub order_type: String,
    pub delivery_fee_cents: i64,
    pub tax_cents: i64,
    pub discount_cents: i64,
    pub notes: Option<String>,
}

// ---------------------------------------------------------------------------
// Creation
// ---------------------------------------------------------------------------

/// Create one order (plus item rows) from the non-draft cart lines.
///
/// Runs inside the caller's write transaction so the order commits (or
/// rolls back) together with the payment that funds it. Returns the new
/// order id, or `None` when every cart line was a draft reference.
pub fn create_order_from_cart(
    conn: &Connection,
    customer_id: &str,
    items: &[CartItem],
    ctx: &OrderContext,
) -> Result<Option<String>, String> {
    let fresh: Vec<&CartItem> = items.iter().filter(|i| i.draft_order_id.is_none()).collect();
    if fresh.is_empty() {
        return Ok(None);
    }

    let item_total: i64 = fresh.iter().map(|i| i.row_total_cents()).sum();
    let payment_amount =
        (item_total + ctx.delivery_fee_cents + ctx.tax_cents - ctx.discount_cents).max(0);

    let order_id = Uuid::new_v4().to_string();
    let order_number = db::next_counter_value(conn, "ORD")?;
    let now = Utc::now().to_rfc3339();
    let order_type = if ctx.order_type.is_empty() {
        "PICKUP"
    } else {
        ctx.order_type.as_str()
    };

    conn.execute(
        "INSERT INTO orders (
            id, order_number, customer_id, status, payment_status, order_type,
            delivery_fee_cents, tax_cents, discount_cents, payment_amount_cents,
            notes, created_at, updated_at
        ) VALUES (?1, ?2, ?3, 'DRAFT', 'UNPAID', ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
        params![
            order_id,
            order_number,
            customer_id,
            order_type,
            ctx.delivery_fee_cents,
            ctx.tax_cents,
            ctx.discount_cents,
            payment_amount,
            ctx.notes,
            now,
        ],
    )
    .map_err(|e| format!("insert order: {e}"))?;

    for item in fresh {
        conn.execute(
            "INSERT INTO order_items (
                id, order_id, description, unit_price_cents, quantity,
                row_total_cents, taxable, product_id, category_id
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                Uuid::new_v4().to_string(),
                order_id,
                item.description,
                item.unit_price_cents,
                item.quantity,
                item.row_total_cents(),
                item.taxable as i64,
                item.product_id,
                item.category_id,
            ],
        )
        .map_err(|e| format!("insert order item: {e}"))?;
    }

    Ok(Some(order_id))
}

/// Mark orders PAID. Runs inside the caller's transaction alongside the
/// payment commit.
pub fn mark_orders_paid(conn: &Connection, order_ids: &[String]) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();
    for order_id in order_ids {
        let updated = conn
            .execute(
                "UPDATE orders SET status = 'PAID', payment_status = 'PAID', updated_at = ?1
                 WHERE id = ?2",
                params![now, order_id],
            )
            .map_err(|e| format!("mark order paid: {e}"))?;
        if updated == 0 {
            return Err(format!("Order not found: {order_id}"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Payment status derivation
// ---------------------------------------------------------------------------

/// Fraction of a transaction that settled at the register, applied to an
/// order-payment link. House-account and COD legs settle later via
/// invoicing, so a link funded half by card and half by house account only
/// counts half toward `PAID`.
fn settled_portion(conn: &Connection, transaction_id: &str, link_amount: i64) -> i64 {
    let mut stmt = match conn.prepare(
        "SELECT method, amount_cents FROM payment_methods WHERE transaction_id = ?1",
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!("settled_portion prepare: {e}");
            return link_amount;
        }
    };

    let legs: Vec<(String, i64)> = stmt
        .query_map(params![transaction_id], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();

    if legs.is_empty() {
        return link_amount;
    }

    let total: i64 = legs.iter().map(|(_, amount)| amount).sum();
    let settled: i64 = legs
        .iter()
        .filter(|(method, _)| {
            PaymentMethod::parse(method)
                .map(|m| m.is_settling())
                .unwrap_or(true)
        })
        .map(|(_, amount)| amount)
        .sum();

    if settled <= 0 {
        return 0;
    }
    if total <= 0 || settled >= total {
        return link_amount;
    }
    prorate(link_amount, settled, total)
}

/// Same settled fraction for a refund, applied to an order-refund link.
fn settled_refund_portion(conn: &Connection, refund_id: &str, link_amount: i64) -> i64 {
    let mut stmt = match conn
        .prepare("SELECT method, amount_cents FROM refund_methods WHERE refund_id = ?1")
    {
        Ok(s) => s,
        Err(e) => {
            warn!("settled_refund_portion prepare: {e}");
            return link_amount;
        }
    };

    let methods: Vec<(String, i64)> = stmt
        .query_map(params![refund_id], |row| Ok((row.get(0)?, row.get(1)?)))
        .map(|rows| rows.filter_map(|r| r.ok()).collect())
        .unwrap_or_default();

    if methods.is_empty() {
        return link_amount;
    }

    let total: i64 = methods.iter().map(|(_, amount)| amount).sum();
    let settled: i64 = methods
        .iter()
        .filter(|(method, _)| {
            PaymentMethod::parse(method)
                .map(|m| m.is_settling())
                .unwrap_or(true)
        })
        .map(|(_, amount)| amount)
        .sum();

    if settled <= 0 {
        return 0;
    }
    if total <= 0 || settled >= total {
        return link_amount;
    }
    prorate(link_amount, settled, total)
}

/// Recompute `payment_status` for each order from its settled payments and
/// refunds. Thresholds: no refunds leave the paid/partial state untouched;
/// refunds below the settled-paid amount give `PARTIALLY_REFUNDED`; refunds
/// at or above it give `REFUNDED`.
pub fn recalculate_payment_statuses(
    conn: &Connection,
    order_ids: &[String],
) -> Result<(), String> {
    let now = Utc::now().to_rfc3339();

    for order_id in order_ids {
        let (payment_amount, current_status): (i64, String) = match conn.query_row(
            "SELECT payment_amount_cents, payment_status FROM orders WHERE id = ?1",
            params![order_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ) {
            Ok(v) => v,
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                return Err(format!("Order not found: {order_id}"))
            }
            Err(e) => return Err(format!("query order: {e}")),
        };

        let mut pay_stmt = conn
            .prepare(
                "SELECT op.transaction_id, op.amount_cents
                 FROM order_payments op
                 JOIN payment_transactions pt ON pt.id = op.transaction_id
                 WHERE op.order_id = ?1",
            )
            .map_err(|e| e.to_string())?;
        let payments: Vec<(String, i64)> = pay_stmt
            .query_map(params![order_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();

        let settled_paid: i64 = payments
            .iter()
            .map(|(tx_id, amount)| settled_portion(conn, tx_id, *amount))
            .sum();

        let mut refund_stmt = conn
            .prepare(
                "SELECT refund_id, amount_cents FROM order_refunds WHERE order_id = ?1",
            )
            .map_err(|e| e.to_string())?;
        let refunds: Vec<(String, i64)> = refund_stmt
            .query_map(params![order_id], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();

        let settled_refunded: i64 = refunds
            .iter()
            .map(|(refund_id, amount)| settled_refund_portion(conn, refund_id, *amount))
            .sum();

        let next_status = if settled_paid <= 0 {
            "UNPAID"
        } else if settled_refunded >= settled_paid {
            "REFUNDED"
        } else if settled_refunded > 0 {
            "PARTIALLY_REFUNDED"
        } else if payment_amount == 0 || settled_paid >= payment_amount {
            "PAID"
        } else {
            "PARTIALLY_PAID"
        };

        if next_status != current_status {
            conn.execute(
                "UPDATE orders SET payment_status = ?1, updated_at = ?2 WHERE id = ?3",
                params![next_status, now, order_id],
            )
            .map_err(|e| format!("update payment status: {e}"))?;

            // A fully refunded order also flips its workflow status.
            if next_status == "REFUNDED" {
                conn.execute(
                    "UPDATE orders SET status = 'REFUNDED', updated_at = ?1 WHERE id = ?2",
                    params![now, order_id],
                )
                .map_err(|e| format!("update order status: {e}"))?;
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

/// Get an order with its item rows.
pub fn get_order(db: &DbState, order_id: &str) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let order = conn
        .query_row(
            "SELECT id, order_number, customer_id, status, payment_status, order_type,
                    delivery_fee_cents, tax_cents, discount_cents, payment_amount_cents,
                    notes, created_at, updated_at
             FROM orders WHERE id = ?1",
            params![order_id],
            |row| {
                Ok(serde_json::json!({
                    "id": row.get::<_, String>(0)?,
                    "orderNumber": row.get::<_, Option<i64>>(1)?,
                    "customerId": row.get::<_, Option<String>>(2)?,
                    "status": row.get::<_, String>(3)?,
                    "paymentStatus": row.get::<_, String>(4)?,
                    "orderType": row.get::<_, String>(5)?,
                    "deliveryFeeCents": row.get::<_, i64>(6)?,
                    "taxCents": row.get::<_, i64>(7)?,
                    "discountCents": row.get::<_, i64>(8)?,
                    "paymentAmountCents": row.get::<_, i64>(9)?,
                    "notes": row.get::<_, Option<String>>(10)?,
                    "createdAt": row.get::<_, Option<String>>(11)?,
                    "updatedAt": row.get::<_, Option<String>>(12)?,
                }))
            },
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => format!("Order not found: {order_id}"),
            _ => format!("query order: {e}"),
        })?;

    let mut stmt = conn
        .prepare(
            "SELECT id, description, unit_price_cents, quantity, row_total_cents,
                    taxable, product_id, category_id
             FROM order_items WHERE order_id = ?1",
        )
        .map_err(|e| e.to_string())?;

    let items: Vec<Value> = stmt
        .query_map(params![order_id], |row| {
            Ok(serde_json::json!({
                "id": row.get::<_, String>(0)?,
                "description": row.get::<_, String>(1)?,
                "unitPriceCents": row.get::<_, i64>(2)?,
                "quantity": row.get::<_, i64>(3)?,
                "rowTotalCents": row.get::<_, i64>(4)?,
                "taxable": row.get::<_, i64>(5)? != 0,
                "productId": row.get::<_, Option<String>>(6)?,
                "categoryId": row.get::<_, Option<String>>(7)?,
            }))
        })
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let mut result = order;
    result["orderItems"] = Value::Array(items);
    Ok(result)
}

// ===========================================================================
// Tests
// ===========================================================================
