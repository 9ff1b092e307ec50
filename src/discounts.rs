//! Discount and coupon resolution.
//!
//! Decides validity and dollar impact of a coupon code or automatic rule
//! against a cart snapshot. Usage is tracked through append-only
//! `discount_usages` rows; the `usage_count` denormalization is updated in
//! the same transaction as the usage row, never as a bare increment.
//!
//! Error codes mirror the wire contract: `NOT_FOUND`, `DISABLED`,
//! `EXPIRED`, `USAGE_LIMIT`, `CUSTOMER_LIMIT`, `MINIMUM_ORDER`.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::DbState;
use crate::money::{format_dollars, percent_of};
use crate::orders::CartItem;

/// Channel a validation request comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Pos,
    Website,
}

impl Source {
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("website") {
            Source::Website
        } else {
            Source::Pos
        }
    }
}

/// A discount row loaded from the database.
#[derive(Debug, Clone)]
struct DiscountRow {
    id: String,
    code: Option<String>,
    name: String,
    discount_type: String,
    trigger_type: String,
    value: i64,
    enabled: bool,
    minimum_order_cents: Option<i64>,
    usage_limit: Option<i64>,
    usage_count: i64,
    per_customer_limit: Option<i64>,
    start_date: Option<String>,
    end_date: Option<String>,
    priority: i64,
    applicable_products: Vec<String>,
    applicable_categories: Vec<String>,
    pos_only: bool,
    web_only: bool,
}

fn parse_id_list(raw: &str) -> Vec<String> {
    serde_json::from_str::<Vec<String>>(raw).unwrap_or_default()
}

fn row_to_discount(row: &rusqlite::Row<'_>) -> rusqlite::Result<DiscountRow> {
    Ok(DiscountRow {
        id: row.get(0)?,
        code: row.get(1)?,
        name: row.get(2)?,
        discount_type: row.get(3)?,
        trigger_type: row.get(4)?,
        value: row.get(5)?,
        enabled: row.get::<_, i64>(6)? != 0,
        minimum_order_cents: row.get(7)?,
        usage_limit: row.get(8)?,
        usage_count: row.get(9)?,
        per_customer_limit: row.get(10)?,
        start_date: row.get(11)?,
        end_date: row.get(12)?,
        priority: row.get(13)?,
        applicable_products: parse_id_list(&row.get::<_, String>(14)?),
        applicable_categories: parse_id_list(&row.get::<_, String>(15)?),
        pos_only: row.get::<_, i64>(16)? != 0,
        web_only: row.get::<_, i64>(17)? != 0,
    })
}

const DISCOUNT_COLUMNS: &str = "id, code, name, discount_type, trigger_type, value, enabled,
    minimum_order_cents, usage_limit, usage_count, per_customer_limit,
    start_date, end_date, priority, applicable_products, applicable_categories,
    pos_only, web_only";

/// Parse a stored date as either RFC3339 or a bare `YYYY-MM-DD`.
fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| DateTime::from_naive_utc_and_offset(naive, Utc))
}

fn cart_total_cents(cart: &[CartItem]) -> i64 {
    cart.iter().map(|i| i.row_total_cents()).sum()
}

fn validation_err(code: &str, message: &str) -> String {
    format!("{code}: {message}")
}

/// Shared eligibility gates for coupons and automatic discounts. Returns
/// the validation error (code-prefixed) or `Ok(())`.
fn check_eligibility(
    conn: &Connection,
    discount: &DiscountRow,
    cart: &[CartItem],
    customer_id: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), String> {
    if !discount.enabled {
        return Err(validation_err("DISABLED", "This discount is no longer available"));
    }

    if let Some(start) = discount.start_date.as_deref().and_then(parse_date) {
        if now < start {
            return Err(validation_err("EXPIRED", "This discount is not yet valid"));
        }
    }
    if let Some(end) = discount.end_date.as_deref().and_then(parse_date) {
        if now > end {
            return Err(validation_err("EXPIRED", "This discount has expired"));
        }
    }

    if let Some(limit) = discount.usage_limit {
        if discount.usage_count >= limit {
            return Err(validation_err(
                "USAGE_LIMIT",
                "This discount has reached its usage limit",
            ));
        }
    }

    if let (Some(limit), Some(customer)) = (discount.per_customer_limit, customer_id) {
        let used: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM discount_usages WHERE discount_id = ?1 AND customer_id = ?2",
                params![discount.id, customer],
                |row| row.get(0),
            )
            .unwrap_or(0);
        if used >= limit {
            return Err(validation_err(
                "CUSTOMER_LIMIT",
                "This customer has already used this discount the maximum number of times",
            ));
        }
    }

    let total = cart_total_cents(cart);
    if let Some(minimum) = discount.minimum_order_cents {
        if total < minimum {
            return Err(validation_err(
                "MINIMUM_ORDER",
                &format!(
                    "Minimum order of {} required for this discount",
                    format_dollars(minimum)
                ),
            ));
        }
    }

    if !discount.applicable_products.is_empty() {
        let matches = cart.iter().any(|item| {
            item.product_id
                .as_deref()
                .map(|id| discount.applicable_products.iter().any(|p| p == id))
                .unwrap_or(false)
        });
        if !matches {
            return Err(validation_err(
                "DISABLED",
                "This discount is not applicable to the items in the cart",
            ));
        }
    }

    if !discount.applicable_categories.is_empty() {
        let matches = cart.iter().any(|item| {
            item.category_id
                .as_deref()
                .map(|id| discount.applicable_categories.iter().any(|c| c == id))
                .unwrap_or(false)
        });
        if !matches {
            return Err(validation_err(
                "DISABLED",
                "This discount is not applicable to the items in the cart",
            ));
        }
    }

    Ok(())
}

/// Discount amount in cents for a cart. FREE_SHIPPING / SALE_PRICE /
/// BUY_X_GET_Y_FREE affect pricing elsewhere (delivery-fee waiver,
/// per-item pricing) and resolve to zero here while staying valid.
fn discount_amount_cents(discount: &DiscountRow, cart_total: i64) -> i64 {
    match discount.discount_type.as_str() {
        "FIXED_AMOUNT" => discount.value.min(cart_total),
        "PERCENTAGE" => percent_of(cart_total, discount.value),
        _ => 0,
    }
}

// ---------------------------------------------------------------------------
// Coupon validation
// ---------------------------------------------------------------------------

/// Validate a coupon code against a cart snapshot.
///
/// Returns `{ valid: true, coupon, discountAmountCents }` or an error whose
/// message is prefixed with the taxonomy code.
pub fn validate_coupon(
    db: &DbState,
    code: &str,
    cart: &[CartItem],
    customer_id: Option<&str>,
    source: Source,
) -> Result<Value, String> {
    let code = code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(validation_err("NOT_FOUND", "Coupon code is required"));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let discount = conn
        .query_row(
            &format!(
                "SELECT {DISCOUNT_COLUMNS} FROM discounts
                 WHERE code = ?1 AND trigger_type = 'COUPON_CODE'"
            ),
            params![code],
            |row| row_to_discount(row),
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => {
                validation_err("NOT_FOUND", "Coupon code not found")
            }
            _ => format!("query coupon: {e}"),
        })?;

    match source {
        Source::Website if discount.pos_only => {
            return Err(validation_err(
                "DISABLED",
                "This coupon can only be used in-store",
            ))
        }
        Source::Pos if discount.web_only => {
            return Err(validation_err(
                "DISABLED",
                "This coupon can only be used online",
            ))
        }
        _ => {}
    }

    check_eligibility(&conn, &discount, cart, customer_id, Utc::now())?;

    let amount = discount_amount_cents(&discount, cart_total_cents(cart));

    Ok(serde_json::json!({
        "valid": true,
        "coupon": {
            "id": discount.id,
            "code": discount.code,
            "name": discount.name,
            "discountType": discount.discount_type,
            "value": discount.value,
            "minimumOrderCents": discount.minimum_order_cents,
            "usageCount": discount.usage_count,
            "usageLimit": discount.usage_limit,
        },
        "discountAmountCents": amount,
    }))
}

// ---------------------------------------------------------------------------
// Automatic discounts
// ---------------------------------------------------------------------------

/// Resolve every automatic discount applicable to the cart.
///
/// All matches stack; the list is ordered by priority (highest first) and
/// the summed amount is returned alongside.
pub fn auto_apply(
    db: &DbState,
    cart: &[CartItem],
    customer_id: Option<&str>,
) -> Result<Value, String> {
    if cart.is_empty() {
        return Ok(serde_json::json!({ "discounts": [], "totalDiscountCents": 0 }));
    }

    let conn = db.conn.lock().map_err(|e| e.to_string())?;

    let mut stmt = conn
        .prepare(&format!(
            "SELECT {DISCOUNT_COLUMNS} FROM discounts
             WHERE enabled = 1
               AND trigger_type IN ('AUTOMATIC_PRODUCT', 'AUTOMATIC_CATEGORY')
             ORDER BY priority DESC, created_at ASC"
        ))
        .map_err(|e| e.to_string())?;

    let candidates: Vec<DiscountRow> = stmt
        .query_map([], |row| row_to_discount(row))
        .map_err(|e| e.to_string())?
        .filter_map(|r| r.ok())
        .collect();

    let now = Utc::now();
    let cart_total = cart_total_cents(cart);
    let mut applicable = Vec::new();
    let mut total_discount = 0i64;

    for discount in candidates {
        // Automatic rules need a non-empty allow-list to trigger from.
        let has_trigger = match discount.trigger_type.as_str() {
            "AUTOMATIC_PRODUCT" => !discount.applicable_products.is_empty(),
            "AUTOMATIC_CATEGORY" => !discount.applicable_categories.is_empty(),
            _ => false,
        };
        if !has_trigger {
            continue;
        }

        if check_eligibility(&conn, &discount, cart, customer_id, now).is_err() {
            continue;
        }

        let amount = discount_amount_cents(&discount, cart_total);
        total_discount += amount;
        applicable.push(serde_json::json!({
            "id": discount.id,
            "name": discount.name,
            "discountType": discount.discount_type,
            "triggerType": discount.trigger_type,
            "value": discount.value,
            "priority": discount.priority,
            "discountAmountCents": amount,
        }));
    }

    info!(
        count = applicable.len(),
        total_discount, "Automatic discounts resolved"
    );

    Ok(serde_json::json!({
        "discounts": applicable,
        "totalDiscountCents": total_discount,
    }))
}

// ---------------------------------------------------------------------------
// Usage recording
// ---------------------------------------------------------------------------

/// Record one use of a discount: inserts the append-only usage row and
/// bumps `usage_count` in the same transaction.
pub fn record_usage(
    db: &DbState,
    discount_id: &str,
    customer_id: Option<&str>,
    order_id: Option<&str>,
    transaction_id: Option<&str>,
) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    record_usage_on_conn(&conn, discount_id, customer_id, order_id, transaction_id)
}

/// Transaction-scoped variant used by the post-commit queue.
pub fn record_usage_on_conn(
    conn: &Connection,
    discount_id: &str,
    customer_id: Option<&str>,
    order_id: Option<&str>,
    transaction_id: Option<&str>,
) -> Result<Value, String> {
    let exists: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM discounts WHERE id = ?1",
            params![discount_id],
            |row| row.get(0),
        )
        .unwrap_or(0);
    if exists == 0 {
        return Err(format!("Discount not found: {discount_id}"));
    }

    let usage_id = Uuid::new_v4().to_string();
    let now = Utc::now().to_rfc3339();

    conn.execute_batch("BEGIN IMMEDIATE")
        .map_err(|e| format!("begin transaction: {e}"))?;

    let result = (|| -> Result<(), String> {
        conn.execute(
            "INSERT INTO discount_usages (id, discount_id, customer_id, order_id, transaction_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![usage_id, discount_id, customer_id, order_id, transaction_id, now],
        )
        .map_err(|e| format!("insert usage: {e}"))?;

        conn.execute(
            "UPDATE discounts SET usage_count = usage_count + 1, updated_at = ?1 WHERE id = ?2",
            params![now, discount_id],
        )
        .map_err(|e| format!("bump usage_count: {e}"))?;

        Ok(())
    })();

    match result {
        Ok(()) => {
            conn.execute_batch("COMMIT")
                .map_err(|e| format!("commit: {e}"))?;
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            warn!(discount_id, "Recording discount usage failed: {e}");
            return Err(e);
        }
    }

    Ok(serde_json::json!({
        "success": true,
        "usageId": usage_id,
        "discountId": discount_id,
    }))
}

// ---------------------------------------------------------------------------
// Manual (staff-entered) discount
// ---------------------------------------------------------------------------

/// Staff-entered discount: percent of (item total + delivery fee), or a
/// flat cents amount. Independent of coupon/automatic discounts.
pub fn manual_discount_cents(
    item_total_cents: i64,
    delivery_fee_cents: i64,
    percent: Option<i64>,
    flat_cents: Option<i64>,
) -> i64 {
    let base = item_total_cents + delivery_fee_cents;
    let mut discount = 0i64;
    if let Some(p) = percent {
        discount += percent_of(base, p.clamp(0, 100));
    }
    if let Some(flat) = flat_cents {
        discount += flat.max(0);
    }
    discount.min(base)
}

// ===========================================================================
// Tests
// ===========================================================================
