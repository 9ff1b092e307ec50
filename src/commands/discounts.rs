use serde_json::Value;

use crate::discounts::Source;
use crate::orders::CartItem;
use crate::value_str;
use crate::{db, discounts};

fn parse_cart(payload: &Value) -> Result<Vec<CartItem>, String> {
    let raw = payload
        .get("cartItems")
        .or_else(|| payload.get("cart"))
        .or_else(|| payload.get("items"))
        .cloned()
        .ok_or("Missing cart items")?;
    serde_json::from_value(raw).map_err(|e| format!("Invalid cart items: {e}"))
}

#[tauri::command]
pub async fn coupon_validate(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing coupon payload")?;
    let code = value_str(&payload, &["code", "couponCode"]).ok_or("Missing coupon code")?;
    let cart = parse_cart(&payload)?;
    let customer_id = value_str(&payload, &["customerId", "customer_id"]);
    let source = value_str(&payload, &["source"])
        .map(|s| Source::parse(&s))
        .unwrap_or(Source::Pos);

    discounts::validate_coupon(&db, &code, &cart, customer_id.as_deref(), source)
}

#[tauri::command]
pub async fn discounts_auto_apply(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let cart = parse_cart(&payload)?;
    let customer_id = value_str(&payload, &["customerId", "customer_id"]);
    discounts::auto_apply(&db, &cart, customer_id.as_deref())
}
