use serde_json::Value;
use std::sync::Mutex;

use crate::checkout::{CheckoutSession, Finalize};
use crate::db;
use crate::gift_cards::CardActivation;
use crate::money::parse_dollars;
use crate::notifications::HttpNotifier;
use crate::orders::CartItem;
use crate::tender::PaymentLeg;
use crate::{value_i64, value_str};

/// The in-progress POS checkout, managed by Tauri.
#[derive(Default)]
pub struct CheckoutState(pub Mutex<Option<CheckoutSession>>);

fn with_session<T>(
    state: &CheckoutState,
    f: impl FnOnce(&mut CheckoutSession) -> Result<T, String>,
) -> Result<T, String> {
    let mut guard = state.0.lock().map_err(|e| e.to_string())?;
    let session = guard.as_mut().ok_or("No checkout in progress")?;
    f(session)
}

fn parse_cart(payload: &Value) -> Result<Vec<CartItem>, String> {
    let raw = payload
        .get("cart")
        .or_else(|| payload.get("cartItems"))
        .or_else(|| payload.get("items"))
        .cloned()
        .ok_or("Missing cart items")?;
    serde_json::from_value(raw).map_err(|e| format!("Invalid cart items: {e}"))
}

fn parse_legs(payload: &Value) -> Result<Vec<PaymentLeg>, String> {
    let raw = payload
        .get("legs")
        .or_else(|| payload.get("payments"))
        .or_else(|| payload.get("paymentMethods"))
        .cloned()
        .ok_or("Missing payment legs")?;
    serde_json::from_value(raw).map_err(|e| format!("Invalid payment legs: {e}"))
}

/// Accept an amount either as integer cents or as a typed dollar string.
fn parse_amount(payload: &Value, cents_keys: &[&str], dollar_keys: &[&str]) -> Option<i64> {
    if let Some(cents) = value_i64(payload, cents_keys) {
        return Some(cents);
    }
    value_str(payload, dollar_keys).and_then(|s| parse_dollars(&s).ok())
}

#[tauri::command]
pub async fn checkout_start(
    arg0: Option<Value>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing checkout payload")?;
    let mut session = CheckoutSession::new(parse_cart(&payload)?);

    session.delivery_fee_cents =
        value_i64(&payload, &["deliveryFeeCents", "delivery_fee_cents"]).unwrap_or(0);
    session.tax_cents = value_i64(&payload, &["taxCents", "tax_cents"]).unwrap_or(0);
    session.tip_cents = value_i64(&payload, &["tipCents", "tip_cents"]).unwrap_or(0);
    session.customer_id = value_str(&payload, &["customerId", "customer_id"]);
    session.customer_display_name =
        value_str(&payload, &["customerDisplayName", "customerName", "customer_name"]);
    session.employee_id = value_str(&payload, &["employeeId", "employee_id"]);
    session.receipt_email = value_str(&payload, &["receiptEmail", "receipt_email"]);
    session.print_receipt = payload
        .get("printReceipt")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let snapshot = session.to_json();
    *state.0.lock().map_err(|e| e.to_string())? = Some(session);
    Ok(snapshot)
}

#[tauri::command]
pub async fn checkout_get_state(
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    with_session(&state, |session| Ok(session.to_json()))
}

#[tauri::command]
pub async fn checkout_cancel(state: tauri::State<'_, CheckoutState>) -> Result<Value, String> {
    *state.0.lock().map_err(|e| e.to_string())? = None;
    Ok(serde_json::json!({ "success": true }))
}

#[tauri::command]
pub async fn checkout_apply_manual_discount(
    arg0: Option<Value>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.unwrap_or_default();
    let percent = value_i64(&payload, &["percent", "discountPercent"]);
    let flat = parse_amount(&payload, &["flatCents", "flat_cents"], &["flatAmount", "amount"]);
    with_session(&state, |session| {
        session.apply_manual_discount(percent, flat);
        Ok(session.to_json())
    })
}

#[tauri::command]
pub async fn checkout_apply_coupon(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing coupon payload")?;
    let code = value_str(&payload, &["code", "couponCode"]).ok_or("Missing coupon code")?;
    with_session(&state, |session| session.apply_coupon(&db, &code))
}

#[tauri::command]
pub async fn checkout_remove_coupon(
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    with_session(&state, |session| {
        session.remove_coupon();
        Ok(session.to_json())
    })
}

#[tauri::command]
pub async fn checkout_apply_automatic_discounts(
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    with_session(&state, |session| session.apply_automatic_discounts(&db))
}

#[tauri::command]
pub async fn checkout_redeem_gift_card(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing gift card payload")?;
    let card_number =
        value_str(&payload, &["cardNumber", "card_number"]).ok_or("Missing card number")?;
    let amount = parse_amount(&payload, &["amountCents", "amount_cents"], &["amount"]);
    with_session(&state, |session| {
        session.redeem_gift_card(&db, &card_number, amount)
    })
}

#[tauri::command]
pub async fn checkout_provide_gift_card_activations(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing activation payload")?;
    let cards: Vec<CardActivation> = serde_json::from_value(
        payload
            .get("cards")
            .cloned()
            .ok_or("Missing activation cards")?,
    )
    .map_err(|e| format!("Invalid activation details: {e}"))?;

    with_session(&state, |session| {
        // Providing activation details releases any parked finalization;
        // resume it immediately so the operator does not re-confirm.
        match session.provide_gift_card_activations(cards)? {
            Some(parked_legs) => session.submit(&db, &HttpNotifier, parked_legs),
            None => Ok(session.to_json()),
        }
    })
}

#[tauri::command]
pub async fn checkout_submit(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, CheckoutState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payment payload")?;
    let legs = parse_legs(&payload)?;

    with_session(&state, |session| {
        match session.attempt_finalize(legs)? {
            Finalize::NeedsGiftCardActivation => Ok(serde_json::json!({
                "success": false,
                "needsGiftCardActivation": true,
            })),
            Finalize::Ready(legs) => session.submit(&db, &HttpNotifier, legs),
        }
    })
}
