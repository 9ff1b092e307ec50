use serde_json::Value;

use crate::gift_cards::CardActivation;
use crate::{db, gift_cards};
use crate::{value_i64, value_str};

#[tauri::command]
pub async fn gift_card_lookup(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let card_number =
        value_str(&payload, &["cardNumber", "card_number"]).ok_or("Missing card number")?;
    gift_cards::lookup(&db, &card_number)
}

/// Activate purchased cards outside the checkout flow (back-office sale of
/// preprinted stock, or remediation after a failed post-commit activation).
#[tauri::command]
pub async fn gift_card_activate(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing activation payload")?;
    let cards: Vec<CardActivation> = serde_json::from_value(
        payload
            .get("cards")
            .cloned()
            .ok_or("Missing activation cards")?,
    )
    .map_err(|e| format!("Invalid activation details: {e}"))?;

    gift_cards::activate_cards(
        &db,
        &cards,
        value_str(&payload, &["purchasedBy", "purchased_by"]).as_deref(),
        value_str(&payload, &["transactionId", "transaction_id"]).as_deref(),
        value_str(&payload, &["employeeId", "employee_id"]).as_deref(),
    )
}

#[tauri::command]
pub async fn gift_card_redeem(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing redemption payload")?;
    let card_number =
        value_str(&payload, &["cardNumber", "card_number"]).ok_or("Missing card number")?;
    let amount =
        value_i64(&payload, &["amountCents", "amount_cents"]).ok_or("Missing amount")?;
    gift_cards::redeem(
        &db,
        &card_number,
        amount,
        value_str(&payload, &["transactionId", "transaction_id"]).as_deref(),
        value_str(&payload, &["employeeId", "employee_id"]).as_deref(),
    )
}
