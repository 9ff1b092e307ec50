use serde_json::Value;
use std::sync::Mutex;

use crate::providers::LiveProviderFactory;
use crate::refunds::{ProcessRefund, RefundDraft};
use crate::value_str;
use crate::{db, refunds};

/// The in-progress itemized refund draft, keyed by order id.
#[derive(Default)]
pub struct RefundDraftState(pub Mutex<Option<(String, RefundDraft)>>);

fn with_draft<T>(
    state: &RefundDraftState,
    f: impl FnOnce(&str, &mut RefundDraft) -> Result<T, String>,
) -> Result<T, String> {
    let mut guard = state.0.lock().map_err(|e| e.to_string())?;
    let (order_id, draft) = guard.as_mut().ok_or("No refund draft in progress")?;
    f(order_id, draft)
}

#[tauri::command]
pub async fn refund_draft_start(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let order_id =
        value_str(&payload, &["orderId", "order_id"]).ok_or("Missing order id")?;

    let draft = RefundDraft::for_order(&db, &order_id)?;
    let snapshot = draft.to_json();
    *state.0.lock().map_err(|e| e.to_string())? = Some((order_id, draft));
    Ok(snapshot)
}

#[tauri::command]
pub async fn refund_draft_get_state(
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    with_draft(&state, |_, draft| Ok(draft.to_json()))
}

#[tauri::command]
pub async fn refund_draft_cancel(
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    *state.0.lock().map_err(|e| e.to_string())? = None;
    Ok(serde_json::json!({ "success": true }))
}

#[tauri::command]
pub async fn refund_draft_set_item(
    arg0: Option<Value>,
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let item_id = value_str(&payload, &["orderItemId", "order_item_id", "itemId"])
        .ok_or("Missing order item id")?;
    let amount = payload
        .get("amountCents")
        .or_else(|| payload.get("amount_cents"))
        .and_then(Value::as_i64)
        .ok_or("Missing amount")?;
    with_draft(&state, |_, draft| {
        draft.set_item_refund(&item_id, amount)?;
        Ok(draft.to_json())
    })
}

#[tauri::command]
pub async fn refund_draft_set_delivery_fee(
    arg0: Option<Value>,
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let amount = payload
        .get("amountCents")
        .or_else(|| payload.get("amount_cents"))
        .and_then(Value::as_i64)
        .ok_or("Missing amount")?;
    with_draft(&state, |_, draft| {
        draft.set_delivery_fee_refund(amount)?;
        Ok(draft.to_json())
    })
}

/// Manually override the tax refund. Auto-proration stops for the rest of
/// this draft once the operator edits tax.
#[tauri::command]
pub async fn refund_draft_set_tax(
    arg0: Option<Value>,
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let amount = payload
        .get("amountCents")
        .or_else(|| payload.get("amount_cents"))
        .and_then(Value::as_i64)
        .ok_or("Missing amount")?;
    with_draft(&state, |_, draft| {
        draft.set_tax_refund(amount)?;
        Ok(draft.to_json())
    })
}

#[tauri::command]
pub async fn refund_get_order_summary(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let order_id =
        value_str(&payload, &["orderId", "order_id"]).ok_or("Missing order id")?;
    refunds::get_order_refund_summary(&db, &order_id)
}

#[tauri::command]
pub async fn refund_process(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
    state: tauri::State<'_, RefundDraftState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing refund payload")?;
    let data: ProcessRefund = serde_json::from_value(payload)
        .map_err(|e| format!("Invalid refund payload: {e}"))?;

    let result = refunds::process_refund(&db, &LiveProviderFactory, &data)?;

    // A processed refund invalidates any draft for its orders.
    *state.0.lock().map_err(|e| e.to_string())? = None;
    Ok(result)
}

#[tauri::command]
pub async fn refund_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let refund_number = value_str(&payload, &["refundNumber", "refund_number"])
        .ok_or("Missing refund number")?;
    refunds::get_refund(&db, &refund_number)
}
