use serde_json::Value;
use std::sync::Mutex;

use crate::split::SplitPayment;
use crate::tender::{PaymentLeg, PaymentMethod};
use crate::{value_i64, value_str};

/// The in-progress split payment, managed by Tauri.
#[derive(Default)]
pub struct SplitState(pub Mutex<Option<SplitPayment>>);

fn with_split<T>(
    state: &SplitState,
    f: impl FnOnce(&mut SplitPayment) -> Result<T, String>,
) -> Result<T, String> {
    let mut guard = state.0.lock().map_err(|e| e.to_string())?;
    let split = guard.as_mut().ok_or("No split payment in progress")?;
    f(split)
}

fn parse_row_id(payload: &Value) -> Result<String, String> {
    value_str(payload, &["rowId", "row_id", "id"]).ok_or("Missing row id".into())
}

#[tauri::command]
pub async fn split_start(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing split payload")?;
    let total = value_i64(&payload, &["totalCents", "total_cents", "total"])
        .ok_or("Missing split total")?;
    if total <= 0 {
        return Err("Split total must be greater than zero".into());
    }

    let split = SplitPayment::new(total);
    let snapshot = split.to_json();
    *state.0.lock().map_err(|e| e.to_string())? = Some(split);
    Ok(snapshot)
}

#[tauri::command]
pub async fn split_get_state(state: tauri::State<'_, SplitState>) -> Result<Value, String> {
    with_split(&state, |split| Ok(split.to_json()))
}

#[tauri::command]
pub async fn split_cancel(state: tauri::State<'_, SplitState>) -> Result<Value, String> {
    *state.0.lock().map_err(|e| e.to_string())? = None;
    Ok(serde_json::json!({ "success": true }))
}

#[tauri::command]
pub async fn split_change_tender(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    let tender = value_str(&payload, &["tender", "method"]).ok_or("Missing tender")?;
    let tender = PaymentMethod::parse(&tender)?;
    with_split(&state, |split| {
        split.change_tender(&row_id, tender)?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_change_amount(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    let amount =
        value_i64(&payload, &["amountCents", "amount_cents"]).ok_or("Missing amount")?;
    with_split(&state, |split| {
        split.change_amount(&row_id, amount)?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_add_row(state: tauri::State<'_, SplitState>) -> Result<Value, String> {
    with_split(&state, |split| {
        split.add_row()?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_delete_row(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    with_split(&state, |split| {
        split.delete_row(&row_id)?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_mark_processing(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    with_split(&state, |split| {
        split.mark_processing(&row_id)?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_complete_row(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    let leg: PaymentLeg = serde_json::from_value(
        payload.get("leg").cloned().ok_or("Missing payment leg")?,
    )
    .map_err(|e| format!("Invalid payment leg: {e}"))?;
    with_split(&state, |split| {
        split.complete_row(&row_id, leg)?;
        Ok(split.to_json())
    })
}

#[tauri::command]
pub async fn split_cancel_row(
    arg0: Option<Value>,
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let row_id = parse_row_id(&payload)?;
    with_split(&state, |split| {
        split.cancel_row(&row_id)?;
        Ok(split.to_json())
    })
}

/// Fire the completion trigger. Returns the committed legs exactly once
/// when the split is fully paid; the caller then submits them through the
/// checkout session as one multi-leg transaction.
#[tauri::command]
pub async fn split_take_completion(
    state: tauri::State<'_, SplitState>,
) -> Result<Value, String> {
    with_split(&state, |split| match split.take_completion() {
        Some(legs) => Ok(serde_json::json!({
            "ready": true,
            "legs": legs,
        })),
        None => Ok(serde_json::json!({
            "ready": false,
            "state": split.to_json(),
        })),
    })
}
