use serde_json::Value;

use crate::money::parse_dollars;
use crate::{customers, db, house_accounts};
use crate::{value_i64, value_str};

fn parse_customer_id(payload: &Value) -> Result<String, String> {
    value_str(payload, &["customerId", "customer_id"]).ok_or("Missing customer id".into())
}

/// Amounts arrive as integer cents or as the dollar string the operator
/// typed into the payment dialog.
fn parse_amount(payload: &Value) -> Result<i64, String> {
    if let Some(cents) = value_i64(payload, &["amountCents", "amount_cents"]) {
        return Ok(cents);
    }
    match payload.get("amount") {
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| "Invalid amount".into()),
        Some(Value::String(s)) => parse_dollars(s),
        _ => Err("Missing amount".into()),
    }
}

#[tauri::command]
pub async fn house_account_get_balance(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let customer_id = parse_customer_id(&payload)?;
    let balance = house_accounts::get_balance(&db, &customer_id)?;
    Ok(serde_json::json!({
        "customerId": customer_id,
        "balanceCents": balance,
    }))
}

#[tauri::command]
pub async fn house_account_apply_payment(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payment payload")?;
    let customer_id = parse_customer_id(&payload)?;
    let amount = parse_amount(&payload)?;
    house_accounts::apply_payment(
        &db,
        &customer_id,
        amount,
        value_str(&payload, &["reference"]).as_deref(),
        value_str(&payload, &["notes"]).as_deref(),
        value_str(&payload, &["employeeId", "employee_id"]).as_deref(),
    )
}

#[tauri::command]
pub async fn house_account_add_adjustment(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing adjustment payload")?;
    let customer_id = parse_customer_id(&payload)?;
    let amount = parse_amount(&payload)?;
    let description =
        value_str(&payload, &["description"]).ok_or("Missing adjustment description")?;
    house_accounts::add_adjustment(
        &db,
        &customer_id,
        amount,
        &description,
        value_str(&payload, &["employeeId", "employee_id"]).as_deref(),
    )
}

#[tauri::command]
pub async fn house_account_statement(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let customer_id = parse_customer_id(&payload)?;
    let from = value_str(&payload, &["from", "fromDate", "from_date"]);
    let to = value_str(&payload, &["to", "toDate", "to_date"]);
    house_accounts::generate_statement(&db, &customer_id, from.as_deref(), to.as_deref())
}

#[tauri::command]
pub async fn house_account_list(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let has_balance_only = arg0
        .as_ref()
        .and_then(|p| {
            p.get("hasBalanceOnly")
                .or_else(|| p.get("has_balance_only"))
        })
        .and_then(Value::as_bool)
        .unwrap_or(false);
    house_accounts::list_accounts(&db, has_balance_only)
}

#[tauri::command]
pub async fn house_account_set_enabled(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let customer_id = parse_customer_id(&payload)?;
    let enabled = payload
        .get("enabled")
        .and_then(Value::as_bool)
        .ok_or("Missing enabled flag")?;
    customers::set_house_account_enabled(&db, &customer_id, enabled)
}
