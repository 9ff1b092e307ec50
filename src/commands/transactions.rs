use serde_json::Value;

use crate::notifications::HttpNotifier;
use crate::value_str;
use crate::{db, post_commit, transactions};

#[tauri::command]
pub async fn transaction_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing transaction payload")?;
    let transaction_id = value_str(&payload, &["transactionId", "transaction_id", "id"])
        .ok_or("Missing transaction id")?;
    transactions::get_transaction(&db, &transaction_id)
}

#[tauri::command]
pub async fn transaction_list_for_customer(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let customer_id =
        value_str(&payload, &["customerId", "customer_id"]).ok_or("Missing customer id")?;
    transactions::list_customer_transactions(&db, &customer_id)
}

#[tauri::command]
pub async fn transaction_daily_summary(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let date = value_str(&payload, &["date"]).ok_or("Missing date")?;
    transactions::daily_summary(&db, &date)
}

/// Retry a failed post-commit side effect (operator remediation from the
/// transaction detail screen).
#[tauri::command]
pub async fn transaction_retry_side_effect(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let queue_id = payload
        .get("queueId")
        .or_else(|| payload.get("queue_id"))
        .or_else(|| payload.get("id"))
        .and_then(Value::as_i64)
        .ok_or("Missing queue id")?;
    post_commit::retry_action(&db, &HttpNotifier, queue_id)
}
