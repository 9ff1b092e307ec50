use serde_json::Value;

use crate::value_str;
use crate::{customers, db};

#[tauri::command]
pub async fn customer_create(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing customer payload")?;
    customers::create_customer(&db, &payload)
}

#[tauri::command]
pub async fn customer_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let customer_id =
        value_str(&payload, &["customerId", "customer_id", "id"]).ok_or("Missing customer id")?;
    customers::get_customer(&db, &customer_id)
}

#[tauri::command]
pub async fn customer_search(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let query = value_str(&payload, &["query", "q", "search"]).ok_or("Missing search query")?;
    customers::search(&db, &query)
}

/// Best-effort repeat-customer matching from a card fingerprint. Always
/// succeeds; an empty match list means nothing was found.
#[tauri::command]
pub async fn customer_match_by_fingerprint(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let fingerprint = value_str(&payload, &["cardFingerprint", "card_fingerprint", "fingerprint"])
        .ok_or("Missing card fingerprint")?;
    Ok(customers::match_by_fingerprint(&db, &fingerprint))
}
