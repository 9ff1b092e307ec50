use serde_json::Value;

use crate::value_str;
use crate::{db, storage};

#[tauri::command]
pub async fn settings_get_all(db: tauri::State<'_, db::DbState>) -> Result<Value, String> {
    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(db::get_all_settings(&conn))
}

#[tauri::command]
pub async fn settings_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let category = value_str(&payload, &["category"]).unwrap_or_else(|| "general".to_string());
    let key = value_str(&payload, &["key"]).ok_or("Missing setting key")?;

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    Ok(serde_json::json!({
        "category": category,
        "key": key,
        "value": db::get_setting(&conn, &category, &key),
    }))
}

#[tauri::command]
pub async fn settings_set(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let category = value_str(&payload, &["category"]).unwrap_or_else(|| "general".to_string());
    let key = value_str(&payload, &["key"]).ok_or("Missing setting key")?;
    let value = match payload.get("value") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };

    let conn = db.conn.lock().map_err(|e| e.to_string())?;
    db::set_setting(&conn, &category, &key, &value)?;
    Ok(serde_json::json!({ "success": true }))
}

/// Store card-provider and collaborator-service credentials in the OS
/// keyring. Values never land in SQLite.
#[tauri::command]
pub async fn settings_update_provider_credentials(
    arg0: Option<Value>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing credentials payload")?;
    storage::update_provider_credentials(&payload)
}

#[tauri::command]
pub async fn settings_is_configured() -> Result<Value, String> {
    Ok(serde_json::json!({
        "cardProviderConfigured": storage::has_card_provider(),
        "notifyServiceConfigured": storage::has_credential(storage::KEY_NOTIFY_SERVICE_URL),
        "printServiceConfigured": storage::has_credential(storage::KEY_PRINT_SERVICE_URL),
    }))
}

#[tauri::command]
pub async fn settings_factory_reset() -> Result<Value, String> {
    storage::factory_reset()
}
