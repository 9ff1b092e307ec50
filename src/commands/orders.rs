use serde_json::Value;

use crate::value_str;
use crate::{db, orders};

#[tauri::command]
pub async fn order_get(
    arg0: Option<Value>,
    db: tauri::State<'_, db::DbState>,
) -> Result<Value, String> {
    let payload = arg0.ok_or("Missing payload")?;
    let order_id =
        value_str(&payload, &["orderId", "order_id", "id"]).ok_or("Missing order id")?;
    orders::get_order(&db, &order_id)
}
