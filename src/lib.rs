#![recursion_limit = "256"]

//! Bloom POS - Tauri v2 Backend
//!
//! Registers the IPC command handlers the React frontend calls via
//! `@tauri-apps/api/core::invoke()`. Domain logic lives in the top-level
//! modules; `commands/` only parses payloads and delegates.

use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod checkout;
mod commands;
mod customers;
mod db;
mod discounts;
mod gift_cards;
mod house_accounts;
mod money;
mod notifications;
mod orders;
mod post_commit;
mod providers;
mod refunds;
mod split;
mod storage;
mod tender;
mod transactions;

pub(crate) fn value_str(v: &serde_json::Value, keys: &[&str]) -> Option<String> {
    for key in keys {
        if let Some(s) = v.get(*key).and_then(|x| x.as_str()) {
            let trimmed = s.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

pub(crate) fn value_i64(v: &serde_json::Value, keys: &[&str]) -> Option<i64> {
    for key in keys {
        if let Some(n) = v.get(*key).and_then(|x| x.as_i64()) {
            return Some(n);
        }
    }
    None
}

/// Log directory (same base dirs the Tauri app-data path resolves to).
fn get_log_dir() -> PathBuf {
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("com.bloomflorist.pos").join("logs")
}

// ============================================================================
// App entry point
// ============================================================================

pub fn run() {
    // Initialize structured logging (console + rolling file)
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bloom_pos_lib=debug"));

    let log_dir = get_log_dir();
    std::fs::create_dir_all(&log_dir).ok();

    let file_appender = tracing_appender::rolling::daily(&log_dir, "pos");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);
    let console_layer = fmt::layer().with_target(true);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    // Keep the guard alive for the lifetime of the app — dropping it flushes logs.
    // We leak it intentionally since the app runs until process exit.
    std::mem::forget(_guard);

    info!("Starting Bloom POS v{}", env!("CARGO_PKG_VERSION"));

    tauri::Builder::default()
        .setup(|app| {
            use tauri::Manager;

            let app_data_dir = app
                .path()
                .app_data_dir()
                .expect("Failed to get app data dir");

            let db_state = db::init(&app_data_dir).expect("Failed to initialize database");
            app.manage(db_state);

            // Session state for the in-progress checkout, split payment,
            // and refund draft
            app.manage(commands::checkout::CheckoutState::default());
            app.manage(commands::split::SplitState::default());
            app.manage(commands::refunds::RefundDraftState::default());

            info!("Database and session state registered");
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            // Checkout session
            commands::checkout::checkout_start,
            commands::checkout::checkout_get_state,
            commands::checkout::checkout_cancel,
            commands::checkout::checkout_apply_manual_discount,
            commands::checkout::checkout_apply_coupon,
            commands::checkout::checkout_remove_coupon,
            commands::checkout::checkout_apply_automatic_discounts,
            commands::checkout::checkout_redeem_gift_card,
            commands::checkout::checkout_provide_gift_card_activations,
            commands::checkout::checkout_submit,
            // Split payment
            commands::split::split_start,
            commands::split::split_get_state,
            commands::split::split_cancel,
            commands::split::split_change_tender,
            commands::split::split_change_amount,
            commands::split::split_add_row,
            commands::split::split_delete_row,
            commands::split::split_mark_processing,
            commands::split::split_complete_row,
            commands::split::split_cancel_row,
            commands::split::split_take_completion,
            // Payment transactions
            commands::transactions::transaction_get,
            commands::transactions::transaction_list_for_customer,
            commands::transactions::transaction_daily_summary,
            commands::transactions::transaction_retry_side_effect,
            // Refunds
            commands::refunds::refund_draft_start,
            commands::refunds::refund_draft_get_state,
            commands::refunds::refund_draft_cancel,
            commands::refunds::refund_draft_set_item,
            commands::refunds::refund_draft_set_delivery_fee,
            commands::refunds::refund_draft_set_tax,
            commands::refunds::refund_get_order_summary,
            commands::refunds::refund_process,
            commands::refunds::refund_get,
            // House accounts
            commands::house_accounts::house_account_get_balance,
            commands::house_accounts::house_account_apply_payment,
            commands::house_accounts::house_account_add_adjustment,
            commands::house_accounts::house_account_statement,
            commands::house_accounts::house_account_list,
            commands::house_accounts::house_account_set_enabled,
            // Gift cards
            commands::gift_cards::gift_card_lookup,
            commands::gift_cards::gift_card_activate,
            commands::gift_cards::gift_card_redeem,
            // Discounts / coupons
            commands::discounts::coupon_validate,
            commands::discounts::discounts_auto_apply,
            // Customers
            commands::customers::customer_create,
            commands::customers::customer_get,
            commands::customers::customer_search,
            commands::customers::customer_match_by_fingerprint,
            // Orders
            commands::orders::order_get,
            // Settings
            commands::settings::settings_get_all,
            commands::settings::settings_get,
            commands::settings::settings_set,
            commands::settings::settings_update_provider_credentials,
            commands::settings::settings_is_configured,
            commands::settings::settings_factory_reset,
        ])
        .run(tauri::generate_context!())
        .expect("error while running Bloom POS");
}
