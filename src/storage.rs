//! Secure secret storage using the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Card-provider secrets never touch
//! the SQLite database or the filesystem.

use keyring::Entry;
use serde_json::Value;
use tracing::{info, warn};
use zeroize::Zeroize;

const SERVICE_NAME: &str = "bloom-pos";

// Credential keys
pub const KEY_STRIPE_SECRET_KEY: &str = "stripe_secret_key";
pub const KEY_SQUARE_ACCESS_TOKEN: &str = "square_access_token";
pub const KEY_NOTIFY_SERVICE_URL: &str = "notify_service_url";
pub const KEY_NOTIFY_SERVICE_KEY: &str = "notify_service_key";
pub const KEY_PRINT_SERVICE_URL: &str = "print_service_url";

/// All credential keys managed by this module.
const ALL_KEYS: &[&str] = &[
    KEY_STRIPE_SECRET_KEY,
    KEY_SQUARE_ACCESS_TOKEN,
    KEY_NOTIFY_SERVICE_URL,
    KEY_NOTIFY_SERVICE_KEY,
    KEY_PRINT_SERVICE_URL,
];

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist (or the platform returns a "not found" error).
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

/// Store a credential in the OS keyring.
pub fn set_credential(key: &str, value: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    entry.set_password(value).map_err(|e| e.to_string())?;
    Ok(())
}

/// Delete a credential from the OS keyring. Silently succeeds if the entry
/// does not exist.
pub fn delete_credential(key: &str) -> Result<(), String> {
    let entry = Entry::new(SERVICE_NAME, key).map_err(|e| e.to_string())?;
    match entry.delete_credential() {
        Ok(()) => Ok(()),
        Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(e.to_string()),
    }
}

pub fn has_credential(key: &str) -> bool {
    get_credential(key).is_some()
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Whether at least one card provider is ready to process refunds.
pub fn has_card_provider() -> bool {
    has_credential(KEY_STRIPE_SECRET_KEY) || has_credential(KEY_SQUARE_ACCESS_TOKEN)
}

/// Store provider/service credentials received from the settings screen.
///
/// Expected JSON shape (camelCase):
/// ```json
/// {
///   "stripeSecretKey": "...",     // optional
///   "squareAccessToken": "...",   // optional
///   "notifyServiceUrl": "...",    // optional
///   "notifyServiceKey": "...",    // optional
///   "printServiceUrl": "..."      // optional
/// }
/// ```
pub fn update_provider_credentials(payload: &Value) -> Result<Value, String> {
    let fields: &[(&str, &[&str])] = &[
        (KEY_STRIPE_SECRET_KEY, &["stripeSecretKey", "stripe_secret_key"]),
        (
            KEY_SQUARE_ACCESS_TOKEN,
            &["squareAccessToken", "square_access_token"],
        ),
        (
            KEY_NOTIFY_SERVICE_URL,
            &["notifyServiceUrl", "notify_service_url"],
        ),
        (
            KEY_NOTIFY_SERVICE_KEY,
            &["notifyServiceKey", "notify_service_key"],
        ),
        (
            KEY_PRINT_SERVICE_URL,
            &["printServiceUrl", "print_service_url"],
        ),
    ];

    let mut stored = 0;
    for (cred_key, aliases) in fields {
        let value = aliases
            .iter()
            .find_map(|alias| payload.get(*alias).and_then(Value::as_str))
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        if let Some(mut value) = value {
            set_credential(cred_key, &value)?;
            value.zeroize();
            stored += 1;
        }
    }

    if stored == 0 {
        return Err("No credentials provided".into());
    }

    info!(stored, "provider credentials updated");
    Ok(serde_json::json!({ "success": true, "stored": stored }))
}

/// Delete every stored credential (factory reset).
pub fn factory_reset() -> Result<Value, String> {
    info!("performing factory reset - deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(serde_json::json!({ "success": true }))
}

// ===========================================================================
// Tests
// ===========================================================================
