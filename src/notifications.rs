//! Receipt email and print-job collaborators.
//!
//! Both services are consumed as black boxes over HTTP: payload in,
//! success out. Calls run after the payment transaction has committed and
//! are best-effort; a failure is reported back to the operator for manual
//! remediation (re-send receipt, reprint) but never affects the committed
//! transaction.

use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};

use crate::storage;

/// Default timeout for collaborator requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Convert a `reqwest::Error` into an operator-friendly message.
fn friendly_error(service: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return format!("{service} request timed out");
    }
    if err.is_connect() {
        return format!("Cannot reach {service}");
    }
    format!("{service} request failed: {err}")
}

fn build_client() -> Result<Client, String> {
    Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| format!("build http client: {e}"))
}

/// Dispatches receipt emails and print jobs. Kept behind a trait so the
/// post-commit runner can be tested without a network.
pub trait Notifier: Send + Sync {
    fn send_receipt_email(&self, payload: &Value) -> Result<(), String>;
    fn submit_print_job(&self, payload: &Value) -> Result<(), String>;
}

/// Live dispatcher backed by the configured service endpoints.
pub struct HttpNotifier;

impl Notifier for HttpNotifier {
    fn send_receipt_email(&self, payload: &Value) -> Result<(), String> {
        let base_url = storage::get_credential(storage::KEY_NOTIFY_SERVICE_URL)
            .ok_or("Notification service is not configured")?;
        let api_key = storage::get_credential(storage::KEY_NOTIFY_SERVICE_KEY).unwrap_or_default();

        let client = build_client()?;
        let mut request = client
            .post(format!("{}/notifications/receipt", base_url.trim_end_matches('/')))
            .json(payload);
        if !api_key.is_empty() {
            request = request.bearer_auth(&api_key);
        }

        let response = request
            .send()
            .map_err(|e| friendly_error("notification service", &e))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "receipt email rejected");
            return Err(format!("Notification service returned {status}"));
        }

        info!("receipt email dispatched");
        Ok(())
    }

    fn submit_print_job(&self, payload: &Value) -> Result<(), String> {
        let base_url = storage::get_credential(storage::KEY_PRINT_SERVICE_URL)
            .ok_or("Print service is not configured")?;

        let client = build_client()?;
        let response = client
            .post(format!("{}/print-jobs", base_url.trim_end_matches('/')))
            .json(payload)
            .send()
            .map_err(|e| friendly_error("print service", &e))?;

        if !response.status().is_success() {
            let status = response.status();
            warn!(%status, "print job rejected");
            return Err(format!("Print service returned {status}"));
        }

        info!("print job submitted");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records dispatches; optionally fails a channel.
    #[derive(Default)]
    pub struct MockNotifier {
        pub receipts: Mutex<Vec<Value>>,
        pub print_jobs: Mutex<Vec<Value>>,
        pub fail_receipts: bool,
        pub fail_print: bool,
    }

    impl Notifier for MockNotifier {
        fn send_receipt_email(&self, payload: &Value) -> Result<(), String> {
            self.receipts.lock().unwrap().push(payload.clone());
            if self.fail_receipts {
                return Err("smtp relay unavailable".into());
            }
            Ok(())
        }

        fn submit_print_job(&self, payload: &Value) -> Result<(), String> {
            self.print_jobs.lock().unwrap().push(payload.clone());
            if self.fail_print {
                return Err("printer offline".into());
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::MockNotifier;
    use super::*;

    #[test]
    fn test_mock_notifier_records_payloads() {
        let notifier = MockNotifier::default();
        notifier
            .send_receipt_email(&serde_json::json!({ "to": "iris@example.com" }))
            .unwrap();
        assert_eq!(notifier.receipts.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_mock_notifier_failure_modes() {
        let notifier = MockNotifier {
            fail_print: true,
            ..Default::default()
        };
        let err = notifier
            .submit_print_job(&serde_json::json!({}))
            .unwrap_err();
        assert!(err.contains("printer offline"));
    }
}
