//! Card provider clients (Stripe, Square).
//!
//! The POS only needs the refund leg of each provider's API: amount and
//! original charge id in, refund id and status out. Charges themselves are
//! collected by the provider's own terminal/elements flow and arrive here
//! as already-captured `provider_transaction_id`s.
//!
//! A timed-out or ambiguous response is an error, never assumed
//! successful; the caller leaves the leg unconfirmed and the operator
//! retries manually.

use reqwest::blocking::Client;
use serde_json::Value;
use std::time::Duration;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::storage;
use crate::tender::Provider;

/// Timeout for provider API calls.
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of a provider-side refund.
#[derive(Debug, Clone)]
pub struct ProviderRefund {
    pub refund_id: String,
    pub status: String,
}

/// The one provider operation the refund engine needs.
pub trait CardProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Reverse `amount_cents` of the charge identified by
    /// `provider_transaction_id`.
    fn refund(&self, provider_transaction_id: &str, amount_cents: i64)
        -> Result<ProviderRefund, String>;
}

/// Resolves a provider enum to a live client. Tests substitute their own
/// implementation.
pub trait ProviderFactory: Send + Sync {
    fn client(&self, provider: Provider) -> Result<Box<dyn CardProvider>, String>;
}

/// Convert a `reqwest::Error` into an operator-friendly message.
fn friendly_error(provider: &str, err: &reqwest::Error) -> String {
    if err.is_timeout() {
        return format!("{provider} request timed out - the refund was not confirmed");
    }
    if err.is_connect() {
        return format!("Cannot reach {provider}");
    }
    format!("{provider} request failed: {err}")
}

// ---------------------------------------------------------------------------
// Stripe
// ---------------------------------------------------------------------------

pub struct StripeClient {
    client: Client,
    base_url: String,
}

impl StripeClient {
    pub fn from_storage() -> Result<Self, String> {
        if storage::get_credential(storage::KEY_STRIPE_SECRET_KEY).is_none() {
            return Err("Stripe secret key is not configured".into());
        }
        Ok(StripeClient {
            client: Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .map_err(|e| format!("build http client: {e}"))?,
            base_url: "https://api.stripe.com".to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(base_url: &str) -> Self {
        StripeClient {
            client: Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .expect("build http client"),
            base_url: base_url.to_string(),
        }
    }
}

impl CardProvider for StripeClient {
    fn name(&self) -> &'static str {
        "Stripe"
    }

    fn refund(
        &self,
        provider_transaction_id: &str,
        amount_cents: i64,
    ) -> Result<ProviderRefund, String> {
        let key = Zeroizing::new(
            storage::get_credential(storage::KEY_STRIPE_SECRET_KEY)
                .ok_or("Stripe secret key is not configured")?,
        );

        let response = self
            .client
            .post(format!("{}/v1/refunds", self.base_url))
            .bearer_auth(key.as_str())
            .form(&[
                ("payment_intent", provider_transaction_id),
                ("amount", &amount_cents.to_string()),
            ])
            .send()
            .map_err(|e| friendly_error("Stripe", &e))?;

        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| format!("Stripe response parse: {e}"))?;

        if !status.is_success() {
            let message = body["error"]["message"]
                .as_str()
                .unwrap_or("refund rejected");
            warn!(provider_transaction_id, %status, "Stripe refund failed: {message}");
            return Err(format!("Stripe refund failed: {message}"));
        }

        let refund_id = body["id"]
            .as_str()
            .ok_or("Stripe response missing refund id")?
            .to_string();
        let refund_status = body["status"].as_str().unwrap_or("succeeded").to_string();

        info!(refund_id = %refund_id, amount = amount_cents, "Stripe refund created");
        Ok(ProviderRefund {
            refund_id,
            status: refund_status,
        })
    }
}

// ---------------------------------------------------------------------------
// Square
// ---------------------------------------------------------------------------

pub struct SquareClient {
    client: Client,
    base_url: String,
}

impl SquareClient {
    pub fn from_storage() -> Result<Self, String> {
        if storage::get_credential(storage::KEY_SQUARE_ACCESS_TOKEN).is_none() {
            return Err("Square access token is not configured".into());
        }
        Ok(SquareClient {
            client: Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .map_err(|e| format!("build http client: {e}"))?,
            base_url: "https://connect.squareup.com".to_string(),
        })
    }

    #[cfg(test)]
    pub fn with_base_url(base_url: &str) -> Self {
        SquareClient {
            client: Client::builder()
                .timeout(PROVIDER_TIMEOUT)
                .build()
                .expect("build http client"),
            base_url: base_url.to_string(),
        }
    }
}

impl CardProvider for SquareClient {
    fn name(&self) -> &'static str {
        "Square"
    }

    fn refund(
        &self,
        provider_transaction_id: &str,
        amount_cents: i64,
    ) -> Result<ProviderRefund, String> {
        let token = Zeroizing::new(
            storage::get_credential(storage::KEY_SQUARE_ACCESS_TOKEN)
                .ok_or("Square access token is not configured")?,
        );

        let idempotency_key = uuid::Uuid::new_v4().to_string();
        let response = self
            .client
            .post(format!("{}/v2/refunds", self.base_url))
            .bearer_auth(token.as_str())
            .json(&serde_json::json!({
                "idempotency_key": idempotency_key,
                "payment_id": provider_transaction_id,
                "amount_money": { "amount": amount_cents, "currency": "USD" },
            }))
            .send()
            .map_err(|e| friendly_error("Square", &e))?;

        let status = response.status();
        let body: Value = response
            .json()
            .map_err(|e| format!("Square response parse: {e}"))?;

        if !status.is_success() {
            let message = body["errors"][0]["detail"]
                .as_str()
                .unwrap_or("refund rejected");
            warn!(provider_transaction_id, %status, "Square refund failed: {message}");
            return Err(format!("Square refund failed: {message}"));
        }

        let refund_id = body["refund"]["id"]
            .as_str()
            .ok_or("Square response missing refund id")?
            .to_string();
        let refund_status = body["refund"]["status"]
            .as_str()
            .unwrap_or("COMPLETED")
            .to_string();

        info!(refund_id = %refund_id, amount = amount_cents, "Square refund created");
        Ok(ProviderRefund {
            refund_id,
            status: refund_status,
        })
    }
}

// ---------------------------------------------------------------------------
// Factory
// ---------------------------------------------------------------------------

/// Live factory backed by the credential store.
pub struct LiveProviderFactory;

impl ProviderFactory for LiveProviderFactory {
    fn client(&self, provider: Provider) -> Result<Box<dyn CardProvider>, String> {
        match provider {
            Provider::Stripe => Ok(Box::new(StripeClient::from_storage()?)),
            Provider::Square => Ok(Box::new(SquareClient::from_storage()?)),
            Provider::Internal => Err("INTERNAL tenders have no card provider".into()),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Records refund calls and returns a canned response.
    pub struct MockProvider {
        pub calls: Mutex<Vec<(String, i64)>>,
        pub fail_with: Option<String>,
    }

    impl MockProvider {
        pub fn succeeding() -> std::sync::Arc<Self> {
            std::sync::Arc::new(MockProvider {
                calls: Mutex::new(Vec::new()),
                fail_with: None,
            })
        }

        pub fn failing(message: &str) -> std::sync::Arc<Self> {
            std::sync::Arc::new(MockProvider {
                calls: Mutex::new(Vec::new()),
                fail_with: Some(message.to_string()),
            })
        }
    }

    impl CardProvider for std::sync::Arc<MockProvider> {
        fn name(&self) -> &'static str {
            "Mock"
        }

        fn refund(
            &self,
            provider_transaction_id: &str,
            amount_cents: i64,
        ) -> Result<ProviderRefund, String> {
            self.calls
                .lock()
                .unwrap()
                .push((provider_transaction_id.to_string(), amount_cents));
            match &self.fail_with {
                Some(message) => Err(message.clone()),
                None => Ok(ProviderRefund {
                    refund_id: format!("re_mock_{}", amount_cents),
                    status: "succeeded".to_string(),
                }),
            }
        }
    }

    /// Factory handing out clones of one mock for every provider.
    pub struct MockFactory(pub std::sync::Arc<MockProvider>);

    impl ProviderFactory for MockFactory {
        fn client(&self, _provider: Provider) -> Result<Box<dyn CardProvider>, String> {
            Ok(Box::new(std::sync::Arc::clone(&self.0)))
        }
    }
}
