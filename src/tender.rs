//! Payment method, provider, and payment-leg types shared by the
//! checkout, split-payment, transaction, and refund flows.

use serde::{Deserialize, Serialize};

use crate::money::{format_dollars, MIN_BALANCE};

/// A payment instrument. `HOUSE_ACCOUNT` and `COD` settle later via
/// invoicing rather than at the register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentMethod {
    Cash,
    Card,
    Check,
    Cod,
    HouseAccount,
    GiftCard,
    StoreCredit,
    Offline,
    External,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "CASH",
            PaymentMethod::Card => "CARD",
            PaymentMethod::Check => "CHECK",
            PaymentMethod::Cod => "COD",
            PaymentMethod::HouseAccount => "HOUSE_ACCOUNT",
            PaymentMethod::GiftCard => "GIFT_CARD",
            PaymentMethod::StoreCredit => "STORE_CREDIT",
            PaymentMethod::Offline => "OFFLINE",
            PaymentMethod::External => "EXTERNAL",
        }
    }

    /// Parse both the wire form (`"HOUSE_ACCOUNT"`) and the POS tile ids
    /// the frontend sends (`"house_account"`, `"credit"`, `"offline:wire"`).
    pub fn parse(raw: &str) -> Result<Self, String> {
        let token = raw.trim();
        if token.starts_with("offline:") || token.eq_ignore_ascii_case("wire") {
            return Ok(PaymentMethod::Offline);
        }
        match token.to_ascii_uppercase().as_str() {
            "CASH" => Ok(PaymentMethod::Cash),
            "CARD" | "CREDIT" | "DEBIT" => Ok(PaymentMethod::Card),
            "CHECK" => Ok(PaymentMethod::Check),
            "COD" | "PAY_LATER" => Ok(PaymentMethod::Cod),
            "HOUSE_ACCOUNT" => Ok(PaymentMethod::HouseAccount),
            "GIFT_CARD" => Ok(PaymentMethod::GiftCard),
            "STORE_CREDIT" => Ok(PaymentMethod::StoreCredit),
            "OFFLINE" => Ok(PaymentMethod::Offline),
            "EXTERNAL" => Ok(PaymentMethod::External),
            _ => Err(format!("Unknown payment method: {raw}")),
        }
    }

    /// Methods that settle money at the register. House-account and COD
    /// legs are collected later, so they do not count as settled when
    /// deriving an order's payment status.
    pub fn is_settling(&self) -> bool {
        !matches!(self, PaymentMethod::HouseAccount | PaymentMethod::Cod)
    }

    /// Tenders an operator can pick for one row of a split payment.
    pub fn valid_for_split(&self) -> bool {
        matches!(
            self,
            PaymentMethod::Cash
                | PaymentMethod::Card
                | PaymentMethod::Check
                | PaymentMethod::HouseAccount
                | PaymentMethod::GiftCard
                | PaymentMethod::Offline
        )
    }
}

/// Card processing backend for a leg. Non-card tenders are `Internal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Provider {
    Stripe,
    Square,
    Internal,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "STRIPE",
            Provider::Square => "SQUARE",
            Provider::Internal => "INTERNAL",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STRIPE" => Ok(Provider::Stripe),
            "SQUARE" => Ok(Provider::Square),
            "INTERNAL" => Ok(Provider::Internal),
            _ => Err(format!("Unknown provider: {raw}")),
        }
    }
}

/// One finalized payment instrument applied to a transaction.
///
/// The metadata fields are method-specific: card legs carry last4/brand/
/// fingerprint and the provider charge id, cash legs carry tendered/change,
/// checks a check number, gift cards the card number.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLeg {
    pub method: PaymentMethod,
    #[serde(default = "default_provider")]
    pub provider: Provider,
    pub amount_cents: i64,
    #[serde(default)]
    pub provider_transaction_id: Option<String>,
    #[serde(default)]
    pub card_last4: Option<String>,
    #[serde(default)]
    pub card_brand: Option<String>,
    #[serde(default)]
    pub card_fingerprint: Option<String>,
    #[serde(default)]
    pub gift_card_number: Option<String>,
    #[serde(default)]
    pub check_number: Option<String>,
    #[serde(default)]
    pub cash_received_cents: Option<i64>,
    #[serde(default)]
    pub change_given_cents: Option<i64>,
    #[serde(default)]
    pub reference: Option<String>,
}

fn default_provider() -> Provider {
    Provider::Internal
}

impl PaymentLeg {
    pub fn new(method: PaymentMethod, amount_cents: i64) -> Self {
        PaymentLeg {
            method,
            provider: Provider::Internal,
            amount_cents,
            provider_transaction_id: None,
            card_last4: None,
            card_brand: None,
            card_fingerprint: None,
            gift_card_number: None,
            check_number: None,
            cash_received_cents: None,
            change_given_cents: None,
            reference: None,
        }
    }

    /// Human-readable one-liner for receipts and the split-row detail column.
    pub fn summary(&self) -> String {
        match self.method {
            PaymentMethod::Cash => match self.cash_received_cents {
                Some(received) => {
                    let change = self.change_given_cents.unwrap_or(0);
                    if change > 0 {
                        format!(
                            "Cash received {} \u{2022} Change {}",
                            format_dollars(received),
                            format_dollars(change)
                        )
                    } else {
                        format!("Cash received {}", format_dollars(received))
                    }
                }
                None => "Cash".to_string(),
            },
            PaymentMethod::Card => {
                let brand = self.card_brand.as_deref().unwrap_or("Card");
                match self.card_last4.as_deref() {
                    Some(last4) => format!("{brand} \u{2022} **** {last4}"),
                    None => brand.to_string(),
                }
            }
            PaymentMethod::Check => match self.check_number.as_deref() {
                Some(num) => format!("Check #{num}"),
                None => "Check".to_string(),
            },
            PaymentMethod::GiftCard => match self.gift_card_number.as_deref() {
                Some(num) => format!("Gift card {num}"),
                None => "Gift card".to_string(),
            },
            PaymentMethod::HouseAccount => match self.reference.as_deref() {
                Some(r) => format!("House account \u{2022} {r}"),
                None => "House account".to_string(),
            },
            PaymentMethod::Cod => "Pay later".to_string(),
            PaymentMethod::StoreCredit => "Store credit".to_string(),
            PaymentMethod::Offline => match self.reference.as_deref() {
                Some(r) => format!("Offline \u{2022} {r}"),
                None => "Offline".to_string(),
            },
            PaymentMethod::External => "External".to_string(),
        }
    }
}

/// Adjust a leg list so its sum matches `expected_total` exactly.
///
/// Rounding drift of at most `MIN_BALANCE` is absorbed into the last leg.
/// A larger mismatch is returned as a validation error; nothing is mutated
/// silently beyond the tolerance.
pub fn normalize_legs(
    mut legs: Vec<PaymentLeg>,
    expected_total: i64,
) -> Result<Vec<PaymentLeg>, String> {
    if legs.is_empty() {
        return Err("At least one payment is required".into());
    }

    let submitted: i64 = legs.iter().map(|l| l.amount_cents).sum();
    let difference = expected_total - submitted;

    if difference == 0 {
        return Ok(legs);
    }
    if difference.abs() <= MIN_BALANCE {
        if let Some(last) = legs.last_mut() {
            last.amount_cents += difference;
        }
        return Ok(legs);
    }

    Err(format!(
        "Payments ({}) do not cover the order total ({})",
        format_dollars(submitted),
        format_dollars(expected_total)
    ))
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_method_wire_and_tile_forms() {
        assert_eq!(PaymentMethod::parse("CASH").unwrap(), PaymentMethod::Cash);
        assert_eq!(PaymentMethod::parse("credit").unwrap(), PaymentMethod::Card);
        assert_eq!(
            PaymentMethod::parse("house_account").unwrap(),
            PaymentMethod::HouseAccount
        );
        assert_eq!(
            PaymentMethod::parse("offline:wire").unwrap(),
            PaymentMethod::Offline
        );
        assert_eq!(
            PaymentMethod::parse("PAY_LATER").unwrap(),
            PaymentMethod::Cod
        );
        assert!(PaymentMethod::parse("bitcoin").is_err());
    }

    #[test]
    fn test_settling_methods() {
        assert!(PaymentMethod::Cash.is_settling());
        assert!(PaymentMethod::Card.is_settling());
        assert!(!PaymentMethod::HouseAccount.is_settling());
        assert!(!PaymentMethod::Cod.is_settling());
    }

    #[test]
    fn test_leg_summary_cash_with_change() {
        let mut leg = PaymentLeg::new(PaymentMethod::Cash, 2500);
        leg.cash_received_cents = Some(3000);
        leg.change_given_cents = Some(500);
        assert_eq!(leg.summary(), "Cash received $30.00 \u{2022} Change $5.00");
    }

    #[test]
    fn test_leg_summary_card() {
        let mut leg = PaymentLeg::new(PaymentMethod::Card, 6000);
        leg.card_brand = Some("Visa".into());
        leg.card_last4 = Some("4242".into());
        assert_eq!(leg.summary(), "Visa \u{2022} **** 4242");
    }

    #[test]
    fn test_normalize_absorbs_one_cent_into_last_leg() {
        let legs = vec![
            PaymentLeg::new(PaymentMethod::Cash, 4000),
            PaymentLeg::new(PaymentMethod::Card, 5999),
        ];
        let normalized = normalize_legs(legs, 10000).unwrap();
        assert_eq!(normalized[0].amount_cents, 4000);
        assert_eq!(normalized[1].amount_cents, 6000);
    }

    #[test]
    fn test_normalize_rejects_large_mismatch() {
        let legs = vec![PaymentLeg::new(PaymentMethod::Cash, 9000)];
        let err = normalize_legs(legs, 10000).unwrap_err();
        assert!(err.contains("do not cover"));
    }

    #[test]
    fn test_normalize_rejects_empty() {
        assert!(normalize_legs(Vec::new(), 100).is_err());
    }

    #[test]
    fn test_leg_deserializes_camel_case_payload() {
        let leg: PaymentLeg = serde_json::from_value(serde_json::json!({
            "method": "CARD",
            "provider": "STRIPE",
            "amountCents": 6000,
            "providerTransactionId": "pi_123",
            "cardLast4": "4242",
            "cardBrand": "Visa"
        }))
        .unwrap();
        assert_eq!(leg.method, PaymentMethod::Card);
        assert_eq!(leg.provider, Provider::Stripe);
        assert_eq!(leg.amount_cents, 6000);
        assert_eq!(leg.provider_transaction_id.as_deref(), Some("pi_123"));
    }
}
