//! Checkout session: the payment controller for one POS sale.
//!
//! Holds the cart snapshot and every discount source, gates gift-card
//! activation, guards against double submission, and drives the commit:
//! orders first, then the multi-leg payment transaction, then best-effort
//! post-commit side effects.
//!
//! Discount additivity: the manual discount, a validated coupon, automatic
//! discounts, and gift-card redemptions each contribute independently to
//! `total_discount_cents`, and the charge collected is
//! `max(0, grand_total - total_discount)`.

use serde_json::Value;
use tracing::{info, warn};

use crate::customers;
use crate::db::DbState;
use crate::discounts;
use crate::gift_cards::{self, CardActivation};
use crate::money::format_dollars;
use crate::notifications::Notifier;
use crate::orders::{self, CartItem, OrderContext};
use crate::post_commit;
use crate::tender::{normalize_legs, PaymentLeg, PaymentMethod};
use crate::transactions::{self, CreateTransaction};

/// A coupon that validated against this cart.
#[derive(Debug, Clone)]
pub struct AppliedCoupon {
    pub discount_id: String,
    pub code: String,
    pub amount_cents: i64,
}

/// One automatic discount resolved for this cart.
#[derive(Debug, Clone)]
pub struct AppliedAutomatic {
    pub discount_id: String,
    pub name: String,
    pub amount_cents: i64,
}

/// An earmarked gift-card redemption. The card is only debited after the
/// transaction commits.
#[derive(Debug, Clone)]
pub struct Redemption {
    pub card_number: String,
    pub amount_cents: i64,
}

/// Outcome of `attempt_finalize`.
#[derive(Debug)]
pub enum Finalize {
    /// Legs are normalized and cover the amount due; ready to submit.
    Ready(Vec<PaymentLeg>),
    /// The cart sells gift cards whose activation details are missing.
    /// The legs are parked; provide activations to resume.
    NeedsGiftCardActivation,
}

/// State for one in-progress POS payment.
#[derive(Debug, Default)]
pub struct CheckoutSession {
    pub cart: Vec<CartItem>,
    pub customer_id: Option<String>,
    pub customer_display_name: Option<String>,
    pub employee_id: Option<String>,
    pub delivery_fee_cents: i64,
    pub tax_cents: i64,
    pub tip_cents: i64,
    pub receipt_email: Option<String>,
    pub print_receipt: bool,

    manual_discount_cents: i64,
    coupon: Option<AppliedCoupon>,
    automatic: Vec<AppliedAutomatic>,
    redemptions: Vec<Redemption>,

    gift_card_activations: Vec<CardActivation>,
    pending_finalization: Option<Vec<PaymentLeg>>,

    /// Submission-in-flight flag. Checked before accepting a new submit so
    /// overlapping clicks cannot commit twice.
    processing: bool,
}

impl CheckoutSession {
    pub fn new(cart: Vec<CartItem>) -> Self {
        CheckoutSession {
            cart,
            ..Default::default()
        }
    }

    // -- Totals ------------------------------------------------------------

    pub fn item_total_cents(&self) -> i64 {
        self.cart.iter().map(|i| i.row_total_cents()).sum()
    }

    /// Everything owed before discounts.
    pub fn grand_total_cents(&self) -> i64 {
        self.item_total_cents() + self.delivery_fee_cents + self.tax_cents + self.tip_cents
    }

    pub fn gift_card_discount_cents(&self) -> i64 {
        self.redemptions.iter().map(|r| r.amount_cents).sum()
    }

    pub fn automatic_discount_cents(&self) -> i64 {
        self.automatic.iter().map(|a| a.amount_cents).sum()
    }

    pub fn coupon_discount_cents(&self) -> i64 {
        self.coupon.as_ref().map(|c| c.amount_cents).unwrap_or(0)
    }

    /// Sum of all four discount sources.
    pub fn total_discount_cents(&self) -> i64 {
        self.manual_discount_cents
            + self.coupon_discount_cents()
            + self.automatic_discount_cents()
            + self.gift_card_discount_cents()
    }

    /// Amount the tenders must cover.
    pub fn amount_due_cents(&self) -> i64 {
        (self.grand_total_cents() - self.total_discount_cents()).max(0)
    }

    // -- Discount sources --------------------------------------------------

    /// Staff-entered discount: percent of (items + delivery fee) or flat.
    pub fn apply_manual_discount(&mut self, percent: Option<i64>, flat_cents: Option<i64>) {
        self.manual_discount_cents = discounts::manual_discount_cents(
            self.item_total_cents(),
            self.delivery_fee_cents,
            percent,
            flat_cents,
        );
    }

    /// Validate and attach a coupon. Replaces any previous coupon.
    pub fn apply_coupon(&mut self, db: &DbState, code: &str) -> Result<Value, String> {
        let result = discounts::validate_coupon(
            db,
            code,
            &self.cart,
            self.customer_id.as_deref(),
            discounts::Source::Pos,
        )?;
        self.coupon = Some(AppliedCoupon {
            discount_id: result["coupon"]["id"].as_str().unwrap_or_default().to_string(),
            code: result["coupon"]["code"].as_str().unwrap_or(code).to_string(),
            amount_cents: result["discountAmountCents"].as_i64().unwrap_or(0),
        });
        Ok(result)
    }

    pub fn remove_coupon(&mut self) {
        self.coupon = None;
    }

    /// Resolve and attach automatic discounts for the current cart.
    pub fn apply_automatic_discounts(&mut self, db: &DbState) -> Result<Value, String> {
        let result = discounts::auto_apply(db, &self.cart, self.customer_id.as_deref())?;
        self.automatic = result["discounts"]
            .as_array()
            .map(|list| {
                list.iter()
                    .map(|d| AppliedAutomatic {
                        discount_id: d["id"].as_str().unwrap_or_default().to_string(),
                        name: d["name"].as_str().unwrap_or_default().to_string(),
                        amount_cents: d["discountAmountCents"].as_i64().unwrap_or(0),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(result)
    }

    /// Earmark a gift-card redemption against the balance due. The amount
    /// is capped at both the card's live balance and what remains due.
    pub fn redeem_gift_card(
        &mut self,
        db: &DbState,
        card_number: &str,
        requested_cents: Option<i64>,
    ) -> Result<Value, String> {
        let number = card_number.trim().to_ascii_uppercase();
        if self.redemptions.iter().any(|r| r.card_number == number) {
            return Err(format!("Gift card {number} is already applied"));
        }

        let balance = gift_cards::available_balance(db, &number)?;
        if balance <= 0 {
            return Err(format!("Gift card {number} has no balance"));
        }

        let due = self.amount_due_cents();
        if due <= 0 {
            return Err("Order is already fully covered".into());
        }

        let amount = requested_cents
            .map(|r| r.min(balance))
            .unwrap_or(balance)
            .min(due);
        if amount <= 0 {
            return Err("Redemption amount must be positive".into());
        }

        self.redemptions.push(Redemption {
            card_number: number.clone(),
            amount_cents: amount,
        });

        Ok(serde_json::json!({
            "cardNumber": number,
            "appliedCents": amount,
            "remainingDueCents": self.amount_due_cents(),
        }))
    }

    // -- Gift-card sale gate ----------------------------------------------

    fn gift_card_lines(&self) -> Vec<&CartItem> {
        self.cart.iter().filter(|i| i.is_gift_card()).collect()
    }

    /// True while the cart sells gift cards whose activation details have
    /// not been captured yet.
    pub fn needs_gift_card_activation(&self) -> bool {
        !self.gift_card_lines().is_empty() && self.gift_card_activations.is_empty()
    }

    /// Capture activation details and release any parked finalization.
    pub fn provide_gift_card_activations(
        &mut self,
        cards: Vec<CardActivation>,
    ) -> Result<Option<Vec<PaymentLeg>>, String> {
        gift_cards::validate_activations(&cards)?;
        self.gift_card_activations = cards;
        Ok(self.pending_finalization.take())
    }

    // -- Finalization ------------------------------------------------------

    /// Validate that `legs` cover the amount due and gate on gift-card
    /// activation. Ready legs are normalized (one-cent drift absorbed).
    pub fn attempt_finalize(&mut self, legs: Vec<PaymentLeg>) -> Result<Finalize, String> {
        if self.processing {
            return Err("A payment is already being processed".into());
        }
        let normalized = normalize_legs(legs, self.amount_due_cents())?;

        if self.needs_gift_card_activation() {
            self.pending_finalization = Some(normalized);
            return Ok(Finalize::NeedsGiftCardActivation);
        }
        Ok(Finalize::Ready(normalized))
    }

    /// Flip the in-flight flag. Rejects when a submission is already
    /// running; this is the double-click guard.
    pub fn begin_submission(&mut self) -> Result<(), String> {
        if self.processing {
            return Err("A payment is already being processed".into());
        }
        self.processing = true;
        Ok(())
    }

    pub fn end_submission(&mut self) {
        self.processing = false;
    }

    fn reset(&mut self) {
        *self = CheckoutSession::default();
    }

    // -- Submission --------------------------------------------------------

    /// Commit the payment: create orders, commit the transaction with all
    /// legs, then run post-commit side effects.
    ///
    /// Pre-commit failures persist nothing beyond any created orders (a
    /// partial-success error names what succeeded). Side-effect failures
    /// are returned in `sideEffectErrors` and never roll anything back.
    pub fn submit(
        &mut self,
        db: &DbState,
        notifier: &dyn Notifier,
        legs: Vec<PaymentLeg>,
    ) -> Result<Value, String> {
        self.begin_submission()?;
        let result = self.submit_inner(db, notifier, legs);
        match &result {
            Ok(_) => self.reset(),
            Err(_) => self.end_submission(),
        }
        result
    }

    fn submit_inner(
        &mut self,
        db: &DbState,
        notifier: &dyn Notifier,
        legs: Vec<PaymentLeg>,
    ) -> Result<Value, String> {
        if self.cart.is_empty() {
            return Err("Cart is empty".into());
        }
        if self.needs_gift_card_activation() {
            return Err("Gift card activation details are required".into());
        }
        let legs = normalize_legs(legs, self.amount_due_cents())?;
        let total: i64 = legs.iter().map(|l| l.amount_cents).sum();

        // -- Step 1: orders (own transaction) -----------------------------
        let (customer_id, order_ids) = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            conn.execute_batch("BEGIN IMMEDIATE")
                .map_err(|e| format!("begin transaction: {e}"))?;

            let created = (|| -> Result<(String, Vec<String>), String> {
                let customer_id = match &self.customer_id {
                    Some(id) => id.clone(),
                    None => customers::get_or_create_guest(&conn)?,
                };

                let mut order_ids: Vec<String> = self
                    .cart
                    .iter()
                    .filter_map(|i| i.draft_order_id.clone())
                    .collect();

                let ctx = OrderContext {
                    order_type: "PICKUP".to_string(),
                    delivery_fee_cents: self.delivery_fee_cents,
                    tax_cents: self.tax_cents,
                    discount_cents: self.total_discount_cents(),
                    notes: Some(format!(
                        "POS transaction for {}",
                        self.customer_display_name.as_deref().unwrap_or("Walk-in Customer")
                    )),
                };
                if let Some(new_order) =
                    orders::create_order_from_cart(&conn, &customer_id, &self.cart, &ctx)?
                {
                    order_ids.push(new_order);
                }

                if order_ids.is_empty() {
                    return Err("No orders to pay for".into());
                }
                Ok((customer_id, order_ids))
            })();

            match created {
                Ok(ok) => {
                    conn.execute_batch("COMMIT")
                        .map_err(|e| format!("commit: {e}"))?;
                    ok
                }
                Err(e) => {
                    let _ = conn.execute_batch("ROLLBACK");
                    return Err(e);
                }
            }
        };

        // -- Step 2: side-effect plan -------------------------------------
        let mut side_effects = Vec::new();
        if !self.gift_card_activations.is_empty() {
            side_effects.push(post_commit::Action {
                action_type: post_commit::GIFT_CARD_ACTIVATION,
                payload: serde_json::json!({
                    "cards": self
                        .gift_card_activations
                        .iter()
                        .map(|c| serde_json::json!({
                            "cardNumber": c.card_number,
                            "amountCents": c.amount_cents,
                            "cardType": c.card_type.as_str(),
                            "recipientName": c.recipient_name,
                            "recipientEmail": c.recipient_email,
                            "message": c.message,
                        }))
                        .collect::<Vec<_>>(),
                    "purchasedBy": self.customer_display_name,
                    "employeeId": self.employee_id,
                }),
            });
        }
        for redemption in &self.redemptions {
            side_effects.push(post_commit::Action {
                action_type: post_commit::GIFT_CARD_REDEMPTION,
                payload: serde_json::json!({
                    "cardNumber": redemption.card_number,
                    "amountCents": redemption.amount_cents,
                    "employeeId": self.employee_id,
                }),
            });
        }
        if let Some(coupon) = &self.coupon {
            side_effects.push(post_commit::Action {
                action_type: post_commit::DISCOUNT_USAGE,
                payload: serde_json::json!({
                    "discountId": coupon.discount_id,
                    "customerId": self.customer_id,
                    "orderId": order_ids.first(),
                }),
            });
        }
        for automatic in &self.automatic {
            side_effects.push(post_commit::Action {
                action_type: post_commit::DISCOUNT_USAGE,
                payload: serde_json::json!({
                    "discountId": automatic.discount_id,
                    "customerId": self.customer_id,
                    "orderId": order_ids.first(),
                }),
            });
        }
        if let Some(email) = self.receipt_email.as_deref().filter(|e| !e.is_empty()) {
            side_effects.push(post_commit::Action {
                action_type: post_commit::RECEIPT_EMAIL,
                payload: serde_json::json!({
                    "to": email,
                    "orderIds": order_ids,
                    "totalCents": total,
                }),
            });
        }
        if self.print_receipt {
            side_effects.push(post_commit::Action {
                action_type: post_commit::PRINT_JOB,
                payload: serde_json::json!({
                    "kind": "receipt",
                    "orderIds": order_ids,
                }),
            });
        }
        // Repeat-customer linking from card fingerprints, never blocking.
        if self.customer_id.is_some() {
            for leg in &legs {
                if leg.method == PaymentMethod::Card {
                    if let Some(fingerprint) = leg.card_fingerprint.as_deref() {
                        side_effects.push(post_commit::Action {
                            action_type: post_commit::CARD_FINGERPRINT_MATCH,
                            payload: serde_json::json!({
                                "customerId": self.customer_id,
                                "fingerprint": fingerprint,
                                "cardLast4": leg.card_last4,
                                "cardBrand": leg.card_brand,
                            }),
                        });
                    }
                }
            }
        }

        // -- Step 3: atomic transaction commit ----------------------------
        let data = CreateTransaction {
            customer_id: customer_id.clone(),
            employee_id: self.employee_id.clone(),
            channel: "POS".to_string(),
            total_amount_cents: total,
            tax_amount_cents: self.tax_cents,
            tip_amount_cents: self.tip_cents,
            notes: Some(format!(
                "POS transaction for {}",
                self.customer_display_name.as_deref().unwrap_or("Walk-in Customer")
            )),
            receipt_email: self.receipt_email.clone(),
            legs,
            order_ids: order_ids.clone(),
        };

        let transaction = transactions::create_transaction(db, &data, &side_effects)
            .map_err(|e| {
                warn!("payment tracking failed after order creation: {e}");
                format!("Orders were created but payment tracking failed: {e}")
            })?;
        let transaction_id = transaction["id"].as_str().unwrap_or_default().to_string();

        // -- Step 4: best-effort side effects ------------------------------
        let side_effect_errors = post_commit::run_pending(db, notifier, &transaction_id);

        // Cards activated for this transaction, for the completion screen.
        let activated = {
            let conn = db.conn.lock().map_err(|e| e.to_string())?;
            let mut stmt = conn
                .prepare(
                    "SELECT card_number, card_type, balance_cents, recipient_email
                     FROM gift_cards WHERE purchase_transaction_id = ?1",
                )
                .map_err(|e| e.to_string())?;
            // Activation records the transaction id passed in its payload;
            // the enqueue path omits it, so match on recent activations too.
            let mut cards: Vec<Value> = stmt
                .query_map(rusqlite::params![transaction_id], |row| {
                    Ok(serde_json::json!({
                        "cardNumber": row.get::<_, String>(0)?,
                        "cardType": row.get::<_, String>(1)?,
                        "balanceCents": row.get::<_, i64>(2)?,
                        "recipientEmail": row.get::<_, Option<String>>(3)?,
                    }))
                })
                .map(|rows| rows.filter_map(|r| r.ok()).collect())
                .unwrap_or_default();
            if cards.is_empty() && !self.gift_card_activations.is_empty() {
                for activation in &self.gift_card_activations {
                    if let Some(number) = activation.card_number.as_deref() {
                        if let Ok(card) = gift_cards::lookup_on_conn(&conn, number) {
                            cards.push(card);
                        }
                    }
                }
            }
            cards
        };

        info!(
            transaction_id = %transaction_id,
            total,
            side_effect_failures = side_effect_errors.len(),
            "checkout submitted"
        );

        Ok(serde_json::json!({
            "success": true,
            "transaction": transaction,
            "orderIds": order_ids,
            "activatedGiftCards": activated,
            "sideEffectErrors": side_effect_errors,
        }))
    }

    /// Snapshot for the frontend.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "itemTotalCents": self.item_total_cents(),
            "deliveryFeeCents": self.delivery_fee_cents,
            "taxCents": self.tax_cents,
            "tipCents": self.tip_cents,
            "grandTotalCents": self.grand_total_cents(),
            "manualDiscountCents": self.manual_discount_cents,
            "couponDiscountCents": self.coupon_discount_cents(),
            "automaticDiscountCents": self.automatic_discount_cents(),
            "giftCardDiscountCents": self.gift_card_discount_cents(),
            "totalDiscountCents": self.total_discount_cents(),
            "amountDueCents": self.amount_due_cents(),
            "amountDueDisplay": format_dollars(self.amount_due_cents()),
            "needsGiftCardActivation": self.needs_gift_card_activation(),
            "processing": self.processing,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
