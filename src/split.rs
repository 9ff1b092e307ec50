//! Split-payment state machine.
//!
//! Orchestrates collection of one order total across N heterogeneous
//! tenders without losing track of how much remains. Pure in-memory state,
//! driven by the checkout commands and unit-testable without any UI.
//!
//! **Row lifecycle:** `Pending -> Processing -> Completed`. Only pending
//! rows may be edited or deleted; `mark_processing` locks a row while its
//! tender-specific collection modal is open; a dismissed modal cancels the
//! row back to pending. Completed rows are immutable and a failed charge
//! never touches sibling rows.

use serde_json::Value;

use crate::money::{format_dollars, MIN_BALANCE};
use crate::tender::{PaymentLeg, PaymentMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowStatus {
    Pending,
    Processing,
    Completed,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RowStatus::Pending => "pending",
            RowStatus::Processing => "processing",
            RowStatus::Completed => "completed",
        }
    }
}

/// One row in an in-progress split payment.
#[derive(Debug, Clone)]
pub struct SplitRow {
    pub id: String,
    pub tender: PaymentMethod,
    pub amount_cents: i64,
    pub status: RowStatus,
    /// Committed leg, present once the row completes.
    pub leg: Option<PaymentLeg>,
    /// Human-readable collection details ("Visa **** 4242").
    pub details: Option<String>,
}

/// The split-payment session for a single order total.
#[derive(Debug)]
pub struct SplitPayment {
    total_cents: i64,
    rows: Vec<SplitRow>,
    next_row_id: u64,
    /// Set once the completion trigger has fired; re-evaluation after that
    /// returns nothing so the transaction is never submitted twice.
    completion_taken: bool,
}

impl SplitPayment {
    /// Start a split for `total_cents` with a single pending cash row
    /// pre-filled with the full total.
    pub fn new(total_cents: i64) -> Self {
        let mut split = SplitPayment {
            total_cents,
            rows: Vec::new(),
            next_row_id: 0,
            completion_taken: false,
        };
        let id = split.next_id();
        split.rows.push(SplitRow {
            id,
            tender: PaymentMethod::Cash,
            amount_cents: total_cents,
            status: RowStatus::Pending,
            leg: None,
            details: None,
        });
        split
    }

    fn next_id(&mut self) -> String {
        self.next_row_id += 1;
        format!("split-{}", self.next_row_id)
    }

    pub fn total_cents(&self) -> i64 {
        self.total_cents
    }

    pub fn rows(&self) -> &[SplitRow] {
        &self.rows
    }

    fn row_mut(&mut self, row_id: &str) -> Result<&mut SplitRow, String> {
        self.rows
            .iter_mut()
            .find(|r| r.id == row_id)
            .ok_or_else(|| format!("Split row not found: {row_id}"))
    }

    /// Amount of the total not yet reserved by any row. Pending and
    /// processing rows reserve their amount just like completed ones, so
    /// `remaining` only grows when a row is deleted or edited down.
    pub fn remaining_cents(&self) -> i64 {
        let reserved: i64 = self.rows.iter().map(|r| r.amount_cents).sum();
        (self.total_cents - reserved).max(0)
    }

    /// Sum of committed rows.
    pub fn paid_cents(&self) -> i64 {
        self.rows
            .iter()
            .filter(|r| r.status == RowStatus::Completed)
            .map(|r| r.amount_cents)
            .sum()
    }

    /// Change the tender of a pending row.
    pub fn change_tender(&mut self, row_id: &str, tender: PaymentMethod) -> Result<(), String> {
        if !tender.valid_for_split() {
            return Err(format!(
                "{} cannot be used as a split tender",
                tender.as_str()
            ));
        }
        let row = self.row_mut(row_id)?;
        if row.status != RowStatus::Pending {
            return Err("Only pending rows can change tender".into());
        }
        row.tender = tender;
        Ok(())
    }

    /// Change the amount of a pending row. Negative amounts clamp to zero.
    pub fn change_amount(&mut self, row_id: &str, amount_cents: i64) -> Result<(), String> {
        let row = self.row_mut(row_id)?;
        if row.status != RowStatus::Pending {
            return Err("Only pending rows can change amount".into());
        }
        row.amount_cents = amount_cents.max(0);
        Ok(())
    }

    /// Add a new pending cash row covering whatever remains.
    pub fn add_row(&mut self) -> Result<&SplitRow, String> {
        let remaining = self.remaining_cents();
        if remaining <= 0 {
            return Err("Order total is already fully allocated".into());
        }
        let id = self.next_id();
        self.rows.push(SplitRow {
            id,
            tender: PaymentMethod::Cash,
            amount_cents: remaining,
            status: RowStatus::Pending,
            leg: None,
            details: None,
        });
        Ok(self.rows.last().expect("row just pushed"))
    }

    /// Delete a pending row. The last remaining row can never be deleted.
    pub fn delete_row(&mut self, row_id: &str) -> Result<(), String> {
        if self.rows.len() <= 1 {
            return Err("Cannot delete the only split row".into());
        }
        let idx = self
            .rows
            .iter()
            .position(|r| r.id == row_id)
            .ok_or_else(|| format!("Split row not found: {row_id}"))?;
        if self.rows[idx].status != RowStatus::Pending {
            return Err("Only pending rows can be deleted".into());
        }
        self.rows.remove(idx);
        Ok(())
    }

    /// Lock a row for collection (`Pending -> Processing`), invoked right
    /// before the tender-specific collection modal opens. A row that is
    /// already processing or completed rejects, which is what guards
    /// against double-submission of the same row.
    pub fn mark_processing(&mut self, row_id: &str) -> Result<(), String> {
        let row = self.row_mut(row_id)?;
        match row.status {
            RowStatus::Pending => {
                row.status = RowStatus::Processing;
                Ok(())
            }
            RowStatus::Processing => Err("Row is already being collected".into()),
            RowStatus::Completed => Err("Row is already completed".into()),
        }
    }

    /// Commit a collected leg (`Processing -> Completed`). The leg amount
    /// becomes the row amount so the reconciliation below always reflects
    /// what was actually captured.
    pub fn complete_row(&mut self, row_id: &str, leg: PaymentLeg) -> Result<(), String> {
        let row = self.row_mut(row_id)?;
        if row.status != RowStatus::Processing {
            return Err("Row must be processing before it can complete".into());
        }
        row.amount_cents = leg.amount_cents;
        row.details = Some(leg.summary());
        row.leg = Some(leg);
        row.status = RowStatus::Completed;
        Ok(())
    }

    /// Return a processing row to pending (collection modal dismissed, or
    /// the charge was declined). Prior completed rows are untouched; the
    /// operator must refund explicitly if the split is abandoned.
    pub fn cancel_row(&mut self, row_id: &str) -> Result<(), String> {
        let row = self.row_mut(row_id)?;
        if row.status != RowStatus::Processing {
            return Err("Only processing rows can be cancelled".into());
        }
        row.status = RowStatus::Pending;
        Ok(())
    }

    /// True when every row is completed and the captured amounts cover the
    /// total within the one-cent tolerance.
    pub fn is_fully_paid(&self) -> bool {
        !self.rows.is_empty()
            && self
                .rows
                .iter()
                .all(|r| r.status == RowStatus::Completed)
            && self.paid_cents() >= self.total_cents - MIN_BALANCE
    }

    /// Fire the completion trigger: returns the committed legs exactly once
    /// when the split is fully paid. Later calls return `None`, so the
    /// outer controller can re-evaluate freely without re-submitting.
    pub fn take_completion(&mut self) -> Option<Vec<PaymentLeg>> {
        if self.completion_taken || !self.is_fully_paid() {
            return None;
        }
        self.completion_taken = true;
        Some(
            self.rows
                .iter()
                .filter_map(|r| r.leg.clone())
                .collect(),
        )
    }

    /// Snapshot for the frontend.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "totalCents": self.total_cents,
            "paidCents": self.paid_cents(),
            "remainingCents": self.remaining_cents(),
            "fullyPaid": self.is_fully_paid(),
            "rows": self.rows.iter().map(|r| serde_json::json!({
                "id": r.id,
                "tender": r.tender.as_str(),
                "amountCents": r.amount_cents,
                "amountDisplay": format_dollars(r.amount_cents),
                "status": r.status.as_str(),
                "details": r.details,
            })).collect::<Vec<_>>(),
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tender::Provider;

    fn cash_leg(amount: i64) -> PaymentLeg {
        let mut leg = PaymentLeg::new(PaymentMethod::Cash, amount);
        leg.cash_received_cents = Some(amount);
        leg
    }

    fn card_leg(amount: i64) -> PaymentLeg {
        let mut leg = PaymentLeg::new(PaymentMethod::Card, amount);
        leg.provider = Provider::Stripe;
        leg.card_last4 = Some("4242".into());
        leg.card_brand = Some("Visa".into());
        leg
    }

    #[test]
    fn test_new_creates_single_full_row() {
        let split = SplitPayment::new(10000);
        assert_eq!(split.rows().len(), 1);
        assert_eq!(split.rows()[0].amount_cents, 10000);
        assert_eq!(split.rows()[0].status, RowStatus::Pending);
        assert_eq!(split.remaining_cents(), 0);
    }

    #[test]
    fn test_pending_rows_reserve_against_total() {
        let mut split = SplitPayment::new(10000);
        let row_id = split.rows()[0].id.clone();

        split.change_amount(&row_id, 4000).unwrap();
        assert_eq!(split.remaining_cents(), 6000);

        let new_id = split.add_row().unwrap().id.clone();
        assert_eq!(split.rows()[1].amount_cents, 6000);
        assert_eq!(split.remaining_cents(), 0);

        // Editing the second row down frees the difference again
        split.change_amount(&new_id, 5000).unwrap();
        assert_eq!(split.remaining_cents(), 1000);
    }

    #[test]
    fn test_add_row_requires_remaining() {
        let mut split = SplitPayment::new(5000);
        let err = split.add_row().unwrap_err();
        assert!(err.contains("fully allocated"));
    }

    #[test]
    fn test_delete_row_rules() {
        let mut split = SplitPayment::new(10000);
        let first = split.rows()[0].id.clone();

        // Only row: cannot delete
        assert!(split.delete_row(&first).is_err());

        split.change_amount(&first, 4000).unwrap();
        let second = split.add_row().unwrap().id.clone();
        split.delete_row(&second).unwrap();
        assert_eq!(split.rows().len(), 1);

        // Completed rows cannot be deleted even when siblings exist
        split.change_amount(&first, 6000).unwrap();
        split.mark_processing(&first).unwrap();
        split.complete_row(&first, cash_leg(6000)).unwrap();
        split.add_row().unwrap();
        let err = split.delete_row(&first).unwrap_err();
        assert!(err.contains("pending"));
    }

    #[test]
    fn test_completed_rows_are_immutable() {
        let mut split = SplitPayment::new(3000);
        let id = split.rows()[0].id.clone();
        split.mark_processing(&id).unwrap();
        split.complete_row(&id, cash_leg(3000)).unwrap();

        assert!(split.change_amount(&id, 100).is_err());
        assert!(split.change_tender(&id, PaymentMethod::Card).is_err());
        assert!(split.mark_processing(&id).is_err());
    }

    #[test]
    fn test_mark_processing_guards_double_submission() {
        let mut split = SplitPayment::new(3000);
        let id = split.rows()[0].id.clone();
        split.mark_processing(&id).unwrap();
        let err = split.mark_processing(&id).unwrap_err();
        assert!(err.contains("already being collected"));
    }

    #[test]
    fn test_cancel_returns_row_to_pending_without_touching_others() {
        let mut split = SplitPayment::new(10000);
        let a = split.rows()[0].id.clone();
        split.change_amount(&a, 4000).unwrap();
        let b = split.add_row().unwrap().id.clone();

        // Complete A
        split.mark_processing(&a).unwrap();
        split.complete_row(&a, cash_leg(4000)).unwrap();

        // B declines
        split.change_tender(&b, PaymentMethod::Card).unwrap();
        split.mark_processing(&b).unwrap();
        split.cancel_row(&b).unwrap();

        assert_eq!(split.rows()[1].status, RowStatus::Pending);
        assert_eq!(split.rows()[0].status, RowStatus::Completed);
        assert_eq!(split.paid_cents(), 4000);
        assert!(!split.is_fully_paid());
    }

    #[test]
    fn test_cash_then_card_scenario() {
        // Order total $100.00; row A = cash $40.00, row B = card $60.00.
        let mut split = SplitPayment::new(10000);
        let a = split.rows()[0].id.clone();
        split.change_amount(&a, 4000).unwrap();
        let b = split.add_row().unwrap().id.clone();
        split.change_tender(&b, PaymentMethod::Card).unwrap();

        split.mark_processing(&a).unwrap();
        split.complete_row(&a, cash_leg(4000)).unwrap();
        assert!(split.take_completion().is_none());

        split.mark_processing(&b).unwrap();
        split.complete_row(&b, card_leg(6000)).unwrap();

        assert_eq!(split.remaining_cents(), 0);
        assert!(split.is_fully_paid());

        let legs = split.take_completion().expect("completion should fire");
        assert_eq!(legs.len(), 2);
        assert_eq!(legs.iter().map(|l| l.amount_cents).sum::<i64>(), 10000);
    }

    #[test]
    fn test_completion_trigger_is_idempotent() {
        let mut split = SplitPayment::new(2000);
        let id = split.rows()[0].id.clone();
        split.mark_processing(&id).unwrap();
        split.complete_row(&id, cash_leg(2000)).unwrap();

        assert!(split.take_completion().is_some());
        assert!(split.take_completion().is_none());
        assert!(split.take_completion().is_none());
    }

    #[test]
    fn test_one_cent_tolerance() {
        let mut split = SplitPayment::new(10000);
        let a = split.rows()[0].id.clone();
        split.change_amount(&a, 9999).unwrap();
        split.mark_processing(&a).unwrap();
        split.complete_row(&a, cash_leg(9999)).unwrap();

        // 9999 >= 10000 - MIN_BALANCE
        assert!(split.is_fully_paid());
    }

    #[test]
    fn test_split_conservation_over_random_edits() {
        // Property: after any sequence of edits, once everything completes
        // the committed legs sum to the original total (within tolerance).
        let mut split = SplitPayment::new(12345);
        let a = split.rows()[0].id.clone();
        split.change_amount(&a, 5000).unwrap();
        let b = split.add_row().unwrap().id.clone();
        split.change_amount(&b, 2000).unwrap();
        let c = split.add_row().unwrap().id.clone();
        assert_eq!(split.rows()[2].amount_cents, 5345);

        // Delete b, re-add
        split.delete_row(&b).unwrap();
        let d = split.add_row().unwrap().id.clone();
        assert_eq!(split.remaining_cents(), 0);

        for id in [a, c, d] {
            let amount = split
                .rows()
                .iter()
                .find(|r| r.id == id)
                .unwrap()
                .amount_cents;
            split.mark_processing(&id).unwrap();
            split.complete_row(&id, cash_leg(amount)).unwrap();
        }

        let legs = split.take_completion().expect("fully paid");
        assert_eq!(legs.iter().map(|l| l.amount_cents).sum::<i64>(), 12345);
    }

    #[test]
    fn test_to_json_snapshot() {
        let split = SplitPayment::new(5000);
        let snapshot = split.to_json();
        assert_eq!(snapshot["totalCents"], 5000);
        assert_eq!(snapshot["remainingCents"], 0);
        assert_eq!(snapshot["fullyPaid"], false);
        assert_eq!(snapshot["rows"][0]["tender"], "CASH");
        assert_eq!(snapshot["rows"][0]["amountDisplay"], "$50.00");
    }
}
