//! Reconciliation of gateway events into transaction and invoice status.
//!
//! Status is always recomputed globally from the full event history, never
//! patched incrementally. That trades extra reads for order-independence:
//! any permutation of deliveries and replays converges to the same state.

use std::sync::Arc;

use time::OffsetDateTime;
use uuid::Uuid;

use remit_shared::{InvoiceStatus, TransactionStatus};

use crate::error::BillingResult;
use crate::model::{Transaction, TransactionEvent};
use crate::store::BillingStore;

/// A validated callback outcome, not yet applied.
///
/// Produced by [`crate::callback::CallbackHandler::resolve`]; the caller
/// decides when and inside which storage transaction to apply it, so
/// callback acknowledgment and state mutation stay decoupled.
#[derive(Debug, Clone)]
pub struct ReconcileAction {
    pub company_id: Uuid,
    pub transaction_id: Uuid,
    pub status: TransactionStatus,
    pub gateway_event_id: String,
    pub occurred_at: OffsetDateTime,
}

/// Current status of a transaction, derived from its full event set.
///
/// The event with the greatest `occurred_at` wins. Equal timestamps are
/// broken by the greater gateway event id, so the result is deterministic
/// no matter what order events arrived in. `None` when there are no events
/// yet (the transaction keeps its initial status).
pub fn transaction_status_from_events(
    events: &[TransactionEvent],
) -> Option<TransactionStatus> {
    events
        .iter()
        .max_by(|a, b| {
            (a.occurred_at, &a.gateway_event_id).cmp(&(b.occurred_at, &b.gateway_event_id))
        })
        .map(|event| event.status)
}

/// Derive an invoice's status from its transactions.
///
/// Canceled submissions are ignored. Failed is sticky: one failed active
/// transaction forces the invoice to Failed regardless of the rest.
/// Succeeded requires every active transaction to have succeeded; an
/// invoice with no active transactions is Pending.
pub fn derive_invoice_status(transactions: &[Transaction]) -> InvoiceStatus {
    let mut any_active = false;
    let mut any_processing = false;
    let mut any_pending = false;

    for transaction in transactions.iter().filter(|t| t.submission.is_active()) {
        any_active = true;
        match transaction.status {
            TransactionStatus::Failed => return InvoiceStatus::Failed,
            TransactionStatus::Processing => any_processing = true,
            TransactionStatus::Pending => any_pending = true,
            TransactionStatus::Succeeded => {}
        }
    }

    if !any_active {
        InvoiceStatus::Pending
    } else if any_processing {
        InvoiceStatus::Processing
    } else if any_pending {
        InvoiceStatus::Pending
    } else {
        InvoiceStatus::Succeeded
    }
}

/// Applies validated reconcile actions against the store.
#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn BillingStore>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn BillingStore>) -> Self {
        Self { store }
    }

    /// Apply one action as a single atomic unit: insert the event (the
    /// store's uniqueness constraint on (company, gateway event id) is the
    /// dedup gate and fails the loser of a concurrent race with
    /// `DuplicateEvent`), then recompute the transaction's and the owning
    /// invoice's status from full history.
    pub async fn apply(&self, action: &ReconcileAction) -> BillingResult<()> {
        self.store.apply_event(action).await?;
        tracing::info!(
            company_id = %action.company_id,
            transaction_id = %action.transaction_id,
            gateway_event_id = %action.gateway_event_id,
            status = %action.status,
            occurred_at = %action.occurred_at,
            "Applied reconcile action"
        );
        Ok(())
    }
}
