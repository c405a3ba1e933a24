//! Persisted records of the billing engine.
//!
//! Row types mirror the tables in `migrations/0001_init.sql`. Status fields
//! on [`Transaction`] and [`Invoice`] are derived by the reconciliation
//! engine and must not be written by anything else.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use remit_shared::{InvoiceStatus, Submission, TransactionStatus, TransactionType};

use crate::error::{BillingError, BillingResult};

/// Tenant boundary. Owns the gateway credential; every lookup in the engine
/// is scoped by company id.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Company {
    pub id: Uuid,
    /// Secret key for the company's account at the payment gateway.
    pub api_key: String,
    /// Shared secret handed to the gateway when registering the callback URL.
    pub callback_key: String,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Customer {
    pub id: Uuid,
    pub company_id: Uuid,
    /// URI of the gateway-side customer record, set once created there.
    pub processor_uri: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A billable aggregate owning the transactions for one customer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Invoice {
    pub id: Uuid,
    pub company_id: Uuid,
    pub customer_id: Uuid,
    pub amount_cents: i64,
    /// Derived from the invoice's active transactions; never set directly.
    pub status: InvoiceStatus,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// One intended money movement. Never physically deleted; a withdrawn
/// transaction moves its submission state to `Canceled` and stays for audit.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Transaction {
    pub id: Uuid,
    pub company_id: Uuid,
    pub invoice_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount_cents: i64,
    /// Card or bank-account URI at the gateway. Always `None` for refunds.
    pub funding_instrument_uri: Option<String>,
    /// For refunds: the settled debit being refunded.
    pub reference_to: Option<Uuid>,
    /// URI of the gateway resource once the dispatcher has submitted.
    pub processor_uri: Option<String>,
    pub status: TransactionStatus,
    pub submission: Submission,
    /// Dispatch attempts so far; drives the retry budget.
    pub attempt_count: i32,
    pub statement_descriptor: Option<String>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// Parameters for creating a transaction.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub company_id: Uuid,
    pub invoice_id: Uuid,
    pub transaction_type: TransactionType,
    pub amount_cents: i64,
    pub funding_instrument_uri: Option<String>,
    pub reference_to: Option<Uuid>,
    pub statement_descriptor: Option<String>,
}

impl NewTransaction {
    /// Enforce the refund invariant: a refund must reference a debit whose
    /// submission is `Done`, and carries no funding instrument of its own.
    /// `reference` is the transaction `reference_to` resolves to, if any.
    pub fn validate(&self, reference: Option<&Transaction>) -> BillingResult<()> {
        match self.transaction_type {
            TransactionType::Refund => {
                if self.funding_instrument_uri.is_some() {
                    return Err(BillingError::Validation(
                        "refunds carry no funding instrument".to_string(),
                    ));
                }
                let reference_id = self.reference_to.ok_or_else(|| {
                    BillingError::Validation("refund requires reference_to".to_string())
                })?;
                let debit = reference
                    .ok_or(BillingError::TransactionNotFound(reference_id))?;
                if debit.company_id != self.company_id || debit.invoice_id != self.invoice_id {
                    return Err(BillingError::Validation(
                        "refund must reference a debit on the same invoice".to_string(),
                    ));
                }
                if debit.transaction_type != TransactionType::Debit {
                    return Err(BillingError::Validation(format!(
                        "refund must reference a debit, got {}",
                        debit.transaction_type
                    )));
                }
                if debit.submission != Submission::Done {
                    return Err(BillingError::Validation(format!(
                        "refund must reference a settled debit, submission is {}",
                        debit.submission
                    )));
                }
                Ok(())
            }
            TransactionType::Debit | TransactionType::Credit => {
                if self.reference_to.is_some() {
                    return Err(BillingError::Validation(format!(
                        "{} must not carry reference_to",
                        self.transaction_type
                    )));
                }
                Ok(())
            }
        }
    }
}

/// An immutable fact delivered by the gateway: what status a transaction's
/// underlying entity had at `occurred_at`. Created once per distinct gateway
/// event id, never updated or deleted.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TransactionEvent {
    pub id: Uuid,
    pub company_id: Uuid,
    pub transaction_id: Uuid,
    /// Gateway-assigned event id, unique within a company.
    pub gateway_event_id: String,
    pub status: TransactionStatus,
    /// The gateway's authoritative timestamp of the state change. Ordering
    /// uses this, never local ingestion time.
    pub occurred_at: OffsetDateTime,
    pub created_at: OffsetDateTime,
}
