//! Idempotent dispatch of transactions against the gateway.
//!
//! Every operation runs the same lookup-before-create template: ask the
//! gateway for a resource already tagged with the transaction id, and only
//! mutate when the lookup comes back empty. A transaction that was
//! submitted — even if we crashed before recording the result — is found by
//! the lookup on redispatch, making the common retry path at-most-once.
//!
//! The lookup-then-mutate pair is not atomic at the gateway boundary; two
//! truly concurrent dispatches of one transaction can both miss. That
//! narrow window is accepted and left to gateway-side idempotency keys.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use remit_shared::{Submission, TransactionStatus, TransactionType};

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    funding_instrument_kind, ChargeOperation, ChargeRequest, Gateway, GatewayResource,
    ResourceKind,
};
use crate::model::Transaction;
use crate::status::map_gateway_status;
use crate::store::BillingStore;

/// How many dispatch attempts a transaction gets before its submission is
/// marked failed for good.
pub const MAX_SUBMISSION_ATTEMPTS: u32 = 10;

/// Default batch size for one submission sweep.
const SUBMISSION_BATCH: usize = 100;

/// What a dispatch produced: the gateway resource URI and the mapped status
/// of the gateway's synchronous answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DispatchOutcome {
    pub processor_uri: String,
    pub status: TransactionStatus,
}

/// Per-transaction result of a submission sweep.
#[derive(Debug, Clone)]
pub enum SubmitResult {
    Submitted {
        transaction_id: Uuid,
        outcome: DispatchOutcome,
    },
    Failed {
        transaction_id: Uuid,
        error: String,
        /// True once the retry budget is exhausted and the submission was
        /// marked failed for good.
        gave_up: bool,
    },
}

pub struct Dispatcher {
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn BillingStore>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<dyn BillingStore>) -> Self {
        Self { gateway, store }
    }

    /// Execute one transaction against the gateway with at-most-once
    /// semantics across sequential retries, persisting `processor_uri` and
    /// submission state on success.
    pub async fn execute(&self, transaction: &Transaction) -> BillingResult<DispatchOutcome> {
        let kind = ResourceKind::for_transaction(transaction.transaction_type);

        // Existence check before creation so a retried dispatch never
        // duplicates money movement at the gateway.
        let existing = self.gateway.find_by_tag(kind, transaction.id).await?;
        match existing.len() {
            0 => {}
            1 => {
                tracing::warn!(
                    transaction_id = %transaction.id,
                    processor_uri = %existing[0].href,
                    "Gateway record already exists, skipping mutating call"
                );
                return self.finish(transaction, &existing[0]).await;
            }
            n => {
                tracing::error!(
                    transaction_id = %transaction.id,
                    matches = n,
                    "Gateway holds multiple resources for one transaction"
                );
                return Err(BillingError::AmbiguousGatewayResource(transaction.id));
            }
        }

        let request = self.build_request(transaction).await?;
        tracing::debug!(
            transaction_id = %transaction.id,
            operation = ?request.operation,
            amount_cents = request.amount_cents,
            "Calling gateway"
        );
        let resource = self.gateway.create_charge(&request).await?;
        tracing::info!(
            transaction_id = %transaction.id,
            processor_uri = %resource.href,
            gateway_status = %resource.status,
            "Gateway accepted {}",
            transaction.transaction_type
        );
        self.finish(transaction, &resource).await
    }

    /// Sweep transactions awaiting submission through `execute`, recording
    /// failures against the retry budget. Worker entry point.
    pub async fn submit_due(&self) -> Vec<SubmitResult> {
        let due = match self.store.due_for_submission(SUBMISSION_BATCH).await {
            Ok(due) => due,
            Err(e) => {
                tracing::error!(error = %e, "Failed to load transactions due for submission");
                return Vec::new();
            }
        };

        let mut results = Vec::with_capacity(due.len());
        for transaction in due {
            match self.execute(&transaction).await {
                Ok(outcome) => results.push(SubmitResult::Submitted {
                    transaction_id: transaction.id,
                    outcome,
                }),
                Err(error) => {
                    if !error.is_retryable() {
                        tracing::warn!(
                            transaction_id = %transaction.id,
                            error = %error,
                            "Dispatch failed deterministically; redispatch will not help"
                        );
                    }
                    let gave_up = match self
                        .store
                        .mark_submission_failure(transaction.id, MAX_SUBMISSION_ATTEMPTS)
                        .await
                    {
                        Ok(submission) => submission == Submission::Failed,
                        Err(e) => {
                            tracing::error!(
                                transaction_id = %transaction.id,
                                error = %e,
                                "Failed to record submission failure"
                            );
                            false
                        }
                    };
                    results.push(SubmitResult::Failed {
                        transaction_id: transaction.id,
                        error: error.to_string(),
                        gave_up,
                    });
                }
            }
        }
        results
    }

    /// Map the gateway resource and persist the result on the transaction.
    async fn finish(
        &self,
        transaction: &Transaction,
        resource: &GatewayResource,
    ) -> BillingResult<DispatchOutcome> {
        let outcome = DispatchOutcome {
            processor_uri: resource.href.clone(),
            status: map_gateway_status(&resource.status),
        };
        self.store
            .mark_submitted(transaction.id, &outcome.processor_uri, outcome.status)
            .await?;
        Ok(outcome)
    }

    async fn build_request(&self, transaction: &Transaction) -> BillingResult<ChargeRequest> {
        let operation = match transaction.transaction_type {
            // A refund targets the original debit's gateway resource; it
            // has no funding instrument of its own.
            TransactionType::Refund => {
                let reference_id = transaction.reference_to.ok_or_else(|| {
                    BillingError::Validation(format!(
                        "refund {} carries no reference_to",
                        transaction.id
                    ))
                })?;
                let debit = self
                    .store
                    .transaction(reference_id)
                    .await?
                    .ok_or(BillingError::TransactionNotFound(reference_id))?;
                let debit_uri = debit.processor_uri.ok_or_else(|| {
                    BillingError::Validation(format!(
                        "referenced debit {} has no processor URI",
                        debit.id
                    ))
                })?;
                ChargeOperation::Refund { debit_uri }
            }
            TransactionType::Debit | TransactionType::Credit => {
                let uri = transaction.funding_instrument_uri.clone().ok_or_else(|| {
                    BillingError::Validation(format!(
                        "{} {} carries no funding instrument",
                        transaction.transaction_type, transaction.id
                    ))
                })?;
                // Shape check happens before any network call.
                let instrument_kind = funding_instrument_kind(&uri)?;
                self.gateway
                    .fetch_resource(instrument_kind, &uri)
                    .await
                    .map_err(|e| {
                        BillingError::InvalidFundingInstrument(format!(
                            "failed to validate funding instrument {uri}: {e}"
                        ))
                    })?;
                match transaction.transaction_type {
                    TransactionType::Debit => ChargeOperation::Debit { source_uri: uri },
                    _ => ChargeOperation::Credit {
                        destination_uri: uri,
                    },
                }
            }
        };

        Ok(ChargeRequest {
            operation,
            amount_cents: transaction.amount_cents,
            transaction_id: transaction.id,
            description: format!("Generated by Remit from invoice {}", transaction.invoice_id),
            statement_descriptor: transaction.statement_descriptor.clone(),
        })
    }
}
