//! Inbound gateway callback handling.
//!
//! Callbacks are validated here and turned into deferred
//! [`ReconcileAction`]s; applying them is the caller's decision, so
//! transport-level acknowledgment stays decoupled from the storage commit.

use std::sync::Arc;

use serde::Deserialize;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{Gateway, TRANSACTION_TAG};
use crate::model::Company;
use crate::reconcile::ReconcileAction;
use crate::status::map_gateway_status;
use crate::store::BillingStore;

/// The wire payload the gateway delivers to a callback URL. Carries nothing
/// trustworthy beyond the event id; `event_type` is informational only.
#[derive(Debug, Clone, Deserialize)]
pub struct CallbackPayload {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
}

pub struct CallbackHandler {
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn BillingStore>,
}

impl CallbackHandler {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<dyn BillingStore>) -> Self {
        Self { gateway, store }
    }

    /// Validate a callback and produce the deferred action.
    ///
    /// Returns `Ok(None)` for events that carry no transaction tag: not
    /// every gateway event is billing-relevant, and ignoring those is by
    /// design, not an error.
    pub async fn resolve(
        &self,
        company: &Company,
        payload: &CallbackPayload,
    ) -> BillingResult<Option<ReconcileAction>> {
        tracing::info!(
            company_id = %company.id,
            event_id = %payload.event_id,
            event_type = %payload.event_type,
            "Handling gateway callback"
        );

        // Re-fetch the event from the gateway to ensure it is real. Without
        // this, anyone who knows the company's callback key could forge a
        // payload and settle an arbitrary invoice.
        let event = self
            .gateway
            .fetch_event(&payload.event_id)
            .await
            .map_err(|e| {
                BillingError::InvalidCallbackPayload(format!(
                    "failed to fetch event {}: {e}",
                    payload.event_id
                ))
            })?;

        let Some(tag) = event.metadata.get(TRANSACTION_TAG) else {
            tracing::info!(event_id = %event.id, "Not a transaction created by us, ignoring");
            return Ok(None);
        };

        let transaction_id = Uuid::parse_str(tag).map_err(|_| {
            BillingError::InvalidCallbackPayload(format!(
                "event {} carries malformed transaction tag {tag:?}",
                event.id
            ))
        })?;

        // Scoped lookup: a transaction belonging to another company must be
        // indistinguishable from one that does not exist.
        let transaction = self
            .store
            .transaction_for_company(company.id, transaction_id)
            .await?
            .ok_or_else(|| {
                BillingError::InvalidCallbackPayload(format!(
                    "transaction {transaction_id} does not exist in this company"
                ))
            })?;

        let status = map_gateway_status(&event.entity_status);
        tracing::info!(
            transaction_id = %transaction.id,
            entity_status = %event.entity_status,
            new_status = %status,
            gateway_event_id = %event.id,
            occurred_at = %event.occurred_at,
            "Resolved callback to reconcile action"
        );

        Ok(Some(ReconcileAction {
            company_id: company.id,
            transaction_id: transaction.id,
            status,
            gateway_event_id: event.id,
            occurred_at: event.occurred_at,
        }))
    }
}
