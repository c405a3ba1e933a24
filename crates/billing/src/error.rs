//! Error types for the billing engine.

use thiserror::Error;
use uuid::Uuid;

use crate::gateway::GatewayError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    /// The gateway event id was already recorded for this company. The
    /// enclosing storage transaction rolls back; nothing partial persists.
    #[error("event {event_id} already recorded for company {company_id}")]
    DuplicateEvent { company_id: Uuid, event_id: String },

    /// The callback references no transaction in the calling company's
    /// scope, or the event could not be verified against the gateway.
    #[error("invalid callback payload: {0}")]
    InvalidCallbackPayload(String),

    /// A customer or funding-instrument reference is not in URI form.
    /// A very common mistake is passing the gateway GUID instead of the URI.
    #[error("invalid URI format: {0}")]
    InvalidUriFormat(String),

    #[error("invalid funding instrument: {0}")]
    InvalidFundingInstrument(String),

    #[error("invalid customer: {0}")]
    InvalidCustomer(String),

    /// The gateway holds more than one resource tagged with this
    /// transaction. Dispatch must not guess which one is the real money
    /// movement; an operator has to reconcile the gateway-side duplicates.
    #[error("gateway holds multiple resources tagged with transaction {0}")]
    AmbiguousGatewayResource(Uuid),

    /// Missing or unusable configuration. A caller error, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("invoice {0} not found")]
    InvoiceNotFound(Uuid),

    #[error("customer {0} not found")]
    CustomerNotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl BillingError {
    /// Whether a later redispatch could plausibly succeed. Validation and
    /// configuration failures are deterministic; retrying them only burns
    /// the retry budget.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Database(_) | BillingError::Gateway(_))
    }
}
