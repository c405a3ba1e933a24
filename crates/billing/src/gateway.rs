//! Payment gateway abstraction.
//!
//! The gateway is an external RPC service; everything the engine needs from
//! it fits the small [`Gateway`] trait. The production implementation is
//! [`crate::client::HttpGateway`]; tests substitute recording fakes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use remit_shared::TransactionType;

use crate::error::{BillingError, BillingResult};

/// Metadata key binding a gateway resource back to our transaction.
pub const TRANSACTION_TAG: &str = "remit.transaction_id";

/// Metadata key binding a gateway customer record back to our customer.
pub const CUSTOMER_TAG: &str = "remit.customer_id";

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("gateway request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway returned {status} for {context}")]
    Status { status: u16, context: String },

    #[error("gateway response malformed: {0}")]
    Malformed(String),
}

/// A full event record fetched from the gateway by id.
///
/// Only ever obtained by re-fetching: the inbound callback payload is not
/// trusted beyond the event id it names.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayEvent {
    pub id: String,
    /// When the underlying state change actually happened, per the gateway.
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    /// Status of the entity the event describes, in gateway vocabulary.
    pub entity_status: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// A resource record at the gateway (debit, credit, refund, card, ...).
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayResource {
    pub href: String,
    pub status: String,
}

/// The kinds of gateway resource the engine touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Debit,
    Credit,
    Refund,
    Card,
    BankAccount,
    Customer,
}

impl ResourceKind {
    /// Collection segment in the gateway's REST paths.
    pub fn path(&self) -> &'static str {
        match self {
            ResourceKind::Debit => "debits",
            ResourceKind::Credit => "credits",
            ResourceKind::Refund => "refunds",
            ResourceKind::Card => "cards",
            ResourceKind::BankAccount => "bank_accounts",
            ResourceKind::Customer => "customers",
        }
    }

    pub fn for_transaction(transaction_type: TransactionType) -> Self {
        match transaction_type {
            TransactionType::Debit => ResourceKind::Debit,
            TransactionType::Credit => ResourceKind::Credit,
            TransactionType::Refund => ResourceKind::Refund,
        }
    }
}

/// Classify a funding-instrument URI, rejecting anything that is not a
/// recognized instrument shape before any network call is made.
pub fn funding_instrument_kind(uri: &str) -> BillingResult<ResourceKind> {
    if !uri.starts_with('/') {
        return Err(BillingError::InvalidUriFormat(format!(
            "funding instrument should be a URI like \
             /v1/marketplaces/MPxxx/cards/CCxxx, got {uri:?}; remember it is \
             a URI rather than a GUID"
        )));
    }
    if uri.contains("/bank_accounts/") {
        Ok(ResourceKind::BankAccount)
    } else if uri.contains("/cards/") {
        Ok(ResourceKind::Card)
    } else {
        Err(BillingError::InvalidFundingInstrument(format!(
            "unknown type of funding instrument {uri}; should be a bank \
             account or card"
        )))
    }
}

/// The mutating side of a dispatch: which gateway operation to perform and
/// what it targets. The variants' differences are data, not behavior; the
/// dispatcher runs one algorithm over all three.
#[derive(Debug, Clone)]
pub enum ChargeOperation {
    Debit { source_uri: String },
    Credit { destination_uri: String },
    /// Refunds target the original debit's gateway resource; they have no
    /// funding instrument of their own.
    Refund { debit_uri: String },
}

impl ChargeOperation {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ChargeOperation::Debit { .. } => ResourceKind::Debit,
            ChargeOperation::Credit { .. } => ResourceKind::Credit,
            ChargeOperation::Refund { .. } => ResourceKind::Refund,
        }
    }
}

/// One mutating call against the gateway, fully described.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub operation: ChargeOperation,
    pub amount_cents: i64,
    /// Written into the resource's metadata under [`TRANSACTION_TAG`] so the
    /// lookup-before-create path can find it on retry.
    pub transaction_id: Uuid,
    pub description: String,
    pub statement_descriptor: Option<String>,
}

/// RPC surface of the payment gateway consumed by the engine.
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Fetch the full event record by id.
    async fn fetch_event(&self, event_id: &str) -> Result<GatewayEvent, GatewayError>;

    /// All resources of `kind` whose metadata tags them with this
    /// transaction. Expected to match at most one; callers treat more as a
    /// consistency error.
    async fn find_by_tag(
        &self,
        kind: ResourceKind,
        transaction_id: Uuid,
    ) -> Result<Vec<GatewayResource>, GatewayError>;

    /// Fetch a resource by its URI.
    async fn fetch_resource(
        &self,
        kind: ResourceKind,
        uri: &str,
    ) -> Result<GatewayResource, GatewayError>;

    /// Perform a debit/credit/refund. The gateway answers synchronously with
    /// the created resource; later status changes arrive as callback events.
    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayResource, GatewayError>;

    /// Create a gateway-side customer record tagged with our customer id.
    async fn create_customer(&self, customer_id: Uuid) -> Result<GatewayResource, GatewayError>;

    /// Associate a card or bank account with a gateway customer record.
    async fn associate_instrument(
        &self,
        customer_uri: &str,
        kind: ResourceKind,
        instrument_uri: &str,
    ) -> Result<(), GatewayError>;

    /// Register the company's callback URL with the gateway.
    async fn register_callback(&self, url: &str) -> Result<(), GatewayError>;
}
