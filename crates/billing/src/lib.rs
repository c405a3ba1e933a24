// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some gateway operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Remit Billing Engine
//!
//! Reconciles asynchronous payment-gateway callback events into
//! deterministic transaction and invoice state, and dispatches
//! debit/credit/refund operations with at-most-once semantics.
//!
//! ## Features
//!
//! - **Callback Handling**: verify inbound events against the gateway and
//!   resolve them within the calling company's scope
//! - **Event Reconciliation**: durable, deduplicated event records; status
//!   recomputed from full history so any delivery order converges
//! - **Idempotent Dispatch**: lookup-before-create debit/credit/refund
//! - **Customer Preparation**: gateway customer records and funding
//!   instrument association
//! - **Invariants**: runnable consistency checks over the store

pub mod callback;
pub mod client;
pub mod customer;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod model;
pub mod postgres;
pub mod reconcile;
pub mod status;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Callback
pub use callback::{CallbackHandler, CallbackPayload};

// Client
pub use client::{GatewayConfig, HttpGateway};

// Customer
pub use customer::CustomerService;

// Dispatch
pub use dispatch::{DispatchOutcome, Dispatcher, SubmitResult, MAX_SUBMISSION_ATTEMPTS};

// Error
pub use error::{BillingError, BillingResult};

// Gateway
pub use gateway::{
    ChargeOperation, ChargeRequest, Gateway, GatewayError, GatewayEvent, GatewayResource,
    ResourceKind, CUSTOMER_TAG, TRANSACTION_TAG,
};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Model
pub use model::{Company, Customer, Invoice, NewTransaction, Transaction, TransactionEvent};

// Postgres
pub use postgres::PgStore;

// Reconcile
pub use reconcile::{
    derive_invoice_status, transaction_status_from_events, ReconcileAction, Reconciler,
};

// Status
pub use status::map_gateway_status;

// Store
pub use store::{BillingStore, MemoryStore};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub callbacks: CallbackHandler,
    pub customers: CustomerService,
    pub dispatcher: Dispatcher,
    pub reconciler: Reconciler,
    pub store: Arc<dyn BillingStore>,
    pub gateway: Arc<dyn Gateway>,
}

impl BillingService {
    /// Create a billing service from environment variables, backed by
    /// Postgres and the HTTP gateway client. Fails if `GATEWAY_API_KEY` is
    /// missing — the engine never runs unconfigured.
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        let gateway: Arc<dyn Gateway> = Arc::new(HttpGateway::from_env()?);
        let store: Arc<dyn BillingStore> = Arc::new(PgStore::new(pool));
        Ok(Self::new(gateway, store))
    }

    /// Create a billing service over explicit gateway and store
    /// implementations.
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<dyn BillingStore>) -> Self {
        Self {
            callbacks: CallbackHandler::new(gateway.clone(), store.clone()),
            customers: CustomerService::new(gateway.clone(), store.clone()),
            dispatcher: Dispatcher::new(gateway.clone(), store.clone()),
            reconciler: Reconciler::new(store.clone()),
            store,
            gateway,
        }
    }

    /// Register the company's callback URL with the gateway so it starts
    /// delivering events there.
    pub async fn register_callback(&self, url: &str) -> BillingResult<()> {
        tracing::info!(url = %url, "Registering callback URL with gateway");
        self.gateway.register_callback(url).await?;
        Ok(())
    }
}
