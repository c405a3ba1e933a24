//! Storage surface of the billing engine.
//!
//! [`BillingStore`] is the only thing allowed to write `status`,
//! `processor_uri`, or event history. [`crate::postgres::PgStore`] is the
//! production implementation; [`MemoryStore`] backs the engine's test suite
//! and runs the same recompute code through
//! [`crate::reconcile::transaction_status_from_events`] and
//! [`crate::reconcile::derive_invoice_status`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use remit_shared::{InvoiceStatus, Submission, TransactionStatus};

use crate::error::{BillingError, BillingResult};
use crate::model::{Company, Customer, Invoice, NewTransaction, Transaction, TransactionEvent};
use crate::reconcile::{derive_invoice_status, transaction_status_from_events, ReconcileAction};

#[async_trait]
pub trait BillingStore: Send + Sync {
    async fn create_company(&self, api_key: &str, callback_key: &str) -> BillingResult<Company>;

    async fn create_customer(&self, company_id: Uuid) -> BillingResult<Customer>;

    async fn set_customer_processor_uri(
        &self,
        customer_id: Uuid,
        processor_uri: &str,
    ) -> BillingResult<()>;

    async fn create_invoice(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        amount_cents: i64,
    ) -> BillingResult<Invoice>;

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>>;

    /// Create a transaction in `Staged` submission state. Enforces the
    /// refund invariant via [`NewTransaction::validate`].
    async fn create_transaction(&self, new: NewTransaction) -> BillingResult<Transaction>;

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>>;

    /// Company-scoped lookup. Returns `None` for a transaction that exists
    /// but belongs to another company; callers must not be able to tell the
    /// two cases apart.
    async fn transaction_for_company(
        &self,
        company_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Transaction>>;

    /// Events for a transaction, newest first by (occurred_at, event id).
    async fn events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Vec<TransactionEvent>>;

    /// Atomically: dedup-check + insert the event, recompute the
    /// transaction's status from its full event set, recompute the owning
    /// invoice's status. A second insert of the same (company, gateway
    /// event id) — concurrent or sequential — fails with
    /// [`BillingError::DuplicateEvent`] and leaves no partial state.
    async fn apply_event(&self, action: &ReconcileAction) -> BillingResult<()>;

    /// Transactions awaiting submission (`Staged` or `Retrying`), oldest
    /// first.
    async fn due_for_submission(&self, limit: usize) -> BillingResult<Vec<Transaction>>;

    /// Record a successful dispatch: `processor_uri`, submission `Done`,
    /// and — only while no gateway events exist yet — the synchronous
    /// response status. Once events have arrived they are authoritative and
    /// the dispatch response must not overwrite the derived status.
    async fn mark_submitted(
        &self,
        transaction_id: Uuid,
        processor_uri: &str,
        status: TransactionStatus,
    ) -> BillingResult<()>;

    /// Record a failed dispatch attempt; moves submission to `Retrying`, or
    /// `Failed` once `max_attempts` is exhausted. Returns the new state.
    async fn mark_submission_failure(
        &self,
        transaction_id: Uuid,
        max_attempts: u32,
    ) -> BillingResult<Submission>;
}

#[derive(Default)]
struct MemoryState {
    companies: HashMap<Uuid, Company>,
    customers: HashMap<Uuid, Customer>,
    invoices: HashMap<Uuid, Invoice>,
    transactions: HashMap<Uuid, Transaction>,
    events: Vec<TransactionEvent>,
}

impl MemoryState {
    fn events_for(&self, transaction_id: Uuid) -> Vec<TransactionEvent> {
        let mut events: Vec<_> = self
            .events
            .iter()
            .filter(|e| e.transaction_id == transaction_id)
            .cloned()
            .collect();
        events.sort_by(|a, b| {
            (b.occurred_at, &b.gateway_event_id).cmp(&(a.occurred_at, &a.gateway_event_id))
        });
        events
    }

    fn recompute_invoice(&mut self, invoice_id: Uuid) -> BillingResult<()> {
        let transactions: Vec<_> = self
            .transactions
            .values()
            .filter(|t| t.invoice_id == invoice_id)
            .cloned()
            .collect();
        let status = derive_invoice_status(&transactions);
        let invoice = self
            .invoices
            .get_mut(&invoice_id)
            .ok_or(BillingError::InvoiceNotFound(invoice_id))?;
        if invoice.status != status {
            invoice.status = status;
            invoice.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

/// In-memory [`BillingStore`]. One mutex serializes all appliers, which
/// gives the same isolation the Postgres implementation gets from row locks
/// and the unique index.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillingStore for MemoryStore {
    async fn create_company(&self, api_key: &str, callback_key: &str) -> BillingResult<Company> {
        let mut state = self.state.lock().await;
        let company = Company {
            id: Uuid::new_v4(),
            api_key: api_key.to_string(),
            callback_key: callback_key.to_string(),
            created_at: OffsetDateTime::now_utc(),
        };
        state.companies.insert(company.id, company.clone());
        Ok(company)
    }

    async fn create_customer(&self, company_id: Uuid) -> BillingResult<Customer> {
        let mut state = self.state.lock().await;
        let customer = Customer {
            id: Uuid::new_v4(),
            company_id,
            processor_uri: None,
            created_at: OffsetDateTime::now_utc(),
        };
        state.customers.insert(customer.id, customer.clone());
        Ok(customer)
    }

    async fn set_customer_processor_uri(
        &self,
        customer_id: Uuid,
        processor_uri: &str,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let customer = state
            .customers
            .get_mut(&customer_id)
            .ok_or(BillingError::CustomerNotFound(customer_id))?;
        customer.processor_uri = Some(processor_uri.to_string());
        Ok(())
    }

    async fn create_invoice(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        amount_cents: i64,
    ) -> BillingResult<Invoice> {
        let mut state = self.state.lock().await;
        let now = OffsetDateTime::now_utc();
        let invoice = Invoice {
            id: Uuid::new_v4(),
            company_id,
            customer_id,
            amount_cents,
            status: InvoiceStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        state.invoices.insert(invoice.id, invoice.clone());
        Ok(invoice)
    }

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let state = self.state.lock().await;
        Ok(state.invoices.get(&id).cloned())
    }

    async fn create_transaction(&self, new: NewTransaction) -> BillingResult<Transaction> {
        let mut state = self.state.lock().await;
        if !state.invoices.contains_key(&new.invoice_id) {
            return Err(BillingError::InvoiceNotFound(new.invoice_id));
        }
        let reference = new
            .reference_to
            .and_then(|id| state.transactions.get(&id))
            .cloned();
        new.validate(reference.as_ref())?;

        let now = OffsetDateTime::now_utc();
        let transaction = Transaction {
            id: Uuid::new_v4(),
            company_id: new.company_id,
            invoice_id: new.invoice_id,
            transaction_type: new.transaction_type,
            amount_cents: new.amount_cents,
            funding_instrument_uri: new.funding_instrument_uri,
            reference_to: new.reference_to,
            processor_uri: None,
            status: TransactionStatus::Pending,
            submission: Submission::Staged,
            attempt_count: 0,
            statement_descriptor: new.statement_descriptor,
            created_at: now,
            updated_at: now,
        };
        state
            .transactions
            .insert(transaction.id, transaction.clone());
        state.recompute_invoice(transaction.invoice_id)?;
        Ok(transaction)
    }

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state.transactions.get(&id).cloned())
    }

    async fn transaction_for_company(
        &self,
        company_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Transaction>> {
        let state = self.state.lock().await;
        Ok(state
            .transactions
            .get(&id)
            .filter(|t| t.company_id == company_id)
            .cloned())
    }

    async fn events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Vec<TransactionEvent>> {
        let state = self.state.lock().await;
        Ok(state.events_for(transaction_id))
    }

    async fn apply_event(&self, action: &ReconcileAction) -> BillingResult<()> {
        let mut state = self.state.lock().await;

        let transaction = state
            .transactions
            .get(&action.transaction_id)
            .filter(|t| t.company_id == action.company_id)
            .cloned()
            .ok_or_else(|| {
                BillingError::InvalidCallbackPayload(format!(
                    "transaction {} does not exist in this company",
                    action.transaction_id
                ))
            })?;

        let duplicate = state.events.iter().any(|e| {
            e.company_id == action.company_id && e.gateway_event_id == action.gateway_event_id
        });
        if duplicate {
            return Err(BillingError::DuplicateEvent {
                company_id: action.company_id,
                event_id: action.gateway_event_id.clone(),
            });
        }

        state.events.push(TransactionEvent {
            id: Uuid::new_v4(),
            company_id: action.company_id,
            transaction_id: transaction.id,
            gateway_event_id: action.gateway_event_id.clone(),
            status: action.status,
            occurred_at: action.occurred_at,
            created_at: OffsetDateTime::now_utc(),
        });

        let events = state.events_for(transaction.id);
        if let Some(status) = transaction_status_from_events(&events) {
            if let Some(stored) = state.transactions.get_mut(&transaction.id) {
                if stored.status != status {
                    stored.status = status;
                    stored.updated_at = OffsetDateTime::now_utc();
                }
            }
        }

        state.recompute_invoice(transaction.invoice_id)
    }

    async fn due_for_submission(&self, limit: usize) -> BillingResult<Vec<Transaction>> {
        let state = self.state.lock().await;
        let mut due: Vec<_> = state
            .transactions
            .values()
            .filter(|t| t.submission.needs_submission())
            .cloned()
            .collect();
        due.sort_by_key(|t| t.created_at);
        due.truncate(limit);
        Ok(due)
    }

    async fn mark_submitted(
        &self,
        transaction_id: Uuid,
        processor_uri: &str,
        status: TransactionStatus,
    ) -> BillingResult<()> {
        let mut state = self.state.lock().await;
        let has_events = !state.events_for(transaction_id).is_empty();
        let invoice_id = {
            let transaction = state
                .transactions
                .get_mut(&transaction_id)
                .ok_or(BillingError::TransactionNotFound(transaction_id))?;
            transaction.processor_uri = Some(processor_uri.to_string());
            transaction.submission = Submission::Done;
            if !has_events {
                transaction.status = status;
            }
            transaction.updated_at = OffsetDateTime::now_utc();
            transaction.invoice_id
        };
        state.recompute_invoice(invoice_id)
    }

    async fn mark_submission_failure(
        &self,
        transaction_id: Uuid,
        max_attempts: u32,
    ) -> BillingResult<Submission> {
        let mut state = self.state.lock().await;
        let transaction = state
            .transactions
            .get_mut(&transaction_id)
            .ok_or(BillingError::TransactionNotFound(transaction_id))?;
        transaction.attempt_count += 1;
        transaction.submission = if transaction.attempt_count as u32 >= max_attempts {
            Submission::Failed
        } else {
            Submission::Retrying
        };
        transaction.updated_at = OffsetDateTime::now_utc();
        Ok(transaction.submission)
    }
}
