//! Postgres-backed [`BillingStore`].
//!
//! The UNIQUE index on `transaction_events (company_id, gateway_event_id)`
//! is the authoritative dedup gate: under concurrent delivery of the same
//! event, the database rejects the second insert and the loser surfaces
//! `DuplicateEvent`. Each `apply_event` runs in one database transaction
//! with the transaction row locked, so recomputation always sees the
//! complete event set.

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction as PgTransaction};
use uuid::Uuid;

use remit_shared::{Submission, TransactionStatus};

use crate::error::{BillingError, BillingResult};
use crate::model::{Company, Customer, Invoice, NewTransaction, Transaction, TransactionEvent};
use crate::reconcile::{derive_invoice_status, transaction_status_from_events, ReconcileAction};
use crate::store::BillingStore;

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn is_unique_violation(err: &sqlx::Error) -> bool {
        matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
    }

    /// Recompute and persist the invoice's derived status inside `tx`.
    async fn recompute_invoice(
        tx: &mut PgTransaction<'_, Postgres>,
        invoice_id: Uuid,
    ) -> BillingResult<()> {
        let transactions: Vec<Transaction> =
            sqlx::query_as("SELECT * FROM transactions WHERE invoice_id = $1")
                .bind(invoice_id)
                .fetch_all(&mut **tx)
                .await?;
        let status = derive_invoice_status(&transactions);
        let updated = sqlx::query(
            "UPDATE invoices SET status = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(invoice_id)
        .bind(status)
        .execute(&mut **tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(BillingError::InvoiceNotFound(invoice_id));
        }
        Ok(())
    }
}

#[async_trait]
impl BillingStore for PgStore {
    async fn create_company(&self, api_key: &str, callback_key: &str) -> BillingResult<Company> {
        let company = sqlx::query_as(
            r#"
            INSERT INTO companies (id, api_key, callback_key)
            VALUES ($1, $2, $3)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(api_key)
        .bind(callback_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(company)
    }

    async fn create_customer(&self, company_id: Uuid) -> BillingResult<Customer> {
        let customer = sqlx::query_as(
            r#"
            INSERT INTO customers (id, company_id)
            VALUES ($1, $2)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(customer)
    }

    async fn set_customer_processor_uri(
        &self,
        customer_id: Uuid,
        processor_uri: &str,
    ) -> BillingResult<()> {
        let updated = sqlx::query(
            "UPDATE customers SET processor_uri = $2 WHERE id = $1",
        )
        .bind(customer_id)
        .bind(processor_uri)
        .execute(&self.pool)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(BillingError::CustomerNotFound(customer_id));
        }
        Ok(())
    }

    async fn create_invoice(
        &self,
        company_id: Uuid,
        customer_id: Uuid,
        amount_cents: i64,
    ) -> BillingResult<Invoice> {
        let invoice = sqlx::query_as(
            r#"
            INSERT INTO invoices (id, company_id, customer_id, amount_cents)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(company_id)
        .bind(customer_id)
        .bind(amount_cents)
        .fetch_one(&self.pool)
        .await?;
        Ok(invoice)
    }

    async fn invoice(&self, id: Uuid) -> BillingResult<Option<Invoice>> {
        let invoice = sqlx::query_as("SELECT * FROM invoices WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(invoice)
    }

    async fn create_transaction(&self, new: NewTransaction) -> BillingResult<Transaction> {
        let mut tx = self.pool.begin().await?;

        let invoice_exists: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM invoices WHERE id = $1 AND company_id = $2")
                .bind(new.invoice_id)
                .bind(new.company_id)
                .fetch_optional(&mut *tx)
                .await?;
        if invoice_exists.is_none() {
            return Err(BillingError::InvoiceNotFound(new.invoice_id));
        }

        let reference: Option<Transaction> = match new.reference_to {
            Some(reference_id) => {
                sqlx::query_as("SELECT * FROM transactions WHERE id = $1")
                    .bind(reference_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => None,
        };
        new.validate(reference.as_ref())?;

        let transaction: Transaction = sqlx::query_as(
            r#"
            INSERT INTO transactions (
                id, company_id, invoice_id, transaction_type, amount_cents,
                funding_instrument_uri, reference_to, statement_descriptor
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.company_id)
        .bind(new.invoice_id)
        .bind(new.transaction_type)
        .bind(new.amount_cents)
        .bind(new.funding_instrument_uri.as_deref())
        .bind(new.reference_to)
        .bind(new.statement_descriptor.as_deref())
        .fetch_one(&mut *tx)
        .await?;

        Self::recompute_invoice(&mut tx, transaction.invoice_id).await?;
        tx.commit().await?;
        Ok(transaction)
    }

    async fn transaction(&self, id: Uuid) -> BillingResult<Option<Transaction>> {
        let transaction = sqlx::query_as("SELECT * FROM transactions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(transaction)
    }

    async fn transaction_for_company(
        &self,
        company_id: Uuid,
        id: Uuid,
    ) -> BillingResult<Option<Transaction>> {
        let transaction =
            sqlx::query_as("SELECT * FROM transactions WHERE id = $1 AND company_id = $2")
                .bind(id)
                .bind(company_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(transaction)
    }

    async fn events_for_transaction(
        &self,
        transaction_id: Uuid,
    ) -> BillingResult<Vec<TransactionEvent>> {
        let events = sqlx::query_as(
            r#"
            SELECT * FROM transaction_events
            WHERE transaction_id = $1
            ORDER BY occurred_at DESC, gateway_event_id DESC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn apply_event(&self, action: &ReconcileAction) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // Lock the transaction row so concurrent appliers for the same
        // transaction serialize and each recompute sees a settled history.
        let transaction: Option<Transaction> = sqlx::query_as(
            "SELECT * FROM transactions WHERE id = $1 AND company_id = $2 FOR UPDATE",
        )
        .bind(action.transaction_id)
        .bind(action.company_id)
        .fetch_optional(&mut *tx)
        .await?;
        let transaction = transaction.ok_or_else(|| {
            BillingError::InvalidCallbackPayload(format!(
                "transaction {} does not exist in this company",
                action.transaction_id
            ))
        })?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO transaction_events (
                id, company_id, transaction_id, gateway_event_id, status, occurred_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(action.company_id)
        .bind(transaction.id)
        .bind(&action.gateway_event_id)
        .bind(action.status)
        .bind(action.occurred_at)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            // Dropping `tx` rolls back; nothing partial persists.
            if Self::is_unique_violation(&err) {
                return Err(BillingError::DuplicateEvent {
                    company_id: action.company_id,
                    event_id: action.gateway_event_id.clone(),
                });
            }
            return Err(err.into());
        }

        let events: Vec<TransactionEvent> = sqlx::query_as(
            r#"
            SELECT * FROM transaction_events
            WHERE transaction_id = $1
            ORDER BY occurred_at DESC, gateway_event_id DESC
            "#,
        )
        .bind(transaction.id)
        .fetch_all(&mut *tx)
        .await?;

        if let Some(status) = transaction_status_from_events(&events) {
            sqlx::query("UPDATE transactions SET status = $2, updated_at = NOW() WHERE id = $1")
                .bind(transaction.id)
                .bind(status)
                .execute(&mut *tx)
                .await?;
        }

        Self::recompute_invoice(&mut tx, transaction.invoice_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn due_for_submission(&self, limit: usize) -> BillingResult<Vec<Transaction>> {
        let due = sqlx::query_as(
            r#"
            SELECT * FROM transactions
            WHERE submission IN ('staged'::submission_status, 'retrying'::submission_status)
            ORDER BY created_at
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(due)
    }

    async fn mark_submitted(
        &self,
        transaction_id: Uuid,
        processor_uri: &str,
        status: TransactionStatus,
    ) -> BillingResult<()> {
        let mut tx = self.pool.begin().await?;

        // The synchronous dispatch response only sets status while no
        // callback events exist; once events arrive they are authoritative.
        let invoice_id: Option<(Uuid,)> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET processor_uri = $2,
                submission = 'done'::submission_status,
                status = CASE
                    WHEN EXISTS (
                        SELECT 1 FROM transaction_events WHERE transaction_id = $1
                    ) THEN status
                    ELSE $3
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING invoice_id
            "#,
        )
        .bind(transaction_id)
        .bind(processor_uri)
        .bind(status)
        .fetch_optional(&mut *tx)
        .await?;
        let (invoice_id,) =
            invoice_id.ok_or(BillingError::TransactionNotFound(transaction_id))?;

        Self::recompute_invoice(&mut tx, invoice_id).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn mark_submission_failure(
        &self,
        transaction_id: Uuid,
        max_attempts: u32,
    ) -> BillingResult<Submission> {
        let submission: Option<(Submission,)> = sqlx::query_as(
            r#"
            UPDATE transactions
            SET attempt_count = attempt_count + 1,
                submission = CASE
                    WHEN attempt_count + 1 >= $2 THEN 'failed'::submission_status
                    ELSE 'retrying'::submission_status
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING submission
            "#,
        )
        .bind(transaction_id)
        .bind(max_attempts as i32)
        .fetch_optional(&self.pool)
        .await?;
        submission
            .map(|(s,)| s)
            .ok_or(BillingError::TransactionNotFound(transaction_id))
    }
}
