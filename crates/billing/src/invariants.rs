//! Billing invariants.
//!
//! Runnable consistency checks for the reconciliation engine. Run them
//! after a webhook replay or a migration to confirm the system is in a
//! valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: each invariant is a real query against the store
//! 2. **Explanatory**: violations include enough context to debug
//! 3. **Non-destructive**: checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;
use crate::model::{Transaction, TransactionEvent};
use crate::reconcile::{derive_invoice_status, transaction_status_from_events};
use remit_shared::{InvoiceStatus, TransactionStatus};

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Company(s) affected
    pub company_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - money may be moving incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for duplicate gateway event violations
#[derive(Debug, sqlx::FromRow)]
struct DuplicateEventRow {
    company_id: Uuid,
    gateway_event_id: String,
    event_count: i64,
}

/// Row type for bad refund reference violations
#[derive(Debug, sqlx::FromRow)]
struct BadRefundRow {
    refund_id: Uuid,
    company_id: Uuid,
    reference_to: Option<Uuid>,
    reference_type: Option<String>,
    reference_submission: Option<String>,
}

/// Row type for settled-without-URI violations
#[derive(Debug, sqlx::FromRow)]
struct DoneWithoutUriRow {
    transaction_id: Uuid,
    company_id: Uuid,
}

/// Row type for invoice derivation checks
#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    company_id: Uuid,
    status: InvoiceStatus,
}

pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run every check and summarize.
    pub async fn run_all(&self) -> BillingResult<InvariantCheckSummary> {
        let mut violations = Vec::new();
        let mut checks_run = 0;
        let mut checks_failed = 0;

        let checks = [
            self.check_duplicate_events().await?,
            self.check_refund_references().await?,
            self.check_done_without_processor_uri().await?,
            self.check_invoice_status_derivation().await?,
            self.check_transaction_status_derivation().await?,
        ];
        for found in checks {
            checks_run += 1;
            if !found.is_empty() {
                checks_failed += 1;
                violations.extend(found);
            }
        }

        Ok(InvariantCheckSummary {
            checked_at: OffsetDateTime::now_utc(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// The unique index makes this impossible through the engine; a hit
    /// means someone wrote events around it.
    async fn check_duplicate_events(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateEventRow> = sqlx::query_as(
            r#"
            SELECT company_id, gateway_event_id, COUNT(*) AS event_count
            FROM transaction_events
            GROUP BY company_id, gateway_event_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "unique_gateway_event_per_company".to_string(),
                company_ids: vec![row.company_id],
                description: format!(
                    "gateway event {} recorded {} times",
                    row.gateway_event_id, row.event_count
                ),
                context: serde_json::json!({
                    "gateway_event_id": row.gateway_event_id,
                    "event_count": row.event_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Every refund must reference a debit whose submission is done.
    async fn check_refund_references(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<BadRefundRow> = sqlx::query_as(
            r#"
            SELECT r.id AS refund_id,
                   r.company_id,
                   r.reference_to,
                   d.transaction_type::TEXT AS reference_type,
                   d.submission::TEXT AS reference_submission
            FROM transactions r
            LEFT JOIN transactions d ON d.id = r.reference_to
            WHERE r.transaction_type = 'refund'::transaction_type
              AND (r.reference_to IS NULL
                   OR d.id IS NULL
                   OR d.transaction_type <> 'debit'::transaction_type
                   OR d.submission <> 'done'::submission_status)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_references_settled_debit".to_string(),
                company_ids: vec![row.company_id],
                description: format!(
                    "refund {} does not reference a settled debit",
                    row.refund_id
                ),
                context: serde_json::json!({
                    "refund_id": row.refund_id,
                    "reference_to": row.reference_to,
                    "reference_type": row.reference_type,
                    "reference_submission": row.reference_submission,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// A done submission always carries the gateway resource URI.
    async fn check_done_without_processor_uri(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DoneWithoutUriRow> = sqlx::query_as(
            r#"
            SELECT id AS transaction_id, company_id
            FROM transactions
            WHERE submission = 'done'::submission_status
              AND processor_uri IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "done_submission_has_processor_uri".to_string(),
                company_ids: vec![row.company_id],
                description: format!(
                    "transaction {} is done but has no processor URI",
                    row.transaction_id
                ),
                context: serde_json::json!({ "transaction_id": row.transaction_id }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Stored invoice status must equal the derivation over its
    /// transactions.
    async fn check_invoice_status_derivation(&self) -> BillingResult<Vec<InvariantViolation>> {
        let invoices: Vec<InvoiceRow> =
            sqlx::query_as("SELECT id, company_id, status FROM invoices")
                .fetch_all(&self.pool)
                .await?;

        let mut violations = Vec::new();
        for invoice in invoices {
            let transactions: Vec<Transaction> =
                sqlx::query_as("SELECT * FROM transactions WHERE invoice_id = $1")
                    .bind(invoice.id)
                    .fetch_all(&self.pool)
                    .await?;
            let derived = derive_invoice_status(&transactions);
            if derived != invoice.status {
                violations.push(InvariantViolation {
                    invariant: "invoice_status_matches_derivation".to_string(),
                    company_ids: vec![invoice.company_id],
                    description: format!(
                        "invoice {} stores {} but derives {}",
                        invoice.id, invoice.status, derived
                    ),
                    context: serde_json::json!({
                        "invoice_id": invoice.id,
                        "stored": invoice.status,
                        "derived": derived,
                        "transaction_count": transactions.len(),
                    }),
                    severity: ViolationSeverity::High,
                });
            }
        }
        Ok(violations)
    }

    /// Stored transaction status must equal the recompute over its full
    /// event history. Transactions without events keep their dispatch or
    /// initial status and are skipped.
    async fn check_transaction_status_derivation(
        &self,
    ) -> BillingResult<Vec<InvariantViolation>> {
        let events: Vec<TransactionEvent> = sqlx::query_as(
            "SELECT * FROM transaction_events ORDER BY transaction_id, occurred_at",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut violations = Vec::new();
        let mut index = 0;
        while index < events.len() {
            let transaction_id = events[index].transaction_id;
            let mut end = index;
            while end < events.len() && events[end].transaction_id == transaction_id {
                end += 1;
            }
            let history = &events[index..end];
            index = end;

            let Some(derived) = transaction_status_from_events(history) else {
                continue;
            };
            let stored: Option<(Uuid, TransactionStatus)> =
                sqlx::query_as("SELECT company_id, status FROM transactions WHERE id = $1")
                    .bind(transaction_id)
                    .fetch_optional(&self.pool)
                    .await?;
            let Some((company_id, status)) = stored else {
                violations.push(InvariantViolation {
                    invariant: "transaction_status_matches_events".to_string(),
                    company_ids: vec![history[0].company_id],
                    description: format!(
                        "events reference missing transaction {transaction_id}"
                    ),
                    context: serde_json::json!({ "transaction_id": transaction_id }),
                    severity: ViolationSeverity::Critical,
                });
                continue;
            };
            if status != derived {
                violations.push(InvariantViolation {
                    invariant: "transaction_status_matches_events".to_string(),
                    company_ids: vec![company_id],
                    description: format!(
                        "transaction {transaction_id} stores {status} but events derive {derived}"
                    ),
                    context: serde_json::json!({
                        "transaction_id": transaction_id,
                        "stored": status,
                        "derived": derived,
                        "event_count": history.len(),
                    }),
                    severity: ViolationSeverity::Medium,
                });
            }
        }
        Ok(violations)
    }
}
