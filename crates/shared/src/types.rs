//! Canonical status vocabulary.
//!
//! Gateway-specific status strings are normalized into [`TransactionStatus`]
//! at the edge; everything past that point speaks these enums only.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing a status string that is not part of the
/// canonical vocabulary.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown status value: {0}")]
pub struct ParseStatusError(pub String);

/// Canonical status of a single money movement.
///
/// This is what gateway statuses normalize into. A transaction's current
/// value is always derived from its full event history, never assigned from
/// the most recently delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Succeeded => "succeeded",
            TransactionStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "processing" => Ok(TransactionStatus::Processing),
            "succeeded" => Ok(TransactionStatus::Succeeded),
            "failed" => Ok(TransactionStatus::Failed),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Derived status of an invoice.
///
/// Never set directly; always recomputed from the invoice's active
/// transactions. `Failed` overrides every other derived value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "invoice_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InvoiceStatus {
    Pending,
    Processing,
    Succeeded,
    Failed,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Pending => "pending",
            InvoiceStatus::Processing => "processing",
            InvoiceStatus::Succeeded => "succeeded",
            InvoiceStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for InvoiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The kind of money movement a transaction represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "transaction_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Charge the customer's funding instrument.
    Debit,
    /// Pay out to the customer's funding instrument.
    Credit,
    /// Return money for a previously settled debit.
    Refund,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Debit => "debit",
            TransactionType::Credit => "credit",
            TransactionType::Refund => "refund",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Submission lifecycle of a transaction against the gateway.
///
/// Orthogonal to [`TransactionStatus`]: submission tracks our attempts to
/// hand the transaction to the gateway, status tracks what the gateway says
/// happened to the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "submission_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Submission {
    /// Created, not yet handed to the gateway.
    Staged,
    /// At least one dispatch attempt failed; eligible for redispatch.
    Retrying,
    /// Gateway accepted the operation; `processor_uri` is recorded.
    Done,
    /// Gave up after the retry budget was exhausted.
    Failed,
    /// Withdrawn before submission completed. Kept for audit.
    Canceled,
}

impl Submission {
    /// Canceled transactions no longer participate in invoice status
    /// derivation.
    pub fn is_active(&self) -> bool {
        !matches!(self, Submission::Canceled)
    }

    /// Whether the worker should still try to submit this transaction.
    pub fn needs_submission(&self) -> bool {
        matches!(self, Submission::Staged | Submission::Retrying)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Submission::Staged => "staged",
            Submission::Retrying => "retrying",
            Submission::Done => "done",
            Submission::Failed => "failed",
            Submission::Canceled => "canceled",
        }
    }
}

impl fmt::Display for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
