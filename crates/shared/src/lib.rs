//! Shared types for the Remit billing system.
//!
//! Canonical status enums and the transaction/submission vocabulary used by
//! both the billing engine and the worker. Everything here maps 1:1 onto the
//! Postgres enum types created in `migrations/0001_init.sql`.

pub mod types;

pub use types::{
    InvoiceStatus, ParseStatusError, Submission, TransactionStatus, TransactionType,
};
