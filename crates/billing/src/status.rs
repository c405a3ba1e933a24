//! Gateway status normalization.

use remit_shared::TransactionStatus;

/// Map a gateway status string to the canonical transaction status.
///
/// The gateway's vocabulary is larger than ours and grows without notice, so
/// an unknown value must never be an error: it defaults to `Pending` and the
/// next callback for the entity will move the status forward.
pub fn map_gateway_status(raw: &str) -> TransactionStatus {
    match raw {
        "pending" => TransactionStatus::Pending,
        "succeeded" | "paid" => TransactionStatus::Succeeded,
        "failed" | "reversed" => TransactionStatus::Failed,
        other => {
            tracing::warn!(status = %other, "Unknown gateway status, defaulting to pending");
            TransactionStatus::Pending
        }
    }
}
