//! Gateway-side customer preparation.
//!
//! Creates the customer record at the gateway and associates funding
//! instruments with it, so later debits and credits can reference them.

use std::sync::Arc;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{funding_instrument_kind, Gateway, ResourceKind};
use crate::model::Customer;
use crate::store::BillingStore;

pub struct CustomerService {
    gateway: Arc<dyn Gateway>,
    store: Arc<dyn BillingStore>,
}

impl CustomerService {
    pub fn new(gateway: Arc<dyn Gateway>, store: Arc<dyn BillingStore>) -> Self {
        Self { gateway, store }
    }

    /// Create the gateway-side record for a customer, tagged with our
    /// customer id, and persist its URI.
    pub async fn create_customer(&self, customer: &Customer) -> BillingResult<String> {
        tracing::debug!(customer_id = %customer.id, "Creating gateway customer");
        let resource = self.gateway.create_customer(customer.id).await?;
        self.store
            .set_customer_processor_uri(customer.id, &resource.href)
            .await?;
        tracing::info!(
            customer_id = %customer.id,
            processor_uri = %resource.href,
            "Created gateway customer"
        );
        Ok(resource.href)
    }

    /// Associate a funding instrument with the customer's gateway record.
    ///
    /// `None` means the customer's default instrument will be used — a
    /// valid no-op. An unrecognized URI scheme is a validation error raised
    /// before any network call.
    pub async fn prepare_customer(
        &self,
        customer: &Customer,
        funding_instrument_uri: Option<&str>,
    ) -> BillingResult<()> {
        let Some(uri) = funding_instrument_uri else {
            return Ok(());
        };
        let customer_uri = customer.processor_uri.as_deref().ok_or_else(|| {
            BillingError::Validation(format!(
                "customer {} has no gateway record yet",
                customer.id
            ))
        })?;

        let kind = if uri.contains("/bank_accounts/") {
            ResourceKind::BankAccount
        } else if uri.contains("/cards/") {
            ResourceKind::Card
        } else {
            return Err(BillingError::Validation(format!(
                "invalid funding instrument URI {uri}"
            )));
        };

        tracing::debug!(
            customer_id = %customer.id,
            funding_instrument_uri = %uri,
            "Associating {} with customer",
            kind.path()
        );
        self.gateway
            .associate_instrument(customer_uri, kind, uri)
            .await?;
        tracing::info!(
            customer_id = %customer.id,
            funding_instrument_uri = %uri,
            "Associated {} with customer",
            kind.path()
        );
        Ok(())
    }

    /// Check that a customer URI is well-formed and known to the gateway.
    pub async fn validate_customer(&self, processor_uri: &str) -> BillingResult<()> {
        if !processor_uri.starts_with('/') {
            return Err(BillingError::InvalidUriFormat(format!(
                "customer reference should be a URI like /v1/customers/CUxxx, \
                 got {processor_uri:?}; remember it is a URI rather than a GUID"
            )));
        }
        self.gateway
            .fetch_resource(ResourceKind::Customer, processor_uri)
            .await
            .map_err(|e| {
                BillingError::InvalidCustomer(format!(
                    "failed to validate customer {processor_uri}: {e}"
                ))
            })?;
        Ok(())
    }

    /// Check that a funding-instrument URI is well-formed and known to the
    /// gateway.
    pub async fn validate_funding_instrument(&self, uri: &str) -> BillingResult<()> {
        let kind = funding_instrument_kind(uri)?;
        self.gateway.fetch_resource(kind, uri).await.map_err(|e| {
            BillingError::InvalidFundingInstrument(format!(
                "failed to validate funding instrument {uri}: {e}"
            ))
        })?;
        Ok(())
    }
}
