//! HTTP client for the payment gateway.
//!
//! Implements [`Gateway`] over the gateway's Balanced-style REST API. Reads
//! (event fetch, lookups) are retried with exponential backoff because they
//! are idempotent; mutating calls are issued exactly once — retry policy for
//! those lives with the caller's submission bookkeeping.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::gateway::{
    ChargeOperation, ChargeRequest, Gateway, GatewayError, GatewayEvent, GatewayResource,
    ResourceKind, CUSTOMER_TAG, TRANSACTION_TAG,
};

const DEFAULT_API_BASE: &str = "https://gateway.remit.dev";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const GET_RETRIES: usize = 3;

/// Gateway credentials and endpoint.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub api_key: String,
    pub api_base: String,
}

impl GatewayConfig {
    /// An empty key is rejected here so no gateway call can ever run
    /// unconfigured; this is a caller error, not a retryable failure.
    pub fn new(api_key: impl Into<String>, api_base: impl Into<String>) -> BillingResult<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(BillingError::Configuration(
                "gateway API key must not be empty".to_string(),
            ));
        }
        Ok(Self {
            api_key,
            api_base: api_base.into(),
        })
    }

    /// Read `GATEWAY_API_KEY` (required) and `GATEWAY_API_BASE` (optional).
    pub fn from_env() -> BillingResult<Self> {
        let api_key = std::env::var("GATEWAY_API_KEY").map_err(|_| {
            BillingError::Configuration("GATEWAY_API_KEY must be set".to_string())
        })?;
        let api_base =
            std::env::var("GATEWAY_API_BASE").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
        Self::new(api_key, api_base)
    }
}

/// Wire shape of an event; the entity's status and metadata are nested.
#[derive(Debug, Deserialize)]
struct EventRep {
    id: String,
    #[serde(with = "time::serde::rfc3339")]
    occurred_at: OffsetDateTime,
    entity: EntityRep,
}

#[derive(Debug, Deserialize)]
struct EntityRep {
    status: String,
    #[serde(default)]
    meta: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ResourceRep {
    href: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct PageRep {
    #[serde(default)]
    items: Vec<ResourceRep>,
}

impl From<ResourceRep> for GatewayResource {
    fn from(rep: ResourceRep) -> Self {
        GatewayResource {
            href: rep.href,
            status: rep.status,
        }
    }
}

/// Production [`Gateway`] implementation.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    config: GatewayConfig,
    http: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| {
                BillingError::Configuration(format!("failed to build HTTP client: {e}"))
            })?;
        Ok(Self { config, http })
    }

    pub fn from_env() -> BillingResult<Self> {
        Self::new(GatewayConfig::from_env()?)
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.api_base, path)
    }

    fn retry_strategy() -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(100).map(jitter).take(GET_RETRIES)
    }

    /// Issue a GET with retries, decoding the JSON response as `T`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        query: Option<(&str, String)>,
    ) -> Result<T, GatewayError> {
        Retry::spawn(Self::retry_strategy(), || async {
            let mut request = self
                .http
                .get(url)
                .basic_auth(&self.config.api_key, None::<&str>);
            if let Some((key, value)) = &query {
                request = request.query(&[(key, value)]);
            }
            let response = request.send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(GatewayError::Status {
                    status: status.as_u16(),
                    context: format!("GET {url}"),
                });
            }
            Ok(response.json::<T>().await?)
        })
        .await
    }

    /// Issue a mutating call once, no retries.
    async fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> Result<T, GatewayError> {
        let response = request
            .basic_auth(&self.config.api_key, None::<&str>)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::Status {
                status: status.as_u16(),
                context: context.to_string(),
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch_event(&self, event_id: &str) -> Result<GatewayEvent, GatewayError> {
        let url = self.url(&format!("/v1/events/{event_id}"));
        let rep: EventRep = self.get_json(&url, None).await?;
        Ok(GatewayEvent {
            id: rep.id,
            occurred_at: rep.occurred_at,
            entity_status: rep.entity.status,
            metadata: rep.entity.meta,
        })
    }

    async fn find_by_tag(
        &self,
        kind: ResourceKind,
        transaction_id: Uuid,
    ) -> Result<Vec<GatewayResource>, GatewayError> {
        let url = self.url(&format!("/v1/{}", kind.path()));
        let query = format!("meta.{TRANSACTION_TAG}");
        let page: PageRep = self
            .get_json(&url, Some((query.as_str(), transaction_id.to_string())))
            .await?;
        Ok(page.items.into_iter().map(GatewayResource::from).collect())
    }

    async fn fetch_resource(
        &self,
        _kind: ResourceKind,
        uri: &str,
    ) -> Result<GatewayResource, GatewayError> {
        let url = self.url(uri);
        let rep: ResourceRep = self.get_json(&url, None).await?;
        Ok(rep.into())
    }

    async fn create_charge(&self, request: &ChargeRequest) -> Result<GatewayResource, GatewayError> {
        let mut body = serde_json::json!({
            "amount": request.amount_cents,
            "description": request.description,
            "meta": { TRANSACTION_TAG: request.transaction_id.to_string() },
        });
        if let Some(descriptor) = &request.statement_descriptor {
            body["appears_on_statement_as"] = serde_json::json!(descriptor);
        }

        let (url, context) = match &request.operation {
            ChargeOperation::Debit { source_uri } => {
                body["source_uri"] = serde_json::json!(source_uri);
                (self.url("/v1/debits"), "POST /v1/debits")
            }
            ChargeOperation::Credit { destination_uri } => {
                body["destination_uri"] = serde_json::json!(destination_uri);
                (self.url("/v1/credits"), "POST /v1/credits")
            }
            // The refund collection hangs off the original debit.
            ChargeOperation::Refund { debit_uri } => {
                (self.url(&format!("{debit_uri}/refunds")), "POST refunds")
            }
        };

        let rep: ResourceRep = self
            .send_json(self.http.post(&url).json(&body), context)
            .await?;
        Ok(rep.into())
    }

    async fn create_customer(&self, customer_id: Uuid) -> Result<GatewayResource, GatewayError> {
        let body = serde_json::json!({
            "meta": { CUSTOMER_TAG: customer_id.to_string() },
        });
        let url = self.url("/v1/customers");
        let rep: ResourceRep = self
            .send_json(self.http.post(&url).json(&body), "POST /v1/customers")
            .await?;
        Ok(rep.into())
    }

    async fn associate_instrument(
        &self,
        customer_uri: &str,
        kind: ResourceKind,
        instrument_uri: &str,
    ) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "customer": customer_uri });
        let url = self.url(instrument_uri);
        let _: serde_json::Value = self
            .send_json(
                self.http.put(&url).json(&body),
                &format!("PUT {} association", kind.path()),
            )
            .await?;
        Ok(())
    }

    async fn register_callback(&self, url: &str) -> Result<(), GatewayError> {
        let body = serde_json::json!({ "url": url });
        let endpoint = self.url("/v1/callbacks");
        let _: serde_json::Value = self
            .send_json(self.http.post(&endpoint).json(&body), "POST /v1/callbacks")
            .await?;
        Ok(())
    }
}
