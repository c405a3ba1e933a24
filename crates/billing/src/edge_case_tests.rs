// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Reconciliation Engine
//!
//! Tests critical boundary conditions and race-prone paths in:
//! - Callback resolution (company isolation, forged/irrelevant events)
//! - Event ingestion (dedup, order independence, tie-breaks)
//! - Idempotent dispatch (lookup-before-create, refund targeting)
//! - Submission retry budget

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use remit_shared::TransactionType;

use crate::gateway::{
    ChargeRequest, Gateway, GatewayError, GatewayEvent, GatewayResource, ResourceKind,
    TRANSACTION_TAG,
};
use crate::model::{Company, Customer, Invoice, NewTransaction};
use crate::store::{BillingStore, MemoryStore};

/// Recording in-memory gateway. `create_charge` registers the created
/// resource under the transaction tag, so redispatch exercises the same
/// lookup path it would against the real gateway.
#[derive(Default)]
struct FakeGateway {
    events: Mutex<HashMap<String, GatewayEvent>>,
    tagged: Mutex<HashMap<(ResourceKind, Uuid), Vec<GatewayResource>>>,
    rejected_instruments: Mutex<Vec<String>>,
    fail_charges: AtomicBool,
    charge_calls: Mutex<Vec<ChargeRequest>>,
    fetched_resources: Mutex<Vec<String>>,
    associations: Mutex<Vec<(String, ResourceKind, String)>>,
}

impl FakeGateway {
    fn put_event(
        &self,
        event_id: &str,
        entity_status: &str,
        occurred_at: OffsetDateTime,
        tag: Option<String>,
    ) {
        let mut metadata = HashMap::new();
        if let Some(tag) = tag {
            metadata.insert(TRANSACTION_TAG.to_string(), tag);
        }
        self.events.lock().unwrap().insert(
            event_id.to_string(),
            GatewayEvent {
                id: event_id.to_string(),
                occurred_at,
                entity_status: entity_status.to_string(),
                metadata,
            },
        );
    }

    fn put_tagged(&self, kind: ResourceKind, transaction_id: Uuid, resource: GatewayResource) {
        self.tagged
            .lock()
            .unwrap()
            .entry((kind, transaction_id))
            .or_default()
            .push(resource);
    }

    fn reject_instrument(&self, uri: &str) {
        self.rejected_instruments
            .lock()
            .unwrap()
            .push(uri.to_string());
    }

    fn charge_calls(&self) -> Vec<ChargeRequest> {
        self.charge_calls.lock().unwrap().clone()
    }

    fn fetched_resources(&self) -> Vec<String> {
        self.fetched_resources.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for FakeGateway {
    async fn fetch_event(&self, event_id: &str) -> Result<GatewayEvent, GatewayError> {
        self.events
            .lock()
            .unwrap()
            .get(event_id)
            .cloned()
            .ok_or(GatewayError::Status {
                status: 404,
                context: format!("GET /v1/events/{event_id}"),
            })
    }

    async fn find_by_tag(
        &self,
        kind: ResourceKind,
        transaction_id: Uuid,
    ) -> Result<Vec<GatewayResource>, GatewayError> {
        Ok(self
            .tagged
            .lock()
            .unwrap()
            .get(&(kind, transaction_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_resource(
        &self,
        _kind: ResourceKind,
        uri: &str,
    ) -> Result<GatewayResource, GatewayError> {
        self.fetched_resources.lock().unwrap().push(uri.to_string());
        if self.rejected_instruments.lock().unwrap().iter().any(|r| r == uri) {
            return Err(GatewayError::Status {
                status: 400,
                context: format!("GET {uri}"),
            });
        }
        Ok(GatewayResource {
            href: uri.to_string(),
            status: "active".to_string(),
        })
    }

    async fn create_charge(
        &self,
        request: &ChargeRequest,
    ) -> Result<GatewayResource, GatewayError> {
        self.charge_calls.lock().unwrap().push(request.clone());
        if self.fail_charges.load(Ordering::SeqCst) {
            return Err(GatewayError::Status {
                status: 500,
                context: "create charge".to_string(),
            });
        }
        let kind = request.operation.kind();
        let resource = GatewayResource {
            href: format!("/v1/{}/R{}", kind.path(), request.transaction_id.simple()),
            status: "succeeded".to_string(),
        };
        self.put_tagged(kind, request.transaction_id, resource.clone());
        Ok(resource)
    }

    async fn create_customer(&self, customer_id: Uuid) -> Result<GatewayResource, GatewayError> {
        Ok(GatewayResource {
            href: format!("/v1/customers/CU{}", customer_id.simple()),
            status: "active".to_string(),
        })
    }

    async fn associate_instrument(
        &self,
        customer_uri: &str,
        kind: ResourceKind,
        instrument_uri: &str,
    ) -> Result<(), GatewayError> {
        self.associations.lock().unwrap().push((
            customer_uri.to_string(),
            kind,
            instrument_uri.to_string(),
        ));
        Ok(())
    }

    async fn register_callback(&self, _url: &str) -> Result<(), GatewayError> {
        Ok(())
    }
}

struct Scenario {
    gateway: Arc<FakeGateway>,
    store: Arc<MemoryStore>,
    company: Company,
    customer: Customer,
    invoice: Invoice,
}

async fn scenario() -> Scenario {
    let store = Arc::new(MemoryStore::new());
    let company = store.create_company("sk_test", "cb_secret").await.unwrap();
    let customer = store.create_customer(company.id).await.unwrap();
    let invoice = store
        .create_invoice(company.id, customer.id, 10_000)
        .await
        .unwrap();
    Scenario {
        gateway: Arc::new(FakeGateway::default()),
        store,
        company,
        customer,
        invoice,
    }
}

fn new_debit(scenario: &Scenario) -> NewTransaction {
    NewTransaction {
        company_id: scenario.company.id,
        invoice_id: scenario.invoice.id,
        transaction_type: TransactionType::Debit,
        amount_cents: 1000,
        funding_instrument_uri: Some("/v1/cards/tester".to_string()),
        reference_to: None,
        statement_descriptor: Some("hello baby".to_string()),
    }
}

#[cfg(test)]
mod callback_tests {
    use super::*;
    use crate::callback::{CallbackHandler, CallbackPayload};
    use crate::error::BillingError;
    use crate::reconcile::Reconciler;
    use remit_shared::{InvoiceStatus, TransactionStatus};

    fn payload(event_id: &str) -> CallbackPayload {
        CallbackPayload {
            event_id: event_id.to_string(),
            event_type: "debit.updated".to_string(),
        }
    }

    #[tokio::test]
    async fn test_callback_resolves_and_applies() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        s.gateway.put_event(
            "EV_1",
            "succeeded",
            OffsetDateTime::now_utc(),
            Some(transaction.id.to_string()),
        );

        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let action = handler
            .resolve(&s.company, &payload("EV_1"))
            .await
            .unwrap()
            .expect("billing-relevant event");
        assert_eq!(action.transaction_id, transaction.id);
        assert_eq!(action.status, TransactionStatus::Succeeded);
        assert_eq!(action.gateway_event_id, "EV_1");

        Reconciler::new(s.store.clone()).apply(&action).await.unwrap();

        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Succeeded);
        let invoice = s.store.invoice(s.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Succeeded);
        let events = s.store.events_for_transaction(transaction.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_callback_without_tag_is_noop() {
        let s = scenario().await;
        s.gateway
            .put_event("EV_1", "succeeded", OffsetDateTime::now_utc(), None);

        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let action = handler.resolve(&s.company, &payload("EV_1")).await.unwrap();
        assert!(action.is_none());
    }

    #[tokio::test]
    async fn test_callback_with_unknown_event_is_rejected() {
        let s = scenario().await;
        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let err = handler.resolve(&s.company, &payload("EV_FORGED")).await;
        assert!(matches!(err, Err(BillingError::InvalidCallbackPayload(_))));
    }

    #[tokio::test]
    async fn test_callback_with_malformed_tag_is_rejected() {
        let s = scenario().await;
        s.gateway.put_event(
            "EV_1",
            "succeeded",
            OffsetDateTime::now_utc(),
            Some("NOT_A_UUID".to_string()),
        );
        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let err = handler.resolve(&s.company, &payload("EV_1")).await;
        assert!(matches!(err, Err(BillingError::InvalidCallbackPayload(_))));
    }

    #[tokio::test]
    async fn test_callback_with_missing_transaction_is_rejected() {
        let s = scenario().await;
        s.gateway.put_event(
            "EV_1",
            "succeeded",
            OffsetDateTime::now_utc(),
            Some(Uuid::new_v4().to_string()),
        );
        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let err = handler.resolve(&s.company, &payload("EV_1")).await;
        assert!(matches!(err, Err(BillingError::InvalidCallbackPayload(_))));
    }

    #[tokio::test]
    async fn test_callback_with_other_company_is_rejected() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        s.gateway.put_event(
            "EV_1",
            "succeeded",
            OffsetDateTime::now_utc(),
            Some(transaction.id.to_string()),
        );
        let other_company = s
            .store
            .create_company("sk_other", "cb_other")
            .await
            .unwrap();

        let handler = CallbackHandler::new(s.gateway.clone(), s.store.clone());
        let err = handler.resolve(&other_company, &payload("EV_1")).await;
        assert!(matches!(err, Err(BillingError::InvalidCallbackPayload(_))));

        // The first company's transaction is untouched.
        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Pending);
        assert!(s
            .store
            .events_for_transaction(transaction.id)
            .await
            .unwrap()
            .is_empty());
    }
}

#[cfg(test)]
mod reconcile_tests {
    use super::*;
    use crate::error::BillingError;
    use crate::reconcile::ReconcileAction;
    use remit_shared::{InvoiceStatus, TransactionStatus};
    use time::Duration;

    fn action(
        s: &Scenario,
        transaction_id: Uuid,
        event_id: &str,
        status: TransactionStatus,
        occurred_at: OffsetDateTime,
    ) -> ReconcileAction {
        ReconcileAction {
            company_id: s.company.id,
            transaction_id,
            status,
            gateway_event_id: event_id.to_string(),
            occurred_at,
        }
    }

    #[tokio::test]
    async fn test_duplicate_event_stores_exactly_one() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        let first = action(&s, transaction.id, "EV_1", TransactionStatus::Succeeded, now);
        s.store.apply_event(&first).await.unwrap();

        let err = s.store.apply_event(&first).await;
        assert!(matches!(err, Err(BillingError::DuplicateEvent { .. })));

        let events = s.store.events_for_transaction(transaction.id).await.unwrap();
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_event_ids_dedup_per_company_not_per_transaction() {
        let s = scenario().await;
        let first = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let second = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let now = OffsetDateTime::now_utc();

        s.store
            .apply_event(&action(&s, first.id, "EV_1", TransactionStatus::Succeeded, now))
            .await
            .unwrap();
        // Same event id aimed at a different transaction still collides.
        let err = s
            .store
            .apply_event(&action(&s, second.id, "EV_1", TransactionStatus::Failed, now))
            .await;
        assert!(matches!(err, Err(BillingError::DuplicateEvent { .. })));
    }

    #[tokio::test]
    async fn test_order_independence_over_all_permutations() {
        let base = OffsetDateTime::now_utc();
        let events = [
            ("EV_1", TransactionStatus::Pending, base),
            ("EV_2", TransactionStatus::Succeeded, base + Duration::seconds(10)),
            ("EV_3", TransactionStatus::Failed, base + Duration::seconds(20)),
        ];
        // Every arrival order must converge on the same end state.
        let permutations: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        for permutation in permutations {
            let s = scenario().await;
            let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
            for index in permutation {
                let (event_id, status, occurred_at) = events[index];
                s.store
                    .apply_event(&action(&s, transaction.id, event_id, status, occurred_at))
                    .await
                    .unwrap();
            }

            // EV_3 has the latest occurred_at; delivery order is irrelevant.
            let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
            assert_eq!(
                stored.status,
                TransactionStatus::Failed,
                "permutation {permutation:?}"
            );
            let invoice = s.store.invoice(s.invoice.id).await.unwrap().unwrap();
            assert_eq!(invoice.status, InvoiceStatus::Failed);
            assert_eq!(
                s.store
                    .events_for_transaction(transaction.id)
                    .await
                    .unwrap()
                    .len(),
                3
            );
        }
    }

    #[tokio::test]
    async fn test_stale_event_never_moves_status_backwards() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let base = OffsetDateTime::now_utc();

        s.store
            .apply_event(&action(&s, transaction.id, "EV_1", TransactionStatus::Pending, base))
            .await
            .unwrap();
        s.store
            .apply_event(&action(
                &s,
                transaction.id,
                "EV_3",
                TransactionStatus::Failed,
                base + Duration::seconds(20),
            ))
            .await
            .unwrap();
        // EV_2 arrives last but occurred before EV_3; it must not win.
        s.store
            .apply_event(&action(
                &s,
                transaction.id,
                "EV_2",
                TransactionStatus::Succeeded,
                base + Duration::seconds(10),
            ))
            .await
            .unwrap();

        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TransactionStatus::Failed);
        let invoice = s.store.invoice(s.invoice.id).await.unwrap().unwrap();
        assert_eq!(invoice.status, InvoiceStatus::Failed);
    }

    #[tokio::test]
    async fn test_equal_occurred_at_breaks_on_event_id_both_orders() {
        let base = OffsetDateTime::now_utc();
        for order in [["EV_A", "EV_B"], ["EV_B", "EV_A"]] {
            let s = scenario().await;
            let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
            for event_id in order {
                let status = if event_id == "EV_B" {
                    TransactionStatus::Failed
                } else {
                    TransactionStatus::Succeeded
                };
                s.store
                    .apply_event(&action(&s, transaction.id, event_id, status, base))
                    .await
                    .unwrap();
            }
            // EV_B is the greater id; its status wins in both arrival orders.
            let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
            assert_eq!(stored.status, TransactionStatus::Failed, "order {order:?}");
        }
    }
}

#[cfg(test)]
mod dispatch_tests {
    use super::*;
    use crate::dispatch::{Dispatcher, SubmitResult, MAX_SUBMISSION_ATTEMPTS};
    use crate::error::BillingError;
    use crate::gateway::ChargeOperation;
    use remit_shared::{Submission, TransactionStatus};

    fn dispatcher(s: &Scenario) -> Dispatcher {
        Dispatcher::new(s.gateway.clone(), s.store.clone())
    }

    #[tokio::test]
    async fn test_debit_dispatch_calls_gateway_once() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();

        let outcome = dispatcher(&s).execute(&transaction).await.unwrap();
        assert_eq!(outcome.status, TransactionStatus::Succeeded);

        let calls = s.gateway.charge_calls();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.transaction_id, transaction.id);
        assert_eq!(call.amount_cents, 1000);
        assert!(call.description.contains(&s.invoice.id.to_string()));
        assert_eq!(call.statement_descriptor.as_deref(), Some("hello baby"));
        assert!(matches!(
            &call.operation,
            ChargeOperation::Debit { source_uri } if source_uri == "/v1/cards/tester"
        ));

        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.submission, Submission::Done);
        assert_eq!(stored.processor_uri.as_deref(), Some(outcome.processor_uri.as_str()));
    }

    #[tokio::test]
    async fn test_dispatch_twice_mutates_once() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let dispatcher = dispatcher(&s);

        let first = dispatcher.execute(&transaction).await.unwrap();
        let second = dispatcher.execute(&transaction).await.unwrap();

        // The second call went through the lookup path only.
        assert_eq!(s.gateway.charge_calls().len(), 1);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_dispatch_with_preexisting_gateway_record_skips_mutation() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        // Simulates a previous dispatch that mutated the gateway but died
        // before recording the result locally.
        s.gateway.put_tagged(
            ResourceKind::Debit,
            transaction.id,
            GatewayResource {
                href: "/v1/debits/WD_EXISTING".to_string(),
                status: "pending".to_string(),
            },
        );

        let outcome = dispatcher(&s).execute(&transaction).await.unwrap();
        assert_eq!(outcome.processor_uri, "/v1/debits/WD_EXISTING");
        assert_eq!(outcome.status, TransactionStatus::Pending);
        assert!(s.gateway.charge_calls().is_empty());

        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.submission, Submission::Done);
    }

    #[tokio::test]
    async fn test_multiple_gateway_matches_are_fatal() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        for href in ["/v1/debits/WD1", "/v1/debits/WD2"] {
            s.gateway.put_tagged(
                ResourceKind::Debit,
                transaction.id,
                GatewayResource {
                    href: href.to_string(),
                    status: "pending".to_string(),
                },
            );
        }

        let err = dispatcher(&s).execute(&transaction).await;
        assert!(matches!(
            err,
            Err(BillingError::AmbiguousGatewayResource(id)) if id == transaction.id
        ));
        assert!(s.gateway.charge_calls().is_empty());
    }

    #[tokio::test]
    async fn test_refund_targets_original_debit_without_instrument_fetch() {
        let s = scenario().await;
        let charge = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let dispatcher = dispatcher(&s);
        dispatcher.execute(&charge).await.unwrap();
        let charge = s.store.transaction(charge.id).await.unwrap().unwrap();
        let debit_uri = charge.processor_uri.clone().unwrap();

        let refund = s
            .store
            .create_transaction(NewTransaction {
                company_id: s.company.id,
                invoice_id: s.invoice.id,
                transaction_type: TransactionType::Refund,
                amount_cents: 56,
                funding_instrument_uri: None,
                reference_to: Some(charge.id),
                statement_descriptor: Some("hello baby".to_string()),
            })
            .await
            .unwrap();

        let instrument_fetches_before = s.gateway.fetched_resources().len();
        dispatcher.execute(&refund).await.unwrap();

        // No funding instrument was fetched for the refund.
        assert_eq!(s.gateway.fetched_resources().len(), instrument_fetches_before);
        let calls = s.gateway.charge_calls();
        assert_eq!(calls.len(), 2);
        assert!(matches!(
            &calls[1].operation,
            ChargeOperation::Refund { debit_uri: uri } if *uri == debit_uri
        ));
    }

    #[tokio::test]
    async fn test_malformed_instrument_uri_fails_before_any_call() {
        let s = scenario().await;
        let mut new = new_debit(&s);
        // A gateway GUID instead of a URI.
        new.funding_instrument_uri = Some("CC7xzNr2V7QC8rsZvcSrOBKE".to_string());
        let transaction = s.store.create_transaction(new).await.unwrap();

        let err = dispatcher(&s).execute(&transaction).await;
        assert!(matches!(err, Err(BillingError::InvalidUriFormat(_))));
        assert!(s.gateway.charge_calls().is_empty());
        assert!(s.gateway.fetched_resources().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_instrument_fails_without_mutation() {
        let s = scenario().await;
        s.gateway.reject_instrument("/v1/cards/tester");
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();

        let err = dispatcher(&s).execute(&transaction).await;
        assert!(matches!(err, Err(BillingError::InvalidFundingInstrument(_))));
        assert!(s.gateway.charge_calls().is_empty());
    }

    #[tokio::test]
    async fn test_submit_due_marks_retrying_then_done() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let dispatcher = dispatcher(&s);

        s.gateway.fail_charges.store(true, Ordering::SeqCst);
        let results = dispatcher.submit_due().await;
        assert!(matches!(
            results.as_slice(),
            [SubmitResult::Failed { gave_up: false, .. }]
        ));
        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.submission, Submission::Retrying);
        assert_eq!(stored.attempt_count, 1);

        s.gateway.fail_charges.store(false, Ordering::SeqCst);
        let results = dispatcher.submit_due().await;
        assert!(matches!(results.as_slice(), [SubmitResult::Submitted { .. }]));
        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.submission, Submission::Done);
    }

    #[tokio::test]
    async fn test_submit_due_exhausts_retry_budget() {
        let s = scenario().await;
        let transaction = s.store.create_transaction(new_debit(&s)).await.unwrap();
        let dispatcher = dispatcher(&s);
        s.gateway.fail_charges.store(true, Ordering::SeqCst);

        for attempt in 1..=MAX_SUBMISSION_ATTEMPTS {
            let results = dispatcher.submit_due().await;
            match results.as_slice() {
                [SubmitResult::Failed { gave_up, .. }] => {
                    assert_eq!(*gave_up, attempt == MAX_SUBMISSION_ATTEMPTS, "attempt {attempt}");
                }
                other => panic!("unexpected results on attempt {attempt}: {other:?}"),
            }
        }

        let stored = s.store.transaction(transaction.id).await.unwrap().unwrap();
        assert_eq!(stored.submission, Submission::Failed);
        assert_eq!(stored.attempt_count, MAX_SUBMISSION_ATTEMPTS as i32);

        // A failed submission is out of the retry pool for good.
        assert!(dispatcher.submit_due().await.is_empty());
    }
}

#[cfg(test)]
mod customer_tests {
    use super::*;
    use crate::customer::CustomerService;
    use crate::error::BillingError;

    fn service(s: &Scenario) -> CustomerService {
        CustomerService::new(s.gateway.clone(), s.store.clone())
    }

    #[tokio::test]
    async fn test_create_customer_persists_processor_uri() {
        let s = scenario().await;
        let href = service(&s).create_customer(&s.customer).await.unwrap();
        assert!(href.starts_with("/v1/customers/"));
    }

    #[tokio::test]
    async fn test_prepare_customer_with_none_is_noop() {
        let s = scenario().await;
        service(&s).prepare_customer(&s.customer, None).await.unwrap();
        assert!(s.gateway.associations.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_customer_associates_card_and_bank_account() {
        let s = scenario().await;
        let service = service(&s);
        service.create_customer(&s.customer).await.unwrap();
        let customer = Customer {
            processor_uri: Some(format!("/v1/customers/CU{}", s.customer.id.simple())),
            ..s.customer.clone()
        };

        service
            .prepare_customer(&customer, Some("/v1/cards/my_card"))
            .await
            .unwrap();
        service
            .prepare_customer(&customer, Some("/v1/bank_accounts/my_account"))
            .await
            .unwrap();

        let associations = s.gateway.associations.lock().unwrap().clone();
        assert_eq!(associations.len(), 2);
        assert_eq!(associations[0].1, ResourceKind::Card);
        assert_eq!(associations[0].2, "/v1/cards/my_card");
        assert_eq!(associations[1].1, ResourceKind::BankAccount);
    }

    #[tokio::test]
    async fn test_prepare_customer_rejects_unknown_scheme() {
        let s = scenario().await;
        let customer = Customer {
            processor_uri: Some("/v1/customers/CU1".to_string()),
            ..s.customer.clone()
        };
        let err = service(&s)
            .prepare_customer(&customer, Some("/v1/bitcoin/12345"))
            .await;
        assert!(matches!(err, Err(BillingError::Validation(_))));
    }

    #[tokio::test]
    async fn test_validate_customer_rejects_guid() {
        let s = scenario().await;
        let err = service(&s).validate_customer("CUXXXXXXXX").await;
        assert!(matches!(err, Err(BillingError::InvalidUriFormat(_))));
    }

    #[tokio::test]
    async fn test_validate_funding_instrument_rejects_gateway_refusal() {
        let s = scenario().await;
        s.gateway.reject_instrument("/v1/cards/invalid_card");
        let err = service(&s)
            .validate_funding_instrument("/v1/cards/invalid_card")
            .await;
        assert!(matches!(err, Err(BillingError::InvalidFundingInstrument(_))));
    }
}
