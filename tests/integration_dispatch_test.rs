mod common;

use std::time::Duration;

use morphdb::integrate::{ENTITY_HEADER, EVENT_HEADER, HOOK_HEADER, VERB_HEADER};
use morphdb::{DispatchStatus, Service, ServiceBindings};
use serde_json::json;

use common::CaptureServer;

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(20);

// Integration dispatch: the built-in route table, service bindings, and the
// dispatch log as the audit trail.

#[tokio::test]
async fn deal_close_dispatches_to_payments() {
    let payments = CaptureServer::start().await;
    let bindings = ServiceBindings::new().with(Service::Payments, payments.url());
    let engine = common::in_memory_engine_with(bindings);
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Deal", common::deal_definition()).await.unwrap();

    let (deal, _) = kernel
        .create("Deal", common::payload(json!({"title": "Big", "amount": 100})), "https://acme.example")
        .await
        .unwrap();
    let (_, close_event) = kernel.execute("Deal", &deal.id, "close", None).await.unwrap();

    // One dispatch-log entry for the built-in hook, status success.
    let entry = common::eventually(WAIT, POLL, || async {
        kernel
            .list_dispatches(Some(&close_event.id), 10)
            .await
            .unwrap()
            .into_iter()
            .next()
    })
    .await;
    assert_eq!(entry.hook_id, "builtin:PAYMENTS:POST /subscriptions/create");
    assert_eq!(entry.service, Service::Payments);
    assert_eq!(entry.status, DispatchStatus::Success);
    assert_eq!(entry.status_code, Some(200));
    assert!(entry.error.is_none());

    // The outbound request carried the event headers and payload.
    let request = payments
        .requests()
        .into_iter()
        .find(|r| r.path == "/subscriptions/create")
        .expect("payments request");
    assert_eq!(request.method, "POST");
    assert_eq!(request.headers[EVENT_HEADER], "Deal.close");
    assert_eq!(request.headers[ENTITY_HEADER], deal.id);
    assert_eq!(request.headers[VERB_HEADER], "close");
    assert!(request.headers[HOOK_HEADER].starts_with("builtin:PAYMENTS:"));
    let body: serde_json::Value = serde_json::from_str(&request.body).unwrap();
    assert_eq!(body["entityType"], json!("Deal"));
    assert_eq!(body["verb"], json!("close"));
    assert_eq!(body["event"]["type"], json!("Deal.close"));

    engine.shutdown().await;
}

#[tokio::test]
async fn missing_binding_logs_error_without_failing_the_verb() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Deal", common::deal_definition()).await.unwrap();

    let (deal, _) = kernel
        .create("Deal", common::payload(json!({"title": "Small"})), "t")
        .await
        .unwrap();
    let (closed, close_event) = kernel.execute("Deal", &deal.id, "close", None).await.unwrap();
    // The verb itself succeeded.
    assert_eq!(closed.version.as_raw(), 2);

    let entry = common::eventually(WAIT, POLL, || async {
        kernel
            .list_dispatches(Some(&close_event.id), 10)
            .await
            .unwrap()
            .into_iter()
            .next()
    })
    .await;
    assert_eq!(entry.status, DispatchStatus::Error);
    assert!(entry.status_code.is_none());
    assert!(entry.error.as_deref().unwrap().contains("Service binding 'PAYMENTS' not available"));

    engine.shutdown().await;
}

#[tokio::test]
async fn contact_create_hits_builtin_customer_sync() {
    let payments = CaptureServer::start().await;
    let bindings = ServiceBindings::new().with(Service::Payments, payments.url());
    let engine = common::in_memory_engine_with(bindings);
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();

    let (_, event) = kernel
        .create("Contact", common::payload(json!({"name": "Alice"})), "t")
        .await
        .unwrap();

    let entry = common::eventually(WAIT, POLL, || async {
        kernel.list_dispatches(Some(&event.id), 10).await.unwrap().into_iter().next()
    })
    .await;
    assert_eq!(entry.hook_id, "builtin:PAYMENTS:POST /customers/sync");
    assert_eq!(entry.status, DispatchStatus::Success);
    assert_eq!(
        payments.requests()[0].path,
        "/customers/sync"
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn tenant_hooks_match_alongside_builtins() {
    let payments = CaptureServer::start().await;
    let events_svc = CaptureServer::start().await;
    let bindings = ServiceBindings::new()
        .with(Service::Payments, payments.url())
        .with(Service::Events, events_svc.url());
    let engine = common::in_memory_engine_with(bindings);
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Deal", common::deal_definition()).await.unwrap();

    // Wildcard tenant hook: every event also goes to the EVENTS service.
    kernel
        .add_integration_hook("*", "*", Service::Events, "POST /firehose", None)
        .await
        .unwrap();

    let (deal, _) = kernel
        .create("Deal", common::payload(json!({"title": "Big"})), "t")
        .await
        .unwrap();
    let (_, close_event) = kernel.execute("Deal", &deal.id, "close", None).await.unwrap();

    // Deal.close matches the built-in PAYMENTS hook and the tenant hook.
    let entries = common::eventually(WAIT, POLL, || async {
        let entries = kernel.list_dispatches(Some(&close_event.id), 10).await.unwrap();
        if entries.len() >= 2 {
            Some(entries)
        } else {
            None
        }
    })
    .await;
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == DispatchStatus::Success));
    assert!(entries.iter().any(|e| e.hook_id.starts_with("builtin:PAYMENTS:")));
    assert!(entries.iter().any(|e| e.hook_id.starts_with("ihook_")));
    assert!(events_svc.requests().iter().any(|r| r.path == "/firehose"));

    engine.shutdown().await;
}

#[tokio::test]
async fn non_2xx_responses_are_recorded_as_errors() {
    let broken = CaptureServer::start_with_status(500).await;
    let bindings = ServiceBindings::new().with(Service::Payments, broken.url());
    let engine = common::in_memory_engine_with(bindings);
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Deal", common::deal_definition()).await.unwrap();

    let (deal, _) = kernel
        .create("Deal", common::payload(json!({"title": "Doomed"})), "t")
        .await
        .unwrap();
    let (_, close_event) = kernel.execute("Deal", &deal.id, "close", None).await.unwrap();

    let entry = common::eventually(WAIT, POLL, || async {
        kernel.list_dispatches(Some(&close_event.id), 10).await.unwrap().into_iter().next()
    })
    .await;
    assert_eq!(entry.status, DispatchStatus::Error);
    assert_eq!(entry.status_code, Some(500));
    assert!(entry.error.as_deref().unwrap().contains("HTTP 500"));

    engine.shutdown().await;
}
