mod common;

use morphdb::{Error, ListQuery};
use serde_json::json;

// Soft delete: reads go blind, history keeps everything, time travel sees
// both sides of the deletion.

#[tokio::test]
async fn delete_then_get_is_not_found_but_history_remains() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();

    let (entity, _) = kernel
        .create("Contact", common::payload(json!({"name": "Alice", "stage": "Lead"})), "t")
        .await
        .unwrap();
    let (deleted, delete_event) = kernel.delete("Contact", &entity.id).await.unwrap();
    assert!(deleted.is_deleted());

    // get → 404.
    let err = kernel.get("Contact", &entity.id).await.unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
    assert_eq!(err.http_status(), 404);

    // Two events: create (seq 1, before null) and delete (seq 2, after null).
    let history = kernel.history("Contact", &entity.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].verb, "create");
    assert_eq!(history[0].sequence.as_raw(), 1);
    assert!(history[0].before.is_none());
    assert_eq!(history[1].verb, "delete");
    assert_eq!(history[1].sequence.as_raw(), 2);
    assert!(history[1].after.is_none());
    assert_eq!(history[1].id, delete_event.id);
    assert_eq!(history[1].before.as_ref().unwrap()["name"], json!("Alice"));

    engine.shutdown().await;
}

#[tokio::test]
async fn second_delete_is_not_found_and_emits_no_event() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();
    let (entity, _) = kernel
        .create("Contact", common::payload(json!({"name": "Alice"})), "t")
        .await
        .unwrap();
    kernel.delete("Contact", &entity.id).await.unwrap();

    assert!(matches!(
        kernel.delete("Contact", &entity.id).await,
        Err(Error::NotFound { .. })
    ));
    assert_eq!(kernel.history("Contact", &entity.id).await.unwrap().len(), 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn deleted_rows_never_appear_in_lists() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();

    let mut ids = Vec::new();
    for i in 0..4 {
        let (entity, _) = kernel
            .create(
                "Contact",
                common::payload(json!({"name": format!("c{}", i), "stage": "Lead"})),
                "t",
            )
            .await
            .unwrap();
        ids.push(entity.id);
    }
    kernel.delete("Contact", &ids[0]).await.unwrap();
    kernel.delete("Contact", &ids[2]).await.unwrap();

    let page = kernel.list("Contact", ListQuery::default()).await.unwrap();
    assert_eq!(page.total, 2);
    assert!(page.entities.iter().all(|e| !e.is_deleted()));
    assert!(page.entities.iter().all(|e| e.id != ids[0] && e.id != ids[2]));

    // Filtered counts exclude deleted rows too.
    let page = kernel
        .list(
            "Contact",
            ListQuery {
                filter: Some(common::payload(json!({"stage": "Lead"}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn time_travel_spans_the_deletion() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();
    let (entity, _) = kernel
        .create("Contact", common::payload(json!({"name": "Alice", "stage": "Lead"})), "t")
        .await
        .unwrap();
    kernel.delete("Contact", &entity.id).await.unwrap();

    // Final state is a deleted state.
    let last = kernel.reconstruct("Contact", &entity.id, None, None).await.unwrap();
    assert!(last.deleted);
    assert_eq!(last.version.as_raw(), 2);
    assert!(last.state.contains_key("$deletedAt"));

    // State at version 1 is the live, pre-delete payload.
    let first = kernel.reconstruct("Contact", &entity.id, Some(1), None).await.unwrap();
    assert!(!first.deleted);
    assert_eq!(first.state["name"], json!("Alice"));
    assert_eq!(first.version.as_raw(), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn updating_a_deleted_entity_is_not_found() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();
    let (entity, _) = kernel
        .create("Contact", common::payload(json!({"name": "Alice"})), "t")
        .await
        .unwrap();
    kernel.delete("Contact", &entity.id).await.unwrap();

    assert!(matches!(
        kernel
            .update("Contact", &entity.id, common::payload(json!({"name": "Eve"})), None)
            .await,
        Err(Error::NotFound { .. })
    ));
    assert!(matches!(
        kernel.execute("Contact", &entity.id, "qualify", None).await,
        Err(Error::NotFound { .. })
    ));

    engine.shutdown().await;
}
