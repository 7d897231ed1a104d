mod common;

use morphdb::ListQuery;
use serde_json::json;

// Filters must push down into the storage query: `total` and `hasMore`
// describe the filtered population, not the page or the whole table.

#[tokio::test]
async fn filter_beyond_limit_counts_matches_only() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();

    for i in 0..95 {
        kernel
            .create(
                "Contact",
                common::payload(json!({"name": format!("c{}", i), "stage": "Customer"})),
                "t",
            )
            .await
            .unwrap();
    }
    for i in 0..5 {
        kernel
            .create(
                "Contact",
                common::payload(json!({"name": format!("l{}", i), "stage": "Lead"})),
                "t",
            )
            .await
            .unwrap();
    }

    let page = kernel
        .list(
            "Contact",
            ListQuery {
                filter: Some(common::payload(json!({"stage": "Lead"}))),
                limit: Some(10),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(page.entities.len(), 5);
    assert!(page.entities.iter().all(|e| e.data["stage"] == json!("Lead")));
    assert_eq!(page.total, 5);
    assert!(!page.has_more);
    assert_eq!(page.meta()["total"], json!(5));
    assert_eq!(page.meta()["hasMore"], json!(false));

    engine.shutdown().await;
}

#[tokio::test]
async fn pagination_window_and_has_more() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();
    for i in 0..7 {
        kernel
            .create("Contact", common::payload(json!({"name": format!("c{}", i)})), "t")
            .await
            .unwrap();
    }

    let first = kernel
        .list("Contact", ListQuery { limit: Some(3), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(first.entities.len(), 3);
    assert_eq!(first.total, 7);
    assert!(first.has_more);

    let last = kernel
        .list("Contact", ListQuery { limit: Some(3), offset: Some(6), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(last.entities.len(), 1);
    assert!(!last.has_more);

    // Limit is capped at 1,000; an absent limit defaults to 100.
    let capped = kernel
        .list("Contact", ListQuery { limit: Some(9_999), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(capped.limit, 1_000);

    engine.shutdown().await;
}

#[tokio::test]
async fn multi_field_filters_and_nulls() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();

    kernel
        .create(
            "Contact",
            common::payload(json!({"name": "a", "stage": "Lead", "email": "a@x"})),
            "t",
        )
        .await
        .unwrap();
    kernel
        .create("Contact", common::payload(json!({"name": "b", "stage": "Lead"})), "t")
        .await
        .unwrap();
    kernel
        .create(
            "Contact",
            common::payload(json!({"name": "c", "stage": "Customer", "email": null})),
            "t",
        )
        .await
        .unwrap();

    // AND-combined equality.
    let page = kernel
        .list(
            "Contact",
            ListQuery {
                filter: Some(common::payload(json!({"stage": "Lead", "email": "a@x"}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.entities[0].data["name"], json!("a"));

    // Null matches absent and explicit-null alike.
    let page = kernel
        .list(
            "Contact",
            ListQuery {
                filter: Some(common::payload(json!({"email": null}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    engine.shutdown().await;
}

#[tokio::test]
async fn sort_by_document_field_and_time_columns() {
    let engine = common::in_memory_engine();
    let kernel = engine.kernel("acme").unwrap();
    kernel.define_noun("Contact", common::contact_definition()).await.unwrap();
    for name in ["mallory", "alice", "zoe"] {
        kernel
            .create("Contact", common::payload(json!({"name": name})), "t")
            .await
            .unwrap();
    }

    let ascending = kernel
        .list("Contact", ListQuery { sort: Some(("name".into(), 1)), ..Default::default() })
        .await
        .unwrap();
    let names: Vec<_> = ascending.entities.iter().map(|e| e.data["name"].clone()).collect();
    assert_eq!(names, vec![json!("alice"), json!("mallory"), json!("zoe")]);

    let newest_first = kernel
        .list(
            "Contact",
            ListQuery { sort: Some(("$createdAt".into(), -1)), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(newest_first.entities.len(), 3);

    // Invalid sort direction falls back to createdAt DESC, not an error.
    let fallback = kernel
        .list("Contact", ListQuery { sort: Some(("name".into(), 5)), ..Default::default() })
        .await
        .unwrap();
    assert_eq!(fallback.entities.len(), 3);

    engine.shutdown().await;
}
