mod common;

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::{json, Value};

use common::{body_json, TestApp};

#[tokio::test]
async fn seeded_object_types_are_present() -> Result<()> {
    let app = TestApp::new().await?;
    let response = app.get("/api/0/object-types").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let types = body_json(response.into_body()).await?;
    let names: Vec<&str> = types
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    for expected in [
        "purchase_order",
        "order",
        "invoice",
        "shipment",
        "product",
        "customer",
        "supplier",
        "task",
        "ledger_entry",
    ] {
        assert!(names.contains(&expected), "missing seeded type {expected}");
    }
    Ok(())
}

#[tokio::test]
async fn object_type_deletion_is_blocked_while_objects_exist() -> Result<()> {
    let app = TestApp::new().await?;

    let response = app
        .post_json(
            "/api/0/object-types",
            &json!({ "name": "contract", "display_name": "Contract" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let created = body_json(response.into_body()).await?;
    let type_id = created["id"].as_str().unwrap().to_string();

    let response = app
        .post_json(
            "/api/0/objects",
            &json!({ "type": "contract", "name": "C-100", "data": { "party": "ACME" } }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let object = body_json(response.into_body()).await?;
    let object_id = object["id"].as_str().unwrap().to_string();

    let response = app.delete(&format!("/api/0/object-types/{type_id}")).await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["error"]["code"], "precondition_failed");

    let response = app.delete(&format!("/api/0/objects/{object_id}")).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.delete(&format!("/api/0/object-types/{type_id}")).await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    Ok(())
}

#[tokio::test]
async fn duplicate_type_names_conflict() -> Result<()> {
    let app = TestApp::new().await?;
    let response = app
        .post_json(
            "/api/0/object-types",
            &json!({ "name": "invoice", "display_name": "Invoice again" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["error"]["code"], "conflict");
    Ok(())
}

#[tokio::test]
async fn duplicate_object_conflicts_only_when_data_diverges() -> Result<()> {
    let app = TestApp::new().await?;

    let first = app
        .post_json(
            "/api/0/objects",
            &json!({
                "type": "invoice",
                "name": "INV-7",
                "data": { "total": "12.50" },
            }),
        )
        .await?;
    let first = body_json(first.into_body()).await?;

    // same (type, name) with only additional keys: merged, same object
    let second = app
        .post_json(
            "/api/0/objects",
            &json!({
                "type": "invoice",
                "name": "INV-7",
                "data": { "currency": "EUR" },
            }),
        )
        .await?;
    assert_eq!(second.status(), StatusCode::OK);
    let second = body_json(second.into_body()).await?;
    assert_eq!(first["id"], second["id"]);
    assert_eq!(second["data"]["total"], "12.50");
    assert_eq!(second["data"]["currency"], "EUR");

    // divergent data is the caller's problem over REST
    let divergent = app
        .post_json(
            "/api/0/objects",
            &json!({
                "type": "invoice",
                "name": "INV-7",
                "data": { "total": "99.99" },
            }),
        )
        .await?;
    assert_eq!(divergent.status(), StatusCode::CONFLICT);
    let body = body_json(divergent.into_body()).await?;
    assert_eq!(body["error"]["code"], "conflict");

    let response = app.get("/api/0/objects?type=invoice&q=INV-7").await?;
    let listed = body_json(response.into_body()).await?;
    assert_eq!(listed.as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn unknown_object_type_is_rejected_on_create() -> Result<()> {
    let app = TestApp::new().await?;
    let response = app
        .post_json(
            "/api/0/objects",
            &json!({ "type": "not_a_type", "name": "X-1" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn manual_links_round_trip_and_are_idempotent() -> Result<()> {
    let app = TestApp::new().await?;

    app.ingest(
        "win",
        json!([{
            "id": 7,
            "timestamp": "2024-01-06T10:00:00Z",
            "duration": 3.0,
            "data": { "app": "erp", "title": "plain window" },
        }]),
    )
    .await?;

    let object = app
        .post_json(
            "/api/0/objects",
            &json!({ "type": "customer", "name": "ACME GmbH" }),
        )
        .await?;
    let object = body_json(object.into_body()).await?;
    let object_id = object["id"].as_str().unwrap().to_string();

    let link = json!({ "object_id": object_id });
    for _ in 0..2 {
        let response = app
            .post_json("/api/0/buckets/win/events/7/objects", &link)
            .await?;
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = app.get("/api/0/buckets/win/events/7/objects").await?;
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["provenance"], "manual");

    let response = app
        .delete(&format!("/api/0/buckets/win/events/7/objects/{}", object_id))
        .await?;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = app.get("/api/0/buckets/win/events/7/objects").await?;
    let links = body_json(response.into_body()).await?;
    assert!(links.as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn stats_reflect_stored_entities() -> Result<()> {
    let app = TestApp::new().await?;
    app.ingest(
        "win",
        json!([{
            "id": 1,
            "timestamp": "2024-01-06T10:00:00Z",
            "duration": 5.0,
            "data": { "title": "Purchase Order PO-2024-001234" },
        }]),
    )
    .await?;

    let response = app.get("/api/0/stats").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let stats = body_json(response.into_body()).await?;
    assert_eq!(stats["total_events"], 1);
    assert_eq!(stats["total_objects"], 1);
    assert!(stats["total_rules"].as_i64().unwrap() >= 3);

    let by_type = stats["objects_by_type"].as_array().unwrap();
    assert!(by_type
        .iter()
        .any(|entry| entry["type"] == "purchase_order" && entry["count"] == 1));
    Ok(())
}

#[tokio::test]
async fn health_exposes_queue_counters() -> Result<()> {
    let app = TestApp::new().await?;
    let response = app.get("/api/0/health").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["enrichment"]["capacity"], 16);
    assert_eq!(body["enrichment"]["dropped"], 0);
    Ok(())
}

#[tokio::test]
async fn renaming_an_object_onto_an_existing_name_conflicts() -> Result<()> {
    let app = TestApp::new().await?;

    let first = app
        .post_json(
            "/api/0/objects",
            &json!({ "type": "product", "name": "SKU-1" }),
        )
        .await?;
    let first: Value = body_json(first.into_body()).await?;
    let second = app
        .post_json(
            "/api/0/objects",
            &json!({ "type": "product", "name": "SKU-2" }),
        )
        .await?;
    let second: Value = body_json(second.into_body()).await?;

    let response = app
        .put_json(
            &format!("/api/0/objects/{}", second["id"].as_str().unwrap()),
            &json!({ "name": "SKU-1" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // the original is untouched
    let response = app
        .get(&format!("/api/0/objects/{}", first["id"].as_str().unwrap()))
        .await?;
    let unchanged = body_json(response.into_body()).await?;
    assert_eq!(unchanged["name"], "SKU-1");
    Ok(())
}
