mod common;

use anyhow::Result;
use axum::http::StatusCode;
use serde_json::{json, Value};

use common::{body_json, TestApp};

async fn create_rule(app: &TestApp, payload: Value) -> Result<Value> {
    let response = app.post_json("/api/0/extraction-rules", &payload).await?;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response.into_body()).await
}

#[tokio::test]
async fn extracts_purchase_order_from_window_title() -> Result<()> {
    let app = TestApp::new().await?;

    create_rule(
        &app,
        json!({
            "name": "po from title",
            "object_type": "purchase_order",
            "source_fields": ["title"],
            "pattern": r"(?:Purchase Order|PO)\s*(?P<n>PO-\d{4}-\d{6})",
            "name_template": "{n}",
            "data_mapping": { "n": "po_number" },
            "priority": 200,
        }),
    )
    .await?;

    app.ingest(
        "win",
        json!([{
            "id": 1,
            "timestamp": "2024-01-06T10:30:00Z",
            "duration": 5.0,
            "data": { "title": "Purchase Order PO-2024-001234 - ERP" },
        }]),
    )
    .await?;

    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["type"], "purchase_order");
    assert_eq!(links[0]["name"], "PO-2024-001234");
    assert!(links[0]["provenance"]
        .as_str()
        .unwrap()
        .starts_with("rule:"));

    let response = app.get("/api/0/objects?type=purchase_order").await?;
    let objects = body_json(response.into_body()).await?;
    assert_eq!(objects.as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn two_rules_deduplicate_on_type_and_name() -> Result<()> {
    let app = TestApp::new().await?;

    create_rule(
        &app,
        json!({
            "name": "po from title",
            "object_type": "purchase_order",
            "source_fields": ["title"],
            "pattern": r"(?:Purchase Order|PO)\s+(?P<n>PO-\d{4}-\d{6})",
            "name_template": "{n}",
            "priority": 200,
        }),
    )
    .await?;
    create_rule(
        &app,
        json!({
            "name": "po approval",
            "object_type": "purchase_order",
            "source_fields": ["title"],
            "pattern": r"(?P<n>PO-\d{4}-\d{6})\s+approved",
            "name_template": "{n}",
            "priority": 10,
        }),
    )
    .await?;

    app.ingest(
        "win",
        json!([
            {
                "id": 1,
                "timestamp": "2024-01-06T10:30:00Z",
                "duration": 5.0,
                "data": { "title": "Purchase Order PO-2024-001234 - ERP" },
            },
            {
                "id": 2,
                "timestamp": "2024-01-06T10:31:00Z",
                "duration": 5.0,
                "data": { "title": "PO-2024-001234 approved" },
            },
        ]),
    )
    .await?;

    // exactly one object for the pair, two events linked to it
    let response = app.get("/api/0/objects?type=purchase_order").await?;
    let objects = body_json(response.into_body()).await?;
    let objects = objects.as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["name"], "PO-2024-001234");

    let object_id = objects[0]["id"].as_str().unwrap();
    let response = app
        .get(&format!("/api/0/objects/{object_id}/events"))
        .await?;
    let events = body_json(response.into_body()).await?;
    assert_eq!(events.as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn rerunning_extraction_is_idempotent() -> Result<()> {
    let app = TestApp::new().await?;

    app.ingest(
        "win",
        json!([{
            "id": 1,
            "timestamp": "2024-01-06T10:30:00Z",
            "duration": 5.0,
            // matched by the seeded purchase-order rule
            "data": { "title": "Purchase Order PO-2024-001234 - ERP" },
        }]),
    )
    .await?;

    let run = json!({
        "start": "2024-01-06T00:00:00Z",
        "end": "2024-01-07T00:00:00Z",
        "bucket": "win",
    });
    for _ in 0..2 {
        let response = app.post_json("/api/0/extraction-rules/run", &run).await?;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response.into_body()).await?;
        let job = app.wait_for_job(body["job_id"].as_str().unwrap()).await?;
        assert_eq!(job["state"], "done");
    }

    let response = app.get("/api/0/objects?type=purchase_order").await?;
    let objects = body_json(response.into_body()).await?;
    assert_eq!(objects.as_array().unwrap().len(), 1);

    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    let links = body_json(response.into_body()).await?;
    assert_eq!(links.as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn rule_test_endpoint_is_a_dry_run() -> Result<()> {
    let app = TestApp::new().await?;

    let rule = create_rule(
        &app,
        json!({
            "name": "invoice from ocr",
            "object_type": "invoice",
            "source_fields": ["ocr_text"],
            "pattern": r"Invoice\s+(?P<n>INV-\d+)",
            "name_template": "{n}",
            "data_mapping": { "n": "invoice_number" },
        }),
    )
    .await?;
    let rule_id = rule["id"].as_str().unwrap();

    let response = app
        .post_json(
            &format!("/api/0/extraction-rules/{rule_id}/test"),
            &json!({
                "samples": [
                    { "ocr_text": "Invoice INV-991 due Friday" },
                    { "title": "nothing to see" },
                ],
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let results = body_json(response.into_body()).await?;
    let results = results.as_array().unwrap();
    assert_eq!(results[0]["match"], true);
    assert_eq!(results[0]["name"], "INV-991");
    assert_eq!(results[0]["data"]["invoice_number"], "INV-991");
    assert_eq!(results[1]["match"], false);

    // no persistence happened
    let response = app.get("/api/0/objects?type=invoice").await?;
    let objects = body_json(response.into_body()).await?;
    assert!(objects.as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn invalid_rule_definitions_are_rejected() -> Result<()> {
    let app = TestApp::new().await?;

    let bad_pattern = app
        .post_json(
            "/api/0/extraction-rules",
            &json!({
                "name": "broken",
                "object_type": "invoice",
                "source_fields": ["title"],
                "pattern": "(?P<n>[unclosed",
                "name_template": "{n}",
            }),
        )
        .await?;
    assert_eq!(bad_pattern.status(), StatusCode::BAD_REQUEST);
    let body = body_json(bad_pattern.into_body()).await?;
    assert_eq!(body["error"]["code"], "invalid_argument");

    let bad_template = app
        .post_json(
            "/api/0/extraction-rules",
            &json!({
                "name": "broken template",
                "object_type": "invoice",
                "source_fields": ["title"],
                "pattern": r"(?P<n>INV-\d+)",
                "name_template": "{missing}",
            }),
        )
        .await?;
    assert_eq!(bad_template.status(), StatusCode::BAD_REQUEST);
    Ok(())
}

#[tokio::test]
async fn concurrent_job_trigger_returns_job_in_progress() -> Result<()> {
    let app = TestApp::new().await?;

    // hold the singleton slot as a running job would
    app.state
        .analysis
        .try_begin("job-held")
        .expect("slot is free");

    let response = app
        .post_json(
            "/api/0/extraction-rules/run",
            &json!({
                "start": "2024-01-06T00:00:00Z",
                "end": "2024-01-07T00:00:00Z",
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["error"]["code"], "job_in_progress");
    assert_eq!(body["error"]["details"]["job_id"], "job-held");

    app.state.analysis.finish("job-held");
    Ok(())
}
