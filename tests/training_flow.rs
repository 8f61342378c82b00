mod common;

use anyhow::Result;
use axum::http::StatusCode;
use chrono::Utc;
use diesel::prelude::*;
use serde_json::json;
use uuid::Uuid;

use common::{body_json, TestApp};
use procmine::models::NewReviewTask;

async fn insert_review_task(
    app: &TestApp,
    bucket: &str,
    event_id: i64,
    object_type: &str,
    name: &str,
    confidence: f64,
) -> Result<String> {
    let task_id = Uuid::new_v4().to_string();
    let row = NewReviewTask {
        id: task_id.clone(),
        bucket_id: bucket.to_string(),
        event_id,
        object_type: object_type.to_string(),
        object_name: name.to_string(),
        identifier_key: Some("identifier".to_string()),
        data: "{}".to_string(),
        confidence,
        provenance: "llm".to_string(),
        status: "pending".to_string(),
        created_at: Utc::now().naive_utc(),
        updated_at: Utc::now().naive_utc(),
    };
    app.with_conn(move |conn| {
        diesel::insert_into(procmine::schema::review_tasks::table)
            .values(&row)
            .execute(conn)?;
        Ok(())
    })
    .await?;
    Ok(task_id)
}

async fn ingest_plain_event(app: &TestApp, id: i64) -> Result<()> {
    app.ingest(
        "win",
        json!([{
            "id": id,
            "timestamp": "2024-01-06T10:00:00Z",
            "duration": 2.0,
            "data": { "app": "browser", "title": "supplier portal" },
        }]),
    )
    .await?;
    Ok(())
}

#[tokio::test]
async fn pending_tasks_list_oldest_first() -> Result<()> {
    let app = TestApp::new().await?;
    ingest_plain_event(&app, 1).await?;
    insert_review_task(&app, "win", 1, "supplier", "ACME Metals", 0.6).await?;
    insert_review_task(&app, "win", 1, "customer", "Umbrella Corp", 0.7).await?;

    let response = app.get("/api/0/training/pending?limit=10").await?;
    assert_eq!(response.status(), StatusCode::OK);
    let tasks = body_json(response.into_body()).await?;
    let tasks = tasks.as_array().unwrap();
    assert_eq!(tasks.len(), 2);
    assert!(tasks.iter().all(|task| task["status"] == "pending"));
    Ok(())
}

#[tokio::test]
async fn confirming_a_task_materialises_object_and_link() -> Result<()> {
    let app = TestApp::new().await?;
    ingest_plain_event(&app, 1).await?;
    let task_id = insert_review_task(&app, "win", 1, "supplier", "ACME Metals", 0.6).await?;

    let response = app
        .post_json(&format!("/api/0/training/{task_id}/confirm"), &json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["status"], "confirmed");

    let response = app.get("/api/0/objects?type=supplier").await?;
    let objects = body_json(response.into_body()).await?;
    let objects = objects.as_array().unwrap();
    assert_eq!(objects.len(), 1);
    assert_eq!(objects[0]["name"], "ACME Metals");

    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["provenance"], "llm");

    // a processed task cannot be acted on again
    let response = app
        .post_json(&format!("/api/0/training/{task_id}/confirm"), &json!({}))
        .await?;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["error"]["code"], "precondition_failed");
    Ok(())
}

#[tokio::test]
async fn rejecting_a_task_leaves_no_object_behind() -> Result<()> {
    let app = TestApp::new().await?;
    ingest_plain_event(&app, 1).await?;
    let task_id = insert_review_task(&app, "win", 1, "supplier", "Maybe Inc", 0.55).await?;

    let response = app
        .post_json(
            &format!("/api/0/training/{task_id}/reject"),
            &json!({ "reason": "hallucinated" }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.get("/api/0/objects?type=supplier").await?;
    let objects = body_json(response.into_body()).await?;
    assert!(objects.as_array().unwrap().is_empty());

    let response = app.get("/api/0/training/pending").await?;
    let pending = body_json(response.into_body()).await?;
    assert!(pending.as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn correcting_a_task_links_the_corrected_object() -> Result<()> {
    let app = TestApp::new().await?;
    ingest_plain_event(&app, 1).await?;
    let task_id = insert_review_task(&app, "win", 1, "supplier", "PO-2024-000077", 0.6).await?;

    let response = app
        .post_json(
            &format!("/api/0/training/{task_id}/correct"),
            &json!({
                "object_type": "purchase_order",
                "identifier_key": "po_number",
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response.into_body()).await?;
    assert_eq!(body["type"], "purchase_order");
    assert_eq!(body["name"], "PO-2024-000077");

    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["type"], "purchase_order");
    assert_eq!(links[0]["provenance"], "manual");
    Ok(())
}

#[tokio::test]
async fn unknown_task_is_not_found() -> Result<()> {
    let app = TestApp::new().await?;
    let response = app
        .post_json(
            &format!("/api/0/training/{}/confirm", Uuid::new_v4()),
            &json!({}),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    Ok(())
}
