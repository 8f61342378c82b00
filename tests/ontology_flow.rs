mod common;

use anyhow::Result;
use axum::http::StatusCode;
use diesel::prelude::*;
use serde_json::{json, Value};

use common::{body_json, TestApp};

async fn seed_rule(app: &TestApp, pattern: &str, confidence: f64) -> Result<Value> {
    let response = app
        .post_json(
            "/api/0/extraction-rules",
            &json!({
                "name": "task id",
                "object_type": "task",
                "source_fields": ["title"],
                "pattern": pattern,
                "name_template": "{n}",
                "confidence": confidence,
                "priority": 500,
            }),
        )
        .await?;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response.into_body()).await
}

async fn linked_object_id(app: &TestApp, bucket: &str, event: i64) -> Result<String> {
    let response = app
        .get(&format!("/api/0/buckets/{bucket}/events/{event}/objects"))
        .await?;
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().expect("links array");
    assert!(!links.is_empty(), "event {event} has no links");
    Ok(links[0]["object_id"].as_str().unwrap().to_string())
}

#[tokio::test]
async fn ten_confirmations_raise_confidence_past_eighty_percent() -> Result<()> {
    let app = TestApp::new().await?;
    let rule = seed_rule(&app, r"(?P<n>TASK-\d{4})", 0.5).await?;
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let events: Vec<Value> = (1..=10)
        .map(|id| {
            json!({
                "id": id,
                "timestamp": format!("2024-01-06T10:{:02}:00Z", id),
                "duration": 5.0,
                "data": { "title": format!("TASK-{:04} review", id) },
            })
        })
        .collect();
    app.ingest("win", json!(events)).await?;

    for id in 1..=10 {
        let object_id = linked_object_id(&app, "win", id).await?;
        let response = app
            .post_json(
                &format!("/api/0/buckets/win/events/{id}/objects/{object_id}/confirm"),
                &json!({}),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .get(&format!("/api/0/extraction-rules/{rule_id}"))
        .await?;
    let rule = body_json(response.into_body()).await?;
    assert_eq!(rule["confirm_count"], 10);
    assert!(rule["confidence"].as_f64().unwrap() >= 0.80);
    assert_eq!(rule["enabled"], true);
    Ok(())
}

#[tokio::test]
async fn thirty_rejections_demote_the_rule_with_an_audit_record() -> Result<()> {
    let app = TestApp::new().await?;
    let rule = seed_rule(&app, r"(?P<n>TASK-\d{4})", 0.5).await?;
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let events: Vec<Value> = (1..=30)
        .map(|id| {
            json!({
                "id": id,
                "timestamp": format!("2024-01-06T10:{:02}:{:02}Z", id / 60, id % 60),
                "duration": 1.0,
                "data": { "title": format!("TASK-{:04} noise", id) },
            })
        })
        .collect();
    app.ingest("win", json!(events)).await?;

    for id in 1..=30 {
        let object_id = linked_object_id(&app, "win", id).await?;
        let response = app
            .post_json(
                &format!("/api/0/buckets/win/events/{id}/objects/{object_id}/reject"),
                &json!({ "reason": "not a task" }),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .get(&format!("/api/0/extraction-rules/{rule_id}"))
        .await?;
    let rule = body_json(response.into_body()).await?;
    assert_eq!(rule["enabled"], false);
    assert_eq!(rule["reject_count"], 30);

    let rule_id_for_query = rule_id.clone();
    let demoted = app
        .with_conn(move |conn| {
            use procmine::schema::ontology_audit::dsl::*;
            let count: i64 = ontology_audit
                .filter(kind.eq("rule_demoted"))
                .filter(rule_id.eq(Some(rule_id_for_query)))
                .count()
                .get_result(conn)?;
            Ok(count)
        })
        .await?;
    assert_eq!(demoted, 1);
    Ok(())
}

#[tokio::test]
async fn ten_confirms_then_thirty_rejects_demote_the_same_rule() -> Result<()> {
    let app = TestApp::new().await?;
    let rule = seed_rule(&app, r"(?P<n>TASK-\d{4})", 0.5).await?;
    let rule_id = rule["id"].as_str().unwrap().to_string();

    let events: Vec<Value> = (1..=40)
        .map(|id| {
            json!({
                "id": id,
                "timestamp": format!("2024-01-06T10:{:02}:{:02}Z", id / 60, id % 60),
                "duration": 1.0,
                "data": { "title": format!("TASK-{:04}", id) },
            })
        })
        .collect();
    app.ingest("win", json!(events)).await?;

    for id in 1..=10 {
        let object_id = linked_object_id(&app, "win", id).await?;
        let response = app
            .post_json(
                &format!("/api/0/buckets/win/events/{id}/objects/{object_id}/confirm"),
                &json!({}),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .get(&format!("/api/0/extraction-rules/{rule_id}"))
        .await?;
    let rule = body_json(response.into_body()).await?;
    assert!(rule["confidence"].as_f64().unwrap() >= 0.80);
    assert_eq!(rule["enabled"], true);

    for id in 11..=40 {
        let object_id = linked_object_id(&app, "win", id).await?;
        let response = app
            .post_json(
                &format!("/api/0/buckets/win/events/{id}/objects/{object_id}/reject"),
                &json!({ "reason": "wrong binding" }),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
    }

    // accuracy is exactly 10/40 = 0.25 here, which demotes
    let response = app
        .get(&format!("/api/0/extraction-rules/{rule_id}"))
        .await?;
    let rule = body_json(response.into_body()).await?;
    assert_eq!(rule["confirm_count"], 10);
    assert_eq!(rule["reject_count"], 30);
    assert_eq!(rule["enabled"], false);

    let rule_id_for_query = rule_id.clone();
    let demoted = app
        .with_conn(move |conn| {
            use procmine::schema::ontology_audit::dsl::*;
            let count: i64 = ontology_audit
                .filter(kind.eq("rule_demoted"))
                .filter(rule_id.eq(Some(rule_id_for_query)))
                .count()
                .get_result(conn)?;
            Ok(count)
        })
        .await?;
    assert_eq!(demoted, 1);
    Ok(())
}

#[tokio::test]
async fn rejection_removes_the_link() -> Result<()> {
    let app = TestApp::new().await?;
    seed_rule(&app, r"(?P<n>TASK-\d{4})", 0.5).await?;

    app.ingest(
        "win",
        json!([{
            "id": 1,
            "timestamp": "2024-01-06T10:00:00Z",
            "duration": 5.0,
            "data": { "title": "TASK-0001" },
        }]),
    )
    .await?;

    let object_id = linked_object_id(&app, "win", 1).await?;
    app.post_json(
        &format!("/api/0/buckets/win/events/1/objects/{object_id}/reject"),
        &json!({}),
    )
    .await?;

    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    let links = body_json(response.into_body()).await?;
    assert!(links.as_array().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn three_corrections_propose_a_learned_rule() -> Result<()> {
    let app = TestApp::new().await?;
    seed_rule(&app, r"(?P<n>TASK-\d{4})", 0.5).await?;

    let events: Vec<Value> = (1..=3)
        .map(|id| {
            json!({
                "id": id,
                "timestamp": format!("2024-01-06T10:0{id}:00Z"),
                "duration": 5.0,
                "data": { "title": format!("TASK-000{id} shipping label") },
            })
        })
        .collect();
    app.ingest("win", json!(events)).await?;

    for id in 1..=3 {
        let object_id = linked_object_id(&app, "win", id).await?;
        let response = app
            .post_json(
                &format!("/api/0/buckets/win/events/{id}/objects/{object_id}/correct"),
                &json!({
                    "object_type": "shipment",
                    "identifier_key": "tracking_number",
                }),
            )
            .await?;
        assert_eq!(response.status(), StatusCode::OK);
        let corrected = body_json(response.into_body()).await?;
        assert_eq!(corrected["type"], "shipment");
    }

    let response = app.get("/api/0/extraction-rules").await?;
    let rules = body_json(response.into_body()).await?;
    let learned: Vec<&Value> = rules
        .as_array()
        .unwrap()
        .iter()
        .filter(|rule| rule["provenance"] == "learned")
        .collect();
    assert_eq!(learned.len(), 1);
    assert_eq!(learned[0]["object_type"], "shipment");
    // candidate state until a user enables it
    assert_eq!(learned[0]["enabled"], false);
    assert_eq!(learned[0]["confidence"], 0.5);

    // the corrected events now link to shipment objects via manual links
    let response = app.get("/api/0/buckets/win/events/1/objects").await?;
    let links = body_json(response.into_body()).await?;
    let links = links.as_array().unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0]["type"], "shipment");
    assert_eq!(links[0]["provenance"], "manual");
    Ok(())
}
