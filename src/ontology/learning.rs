use chrono::Utc;
use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::json;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::models::{
    EventObjectLink, ExtractionRule, NewExtractionRule, NewOntologyAudit, NewRuleCorrection,
    Object,
};
use crate::schema::{event_objects, extraction_rules, objects, ontology_audit, rule_corrections};
use crate::store::{self, StoreError};

use super::PROVENANCE_LEARNED;

pub const CONFIRM_ALPHA: f64 = 0.1;
pub const REJECT_BETA: f64 = 0.2;
pub const DEMOTION_ACCURACY: f64 = 0.25;
pub const DEMOTION_MIN_SAMPLES: i32 = 10;
pub const CORRECTIONS_FOR_PROPOSAL: i64 = 3;

#[derive(Debug, Error)]
pub enum LearningError {
    #[error(transparent)]
    Database(#[from] diesel::result::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("link not found")]
    LinkNotFound,
    #[error("object not found")]
    ObjectNotFound,
}

pub type LearningResult<T> = Result<T, LearningError>;

pub fn raised_confidence(confidence: f64) -> f64 {
    (confidence + CONFIRM_ALPHA * (1.0 - confidence)).min(0.99)
}

pub fn lowered_confidence(confidence: f64) -> f64 {
    (confidence - REJECT_BETA * confidence).max(0.0)
}

fn find_link(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
) -> LearningResult<EventObjectLink> {
    event_objects::table
        .find((bucket.to_string(), event_id, object_id.to_string()))
        .first(conn)
        .optional()?
        .ok_or(LearningError::LinkNotFound)
}

fn rule_of_link(
    conn: &mut SqliteConnection,
    link: &EventObjectLink,
) -> LearningResult<Option<ExtractionRule>> {
    let Some(rule_id) = link.provenance.strip_prefix("rule:") else {
        return Ok(None);
    };
    Ok(extraction_rules::table
        .find(rule_id.to_string())
        .first(conn)
        .optional()?)
}

/// User confirmed the binding: the originating rule gains confidence.
pub fn confirm_link(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
) -> LearningResult<Option<ExtractionRule>> {
    let link = find_link(conn, bucket, event_id, object_id)?;
    let Some(rule) = rule_of_link(conn, &link)? else {
        return Ok(None);
    };
    diesel::update(extraction_rules::table.find(&rule.id))
        .set((
            extraction_rules::confirm_count.eq(rule.confirm_count + 1),
            extraction_rules::confidence.eq(raised_confidence(rule.confidence)),
            extraction_rules::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;
    Ok(extraction_rules::table.find(&rule.id).first(conn).optional()?)
}

/// User rejected the binding: the link is removed and the rule loses
/// confidence. A rule whose accuracy falls to the demotion threshold or
/// below with enough samples is disabled and an audit record is written.
pub fn reject_link(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
    reason: Option<&str>,
) -> LearningResult<Option<ExtractionRule>> {
    let link = find_link(conn, bucket, event_id, object_id)?;
    let rule = rule_of_link(conn, &link)?;
    store::unlink_event_from_object(conn, bucket, event_id, object_id)?;

    let Some(rule) = rule else {
        return Ok(None);
    };

    let reject_count = rule.reject_count + 1;
    let confidence = lowered_confidence(rule.confidence);
    let samples = rule.confirm_count + reject_count;
    let accuracy = rule.confirm_count as f64 / samples as f64;
    // 10 confirms then 30 rejects lands exactly on the threshold and must
    // demote, so the comparison is inclusive
    let demote = rule.enabled && samples >= DEMOTION_MIN_SAMPLES && accuracy <= DEMOTION_ACCURACY;

    diesel::update(extraction_rules::table.find(&rule.id))
        .set((
            extraction_rules::reject_count.eq(reject_count),
            extraction_rules::confidence.eq(confidence),
            extraction_rules::enabled.eq(rule.enabled && !demote),
            extraction_rules::updated_at.eq(Utc::now().naive_utc()),
        ))
        .execute(conn)?;

    if demote {
        info!(rule_id = %rule.id, accuracy, "rule demoted");
        diesel::insert_into(ontology_audit::table)
            .values(NewOntologyAudit {
                id: Uuid::new_v4().to_string(),
                rule_id: Some(rule.id.clone()),
                kind: "rule_demoted".to_string(),
                detail: json!({
                    "accuracy": accuracy,
                    "samples": samples,
                    "reason": reason,
                })
                .to_string(),
                created_at: Utc::now().naive_utc(),
            })
            .execute(conn)?;
    }

    Ok(extraction_rules::table.find(&rule.id).first(conn).optional()?)
}

#[derive(Debug, Default, Clone)]
pub struct Correction {
    pub object_type: Option<String>,
    pub name: Option<String>,
    pub identifier_key: Option<String>,
}

/// User corrected the binding: the original link is replaced by a manual
/// link to the corrected object. Three corrections of the same
/// (rule, corrected type) pair propose a learned candidate rule.
pub fn correct_link(
    conn: &mut SqliteConnection,
    bucket: &str,
    event_id: i64,
    object_id: &str,
    correction: &Correction,
) -> LearningResult<Object> {
    let link = find_link(conn, bucket, event_id, object_id)?;
    let original: Object = objects::table
        .find(object_id.to_string())
        .first(conn)
        .optional()?
        .ok_or(LearningError::ObjectNotFound)?;
    let rule = rule_of_link(conn, &link)?;

    store::unlink_event_from_object(conn, bucket, event_id, object_id)?;

    let corrected_type = correction
        .object_type
        .clone()
        .unwrap_or_else(|| original.object_type.clone());
    let corrected_name = correction
        .name
        .clone()
        .unwrap_or_else(|| original.name.clone());
    let data = match &correction.identifier_key {
        Some(key) => json!({ key.as_str(): corrected_name }),
        None => original.data_value(),
    };

    let corrected = store::upsert_object(conn, &corrected_type, &corrected_name, &data, false)?;
    store::link_event_to_object(conn, bucket, event_id, &corrected.id, "manual", 1.0)?;

    if let Some(rule) = rule {
        diesel::insert_into(rule_corrections::table)
            .values(NewRuleCorrection {
                id: Uuid::new_v4().to_string(),
                rule_id: rule.id.clone(),
                corrected_type: corrected_type.clone(),
                source_text: original.name.clone(),
                created_at: Utc::now().naive_utc(),
            })
            .execute(conn)?;
        maybe_propose_rule(conn, &rule, &corrected_type)?;
    }

    Ok(corrected)
}

fn maybe_propose_rule(
    conn: &mut SqliteConnection,
    rule: &ExtractionRule,
    corrected_type: &str,
) -> LearningResult<()> {
    let count: i64 = rule_corrections::table
        .filter(rule_corrections::rule_id.eq(&rule.id))
        .filter(rule_corrections::corrected_type.eq(corrected_type))
        .count()
        .get_result(conn)?;
    if count < CORRECTIONS_FOR_PROPOSAL {
        return Ok(());
    }

    let latest: String = rule_corrections::table
        .filter(rule_corrections::rule_id.eq(&rule.id))
        .filter(rule_corrections::corrected_type.eq(corrected_type))
        .order(rule_corrections::created_at.desc())
        .select(rule_corrections::source_text)
        .first(conn)?;

    let pattern = format!("(?P<id>{})", generalize_pattern(&latest));
    let already_proposed: i64 = extraction_rules::table
        .filter(extraction_rules::pattern.eq(&pattern))
        .filter(extraction_rules::object_type.eq(corrected_type))
        .count()
        .get_result(conn)?;
    if already_proposed > 0 {
        return Ok(());
    }

    let now = Utc::now().naive_utc();
    let proposed = NewExtractionRule {
        id: Uuid::new_v4().to_string(),
        name: format!("learned {corrected_type} from {}", rule.name),
        object_type: corrected_type.to_string(),
        source_fields: rule.source_fields.clone(),
        pattern: pattern.clone(),
        name_template: "{id}".to_string(),
        data_mapping: "{}".to_string(),
        // candidate state until confirmed through the API
        enabled: false,
        priority: rule.priority,
        provenance: PROVENANCE_LEARNED.to_string(),
        confidence: 0.5,
        created_at: now,
        updated_at: now,
    };
    diesel::insert_into(extraction_rules::table)
        .values(&proposed)
        .execute(conn)?;
    diesel::insert_into(ontology_audit::table)
        .values(NewOntologyAudit {
            id: Uuid::new_v4().to_string(),
            rule_id: Some(proposed.id.clone()),
            kind: "rule_proposed".to_string(),
            detail: json!({
                "source_rule": rule.id,
                "corrected_type": corrected_type,
                "pattern": pattern,
            })
            .to_string(),
            created_at: now,
        })
        .execute(conn)?;
    info!(rule_id = %proposed.id, %corrected_type, "proposed learned rule");
    Ok(())
}

/// Deterministic generalisation of an identifier: literals are escaped,
/// digit runs become `\d+`, uppercase-letter runs become `[A-Z]+`.
pub fn generalize_pattern(source: &str) -> String {
    let mut out = String::new();
    let mut chars = source.chars().peekable();
    while let Some(&ch) = chars.peek() {
        if ch.is_ascii_digit() {
            while chars.peek().is_some_and(|c| c.is_ascii_digit()) {
                chars.next();
            }
            out.push_str(r"\d+");
        } else if ch.is_ascii_uppercase() {
            while chars.peek().is_some_and(|c| c.is_ascii_uppercase()) {
                chars.next();
            }
            out.push_str("[A-Z]+");
        } else {
            let mut literal = String::new();
            while chars
                .peek()
                .is_some_and(|c| !c.is_ascii_digit() && !c.is_ascii_uppercase())
            {
                literal.push(chars.next().expect("peeked"));
            }
            out.push_str(&regex::escape(&literal));
        }
    }
    out
}
