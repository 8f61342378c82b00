use std::collections::HashMap;

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use serde_json::{Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::Event;
use crate::schema::{extraction_rules, ontology_audit};
use crate::store::{self, StoreError};

use super::{render_template, CompiledRule, RuleSnapshot};

#[derive(Debug, Default)]
pub struct ExtractionSummary {
    pub events_processed: usize,
    pub links_created: usize,
    pub objects_touched: usize,
    pub rules_quarantined: usize,
}

/// One candidate binding produced by a rule match, before persistence.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub object_type: String,
    pub name: String,
    pub data: Value,
}

/// Runs every rule of the snapshot over one event's source text and returns
/// all matches. Later (lower-priority) rules are not inhibited by earlier
/// ones; an event may carry objects of several types.
pub fn match_rules(rules: &[CompiledRule], data: &Value) -> Vec<(usize, RuleMatch)> {
    let mut out = Vec::new();
    for (index, rule) in rules.iter().enumerate() {
        let text = source_text(rule, data);
        if text.trim().is_empty() {
            continue;
        }
        for captures in rule.regex.captures_iter(&text) {
            let Some(name) = render_template(&rule.name_template, &captures) else {
                continue;
            };
            let mut object_data = Map::new();
            for (group, data_key) in &rule.data_mapping {
                if let Some(value) = captures.name(group) {
                    object_data.insert(data_key.clone(), Value::String(value.as_str().to_string()));
                }
            }
            out.push((
                index,
                RuleMatch {
                    object_type: rule.object_type.clone(),
                    name,
                    data: Value::Object(object_data),
                },
            ));
        }
    }
    out
}

fn source_text(rule: &CompiledRule, data: &Value) -> String {
    let mut parts = Vec::with_capacity(rule.source_fields.len());
    for field in &rule.source_fields {
        match data.get(field) {
            Some(Value::String(s)) => parts.push(s.clone()),
            Some(other) if !other.is_null() => parts.push(other.to_string()),
            _ => parts.push(String::new()),
        }
    }
    parts.join(" ")
}

/// Applies the snapshot's rules to a batch of events, upserting objects and
/// links. Per-event failures are logged and skipped; a malformed event never
/// aborts the run.
pub fn extract_events(
    conn: &mut SqliteConnection,
    snapshot: &RuleSnapshot,
    events: &[Event],
) -> Result<ExtractionSummary, StoreError> {
    let mut summary = ExtractionSummary {
        rules_quarantined: quarantine_broken(conn, snapshot)?,
        ..Default::default()
    };
    let mut match_counts: HashMap<String, i32> = HashMap::new();

    for event in events {
        summary.events_processed += 1;
        let data = event.data_value();
        for (rule_index, binding) in match_rules(&snapshot.rules, &data) {
            let rule = &snapshot.rules[rule_index];
            let object = match store::upsert_object(
                conn,
                &binding.object_type,
                &binding.name,
                &binding.data,
                false,
            ) {
                Ok(object) => object,
                Err(StoreError::UnknownObjectType(object_type)) => {
                    warn!(
                        rule_id = %rule.id,
                        %object_type,
                        "rule targets a missing object type; skipping match"
                    );
                    continue;
                }
                Err(err) => return Err(err),
            };
            store::link_event_to_object(
                conn,
                &event.bucket_id,
                event.id,
                &object.id,
                &format!("rule:{}", rule.id),
                rule.confidence,
            )?;
            summary.links_created += 1;
            summary.objects_touched += 1;
            *match_counts.entry(rule.id.clone()).or_default() += 1;
        }
    }

    for (rule_id, count) in match_counts {
        diesel::update(extraction_rules::table.find(&rule_id))
            .set(extraction_rules::match_count.eq(extraction_rules::match_count + count))
            .execute(conn)?;
    }

    debug!(
        events = summary.events_processed,
        links = summary.links_created,
        "extraction batch finished"
    );
    Ok(summary)
}

/// A rule whose pattern fails at runtime is disabled and logged; the job
/// continues without it.
fn quarantine_broken(
    conn: &mut SqliteConnection,
    snapshot: &RuleSnapshot,
) -> Result<usize, StoreError> {
    for (rule_id, error) in &snapshot.broken {
        warn!(rule_id = %rule_id, %error, "quarantining extraction rule");
        diesel::update(extraction_rules::table.find(rule_id))
            .set((
                extraction_rules::enabled.eq(false),
                extraction_rules::updated_at.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        diesel::insert_into(ontology_audit::table)
            .values(crate::models::NewOntologyAudit {
                id: Uuid::new_v4().to_string(),
                rule_id: Some(rule_id.clone()),
                kind: "rule_quarantined".to_string(),
                detail: serde_json::json!({ "error": error }).to_string(),
                created_at: chrono::Utc::now().naive_utc(),
            })
            .execute(conn)?;
    }
    Ok(snapshot.broken.len())
}

/// Dry-run used by the rule test endpoint: no persistence, no counters.
pub fn test_rule_against_sample(rule: &CompiledRule, sample: &Value) -> Option<RuleMatch> {
    match_rules(std::slice::from_ref(rule), sample)
        .into_iter()
        .map(|(_, binding)| binding)
        .next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn po_rule() -> CompiledRule {
        let mut mapping = BTreeMap::new();
        mapping.insert("n".to_string(), "po_number".to_string());
        CompiledRule {
            id: "rule-1".to_string(),
            object_type: "purchase_order".to_string(),
            source_fields: vec!["title".to_string()],
            regex: Regex::new(r"(?:Purchase Order|PO)\s*(?P<n>PO-\d{4}-\d{6})").unwrap(),
            name_template: "{n}".to_string(),
            data_mapping: mapping,
            priority: 10,
            confidence: 0.9,
        }
    }

    #[test]
    fn matches_purchase_order_title() {
        let matches = match_rules(
            &[po_rule()],
            &json!({"title": "Purchase Order PO-2024-001234 - ERP"}),
        );
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].1.name, "PO-2024-001234");
        assert_eq!(matches[0].1.data["po_number"], "PO-2024-001234");
    }

    #[test]
    fn missing_source_field_contributes_empty_string() {
        let matches = match_rules(&[po_rule()], &json!({"url": "https://erp.example"}));
        assert!(matches.is_empty());
    }

    #[test]
    fn collects_all_non_overlapping_matches() {
        let matches = match_rules(
            &[po_rule()],
            &json!({"title": "PO PO-2024-000001 vs PO PO-2024-000002"}),
        );
        let names: Vec<&str> = matches.iter().map(|(_, m)| m.name.as_str()).collect();
        assert_eq!(names, vec!["PO-2024-000001", "PO-2024-000002"]);
    }

    #[test]
    fn lower_priority_rules_still_match() {
        let mut second = po_rule();
        second.id = "rule-2".to_string();
        second.priority = 1;
        second.regex = Regex::new(r"(?P<n>PO-\d{4}-\d{6})\s+approved").unwrap();
        let matches = match_rules(
            &[po_rule(), second],
            &json!({"title": "PO PO-2024-001234 approved"}),
        );
        assert_eq!(matches.len(), 2);
    }
}
