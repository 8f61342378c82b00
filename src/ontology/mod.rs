use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use diesel::prelude::*;
use diesel::sqlite::SqliteConnection;
use regex::Regex;
use tracing::warn;

use crate::models::ExtractionRule;
use crate::schema::extraction_rules;

pub mod extractor;
pub mod learning;
pub mod seed;

pub const PROVENANCE_SEED: &str = "seed";
pub const PROVENANCE_USER: &str = "user";
pub const PROVENANCE_LEARNED: &str = "learned";

/// An enabled rule with its regex compiled, ready to run against events.
#[derive(Debug, Clone)]
pub struct CompiledRule {
    pub id: String,
    pub object_type: String,
    pub source_fields: Vec<String>,
    pub regex: Regex,
    pub name_template: String,
    pub data_mapping: BTreeMap<String, String>,
    pub priority: i32,
    pub confidence: f64,
}

/// Snapshot of the enabled rule set, ordered `priority DESC, id ASC`.
/// Rules whose pattern no longer compiles are carried in `broken` so the
/// extractor can quarantine them.
#[derive(Debug, Default)]
pub struct RuleSnapshot {
    pub version: u64,
    pub rules: Vec<CompiledRule>,
    pub broken: Vec<(String, String)>,
}

/// Versioned in-memory copy of the enabled rules. Mutations to the rules
/// table bump the version; readers reload lazily when their snapshot is
/// stale and hold the `Arc` for the duration of one operation.
pub struct RuleCache {
    latest: AtomicU64,
    snapshot: RwLock<Arc<RuleSnapshot>>,
}

impl Default for RuleCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RuleCache {
    pub fn new() -> Self {
        Self {
            latest: AtomicU64::new(1),
            snapshot: RwLock::new(Arc::new(RuleSnapshot::default())),
        }
    }

    pub fn invalidate(&self) {
        self.latest.fetch_add(1, Ordering::SeqCst);
    }

    pub fn current(&self, conn: &mut SqliteConnection) -> QueryResult<Arc<RuleSnapshot>> {
        let latest = self.latest.load(Ordering::SeqCst);
        {
            let guard = self.snapshot.read().expect("rule cache poisoned");
            if guard.version == latest {
                return Ok(guard.clone());
            }
        }

        let rows: Vec<ExtractionRule> = extraction_rules::table
            .filter(extraction_rules::enabled.eq(true))
            .order((
                extraction_rules::priority.desc(),
                extraction_rules::id.asc(),
            ))
            .load(conn)?;

        let mut rules = Vec::with_capacity(rows.len());
        let mut broken = Vec::new();
        for row in rows {
            match Regex::new(&row.pattern) {
                Ok(regex) => {
                    let source_fields = row.source_fields_vec();
                    let data_mapping = row.data_mapping_map();
                    rules.push(CompiledRule {
                        id: row.id,
                        object_type: row.object_type,
                        source_fields,
                        regex,
                        name_template: row.name_template,
                        data_mapping,
                        priority: row.priority,
                        confidence: row.confidence,
                    })
                }
                Err(err) => {
                    warn!(rule_id = %row.id, error = %err, "rule pattern failed to compile");
                    broken.push((row.id, err.to_string()));
                }
            }
        }

        let fresh = Arc::new(RuleSnapshot {
            version: latest,
            rules,
            broken,
        });
        let mut guard = self.snapshot.write().expect("rule cache poisoned");
        *guard = fresh.clone();
        Ok(fresh)
    }
}

/// Validates a rule definition: the pattern must compile and every
/// `{placeholder}` of the name template must name a capture group.
pub fn validate_rule_definition(
    pattern: &str,
    name_template: &str,
    data_mapping: &BTreeMap<String, String>,
) -> Result<(), String> {
    let regex = Regex::new(pattern).map_err(|err| format!("pattern does not compile: {err}"))?;
    let groups: Vec<&str> = regex.capture_names().flatten().collect();

    for placeholder in template_placeholders(name_template) {
        if !groups.contains(&placeholder.as_str()) {
            return Err(format!(
                "template placeholder {{{placeholder}}} has no matching capture group"
            ));
        }
    }
    for group in data_mapping.keys() {
        if !groups.contains(&group.as_str()) {
            return Err(format!(
                "data mapping references unknown capture group {group}"
            ));
        }
    }
    Ok(())
}

pub fn template_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let Some(close) = rest[open..].find('}') else {
            break;
        };
        let inner = &rest[open + 1..open + close];
        if !inner.is_empty() {
            out.push(inner.to_string());
        }
        rest = &rest[open + close + 1..];
    }
    out
}

pub fn render_template(template: &str, captures: &regex::Captures<'_>) -> Option<String> {
    let mut rendered = template.to_string();
    for placeholder in template_placeholders(template) {
        let value = captures.name(&placeholder)?.as_str();
        rendered = rendered.replace(&format!("{{{placeholder}}}"), value);
    }
    Some(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validates_template_against_groups() {
        let mapping = BTreeMap::new();
        assert!(validate_rule_definition(r"(?P<n>PO-\d+)", "{n}", &mapping).is_ok());
        assert!(validate_rule_definition(r"(?P<n>PO-\d+)", "{other}", &mapping).is_err());
        assert!(validate_rule_definition(r"(?P<n>PO-[", "{n}", &mapping).is_err());
    }

    #[test]
    fn rejects_unknown_mapping_group() {
        let mut mapping = BTreeMap::new();
        mapping.insert("missing".to_string(), "po_number".to_string());
        assert!(validate_rule_definition(r"(?P<n>PO-\d+)", "{n}", &mapping).is_err());
    }

    #[test]
    fn renders_named_groups() {
        let regex = Regex::new(r"(?P<n>PO-\d{4}-\d{6})").unwrap();
        let captures = regex.captures("Purchase Order PO-2024-001234").unwrap();
        assert_eq!(
            render_template("{n}", &captures).as_deref(),
            Some("PO-2024-001234")
        );
    }
}
