use chrono::NaiveDateTime;
use diesel::prelude::*;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = object_types)]
pub struct ObjectType {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub data_schema: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = object_types)]
pub struct NewObjectType {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub data_schema: Option<String>,
    pub icon: Option<String>,
    pub color: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = events)]
pub struct Event {
    pub bucket_id: String,
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub duration: f64,
    pub data: String,
}

impl Event {
    pub fn data_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }

    /// End of the event's foreground interval.
    pub fn ended_at(&self) -> NaiveDateTime {
        self.timestamp + chrono::Duration::milliseconds((self.duration * 1000.0) as i64)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = events)]
pub struct NewEvent {
    pub bucket_id: String,
    pub id: i64,
    pub timestamp: NaiveDateTime,
    pub duration: f64,
    pub data: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = objects)]
pub struct Object {
    pub id: String,
    pub object_type: String,
    pub name: String,
    pub data: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl Object {
    pub fn data_value(&self) -> serde_json::Value {
        serde_json::from_str(&self.data).unwrap_or(serde_json::Value::Null)
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = objects)]
pub struct NewObject {
    pub id: String,
    pub object_type: String,
    pub name: String,
    pub data: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = extraction_rules)]
pub struct ExtractionRule {
    pub id: String,
    pub name: String,
    pub object_type: String,
    pub source_fields: String,
    pub pattern: String,
    pub name_template: String,
    pub data_mapping: String,
    pub enabled: bool,
    pub priority: i32,
    pub provenance: String,
    pub match_count: i32,
    pub confirm_count: i32,
    pub reject_count: i32,
    pub confidence: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl ExtractionRule {
    pub fn source_fields_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.source_fields).unwrap_or_default()
    }

    pub fn data_mapping_map(&self) -> std::collections::BTreeMap<String, String> {
        serde_json::from_str(&self.data_mapping).unwrap_or_default()
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = extraction_rules)]
pub struct NewExtractionRule {
    pub id: String,
    pub name: String,
    pub object_type: String,
    pub source_fields: String,
    pub pattern: String,
    pub name_template: String,
    pub data_mapping: String,
    pub enabled: bool,
    pub priority: i32,
    pub provenance: String,
    pub confidence: f64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = event_objects)]
pub struct EventObjectLink {
    pub bucket_id: String,
    pub event_id: i64,
    pub object_id: String,
    pub provenance: String,
    pub confidence: f64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = event_objects)]
pub struct NewEventObjectLink {
    pub bucket_id: String,
    pub event_id: i64,
    pub object_id: String,
    pub provenance: String,
    pub confidence: f64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = steps)]
pub struct Step {
    pub id: String,
    pub name: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
    pub data: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = steps)]
pub struct NewStep {
    pub id: String,
    pub name: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
    pub data: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = step_events)]
pub struct NewStepEvent {
    pub step_id: String,
    pub bucket_id: String,
    pub event_id: i64,
    pub position: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = step_objects)]
pub struct NewStepObject {
    pub step_id: String,
    pub object_id: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = workflows)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflows)]
pub struct NewWorkflow {
    pub id: String,
    pub name: String,
    pub description: String,
    pub pattern: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflow_steps)]
pub struct NewWorkflowStep {
    pub workflow_id: String,
    pub step_id: String,
    pub position: i32,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = workflow_objects)]
pub struct NewWorkflowObject {
    pub workflow_id: String,
    pub object_id: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = occurrences)]
pub struct Occurrence {
    pub id: String,
    pub workflow_id: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = occurrences)]
pub struct NewOccurrence {
    pub id: String,
    pub workflow_id: String,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = occurrence_step_instances)]
pub struct NewOccurrenceStepInstance {
    pub occurrence_id: String,
    pub step_id: String,
    pub position: i32,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = review_tasks)]
pub struct ReviewTask {
    pub id: String,
    pub bucket_id: String,
    pub event_id: i64,
    pub object_type: String,
    pub object_name: String,
    pub identifier_key: Option<String>,
    pub data: String,
    pub confidence: f64,
    pub provenance: String,
    pub status: String,
    pub reason: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = review_tasks)]
pub struct NewReviewTask {
    pub id: String,
    pub bucket_id: String,
    pub event_id: i64,
    pub object_type: String,
    pub object_name: String,
    pub identifier_key: Option<String>,
    pub data: String,
    pub confidence: f64,
    pub provenance: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = rule_corrections)]
pub struct RuleCorrection {
    pub id: String,
    pub rule_id: String,
    pub corrected_type: String,
    pub source_text: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = rule_corrections)]
pub struct NewRuleCorrection {
    pub id: String,
    pub rule_id: String,
    pub corrected_type: String,
    pub source_text: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = ontology_audit)]
pub struct OntologyAudit {
    pub id: String,
    pub rule_id: Option<String>,
    pub kind: String,
    pub detail: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = ontology_audit)]
pub struct NewOntologyAudit {
    pub id: String,
    pub rule_id: Option<String>,
    pub kind: String,
    pub detail: String,
    pub created_at: NaiveDateTime,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub payload: String,
    pub status: String,
    pub progress: f64,
    pub error: Option<String>,
    pub result: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: String,
    pub job_type: String,
    pub payload: String,
    pub status: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}
