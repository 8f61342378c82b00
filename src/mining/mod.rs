use std::collections::BTreeSet;

use chrono::NaiveDateTime;

pub mod cases;
pub mod discovery;
pub mod matching;
pub mod patterns;

/// Event view used by the case builder and miner: label and object set are
/// resolved up front so the algorithms stay free of storage concerns.
#[derive(Debug, Clone)]
pub struct MiningEvent {
    pub bucket_id: String,
    pub id: i64,
    pub start: NaiveDateTime,
    pub duration: f64,
    pub label: String,
    pub objects: BTreeSet<String>,
}

impl MiningEvent {
    pub fn end(&self) -> NaiveDateTime {
        self.start + chrono::Duration::milliseconds((self.duration * 1000.0) as i64)
    }
}

/// A labelled group of consecutive same-activity events within a case.
#[derive(Debug, Clone)]
pub struct CaseStep {
    pub label: String,
    pub event_indices: Vec<usize>,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
    pub objects: BTreeSet<String>,
}

/// A candidate process instance: a bounded, temporally-coherent sequence of
/// events with its synthesized steps.
#[derive(Debug, Clone)]
pub struct Case {
    pub event_indices: Vec<usize>,
    pub steps: Vec<CaseStep>,
    pub objects: BTreeSet<String>,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub duration: f64,
}

impl Case {
    pub fn labels(&self) -> Vec<String> {
        self.steps.iter().map(|step| step.label.clone()).collect()
    }
}
