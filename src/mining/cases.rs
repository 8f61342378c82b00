use std::collections::BTreeSet;

use chrono::NaiveDateTime;
use serde_json::Value;

use super::{Case, CaseStep, MiningEvent};

pub const DEFAULT_MAX_GAP_SECONDS: f64 = 120.0;
pub const AFK_CUT_SECONDS: f64 = 60.0;
const TITLE_LABEL_MAX: usize = 64;

/// Activity label of an event: `app`, else the url host, else the title
/// truncated to 64 characters, else "unknown".
pub fn activity_label(data: &Value) -> String {
    if let Some(app) = data.get("app").and_then(Value::as_str) {
        if !app.is_empty() {
            return app.to_string();
        }
    }
    if let Some(url) = data.get("url").and_then(Value::as_str) {
        if let Ok(parsed) = url::Url::parse(url) {
            if let Some(host) = parsed.host_str() {
                return host.to_string();
            }
        }
    }
    if let Some(title) = data.get("title").and_then(Value::as_str) {
        if !title.is_empty() {
            return title.chars().take(TITLE_LABEL_MAX).collect();
        }
    }
    "unknown".to_string()
}

fn seconds_between(earlier: NaiveDateTime, later: NaiveDateTime) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

/// Partitions timestamp-ordered events into gap-bounded runs of indices.
/// A boundary is cut iff the idle gap exceeds `max_gap_seconds`, or an AFK
/// interval of at least 60 s falls between two consecutive events.
pub fn gap_partition(
    events: &[MiningEvent],
    max_gap_seconds: f64,
    afk_intervals: &[(NaiveDateTime, NaiveDateTime)],
) -> Vec<Vec<usize>> {
    let mut partitions = Vec::new();
    let mut current: Vec<usize> = Vec::new();

    for (index, event) in events.iter().enumerate() {
        if let Some(&previous_index) = current.last() {
            let previous = &events[previous_index];
            let gap = seconds_between(previous.end(), event.start);
            let afk_cut = afk_intervals.iter().any(|(afk_start, afk_end)| {
                seconds_between(*afk_start, *afk_end) >= AFK_CUT_SECONDS
                    && *afk_end > previous.end()
                    && *afk_start < event.start
            });
            if gap > max_gap_seconds || afk_cut {
                partitions.push(std::mem::take(&mut current));
            }
        }
        current.push(index);
    }
    if !current.is_empty() {
        partitions.push(current);
    }
    partitions
}

/// Object-coherence refinement: within a gap case, each maximal consecutive
/// run of events sharing an object id forms a sub-case. Runs shorter than
/// two events are dropped. The output deliberately overlaps the gap case; a
/// run covering the whole case yields a sub-case identical to it.
pub fn coherent_subcases(case: &[usize], events: &[MiningEvent]) -> Vec<Vec<usize>> {
    let mut object_ids: BTreeSet<&String> = BTreeSet::new();
    for &index in case {
        object_ids.extend(events[index].objects.iter());
    }

    let mut spans: BTreeSet<(usize, usize)> = BTreeSet::new();
    for object_id in object_ids {
        let mut run_start: Option<usize> = None;
        for (offset, &index) in case.iter().enumerate() {
            if events[index].objects.contains(object_id) {
                run_start.get_or_insert(offset);
            } else if let Some(start) = run_start.take() {
                if offset - start >= 2 {
                    spans.insert((start, offset - 1));
                }
            }
        }
        if let Some(start) = run_start {
            if case.len() - start >= 2 {
                spans.insert((start, case.len() - 1));
            }
        }
    }

    spans
        .into_iter()
        .map(|(start, end)| case[start..=end].to_vec())
        .collect()
}

/// Collapses consecutive same-label events into steps. A step's duration is
/// the sum of its event durations (foreground time, per the watcher
/// convention), not end minus start.
pub fn synthesize_steps(indices: &[usize], events: &[MiningEvent]) -> Vec<CaseStep> {
    let mut steps: Vec<CaseStep> = Vec::new();
    for &index in indices {
        let event = &events[index];
        match steps.last_mut() {
            Some(step) if step.label == event.label => {
                step.event_indices.push(index);
                step.ended_at = event.end();
                step.duration += event.duration;
                step.objects.extend(event.objects.iter().cloned());
            }
            _ => steps.push(CaseStep {
                label: event.label.clone(),
                event_indices: vec![index],
                started_at: event.start,
                ended_at: event.end(),
                duration: event.duration,
                objects: event.objects.clone(),
            }),
        }
    }
    steps
}

fn case_from_indices(indices: Vec<usize>, events: &[MiningEvent]) -> Case {
    let steps = synthesize_steps(&indices, events);
    let objects = indices
        .iter()
        .flat_map(|&index| events[index].objects.iter().cloned())
        .collect();
    let started_at = events[indices[0]].start;
    let ended_at = events[*indices.last().expect("non-empty case")].end();
    let duration = indices.iter().map(|&index| events[index].duration).sum();
    Case {
        event_indices: indices,
        steps,
        objects,
        started_at,
        ended_at,
        duration,
    }
}

/// Builds the full case set for a window: gap cases in stream order, each
/// followed by its object-coherent sub-cases.
pub fn build_cases(
    events: &[MiningEvent],
    max_gap_seconds: f64,
    afk_intervals: &[(NaiveDateTime, NaiveDateTime)],
) -> Vec<Case> {
    let mut cases = Vec::new();
    for partition in gap_partition(events, max_gap_seconds, afk_intervals) {
        let subcases = coherent_subcases(&partition, events);
        cases.push(case_from_indices(partition, events));
        for subcase in subcases {
            cases.push(case_from_indices(subcase, events));
        }
    }
    cases
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use serde_json::json;

    fn at(seconds: i64) -> NaiveDateTime {
        DateTime::<Utc>::from_timestamp(1_704_537_000 + seconds, 0)
            .unwrap()
            .naive_utc()
    }

    fn event(id: i64, start_seconds: i64, duration: f64, label: &str) -> MiningEvent {
        MiningEvent {
            bucket_id: "win".to_string(),
            id,
            start: at(start_seconds),
            duration,
            label: label.to_string(),
            objects: BTreeSet::new(),
        }
    }

    #[test]
    fn labels_fall_back_in_order() {
        assert_eq!(activity_label(&json!({"app": "erp"})), "erp");
        assert_eq!(
            activity_label(&json!({"url": "https://shop.example.com/orders/1"})),
            "shop.example.com"
        );
        assert_eq!(activity_label(&json!({"title": "Inbox"})), "Inbox");
        assert_eq!(activity_label(&json!({})), "unknown");
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = "x".repeat(200);
        assert_eq!(activity_label(&json!({ "title": title })).len(), 64);
    }

    #[test]
    fn splits_on_gaps_above_threshold() {
        // t = 0, 60, 119, 400, 460; all duration 5
        let events = vec![
            event(1, 0, 5.0, "erp"),
            event(2, 60, 5.0, "erp"),
            event(3, 119, 5.0, "erp"),
            event(4, 400, 5.0, "erp"),
            event(5, 460, 5.0, "erp"),
        ];
        let partitions = gap_partition(&events, 120.0, &[]);
        assert_eq!(partitions, vec![vec![0, 1, 2], vec![3, 4]]);
    }

    #[test]
    fn partition_concatenation_reproduces_input() {
        let events: Vec<MiningEvent> = (0..40)
            .map(|i| event(i, i * 37, if i % 5 == 0 { 0.0 } else { 3.0 }, "app"))
            .collect();
        for max_gap in [10.0, 30.0, 120.0] {
            let partitions = gap_partition(&events, max_gap, &[]);
            let flattened: Vec<usize> = partitions.iter().flatten().copied().collect();
            assert_eq!(flattened, (0..events.len()).collect::<Vec<_>>());
            for window in partitions.windows(2) {
                let last = &events[*window[0].last().unwrap()];
                let first = &events[window[1][0]];
                assert!(seconds_between(last.end(), first.start) > max_gap);
            }
            for partition in &partitions {
                for pair in partition.windows(2) {
                    let gap = seconds_between(events[pair[0]].end(), events[pair[1]].start);
                    assert!(gap <= max_gap);
                }
            }
        }
    }

    #[test]
    fn afk_interval_cuts_case() {
        let events = vec![
            event(1, 0, 5.0, "erp"),
            event(2, 100, 5.0, "erp"),
        ];
        let afk = vec![(at(10), at(90))];
        let partitions = gap_partition(&events, 120.0, &afk);
        assert_eq!(partitions.len(), 2);

        let short_afk = vec![(at(10), at(40))];
        let partitions = gap_partition(&events, 120.0, &short_afk);
        assert_eq!(partitions.len(), 1);
    }

    #[test]
    fn consecutive_same_label_events_collapse_into_one_step() {
        let events = vec![
            event(1, 0, 5.0, "erp"),
            event(2, 10, 5.0, "erp"),
            event(3, 20, 5.0, "mail"),
            event(4, 30, 5.0, "erp"),
        ];
        let steps = synthesize_steps(&[0, 1, 2, 3], &events);
        let labels: Vec<&str> = steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["erp", "mail", "erp"]);
        assert_eq!(steps[0].duration, 10.0);
        assert_eq!(steps[0].event_indices, vec![0, 1]);
    }

    #[test]
    fn subcases_require_shared_object_and_two_events() {
        let mut events = vec![
            event(1, 0, 5.0, "erp"),
            event(2, 10, 5.0, "mail"),
            event(3, 20, 5.0, "erp"),
            event(4, 30, 5.0, "browser"),
        ];
        events[0].objects.insert("po-1".to_string());
        events[1].objects.insert("po-1".to_string());
        events[3].objects.insert("po-2".to_string());

        let subcases = coherent_subcases(&[0, 1, 2, 3], &events);
        assert_eq!(subcases, vec![vec![0, 1]]);
    }

    #[test]
    fn full_span_object_run_duplicates_the_gap_case() {
        let mut events = vec![event(1, 0, 5.0, "erp"), event(2, 10, 5.0, "erp")];
        events[0].objects.insert("po-1".to_string());
        events[1].objects.insert("po-1".to_string());

        let subcases = coherent_subcases(&[0, 1], &events);
        assert_eq!(subcases, vec![vec![0, 1]]);

        // one gap case plus the identical object-coherent sub-case
        let cases = build_cases(&events, 120.0, &[]);
        assert_eq!(cases.len(), 2);
        assert_eq!(cases[0].event_indices, cases[1].event_indices);
        assert!(cases[1].objects.contains("po-1"));
    }

    #[test]
    fn zero_duration_events_are_kept() {
        let events = vec![event(1, 0, 0.0, "erp"), event(2, 1, 0.0, "erp")];
        let cases = build_cases(&events, 120.0, &[]);
        assert_eq!(cases.len(), 1);
        assert_eq!(cases[0].event_indices.len(), 2);
        assert_eq!(cases[0].duration, 0.0);
    }
}
