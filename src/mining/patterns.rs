use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

pub const DEFAULT_MIN_SUPPORT: f64 = 0.1;
pub const DEFAULT_MIN_LENGTH: usize = 2;
pub const DEFAULT_MAX_LENGTH: usize = 10;
pub const DEFAULT_MIN_VARIANT_CASES: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct MinerOptions {
    pub min_support: f64,
    pub min_length: usize,
    pub max_length: usize,
    /// When false, up to two intermediate labels may be skipped per
    /// expansion step.
    pub contiguous: bool,
}

impl Default for MinerOptions {
    fn default() -> Self {
        Self {
            min_support: DEFAULT_MIN_SUPPORT,
            min_length: DEFAULT_MIN_LENGTH,
            max_length: DEFAULT_MAX_LENGTH,
            contiguous: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MinedPattern {
    pub labels: Vec<String>,
    /// Distinct cases (by index) the pattern occurs in, ascending.
    pub case_ids: Vec<usize>,
    pub support: f64,
    pub avg_duration: f64,
}

impl MinedPattern {
    pub fn case_count(&self) -> usize {
        self.case_ids.len()
    }
}

/// Positions in one case where the pattern's last label matched.
type Projection = BTreeMap<usize, Vec<usize>>;

/// PrefixSpan-style depth-first expansion over label sequences.
/// Deterministic: candidate labels are visited in lexicographic order and
/// the result is sorted by support descending, length ascending, labels
/// lexicographic.
pub fn mine_patterns(
    sequences: &[Vec<String>],
    case_durations: &[f64],
    options: &MinerOptions,
) -> Vec<MinedPattern> {
    if sequences.is_empty() {
        return Vec::new();
    }
    let min_count = ((options.min_support * sequences.len() as f64).ceil() as usize).max(1);
    let skip = if options.contiguous { 0 } else { 2 };

    // Initial projections: every position of every label.
    let mut initial: BTreeMap<&str, Projection> = BTreeMap::new();
    for (case_index, sequence) in sequences.iter().enumerate() {
        for (position, label) in sequence.iter().enumerate() {
            initial
                .entry(label.as_str())
                .or_default()
                .entry(case_index)
                .or_default()
                .push(position);
        }
    }

    let mut found = Vec::new();
    for (label, projection) in initial {
        if projection.len() < min_count {
            continue;
        }
        expand(
            sequences,
            case_durations,
            options,
            min_count,
            skip,
            vec![label.to_string()],
            &projection,
            &mut found,
        );
    }

    found.sort_by(|a: &MinedPattern, b: &MinedPattern| {
        b.case_count()
            .cmp(&a.case_count())
            .then_with(|| a.labels.len().cmp(&b.labels.len()))
            .then_with(|| a.labels.cmp(&b.labels))
    });
    found
}

#[allow(clippy::too_many_arguments)]
fn expand(
    sequences: &[Vec<String>],
    case_durations: &[f64],
    options: &MinerOptions,
    min_count: usize,
    skip: usize,
    prefix: Vec<String>,
    projection: &Projection,
    found: &mut Vec<MinedPattern>,
) {
    if prefix.len() >= options.min_length {
        let case_ids: Vec<usize> = projection.keys().copied().collect();
        let avg_duration =
            case_ids.iter().map(|&id| case_durations[id]).sum::<f64>() / case_ids.len() as f64;
        found.push(MinedPattern {
            labels: prefix.clone(),
            support: case_ids.len() as f64 / sequences.len() as f64,
            avg_duration,
            case_ids,
        });
    }
    if prefix.len() >= options.max_length {
        return;
    }

    let mut extensions: BTreeMap<&str, Projection> = BTreeMap::new();
    for (&case_index, positions) in projection {
        let sequence = &sequences[case_index];
        for &position in positions {
            for offset in 1..=skip + 1 {
                let next = position + offset;
                if next >= sequence.len() {
                    break;
                }
                let entry = extensions
                    .entry(sequence[next].as_str())
                    .or_default()
                    .entry(case_index)
                    .or_default();
                if !entry.contains(&next) {
                    entry.push(next);
                }
            }
        }
    }

    for (label, next_projection) in extensions {
        if next_projection.len() < min_count {
            continue;
        }
        let mut next_prefix = prefix.clone();
        next_prefix.push(label.to_string());
        expand(
            sequences,
            case_durations,
            options,
            min_count,
            skip,
            next_prefix,
            &next_projection,
            found,
        );
    }
}

pub fn is_subsequence(needle: &[String], haystack: &[String]) -> bool {
    let mut position = 0;
    for label in haystack {
        if position < needle.len() && needle[position] == *label {
            position += 1;
        }
    }
    position == needle.len()
}

/// A variant is a pattern observed in at least `min_cases` distinct cases
/// that is not a strict subsequence of a higher-support pattern with equal
/// coverage.
pub fn variants(patterns: &[MinedPattern], min_cases: usize) -> Vec<MinedPattern> {
    let qualified: Vec<&MinedPattern> = patterns
        .iter()
        .filter(|pattern| pattern.case_count() >= min_cases)
        .collect();

    let mut kept = Vec::new();
    for pattern in &qualified {
        let covered: BTreeSet<usize> = pattern.case_ids.iter().copied().collect();
        let absorbed = qualified.iter().any(|other| {
            other.labels.len() > pattern.labels.len()
                && is_subsequence(&pattern.labels, &other.labels)
                && other.case_ids.iter().copied().collect::<BTreeSet<_>>() == covered
        });
        if !absorbed {
            kept.push((*pattern).clone());
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    fn scenario_cases() -> (Vec<Vec<String>>, Vec<f64>) {
        // 8 of [A,B,C], 3 of [A,B], 1 of [X,Y]
        let mut sequences = Vec::new();
        for _ in 0..8 {
            sequences.push(seq(&["A", "B", "C"]));
        }
        for _ in 0..3 {
            sequences.push(seq(&["A", "B"]));
        }
        sequences.push(seq(&["X", "Y"]));
        let durations = vec![60.0; sequences.len()];
        (sequences, durations)
    }

    #[test]
    fn mines_frequent_patterns_in_support_order() {
        let (sequences, durations) = scenario_cases();
        let options = MinerOptions {
            min_support: 0.5,
            min_length: 2,
            max_length: 10,
            contiguous: true,
        };
        let patterns = mine_patterns(&sequences, &durations, &options);
        // [B,C] rides along with identical coverage and is absorbed
        let patterns = variants(&patterns, 1);
        let labels: Vec<Vec<String>> = patterns.iter().map(|p| p.labels.clone()).collect();
        assert_eq!(labels, vec![seq(&["A", "B"]), seq(&["A", "B", "C"])]);
        assert_eq!(patterns[0].case_count(), 11);
        assert_eq!(patterns[1].case_count(), 8);
        assert!((patterns[0].support - 11.0 / 12.0).abs() < 1e-9);
    }

    #[test]
    fn mining_is_deterministic() {
        let (sequences, durations) = scenario_cases();
        let options = MinerOptions {
            min_support: 0.1,
            ..MinerOptions::default()
        };
        let first = mine_patterns(&sequences, &durations, &options);
        let second = mine_patterns(&sequences, &durations, &options);
        let render = |patterns: &[MinedPattern]| {
            patterns
                .iter()
                .map(|p| format!("{:?}:{:?}", p.labels, p.case_ids))
                .collect::<Vec<_>>()
        };
        assert_eq!(render(&first), render(&second));
    }

    #[test]
    fn support_counts_distinct_cases_exactly() {
        let sequences = vec![seq(&["A", "B", "A", "B"]), seq(&["A", "B"]), seq(&["C"])];
        let durations = vec![10.0, 10.0, 10.0];
        let options = MinerOptions {
            min_support: 0.5,
            min_length: 2,
            max_length: 4,
            contiguous: true,
        };
        let patterns = mine_patterns(&sequences, &durations, &options);
        let ab = patterns
            .iter()
            .find(|p| p.labels == seq(&["A", "B"]))
            .unwrap();
        // repeated occurrences inside one case count once
        assert_eq!(ab.case_ids, vec![0, 1]);
    }

    #[test]
    fn non_contiguous_mode_skips_up_to_two_labels() {
        let sequences = vec![seq(&["A", "X", "Y", "B"]), seq(&["A", "B"])];
        let durations = vec![10.0, 10.0];
        let contiguous = MinerOptions {
            min_support: 1.0,
            min_length: 2,
            max_length: 4,
            contiguous: true,
        };
        assert!(mine_patterns(&sequences, &durations, &contiguous)
            .iter()
            .all(|p| p.labels != seq(&["A", "B"])));

        let relaxed = MinerOptions {
            contiguous: false,
            ..contiguous
        };
        assert!(mine_patterns(&sequences, &durations, &relaxed)
            .iter()
            .any(|p| p.labels == seq(&["A", "B"])));
    }

    #[test]
    fn variant_filter_drops_absorbed_subsequences() {
        let (sequences, durations) = scenario_cases();
        let options = MinerOptions {
            min_support: 0.25,
            min_length: 2,
            max_length: 10,
            contiguous: true,
        };
        let patterns = mine_patterns(&sequences, &durations, &options);
        let kept = variants(&patterns, 3);
        // [A,B] covers 11 cases, [A,B,C] covers 8: different coverage, both kept
        assert!(kept.iter().any(|p| p.labels == seq(&["A", "B"])));
        assert!(kept.iter().any(|p| p.labels == seq(&["A", "B", "C"])));

        // With identical coverage only the longer survives.
        let sequences = vec![
            seq(&["A", "B", "C"]),
            seq(&["A", "B", "C"]),
            seq(&["A", "B", "C"]),
        ];
        let durations = vec![10.0; 3];
        let patterns = mine_patterns(&sequences, &durations, &options);
        let kept = variants(&patterns, 3);
        assert!(kept.iter().any(|p| p.labels == seq(&["A", "B", "C"])));
        assert!(!kept.iter().any(|p| p.labels == seq(&["A", "B"])));
    }
}
