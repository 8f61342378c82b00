pub const DEFAULT_MAX_GAP_INSIDE_WORKFLOW: usize = 1;

/// One accepted match: an inclusive span of case-step indices, including any
/// skipped steps between matched pattern positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternMatch {
    pub first_step: usize,
    pub last_step: usize,
}

impl PatternMatch {
    pub fn step_range(&self) -> std::ops::RangeInclusive<usize> {
        self.first_step..=self.last_step
    }
}

/// Scans a case's label sequence for the pattern, allowing up to `max_gap`
/// non-matching labels between consecutive pattern positions. Matches are
/// selected greedily (earliest first) and kept only when disjoint on steps.
pub fn match_pattern(
    case_labels: &[String],
    pattern: &[String],
    max_gap: usize,
) -> Vec<PatternMatch> {
    if pattern.is_empty() || case_labels.len() < pattern.len() {
        return Vec::new();
    }

    let mut matches = Vec::new();
    let mut scan_from = 0;
    while scan_from < case_labels.len() {
        match try_match_at(case_labels, pattern, max_gap, scan_from) {
            Some(found) => {
                scan_from = found.last_step + 1;
                matches.push(found);
            }
            None => scan_from += 1,
        }
    }
    matches
}

fn try_match_at(
    case_labels: &[String],
    pattern: &[String],
    max_gap: usize,
    start: usize,
) -> Option<PatternMatch> {
    if case_labels[start] != pattern[0] {
        return None;
    }
    let mut position = start;
    for expected in &pattern[1..] {
        let mut next = None;
        for candidate in position + 1..=(position + 1 + max_gap).min(case_labels.len() - 1) {
            if case_labels[candidate] == *expected {
                next = Some(candidate);
                break;
            }
        }
        position = next?;
    }
    Some(PatternMatch {
        first_step: start,
        last_step: position,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn single_gap_is_spanned() {
        let matches = match_pattern(&seq(&["A", "B", "Z", "C"]), &seq(&["A", "B", "C"]), 1);
        assert_eq!(
            matches,
            vec![PatternMatch {
                first_step: 0,
                last_step: 3
            }]
        );
    }

    #[test]
    fn two_consecutive_gaps_fail() {
        let matches = match_pattern(&seq(&["A", "B", "Z", "Z", "C"]), &seq(&["A", "B", "C"]), 1);
        assert!(matches.is_empty());
    }

    #[test]
    fn exact_match_without_gaps() {
        let matches = match_pattern(&seq(&["A", "B", "C"]), &seq(&["A", "B", "C"]), 0);
        assert_eq!(
            matches,
            vec![PatternMatch {
                first_step: 0,
                last_step: 2
            }]
        );
    }

    #[test]
    fn overlapping_candidates_resolve_to_disjoint_earliest_matches() {
        let labels = seq(&["A", "B", "A", "B", "A", "B"]);
        let matches = match_pattern(&labels, &seq(&["A", "B"]), 0);
        assert_eq!(matches.len(), 3);
        assert_eq!(matches[0].first_step, 0);
        assert_eq!(matches[1].first_step, 2);
        assert_eq!(matches[2].first_step, 4);
    }

    #[test]
    fn repeated_prefix_retries_from_next_position() {
        // first A cannot complete; the match anchored at index 1 can
        let labels = seq(&["A", "Z", "A", "B"]);
        let matches = match_pattern(&labels, &seq(&["A", "B"]), 0);
        assert_eq!(
            matches,
            vec![PatternMatch {
                first_step: 2,
                last_step: 3
            }]
        );
    }
}
