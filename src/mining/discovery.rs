use super::patterns::MinedPattern;

pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.8;

/// Levenshtein distance over label sequences.
fn edit_distance(a: &[String], b: &[String]) -> usize {
    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, label_a) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, label_b) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(label_a != label_b);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

pub fn normalized_similarity(a: &[String], b: &[String]) -> f64 {
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }
    1.0 - edit_distance(a, b) as f64 / longest as f64
}

fn longest_common_subsequence(a: &[String], b: &[String]) -> Vec<String> {
    let mut table = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in 0..a.len() {
        for j in 0..b.len() {
            table[i + 1][j + 1] = if a[i] == b[j] {
                table[i][j] + 1
            } else {
                table[i][j + 1].max(table[i + 1][j])
            };
        }
    }
    let mut sequence = Vec::with_capacity(table[a.len()][b.len()]);
    let (mut i, mut j) = (a.len(), b.len());
    while i > 0 && j > 0 {
        if a[i - 1] == b[j - 1] {
            sequence.push(a[i - 1].clone());
            i -= 1;
            j -= 1;
        } else if table[i - 1][j] >= table[i][j - 1] {
            i -= 1;
        } else {
            j -= 1;
        }
    }
    sequence.reverse();
    sequence
}

/// A candidate process produced by clustering variants.
#[derive(Debug, Clone)]
pub struct DiscoveredWorkflow {
    pub name: String,
    pub pattern: Vec<String>,
    /// Indices into the variant list this cluster absorbed.
    pub member_indices: Vec<usize>,
}

/// Single-link agglomerative clustering at the given normalised-similarity
/// threshold, canonical pattern per cluster via the longest common
/// subsequence of its members (falling back to the highest-support member
/// when the LCS degenerates below two labels). Clusters are ordered by
/// best-member support descending, then canonical pattern lexicographically.
pub fn discover_workflows(
    variants: &[MinedPattern],
    similarity_threshold: f64,
) -> Vec<DiscoveredWorkflow> {
    if variants.is_empty() {
        return Vec::new();
    }

    // Union-find over variant indices.
    let mut parent: Vec<usize> = (0..variants.len()).collect();
    fn root(parent: &mut Vec<usize>, mut index: usize) -> usize {
        while parent[index] != index {
            parent[index] = parent[parent[index]];
            index = parent[index];
        }
        index
    }
    for i in 0..variants.len() {
        for j in i + 1..variants.len() {
            if normalized_similarity(&variants[i].labels, &variants[j].labels)
                >= similarity_threshold
            {
                let (a, b) = (root(&mut parent, i), root(&mut parent, j));
                if a != b {
                    parent[b.max(a)] = b.min(a);
                }
            }
        }
    }

    let mut clusters: std::collections::BTreeMap<usize, Vec<usize>> =
        std::collections::BTreeMap::new();
    for index in 0..variants.len() {
        let cluster_root = root(&mut parent, index);
        clusters.entry(cluster_root).or_default().push(index);
    }

    let mut discovered: Vec<(usize, Vec<String>, Vec<usize>)> = Vec::new();
    for members in clusters.into_values() {
        let best = members
            .iter()
            .copied()
            .max_by(|&a, &b| {
                variants[a]
                    .case_count()
                    .cmp(&variants[b].case_count())
                    .then_with(|| variants[b].labels.cmp(&variants[a].labels))
            })
            .expect("cluster is non-empty");

        let mut canonical = variants[best].labels.clone();
        for &member in &members {
            if member != best {
                canonical = longest_common_subsequence(&canonical, &variants[member].labels);
            }
        }
        if canonical.len() < 2 {
            canonical = variants[best].labels.clone();
        }
        discovered.push((variants[best].case_count(), canonical, members));
    }

    discovered.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    discovered
        .into_iter()
        .enumerate()
        .map(|(index, (_, pattern, member_indices))| DiscoveredWorkflow {
            name: format!("process-{index}"),
            pattern,
            member_indices,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(labels: &[&str]) -> Vec<String> {
        labels.iter().map(|s| s.to_string()).collect()
    }

    fn variant(labels: &[&str], cases: &[usize]) -> MinedPattern {
        MinedPattern {
            labels: seq(labels),
            case_ids: cases.to_vec(),
            support: 0.5,
            avg_duration: 60.0,
        }
    }

    #[test]
    fn similarity_is_one_for_identical_sequences() {
        let a = seq(&["A", "B", "C"]);
        assert!((normalized_similarity(&a, &a) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_decreases_with_edits() {
        let a = seq(&["A", "B", "C", "D", "E"]);
        let b = seq(&["A", "B", "C", "D", "X"]);
        assert!((normalized_similarity(&a, &b) - 0.8).abs() < 1e-9);
        let c = seq(&["X", "Y"]);
        assert!(normalized_similarity(&a, &c) < 0.2);
    }

    #[test]
    fn clusters_similar_variants_into_one_workflow() {
        let variants = vec![
            variant(&["A", "B", "C", "D", "E"], &[0, 1, 2, 3]),
            variant(&["A", "B", "C", "D", "X"], &[4, 5, 6]),
            variant(&["Q", "R"], &[7, 8, 9]),
        ];
        let discovered = discover_workflows(&variants, 0.8);
        assert_eq!(discovered.len(), 2);
        assert_eq!(discovered[0].name, "process-0");
        assert_eq!(discovered[0].pattern, seq(&["A", "B", "C", "D"]));
        assert_eq!(discovered[0].member_indices, vec![0, 1]);
        assert_eq!(discovered[1].pattern, seq(&["Q", "R"]));
    }

    #[test]
    fn cluster_order_breaks_support_ties_lexicographically() {
        let variants = vec![
            variant(&["M", "N"], &[0, 1, 2]),
            variant(&["A", "B"], &[3, 4, 5]),
        ];
        let discovered = discover_workflows(&variants, 0.9);
        assert_eq!(discovered[0].pattern, seq(&["A", "B"]));
        assert_eq!(discovered[1].pattern, seq(&["M", "N"]));
    }
}
