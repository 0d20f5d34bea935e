//! Signed 4-tuple patterns in the ablator → reader effect graph
//!
//! The effects form a bipartite graph from ablator features to reader features
//! with signed edge weights. A pattern `(A, B, C, D)` is two distinct ablators
//! `A` and `C` that both excite reader `B`, while `A` excites reader `D` and
//! `C` inhibits it.

use std::collections::{BTreeMap, BTreeSet};

/// A matched `(A, B, C, D)` pattern: ablators `A`, `C`; readers `B`, `D`
pub type FourTuple = (usize, usize, usize, usize);

struct Neighbors {
    positive: BTreeSet<usize>,
    negative: BTreeSet<usize>,
}

fn neighbors(row: &[f32]) -> Neighbors {
    let mut positive = BTreeSet::new();
    let mut negative = BTreeSet::new();
    for (reader, &w) in row.iter().enumerate() {
        if w > 0.0 {
            positive.insert(reader);
        } else if w < 0.0 {
            negative.insert(reader);
        }
    }
    Neighbors { positive, negative }
}

/// All 4-tuples with `A != C`, `A→B > 0`, `C→B > 0`, `A→D > 0`, `C→D < 0`, `B != D`.
///
/// `effects` maps each ablator to its effect on every reader feature. Output is
/// ordered by `A`, then `C`, then `B`, then `D`.
pub fn find_4tuples(effects: &BTreeMap<usize, Vec<f32>>) -> Vec<FourTuple> {
    let graph: BTreeMap<usize, Neighbors> = effects
        .iter()
        .map(|(&ablator, row)| (ablator, neighbors(row)))
        .collect();

    let mut results = Vec::new();
    for (&a, a_edges) in &graph {
        for (&c, c_edges) in &graph {
            if a == c {
                continue;
            }
            let common_b: Vec<usize> = a_edges
                .positive
                .intersection(&c_edges.positive)
                .copied()
                .collect();
            let potential_d: Vec<usize> = a_edges
                .positive
                .intersection(&c_edges.negative)
                .copied()
                .collect();
            for &b in &common_b {
                for &d in &potential_d {
                    if b != d {
                        results.push((a, b, c, d));
                    }
                }
            }
        }
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_pattern() {
        let mut effects = BTreeMap::new();
        // Readers: 0 = B, 1 = D, 2 = unrelated
        effects.insert(10, vec![1.0, 0.5, 0.0]);
        effects.insert(20, vec![2.0, -0.5, 0.0]);
        assert_eq!(find_4tuples(&effects), vec![(10, 0, 20, 1)]);
    }

    #[test]
    fn test_zero_weights_are_not_edges() {
        let mut effects = BTreeMap::new();
        effects.insert(0, vec![1.0, 0.0]);
        effects.insert(1, vec![1.0, 0.0]);
        assert!(find_4tuples(&effects).is_empty());
    }

    #[test]
    fn test_b_and_d_must_differ() {
        let mut effects = BTreeMap::new();
        effects.insert(0, vec![1.0, 1.0, 1.0]);
        effects.insert(1, vec![1.0, 1.0, -1.0]);
        let tuples = find_4tuples(&effects);
        // A=0, C=1: B in {0, 1}, D in {2}
        assert_eq!(tuples, vec![(0, 0, 1, 2), (0, 1, 1, 2)]);
        assert!(tuples.iter().all(|&(_, b, _, d)| b != d));
    }

    #[test]
    fn test_single_ablator() {
        let mut effects = BTreeMap::new();
        effects.insert(3, vec![1.0, -1.0]);
        assert!(find_4tuples(&effects).is_empty());
    }
}
