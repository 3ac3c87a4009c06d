//! Routing divergence between two conditions
//!
//! For each layer, the per-expert activation probability of condition A
//! minus that of condition B:
//!
//! ```text
//! RD[l, e] = count_A[l, e] / tokens_A[l] - count_B[l, e] / tokens_B[l]
//! ```
//!
//! Each token votes for exactly `k` experts, so each probability vector
//! should sum to `k`. Deviations are logged and kept on the table, but do
//! not abort the computation.
//!
//! ## Ranking
//!
//! Positive rankings keep strictly positive values sorted descending,
//! negative rankings strictly negative values sorted ascending. Equal
//! values are ordered by layer index, then expert index, both ascending.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use ndarray::Array1;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::accumulator::ConditionAccumulator;
use crate::routing::LayerId;

/// Relative tolerance of the normalization check
pub const SUM_RTOL: f64 = 1e-3;
/// Absolute tolerance of the normalization check
pub const SUM_ATOL: f64 = 1e-3;

/// Which condition a normalization warning refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

/// A probability vector whose sum deviates from `k`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationWarning {
    pub layer: LayerId,
    pub side: Side,
    pub sum: f64,
    pub expected: f64,
}

/// Per-layer signed probability differences
#[derive(Debug, Clone, Default)]
pub struct DivergenceTable {
    layers: BTreeMap<LayerId, Array1<f64>>,
    warnings: Vec<NormalizationWarning>,
}

impl DivergenceTable {
    pub fn from_layers(layers: BTreeMap<LayerId, Array1<f64>>) -> Self {
        Self {
            layers,
            warnings: Vec::new(),
        }
    }

    pub fn get(&self, layer: LayerId) -> Option<&Array1<f64>> {
        self.layers.get(&layer)
    }

    /// Layers with their divergence vectors, ascending layer order
    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &Array1<f64>)> {
        self.layers.iter().map(|(&l, v)| (l, v))
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn warnings(&self) -> &[NormalizationWarning] {
        &self.warnings
    }

    /// Every `(layer, expert, value)` triple
    pub fn scores(&self) -> impl Iterator<Item = ExpertScore> + '_ {
        self.iter().flat_map(|(layer, rd)| {
            rd.iter().enumerate().map(move |(expert, &value)| ExpertScore {
                layer,
                expert,
                value,
            })
        })
    }
}

/// `numpy.isclose` semantics: `|a - b| <= atol + rtol * |b|`
fn is_close(a: f64, b: f64) -> bool {
    (a - b).abs() <= SUM_ATOL + SUM_RTOL * b.abs()
}

fn probabilities(counts: &Array1<u64>, tokens: u64) -> Array1<f64> {
    counts.mapv(|c| c as f64 / tokens as f64)
}

/// Divergence of condition `a` relative to condition `b`.
///
/// Only layers present in both accumulators with non-zero token totals on
/// both sides are included.
pub fn compute_divergence(
    a: &ConditionAccumulator,
    b: &ConditionAccumulator,
) -> Result<DivergenceTable> {
    anyhow::ensure!(
        a.n_experts() == b.n_experts() && a.top_k() == b.top_k(),
        "Conditions disagree on routing shape: top-{}/{} vs top-{}/{}",
        a.top_k(),
        a.n_experts(),
        b.top_k(),
        b.n_experts()
    );

    let expected = a.top_k() as f64;
    let mut table = DivergenceTable::default();

    for layer in a.layers() {
        let (Some(hist_a), Some(hist_b)) = (a.histogram(layer), b.histogram(layer)) else {
            continue;
        };
        let (tokens_a, tokens_b) = (a.tokens(layer), b.tokens(layer));
        if tokens_a == 0 || tokens_b == 0 {
            continue;
        }

        let p_a = probabilities(hist_a, tokens_a);
        let p_b = probabilities(hist_b, tokens_b);

        for (side, p) in [(Side::A, &p_a), (Side::B, &p_b)] {
            let sum = p.sum();
            if !is_close(sum, expected) {
                warn!("p_{side:?} sum != {expected} for layer {layer}: {sum:.4}");
                table.warnings.push(NormalizationWarning {
                    layer,
                    side,
                    sum,
                    expected,
                });
            }
        }

        table.layers.insert(layer, &p_a - &p_b);
    }

    Ok(table)
}

/// Ranking direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Experts more active under condition A
    Positive,
    /// Experts more active under condition B
    Negative,
}

impl Direction {
    fn admits(self, value: f64) -> bool {
        match self {
            Direction::Positive => value > 0.0,
            Direction::Negative => value < 0.0,
        }
    }

    /// Rank order with the fixed tie-break on layer, then expert
    fn compare(self, a: &ExpertScore, b: &ExpertScore) -> Ordering {
        let by_value = match self {
            Direction::Positive => b.value.total_cmp(&a.value),
            Direction::Negative => a.value.total_cmp(&b.value),
        };
        by_value
            .then_with(|| a.layer.cmp(&b.layer))
            .then_with(|| a.expert.cmp(&b.expert))
    }
}

/// One expert's divergence
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExpertScore {
    pub layer: LayerId,
    pub expert: usize,
    pub value: f64,
}

/// Sort `scores` in rank order for `direction` and keep the first `n`
pub fn rank_scores(
    scores: impl IntoIterator<Item = ExpertScore>,
    direction: Direction,
    n: usize,
) -> Vec<ExpertScore> {
    let mut ranked: Vec<ExpertScore> = scores
        .into_iter()
        .filter(|s| direction.admits(s.value))
        .collect();
    ranked.sort_by(|a, b| direction.compare(a, b));
    ranked.truncate(n);
    ranked
}

/// Top `n` experts of each layer, layers in ascending order.
///
/// A layer with no admissible expert maps to an empty list.
pub fn rank_per_layer(
    table: &DivergenceTable,
    direction: Direction,
    n: usize,
) -> Vec<(LayerId, Vec<ExpertScore>)> {
    table
        .iter()
        .map(|(layer, rd)| {
            let scores = rd.iter().enumerate().map(|(expert, &value)| ExpertScore {
                layer,
                expert,
                value,
            });
            (layer, rank_scores(scores, direction, n))
        })
        .collect()
}

/// Top `n` experts across all layers
pub fn rank_global(table: &DivergenceTable, direction: Direction, n: usize) -> Vec<ExpertScore> {
    rank_scores(table.scores(), direction, n)
}

/// Per-layer ranking of one layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRanking {
    pub layer: LayerId,
    pub experts: Vec<ExpertScore>,
}

/// Positive and negative rankings, per layer and global
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub per_layer_n: usize,
    pub global_n: usize,
    pub per_layer_positive: Vec<LayerRanking>,
    pub per_layer_negative: Vec<LayerRanking>,
    pub global_positive: Vec<ExpertScore>,
    pub global_negative: Vec<ExpertScore>,
    pub warnings: Vec<NormalizationWarning>,
}

impl DivergenceReport {
    pub fn build(table: &DivergenceTable, per_layer_n: usize, global_n: usize) -> Self {
        let per_layer = |direction: Direction| -> Vec<LayerRanking> {
            rank_per_layer(table, direction, per_layer_n)
                .into_iter()
                .map(|(layer, experts)| LayerRanking { layer, experts })
                .collect()
        };

        Self {
            per_layer_n,
            global_n,
            per_layer_positive: per_layer(Direction::Positive),
            per_layer_negative: per_layer(Direction::Negative),
            global_positive: rank_global(table, Direction::Positive, global_n),
            global_negative: rank_global(table, Direction::Negative, global_n),
            warnings: table.warnings().to_vec(),
        }
    }
}

fn write_per_layer(
    f: &mut fmt::Formatter<'_>,
    rankings: &[LayerRanking],
    label: &str,
) -> fmt::Result {
    for ranking in rankings {
        if ranking.experts.is_empty() {
            writeln!(f, "Layer {}: no {label} RD experts", ranking.layer)?;
            continue;
        }
        let formatted: Vec<String> = ranking
            .experts
            .iter()
            .map(|s| format!("e{}: {:.6}", s.expert, s.value))
            .collect();
        writeln!(f, "Layer {}: {}", ranking.layer, formatted.join(", "))?;
    }
    Ok(())
}

fn write_global(f: &mut fmt::Formatter<'_>, scores: &[ExpertScore]) -> fmt::Result {
    for (rank, s) in scores.iter().enumerate() {
        writeln!(
            f,
            "{:02}. Layer {} e{}: {:.6}",
            rank + 1,
            s.layer,
            s.expert,
            s.value
        )?;
    }
    Ok(())
}

impl fmt::Display for DivergenceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (per_layer_n, global_n) = (self.per_layer_n, self.global_n);
        writeln!(f, "Top {per_layer_n} positive RD experts per layer")?;
        write_per_layer(f, &self.per_layer_positive, "positive")?;
        writeln!(f)?;
        writeln!(f, "Top {global_n} positive RD experts overall")?;
        write_global(f, &self.global_positive)?;
        writeln!(f)?;
        writeln!(f, "Top {per_layer_n} negative RD experts per layer")?;
        write_per_layer(f, &self.per_layer_negative, "negative")?;
        writeln!(f)?;
        writeln!(f, "Top {global_n} negative RD experts overall")?;
        write_global(f, &self.global_negative)?;

        if !self.warnings.is_empty() {
            writeln!(f)?;
            for w in &self.warnings {
                writeln!(
                    f,
                    "Warning: p_{:?} sum != {} for layer {}: {:.4}",
                    w.side, w.expected, w.layer, w.sum
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::slicer::SlicedRouting;

    const K: usize = 2;
    const N: usize = 4;

    fn acc(layers: &[(usize, Vec<u32>)]) -> ConditionAccumulator {
        let mut acc = ConditionAccumulator::new(N, K);
        let routing = SlicedRouting::new(
            K,
            layers
                .iter()
                .map(|(l, ids)| (LayerId::gate(*l), ids.clone()))
                .collect(),
        );
        acc.accumulate(&routing).unwrap();
        acc
    }

    fn table(rows: &[(usize, Vec<f64>)]) -> DivergenceTable {
        DivergenceTable::from_layers(
            rows.iter()
                .map(|(l, v)| (LayerId::gate(*l), Array1::from_vec(v.clone())))
                .collect(),
        )
    }

    #[test]
    fn test_divergence_values() {
        // A: 2 tokens {0,1},{0,2}; B: 2 tokens {1,3},{1,3}
        let a = acc(&[(1, vec![0, 1, 0, 2])]);
        let b = acc(&[(1, vec![1, 3, 1, 3])]);
        let rd = compute_divergence(&a, &b).unwrap();
        let v = rd.get(LayerId::gate(1)).unwrap();
        assert_eq!(v.to_vec(), vec![1.0, -0.5, 0.5, -1.0]);
        assert!(rd.warnings().is_empty());
    }

    #[test]
    fn test_antisymmetric() {
        let a = acc(&[(1, vec![0, 1, 0, 2, 3, 1]), (2, vec![2, 3])]);
        let b = acc(&[(1, vec![1, 3]), (2, vec![0, 1, 0, 3])]);
        let ab = compute_divergence(&a, &b).unwrap();
        let ba = compute_divergence(&b, &a).unwrap();
        assert_eq!(ab.n_layers(), 2);
        for (layer, v) in ab.iter() {
            let w = ba.get(layer).unwrap();
            for (x, y) in v.iter().zip(w.iter()) {
                assert_eq!(*x, -*y);
            }
        }
    }

    #[test]
    fn test_identical_inputs_give_zero() {
        let a = acc(&[(1, vec![0, 1, 2, 3]), (3, vec![1, 2])]);
        let rd = compute_divergence(&a, &a.clone()).unwrap();
        for (_, v) in rd.iter() {
            assert!(v.iter().all(|&x| x == 0.0));
        }
    }

    #[test]
    fn test_layers_missing_on_one_side_are_skipped() {
        let a = acc(&[(1, vec![0, 1]), (2, vec![0, 1])]);
        let b = acc(&[(2, vec![2, 3])]);
        let rd = compute_divergence(&a, &b).unwrap();
        assert!(rd.get(LayerId::gate(1)).is_none());
        assert!(rd.get(LayerId::gate(2)).is_some());
    }

    #[test]
    fn test_normalization_warning() {
        // Three ids over one whole token: side A sums to 3 instead of 2
        let a = acc(&[(0, vec![0, 1, 2])]);
        let b = acc(&[(0, vec![2, 3])]);
        let rd = compute_divergence(&a, &b).unwrap();
        assert_eq!(rd.warnings().len(), 1);
        let w = &rd.warnings()[0];
        assert_eq!(w.side, Side::A);
        assert_eq!(w.sum, 3.0);
        assert_eq!(w.expected, 2.0);
        // Computation still goes through
        assert!(rd.get(LayerId::gate(0)).is_some());

        assert!(is_close(2.0005, 2.0));
        assert!(!is_close(2.01, 2.0));
    }

    #[test]
    fn test_mismatched_shapes_rejected() {
        let a = ConditionAccumulator::new(N, K);
        let b = ConditionAccumulator::new(N + 1, K);
        assert!(compute_divergence(&a, &b).is_err());
    }

    #[test]
    fn test_rank_per_layer() {
        let t = table(&[
            (10, vec![0.1, -0.2, 0.3, 0.0]),
            (2, vec![-0.5, 0.0, 0.0, 0.0]),
        ]);
        let pos = rank_per_layer(&t, Direction::Positive, 10);
        assert_eq!(pos[0].0, LayerId::gate(2));
        assert!(pos[0].1.is_empty());
        assert_eq!(pos[1].0, LayerId::gate(10));
        let experts: Vec<usize> = pos[1].1.iter().map(|s| s.expert).collect();
        assert_eq!(experts, vec![2, 0]);

        let neg = rank_per_layer(&t, Direction::Negative, 1);
        assert_eq!(neg[0].1[0].expert, 0);
        assert_eq!(neg[1].1.len(), 1);
        assert_eq!(neg[1].1[0].value, -0.2);
    }

    #[test]
    fn test_rank_global_tie_break() {
        let t = table(&[
            (5, vec![0.4, 0.1, 0.4, -0.3]),
            (1, vec![0.0, 0.4, -0.3, 0.2]),
        ]);
        let top = rank_global(&t, Direction::Positive, 4);
        let order: Vec<(usize, usize)> = top.iter().map(|s| (s.layer.index(), s.expert)).collect();
        assert_eq!(order, vec![(1, 1), (5, 0), (5, 2), (1, 3)]);

        let bottom = rank_global(&t, Direction::Negative, 20);
        let order: Vec<(usize, usize)> = bottom.iter().map(|s| (s.layer.index(), s.expert)).collect();
        assert_eq!(order, vec![(1, 2), (5, 3)]);

        // Stable across repeated runs
        assert_eq!(rank_global(&t, Direction::Positive, 4), top);
    }

    #[test]
    fn test_report_format() {
        let t = table(&[(3, vec![0.25, -0.125, 0.0, 0.0])]);
        let report = DivergenceReport::build(&t, 10, 20);
        let text = report.to_string();
        assert!(text.contains("Layer model.layers.3.mlp.gate: e0: 0.250000"));
        assert!(text.contains("01. Layer model.layers.3.mlp.gate e1: -0.125000"));
        assert_eq!(report.global_positive.len(), 1);
        assert_eq!(report.per_layer_negative[0].experts[0].expert, 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["global_positive"][0]["layer"], "model.layers.3.mlp.gate");
    }
}
