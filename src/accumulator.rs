//! Per-condition expert activation histograms
//!
//! Counts are purely additive, so accumulation order does not matter and
//! shards accumulated independently can be combined with
//! [`ConditionAccumulator::merge`].

use std::collections::BTreeMap;

use anyhow::Result;
use ndarray::Array1;

use crate::routing::LayerId;
use crate::slicer::SlicedRouting;

/// Fixed-length count of each expert id in `ids`.
///
/// An id `>= n_experts` means the routing shape disagrees with the
/// configured expert count and is an error.
pub fn bincount(ids: &[u32], n_experts: usize) -> Result<Array1<u64>> {
    let mut counts = Array1::<u64>::zeros(n_experts);
    for &id in ids {
        let slot = counts.get_mut(id as usize).ok_or_else(|| {
            anyhow::anyhow!("Expert id {id} out of range for {n_experts} experts")
        })?;
        *slot += 1;
    }
    Ok(counts)
}

/// Running histograms and token totals for one experimental condition
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionAccumulator {
    n_experts: usize,
    top_k: usize,
    histograms: BTreeMap<LayerId, Array1<u64>>,
    token_totals: BTreeMap<LayerId, u64>,
    examples: usize,
}

impl ConditionAccumulator {
    pub fn new(n_experts: usize, top_k: usize) -> Self {
        Self {
            n_experts,
            top_k,
            histograms: BTreeMap::new(),
            token_totals: BTreeMap::new(),
            examples: 0,
        }
    }

    pub fn n_experts(&self) -> usize {
        self.n_experts
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Number of sliced runs accumulated
    pub fn examples(&self) -> usize {
        self.examples
    }

    pub fn histogram(&self, layer: LayerId) -> Option<&Array1<u64>> {
        self.histograms.get(&layer)
    }

    pub fn tokens(&self, layer: LayerId) -> u64 {
        self.token_totals.get(&layer).copied().unwrap_or(0)
    }

    /// Layers seen so far, ascending
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.histograms.keys().copied()
    }

    /// Add one sliced run.
    ///
    /// All layers are counted before anything is committed, so an
    /// out-of-range id leaves the accumulator untouched.
    pub fn accumulate(&mut self, routing: &SlicedRouting) -> Result<()> {
        anyhow::ensure!(self.top_k > 0, "Accumulator created with top_k=0");
        anyhow::ensure!(
            routing.is_empty() || routing.top_k() == self.top_k,
            "Routing sliced with top_k={}, accumulator expects {}",
            routing.top_k(),
            self.top_k
        );

        let mut staged = Vec::new();
        for (layer, ids) in routing.iter() {
            if ids.is_empty() {
                continue;
            }
            let counts = bincount(ids, self.n_experts)
                .map_err(|e| anyhow::anyhow!("Layer {layer}: {e}"))?;
            staged.push((layer, counts, (ids.len() / self.top_k) as u64));
        }

        for (layer, counts, tokens) in staged {
            *self
                .histograms
                .entry(layer)
                .or_insert_with(|| Array1::zeros(self.n_experts)) += &counts;
            *self.token_totals.entry(layer).or_insert(0) += tokens;
        }
        self.examples += 1;
        Ok(())
    }

    /// Fold another shard into this one
    pub fn merge(&mut self, other: &ConditionAccumulator) -> Result<()> {
        anyhow::ensure!(
            self.n_experts == other.n_experts && self.top_k == other.top_k,
            "Cannot merge accumulators of shape top-{}/{} and top-{}/{}",
            self.top_k,
            self.n_experts,
            other.top_k,
            other.n_experts
        );
        for (&layer, counts) in &other.histograms {
            *self
                .histograms
                .entry(layer)
                .or_insert_with(|| Array1::zeros(self.n_experts)) += counts;
        }
        for (&layer, &tokens) in &other.token_totals {
            *self.token_totals.entry(layer).or_insert(0) += tokens;
        }
        self.examples += other.examples;
        Ok(())
    }
}
