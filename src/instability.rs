//! Per-token routing instability between two conditions
//!
//! For two length-matched slices, token `t` of layer `l` routes to a set of
//! `k` experts under each condition. The number of experts that changed is
//! `k - |set_a ∩ set_b|`; its mean over tokens measures how strongly the
//! condition perturbs routing at that layer, independent of which experts
//! are involved.

use std::collections::{BTreeMap, HashSet};

use anyhow::Result;
use serde::Serialize;

use crate::routing::LayerId;
use crate::slicer::SlicedRouting;

/// Summed expert changes and compared tokens of one layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LayerChanges {
    pub changes: u64,
    pub tokens: u64,
}

impl LayerChanges {
    /// Mean experts changed per token, `None` without tokens
    pub fn mean(&self) -> Option<f64> {
        (self.tokens > 0).then(|| self.changes as f64 / self.tokens as f64)
    }
}

/// Per-layer changes between two aligned slices.
///
/// Only layers present in both are compared, over the shorter of the two
/// token counts.
pub fn layer_token_changes(
    a: &SlicedRouting,
    b: &SlicedRouting,
) -> Result<BTreeMap<LayerId, LayerChanges>> {
    anyhow::ensure!(
        a.top_k() == b.top_k(),
        "Cannot compare slices with top_k {} and {}",
        a.top_k(),
        b.top_k()
    );
    let k = a.top_k();
    let mut out = BTreeMap::new();
    if k == 0 {
        return Ok(out);
    }

    for (layer, ids_a) in a.iter() {
        let Some(ids_b) = b.get(layer) else {
            continue;
        };

        let mut entry = LayerChanges::default();
        for (tok_a, tok_b) in ids_a.chunks_exact(k).zip(ids_b.chunks_exact(k)) {
            let set_a: HashSet<u32> = tok_a.iter().copied().collect();
            let set_b: HashSet<u32> = tok_b.iter().copied().collect();
            let overlap = set_a.intersection(&set_b).count();
            entry.changes += (k - overlap) as u64;
            entry.tokens += 1;
        }
        if entry.tokens > 0 {
            out.insert(layer, entry);
        }
    }

    Ok(out)
}

/// Running per-layer instability over a sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InstabilityAccumulator {
    layers: BTreeMap<LayerId, LayerChanges>,
}

impl InstabilityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, a: &SlicedRouting, b: &SlicedRouting) -> Result<()> {
        for (layer, delta) in layer_token_changes(a, b)? {
            let entry = self.layers.entry(layer).or_default();
            entry.changes += delta.changes;
            entry.tokens += delta.tokens;
        }
        Ok(())
    }

    pub fn get(&self, layer: LayerId) -> Option<LayerChanges> {
        self.layers.get(&layer).copied()
    }

    /// Mean experts changed per token, ascending layer order
    pub fn means(&self) -> BTreeMap<LayerId, f64> {
        self.layers
            .iter()
            .filter_map(|(&layer, c)| c.mean().map(|m| (layer, m)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
