//! Projection of token spans onto recorded routing
//!
//! Each token contributes exactly `k` contiguous entries to a layer's flat
//! expert-id list, in recording order, so token interval `[s, e)` maps to
//! flat interval `[s*k, e*k)`. `k` comes from the trace metadata; a layer
//! whose length is not a multiple of it is rejected instead of misaligned.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::routing::{LayerId, RunTrace};
use crate::span::TokenSpan;

/// Expert ids of one span, per layer. Layers with no ids in the span are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlicedRouting {
    top_k: usize,
    layers: BTreeMap<LayerId, Vec<u32>>,
}

impl SlicedRouting {
    pub fn new(top_k: usize, layers: BTreeMap<LayerId, Vec<u32>>) -> Self {
        Self { top_k, layers }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn get(&self, layer: LayerId) -> Option<&[u32]> {
        self.layers.get(&layer).map(Vec::as_slice)
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &[u32])> {
        self.layers.iter().map(|(&l, ids)| (l, ids.as_slice()))
    }

    /// Layers present, in ascending order
    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.keys().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Tokens covered in `layer`
    pub fn n_tokens(&self, layer: LayerId) -> usize {
        match (self.layers.get(&layer), self.top_k) {
            (Some(ids), k) if k > 0 => ids.len() / k,
            _ => 0,
        }
    }

    /// Append the routing of an adjacent span, layer by layer
    pub fn extend(&mut self, other: &SlicedRouting) -> Result<()> {
        anyhow::ensure!(
            self.layers.is_empty() || self.top_k == other.top_k,
            "Cannot join slices with top_k {} and {}",
            self.top_k,
            other.top_k
        );
        self.top_k = other.top_k;
        for (layer, ids) in other.iter() {
            self.layers.entry(layer).or_default().extend_from_slice(ids);
        }
        Ok(())
    }
}

/// Restrict `trace` to tokens `[start_idx, end_idx)`.
///
/// `k` must match the trace's recorded `top_k`.
pub fn slice_routing(
    trace: &RunTrace,
    start_idx: usize,
    end_idx: usize,
    k: usize,
) -> Result<SlicedRouting> {
    anyhow::ensure!(k > 0, "top_k must be positive");
    anyhow::ensure!(
        trace.top_k == k,
        "Trace '{}' was recorded with top_k={}, slicing with k={k}",
        trace.example_id,
        trace.top_k
    );

    let mut layers = BTreeMap::new();

    for (&layer, layer_trace) in &trace.layer_traces {
        if layer_trace.is_empty() {
            continue;
        }
        let flat = layer_trace.flat();
        anyhow::ensure!(
            flat.len() % k == 0,
            "Layer {layer} holds {} expert ids, not a multiple of top_k={k}",
            flat.len()
        );

        let start_flat = start_idx.saturating_mul(k);
        let end_flat = end_idx.saturating_mul(k).min(flat.len());
        if start_flat >= end_flat {
            continue;
        }

        layers.insert(layer, flat[start_flat..end_flat].to_vec());
    }

    Ok(SlicedRouting::new(k, layers))
}

impl RunTrace {
    /// Slice this trace to `span` using its recorded `top_k`
    pub fn slice(&self, span: TokenSpan) -> Result<SlicedRouting> {
        slice_routing(self, span.start, span.end, self.top_k)
    }
}

/// Outcome of matching two response lengths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthMatch {
    /// Both sides are truncated to this many tokens
    Matched(usize),
    /// The shorter side is below the minimum; drop the pair
    TooShort { shortest: usize },
}

impl LengthMatch {
    pub fn decide(len_a: usize, len_b: usize, min_tokens: usize) -> Self {
        let k = len_a.min(len_b);
        if k < min_tokens {
            LengthMatch::TooShort { shortest: k }
        } else {
            LengthMatch::Matched(k)
        }
    }

    /// Apply to two spans: each truncated to the matched budget from its own start
    pub fn apply(
        a: TokenSpan,
        b: TokenSpan,
        min_tokens: usize,
    ) -> Result<(TokenSpan, TokenSpan), LengthMatch> {
        match Self::decide(a.len(), b.len(), min_tokens) {
            LengthMatch::Matched(k) => Ok((a.truncate(k), b.truncate(k))),
            too_short => Err(too_short),
        }
    }
}
