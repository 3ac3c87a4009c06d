//! Passive capture of MoE routing decisions
//!
//! A [`RouterTracer`] is attached to a model once. It discovers every
//! routing sub-layer through the model's decoder-layer container (see
//! [`MoeBackend::decoder_layers`]) and records, for each forward pass run
//! while it is armed, the flat top-k expert id sequence each gate emits.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let mut tracer = RouterTracer::attach(&backend)?;
//! let mut run = tracer.start("squad_000001", "with_context");
//! backend.forward_with_routing(&input_ids, &mut run)?;
//! let trace = run.stop();
//! ```
//!
//! [`RouterTracer::start`] hands out an [`ArmedRun`] that mutably borrows the
//! tracer, so starting a second run before the first one is stopped is
//! rejected by the borrow checker instead of silently mixing traces.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::MoeBackend;

/// Identifier of one routing sub-layer, rendered as `model.layers.<index>.mlp.gate`.
///
/// Ordering follows the numeric layer index, so `layers.2` sorts before `layers.10`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LayerId(usize);

impl LayerId {
    /// Gate of the MoE block in decoder layer `index`
    pub fn gate(index: usize) -> Self {
        Self(index)
    }

    /// Decoder layer index
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "model.layers.{}.mlp.gate", self.0)
    }
}

impl FromStr for LayerId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s.strip_prefix("model.").unwrap_or(s);
        let (index, suffix) = rest
            .strip_prefix("layers.")
            .and_then(|r| r.split_once('.'))
            .ok_or_else(|| anyhow::anyhow!("Invalid layer id '{s}'"))?;
        anyhow::ensure!(suffix == "mlp.gate", "Invalid layer id '{s}': not a gate");
        let index = index
            .parse()
            .with_context(|| format!("Invalid layer index in '{s}'"))?;
        Ok(Self(index))
    }
}

impl TryFrom<String> for LayerId {
    type Error = anyhow::Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<LayerId> for String {
    fn from(id: LayerId) -> Self {
        id.to_string()
    }
}

/// Expert ids selected by one gate invocation.
///
/// A teacher-forced forward pass yields a single event per layer whose
/// payload spans the whole sequence (`seq_len * k` ids, token-major).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEvent {
    pub top_experts: Vec<u32>,
}

impl RouteEvent {
    pub fn new(top_experts: Vec<u32>) -> Self {
        Self { top_experts }
    }
}

/// Recorded events for one routing sub-layer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerTrace {
    events: Vec<RouteEvent>,
}

impl LayerTrace {
    pub fn new(events: Vec<RouteEvent>) -> Self {
        Self { events }
    }

    pub fn push(&mut self, event: RouteEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[RouteEvent] {
        &self.events
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// All recorded expert ids in recording order.
    ///
    /// Borrows when the layer holds a single event (the teacher-forced case).
    pub fn flat(&self) -> Cow<'_, [u32]> {
        match self.events.as_slice() {
            [] => Cow::Borrowed(&[]),
            [single] => Cow::Borrowed(&single.top_experts),
            events => Cow::Owned(
                events
                    .iter()
                    .flat_map(|e| e.top_experts.iter().copied())
                    .collect(),
            ),
        }
    }

    /// Total number of recorded expert ids
    pub fn flat_len(&self) -> usize {
        self.events.iter().map(|e| e.top_experts.len()).sum()
    }
}

/// Routing trace of one (example, condition) forward pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTrace {
    pub example_id: String,
    pub run_tag: String,
    /// Experts selected per token; every layer's flat length is a multiple of this
    #[serde(default)]
    pub top_k: usize,
    pub layer_traces: BTreeMap<LayerId, LayerTrace>,
}

impl RunTrace {
    /// Create a trace with an empty entry for each of `layers`
    pub fn empty(example_id: &str, run_tag: &str, top_k: usize, layers: &[LayerId]) -> Self {
        Self {
            example_id: example_id.to_string(),
            run_tag: run_tag.to_string(),
            top_k,
            layer_traces: layers.iter().map(|&l| (l, LayerTrace::default())).collect(),
        }
    }

    pub fn layer(&self, layer: LayerId) -> Option<&LayerTrace> {
        self.layer_traces.get(&layer)
    }

    /// Number of tokens recorded for a layer
    pub fn n_tokens(&self, layer: LayerId) -> usize {
        if self.top_k == 0 {
            return 0;
        }
        self.layer(layer).map_or(0, |t| t.flat_len() / self.top_k)
    }

    /// Whether no layer recorded anything
    pub fn is_empty(&self) -> bool {
        self.layer_traces.values().all(LayerTrace::is_empty)
    }

    /// Check that every layer holds whole tokens (`flat_len % top_k == 0`)
    pub fn validate_layout(&self) -> Result<()> {
        anyhow::ensure!(self.top_k > 0, "Trace '{}' has top_k = 0", self.example_id);
        for (layer, trace) in &self.layer_traces {
            let len = trace.flat_len();
            anyhow::ensure!(
                len % self.top_k == 0,
                "Layer {layer} holds {len} expert ids, not a multiple of top_k={}",
                self.top_k
            );
        }
        Ok(())
    }
}

/// A routing sub-module (the gate of one MoE block).
///
/// `route` returns the gate's outputs in whatever order the implementation
/// uses; the recorder picks the integer-typed tensor among them.
pub trait RoutingModule {
    /// Experts selected per token
    fn top_k(&self) -> usize;
    /// Routed experts in this block
    fn n_experts(&self) -> usize;
    /// Compute routing outputs for `hidden` of shape `[batch, seq, d_model]`
    fn route(&self, hidden: &Tensor) -> Result<Vec<Tensor>>;
}

/// Callback invoked by a backend after every gate evaluation
pub trait RoutingObserver {
    fn observe(&mut self, layer: LayerId, outputs: &[Tensor]) -> Result<()>;
}

/// Observer that records nothing, for plain forward passes
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl RoutingObserver for NoopObserver {
    fn observe(&mut self, _layer: LayerId, _outputs: &[Tensor]) -> Result<()> {
        Ok(())
    }
}

/// Pull the expert ids out of a gate's outputs.
///
/// The first integer-typed tensor wins; float side outputs (routing
/// weights, aux losses) are skipped. A rank-3 tensor with a leading batch of
/// one is squeezed to `[seq_len, k]` and flattened row-major.
///
/// Returns `Ok(None)` when no integer output is present.
pub fn extract_expert_ids(outputs: &[Tensor]) -> Result<Option<Vec<u32>>> {
    let Some(indices) = outputs
        .iter()
        .find(|t| t.dtype().is_int() && t.rank() >= 1)
    else {
        return Ok(None);
    };

    let indices = match indices.dims() {
        [1, _, _] => indices.squeeze(0)?,
        _ => indices.clone(),
    };

    let flat: Vec<i64> = indices.flatten_all()?.to_dtype(DType::I64)?.to_vec1()?;
    let ids = flat
        .into_iter()
        .map(|id| u32::try_from(id).with_context(|| format!("Invalid expert id {id}")))
        .collect::<Result<Vec<u32>>>()?;

    Ok(Some(ids))
}

enum TracerState {
    Idle,
    Armed(RunTrace),
}

/// Records per-layer expert selections for one run at a time
pub struct RouterTracer {
    layers: Vec<LayerId>,
    top_k: usize,
    n_experts: usize,
    state: TracerState,
}

impl RouterTracer {
    /// Attach to every routing module of `model`.
    ///
    /// Fails when the model exposes no decoder-layer container, has no MoE
    /// gate at all, or its gates disagree on `top_k` / expert count. These
    /// indicate an incompatible model and are not recoverable.
    pub fn attach(model: &dyn MoeBackend) -> Result<Self> {
        let decoder_layers = model.decoder_layers().ok_or_else(|| {
            anyhow::anyhow!("Unexpected model structure: no decoder layer container")
        })?;

        let mut layers = Vec::new();
        let mut shape: Option<(usize, usize)> = None;

        for (index, layer) in decoder_layers.iter().enumerate() {
            let Some(gate) = layer.moe_gate() else {
                continue;
            };
            let gate_shape = (gate.top_k(), gate.n_experts());
            match shape {
                None => shape = Some(gate_shape),
                Some(expected) if expected != gate_shape => anyhow::bail!(
                    "Gate of layer {index} routes top-{} of {} experts, expected top-{} of {}",
                    gate_shape.0,
                    gate_shape.1,
                    expected.0,
                    expected.1
                ),
                Some(_) => {}
            }
            layers.push(LayerId::gate(index));
        }

        let (top_k, n_experts) = shape.ok_or_else(|| {
            anyhow::anyhow!("Unexpected model structure: no MoE routing modules found")
        })?;
        anyhow::ensure!(
            top_k > 0 && top_k <= n_experts,
            "Invalid routing shape: top-{top_k} of {n_experts} experts"
        );

        info!(
            "Attached router tracer to {} MoE layers (top-{} of {} experts)",
            layers.len(),
            top_k,
            n_experts
        );

        Ok(Self {
            layers,
            top_k,
            n_experts,
            state: TracerState::Idle,
        })
    }

    /// Arm the tracer for one run.
    ///
    /// The previous run, if any, must have been stopped: the returned guard
    /// borrows the tracer until [`ArmedRun::stop`] or drop.
    pub fn start(&mut self, example_id: &str, run_tag: &str) -> ArmedRun<'_> {
        self.state = TracerState::Armed(RunTrace::empty(
            example_id,
            run_tag,
            self.top_k,
            &self.layers,
        ));
        ArmedRun { tracer: self }
    }

    /// Disarm and return the current trace.
    ///
    /// Without a prior [`start`](Self::start) this returns an empty trace.
    pub fn stop(&mut self) -> RunTrace {
        match std::mem::replace(&mut self.state, TracerState::Idle) {
            TracerState::Armed(trace) => trace,
            TracerState::Idle => RunTrace::empty("", "", self.top_k, &self.layers),
        }
    }

    /// Remove all observation points. Safe to call repeatedly.
    pub fn detach(&mut self) {
        if !self.layers.is_empty() {
            debug!("Detaching router tracer from {} layers", self.layers.len());
        }
        self.layers.clear();
        self.state = TracerState::Idle;
    }

    pub fn is_attached(&self) -> bool {
        !self.layers.is_empty()
    }

    pub fn is_armed(&self) -> bool {
        matches!(self.state, TracerState::Armed(_))
    }

    /// Attached layers in ascending layer order
    pub fn layers(&self) -> &[LayerId] {
        &self.layers
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn n_experts(&self) -> usize {
        self.n_experts
    }

    fn record(&mut self, layer: LayerId, outputs: &[Tensor]) -> Result<()> {
        let TracerState::Armed(trace) = &mut self.state else {
            return Ok(());
        };
        let Some(layer_trace) = trace.layer_traces.get_mut(&layer) else {
            return Ok(());
        };
        let Some(top_experts) = extract_expert_ids(outputs)? else {
            debug!("No integer routing output at {layer}, skipping invocation");
            return Ok(());
        };
        anyhow::ensure!(
            top_experts.len() % self.top_k == 0,
            "Gate {layer} emitted {} expert ids, not a multiple of top_k={}",
            top_experts.len(),
            self.top_k
        );
        layer_trace.push(RouteEvent::new(top_experts));
        Ok(())
    }
}

impl RoutingObserver for RouterTracer {
    /// Records only while armed (i.e. through a leaked guard); otherwise a no-op
    fn observe(&mut self, layer: LayerId, outputs: &[Tensor]) -> Result<()> {
        self.record(layer, outputs)
    }
}

/// An armed recording scope, obtained from [`RouterTracer::start`]
pub struct ArmedRun<'a> {
    tracer: &'a mut RouterTracer,
}

impl ArmedRun<'_> {
    /// Disarm and return the completed trace
    pub fn stop(self) -> RunTrace {
        self.tracer.stop()
    }
}

impl RoutingObserver for ArmedRun<'_> {
    fn observe(&mut self, layer: LayerId, outputs: &[Tensor]) -> Result<()> {
        self.tracer.record(layer, outputs)
    }
}

impl Drop for ArmedRun<'_> {
    fn drop(&mut self) {
        self.tracer.state = TracerState::Idle;
    }
}
