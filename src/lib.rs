// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64 in probability ratios
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::many_single_char_names)] // b, s, d, k standard in tensor code
#![allow(clippy::similar_names)] // related variables like `first`/`first_ids`
#![allow(clippy::module_name_repetitions)] // RoutingModule in routing.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::trivially_copy_pass_by_ref)] // &LayerId for API consistency
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility

//! mord-rs: MoE Routing Divergence
//!
//! Captures which experts a mixture-of-experts language model routes each
//! token to, restricts the captured routing to a token span of interest
//! (a question, or an assistant response), and compares per-expert
//! activation rates between two paired experimental conditions.
//!
//! ## Architecture
//!
//! - `routing`: Router tracer, trace data model and the routing-module seam
//! - `span`: Token span location (subsequence search, prefix length)
//! - `slicer`: Projection of token spans onto flat routing, length matching
//! - `accumulator`: Per-condition expert histograms and token totals
//! - `divergence`: Routing divergence, deterministic rankings, report
//! - `instability`: Per-token expert-set changes between conditions
//! - `dataset`: Paired JSONL loading, grouping and sampling
//! - `chat`: Chat templates and tokenization
//! - `model`: MordModel wrapper and the MoE backend traits
//! - `forward_deepseek_moe`: DeepSeek MoE forward pass with routing capture
//! - `masks`: Cached causal attention masks
//! - `experiment`: Paired sweep driver

pub mod accumulator;
pub mod chat;
pub mod dataset;
pub mod divergence;
pub mod experiment;
pub mod forward_deepseek_moe;
pub mod instability;
pub mod masks;
pub mod model;
pub mod routing;
pub mod slicer;
pub mod span;

pub use accumulator::{bincount, ConditionAccumulator};
pub use chat::{ChatEncoder, ChatMessage, ChatTemplate, ChatTokenizer};
pub use dataset::{
    group_into_pairs, load_jsonl, sample_pairs, ChatRecord, ConditionPair, PairingScheme,
};
pub use divergence::{
    compute_divergence, rank_global, rank_per_layer, Direction, DivergenceReport,
    DivergenceTable, ExpertScore, NormalizationWarning,
};
pub use experiment::{
    Experiment, ExperimentConfig, ExperimentResults, SkipReason, SpanMode, SweepSummary,
};
pub use forward_deepseek_moe::{DeepseekMoeConfig, MordDeepseekMoe, TopKGate};
pub use instability::{layer_token_changes, InstabilityAccumulator, LayerChanges};
pub use masks::{cached_masks, causal_mask, clear_masks};
pub use model::{MoeBackend, MoeDecoderLayer, MordModel};
pub use routing::{
    extract_expert_ids, ArmedRun, LayerId, LayerTrace, RouteEvent, RouterTracer, RoutingModule,
    RoutingObserver, RunTrace,
};
pub use slicer::{slice_routing, LengthMatch, SlicedRouting};
pub use span::{extract_question, find_subsequence, locate_final_turn, TokenSpan};
