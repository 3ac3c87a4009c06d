//! Paired routing-divergence sweep
//!
//! For every condition pair: locate the analysed span in both tokenized
//! conversations, length-match when comparing free-form responses, run one
//! teacher-forced forward pass per condition with the router tracer armed,
//! slice the traces to the spans and accumulate. Divergence is computed once
//! after the sweep.
//!
//! Span location runs before any forward pass, so skipped pairs cost no
//! model time.

use std::collections::BTreeMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::accumulator::ConditionAccumulator;
use crate::dataset::{group_into_pairs, load_jsonl, sample_pairs, ConditionPair, PairingScheme};
use crate::divergence::{compute_divergence, DivergenceReport, DivergenceTable};
use crate::instability::InstabilityAccumulator;
use crate::model::MordModel;
use crate::routing::{LayerId, RouterTracer, RunTrace};
use crate::slicer::LengthMatch;
use crate::span::{extract_question, locate_final_turn, locate_subsequence, TokenSpan};

/// Pairs between progress log lines
const PROGRESS_EVERY: usize = 50;

/// Which tokens of each conversation are analysed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanMode {
    /// The question tokens, found by subsequence search in both conditions
    Question,
    /// The final turn's content, found by prefix length, then length-matched
    FinalTurn,
}

impl SpanMode {
    pub fn default_for(scheme: PairingScheme) -> Self {
        match scheme {
            PairingScheme::Context => SpanMode::Question,
            PairingScheme::Safety => SpanMode::FinalTurn,
        }
    }
}

impl FromStr for SpanMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "question" => Ok(SpanMode::Question),
            "final_turn" => Ok(SpanMode::FinalTurn),
            other => anyhow::bail!("Unknown span mode '{other}' (expected question or final-turn)"),
        }
    }
}

/// Configuration for a routing-divergence sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// JSONL file, or a directory holding exactly one
    pub data_path: PathBuf,
    pub scheme: PairingScheme,
    /// Span strategy; `None` picks the scheme's default
    pub span_mode: Option<SpanMode>,
    /// Random subset of this many pairs (None = all, in file order)
    pub max_pairs: Option<usize>,
    /// Random seed for pair sampling
    pub seed: u64,
    /// Minimum length-matched tokens for a pair to count
    pub min_response_tokens: usize,
    pub per_layer_top_n: usize,
    pub global_top_n: usize,
    /// Dump every RunTrace as one JSON line
    pub trace_output: Option<PathBuf>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/pairs.jsonl"),
            scheme: PairingScheme::Context,
            span_mode: None,
            max_pairs: None,
            seed: 42,
            min_response_tokens: 5,
            per_layer_top_n: 10,
            global_top_n: 20,
            trace_output: None,
        }
    }
}

impl ExperimentConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config {}", path.display()))
    }

    pub fn span_mode(&self) -> SpanMode {
        self.span_mode
            .unwrap_or_else(|| SpanMode::default_for(self.scheme))
    }
}

/// Why a pair contributed nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The target tokens could not be located in one of the conversations
    SpanNotFound,
    /// The length-matched span is shorter than the minimum
    TooShort { shortest: usize },
    /// Tokenization or a forward pass failed for this pair
    Failed,
}

/// Processed vs skipped pair counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub pairs_total: usize,
    pub pairs_processed: usize,
    pub skipped_span_not_found: usize,
    pub skipped_too_short: usize,
    pub skipped_failed: usize,
}

impl SweepSummary {
    fn record_skip(&mut self, reason: SkipReason) {
        match reason {
            SkipReason::SpanNotFound => self.skipped_span_not_found += 1,
            SkipReason::TooShort { .. } => self.skipped_too_short += 1,
            SkipReason::Failed => self.skipped_failed += 1,
        }
    }

    pub fn skipped(&self) -> usize {
        self.skipped_span_not_found + self.skipped_too_short + self.skipped_failed
    }
}

/// Token ids and analysed span of both conditions of a pair
#[derive(Debug, Clone)]
pub struct PreparedPair {
    pub first_ids: Vec<u32>,
    pub first_span: TokenSpan,
    pub second_ids: Vec<u32>,
    pub second_span: TokenSpan,
}

/// Both routing traces of a pair that survived span location
struct TracedPair {
    prepared: PreparedPair,
    first: RunTrace,
    second: RunTrace,
}

/// Output of a sweep
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentResults {
    pub model_id: String,
    pub scheme: PairingScheme,
    pub span_mode: SpanMode,
    /// Condition A of the divergence (positive values favour it)
    pub first_condition: String,
    pub second_condition: String,
    pub summary: SweepSummary,
    pub report: DivergenceReport,
    /// Mean experts changed per analysed token, per layer
    pub instability: BTreeMap<LayerId, f64>,
    #[serde(skip)]
    pub table: DivergenceTable,
    #[serde(skip)]
    pub first: ConditionAccumulator,
    #[serde(skip)]
    pub second: ConditionAccumulator,
}

impl ExperimentResults {
    /// Write the summary, report and instability means as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Results saved to {}", path.display());
        Ok(())
    }
}

/// JSONL sink for raw traces
struct TraceWriter {
    out: BufWriter<fs::File>,
}

impl TraceWriter {
    fn create(path: &Path) -> Result<Self> {
        let file = fs::File::create(path)
            .with_context(|| format!("Failed to create trace file {}", path.display()))?;
        Ok(Self {
            out: BufWriter::new(file),
        })
    }

    fn write(&mut self, trace: &RunTrace) -> Result<()> {
        serde_json::to_writer(&mut self.out, trace)?;
        self.out.write_all(b"\n")?;
        Ok(())
    }

    fn finish(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Main experiment runner
pub struct Experiment {
    config: ExperimentConfig,
    model: MordModel,
}

impl Experiment {
    pub fn new(model: MordModel, config: ExperimentConfig) -> Self {
        Self { config, model }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    pub fn model(&self) -> &MordModel {
        &self.model
    }

    /// Load, pair and optionally sample the dataset
    pub fn load_pairs(&self) -> Result<Vec<ConditionPair>> {
        let records = load_jsonl(&self.config.data_path)?;
        info!(
            "Loaded {} records from {}",
            records.len(),
            self.config.data_path.display()
        );
        let pairs = group_into_pairs(records, self.config.scheme)?;

        match self.config.max_pairs {
            Some(n) => {
                let sampled = sample_pairs(&pairs, n, self.config.seed)?;
                info!("Sampled {} of {} pairs (seed {})", n, pairs.len(), self.config.seed);
                Ok(sampled)
            }
            None => Ok(pairs),
        }
    }

    /// Run the full sweep over the configured dataset
    pub fn run(&self) -> Result<ExperimentResults> {
        let pairs = self.load_pairs()?;
        self.run_pairs(&pairs)
    }

    /// Tokenize both conditions and locate their spans.
    ///
    /// `Ok(Err(reason))` means the pair is skipped; `Err` is fatal.
    pub fn prepare_pair(&self, pair: &ConditionPair) -> Result<std::result::Result<PreparedPair, SkipReason>> {
        let first_ids = self.model.encode_chat(&pair.first.messages, false)?;
        let second_ids = self.model.encode_chat(&pair.second.messages, false)?;

        let spans = match self.config.span_mode() {
            SpanMode::Question => {
                let question = extract_question(&pair.first.messages)
                    .with_context(|| format!("Pair '{}'", pair.base_id))?;
                let question_ids = self.model.encode_text(&question)?;
                locate_subsequence(&first_ids, &question_ids)
                    .zip(locate_subsequence(&second_ids, &question_ids))
                    .ok_or(SkipReason::SpanNotFound)
            }
            SpanMode::FinalTurn => {
                let encoder = self.model.encoder();
                let first = locate_final_turn(encoder, &pair.first.messages, &first_ids)?;
                let second = locate_final_turn(encoder, &pair.second.messages, &second_ids)?;
                match first.zip(second) {
                    Some((a, b)) => LengthMatch::apply(a, b, self.config.min_response_tokens)
                        .map_err(|m| match m {
                            LengthMatch::TooShort { shortest } => SkipReason::TooShort { shortest },
                            LengthMatch::Matched(_) => SkipReason::SpanNotFound,
                        }),
                    None => Err(SkipReason::SpanNotFound),
                }
            }
        };

        Ok(spans.map(|(first_span, second_span)| PreparedPair {
            first_ids,
            first_span,
            second_ids,
            second_span,
        }))
    }

    /// Prepare a pair and run both conditions through the model.
    ///
    /// Span location happens first, so skipped pairs cost no forward pass.
    fn trace_pair(
        &self,
        tracer: &mut RouterTracer,
        pair: &ConditionPair,
    ) -> Result<std::result::Result<TracedPair, SkipReason>> {
        let (first_cond, second_cond) = self.config.scheme.conditions();
        let prepared = match self.prepare_pair(pair)? {
            Ok(prepared) => prepared,
            Err(reason) => return Ok(Err(reason)),
        };
        let first = self
            .model
            .trace_run(tracer, &prepared.first_ids, &pair.base_id, first_cond)?;
        let second = self
            .model
            .trace_run(tracer, &prepared.second_ids, &pair.base_id, second_cond)?;
        Ok(Ok(TracedPair {
            prepared,
            first,
            second,
        }))
    }

    /// Sweep over `pairs`.
    ///
    /// A pair that cannot be tokenized, located or run is skipped and
    /// counted; slicing and accumulation errors are layout mismatches and
    /// abort the sweep.
    pub fn run_pairs(&self, pairs: &[ConditionPair]) -> Result<ExperimentResults> {
        let (first_cond, second_cond) = self.config.scheme.conditions();
        let span_mode = self.config.span_mode();
        info!(
            "Starting {} sweep over {} pairs ({first_cond} vs {second_cond}, span: {span_mode:?})",
            self.config.scheme,
            pairs.len()
        );

        let mut tracer = self.model.attach_tracer()?;
        let mut first = ConditionAccumulator::new(tracer.n_experts(), tracer.top_k());
        let mut second = ConditionAccumulator::new(tracer.n_experts(), tracer.top_k());
        let mut instability = InstabilityAccumulator::new();
        let mut summary = SweepSummary {
            pairs_total: pairs.len(),
            ..Default::default()
        };
        let mut traces = self
            .config
            .trace_output
            .as_deref()
            .map(TraceWriter::create)
            .transpose()?;

        for (idx, pair) in pairs.iter().enumerate() {
            if idx == 0 || (idx + 1) % PROGRESS_EVERY == 0 {
                info!("Processing pair {}/{}", idx + 1, pairs.len());
            }

            let outcome = self.trace_pair(&mut tracer, pair).unwrap_or_else(|e| {
                warn!("Pair '{}' failed: {e:#}", pair.base_id);
                Err(SkipReason::Failed)
            });
            let traced = match outcome {
                Ok(traced) => traced,
                Err(reason) => {
                    warn!("Skipping pair '{}': {:?}", pair.base_id, reason);
                    summary.record_skip(reason);
                    continue;
                }
            };

            if let Some(writer) = traces.as_mut() {
                writer.write(&traced.first)?;
                writer.write(&traced.second)?;
            }

            let slice_first = traced.first.slice(traced.prepared.first_span)?;
            let slice_second = traced.second.slice(traced.prepared.second_span)?;

            first.accumulate(&slice_first)?;
            second.accumulate(&slice_second)?;
            instability.add(&slice_first, &slice_second)?;
            summary.pairs_processed += 1;
        }

        tracer.detach();
        if let Some(writer) = traces {
            writer.finish()?;
        }

        info!(
            "Sweep done: {} processed, {} skipped ({} span not found, {} too short, {} failed)",
            summary.pairs_processed,
            summary.skipped(),
            summary.skipped_span_not_found,
            summary.skipped_too_short,
            summary.skipped_failed
        );

        let table = compute_divergence(&first, &second)?;
        info!("Computed RD for {} layers", table.n_layers());
        let report = DivergenceReport::build(
            &table,
            self.config.per_layer_top_n,
            self.config.global_top_n,
        );

        Ok(ExperimentResults {
            model_id: self.model.model_id().to_string(),
            scheme: self.config.scheme,
            span_mode,
            first_condition: first_cond.to_string(),
            second_condition: second_cond.to_string(),
            summary,
            report,
            instability: instability.means(),
            table,
            first,
            second,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults_from_partial_json() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{"scheme": "safety", "max_pairs": 100}"#).unwrap();
        assert_eq!(config.scheme, PairingScheme::Safety);
        assert_eq!(config.max_pairs, Some(100));
        assert_eq!(config.min_response_tokens, 5);
        assert_eq!(config.per_layer_top_n, 10);
        assert_eq!(config.global_top_n, 20);
        assert_eq!(config.span_mode(), SpanMode::FinalTurn);
    }

    #[test]
    fn test_span_mode_override_and_parse() {
        let config = ExperimentConfig {
            span_mode: Some(SpanMode::FinalTurn),
            ..Default::default()
        };
        assert_eq!(config.scheme, PairingScheme::Context);
        assert_eq!(config.span_mode(), SpanMode::FinalTurn);
        assert_eq!("final-turn".parse::<SpanMode>().unwrap(), SpanMode::FinalTurn);
        assert!("answer".parse::<SpanMode>().is_err());
    }

    #[test]
    fn test_summary_counts_skips() {
        let mut summary = SweepSummary::default();
        summary.record_skip(SkipReason::SpanNotFound);
        summary.record_skip(SkipReason::TooShort { shortest: 3 });
        summary.record_skip(SkipReason::TooShort { shortest: 1 });
        summary.record_skip(SkipReason::Failed);
        assert_eq!(summary.skipped_span_not_found, 1);
        assert_eq!(summary.skipped_too_short, 2);
        assert_eq!(summary.skipped_failed, 1);
        assert_eq!(summary.skipped(), 4);
    }
}
