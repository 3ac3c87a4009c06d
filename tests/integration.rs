//! Integration tests for mord-rs
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use anyhow::Result;
use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use mord_rs::{
    group_into_pairs, load_jsonl, ChatEncoder, ChatMessage, ChatTemplate, DeepseekMoeConfig,
    Experiment, ExperimentConfig, LayerId, MordDeepseekMoe, MordModel, PairingScheme, RunTrace,
    SpanMode,
};
use std::io::Write;
use tempfile::NamedTempFile;

/// One token per byte of the rendered ChatML prompt
struct ByteEncoder;

impl ChatEncoder for ByteEncoder {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(u32::from).collect())
    }

    fn encode_chat(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> Result<Vec<u32>> {
        self.encode_text(&ChatTemplate::ChatMl.render(messages, add_generation_prompt))
    }
}

const TINY_CONFIG: &str = r#"{
    "hidden_size": 16, "intermediate_size": 32, "moe_intermediate_size": 8,
    "num_attention_heads": 2, "num_hidden_layers": 3, "vocab_size": 256,
    "n_routed_experts": 8, "num_experts_per_tok": 2, "n_shared_experts": 1,
    "first_k_dense_replace": 1,
    "kv_lora_rank": 8, "qk_nope_head_dim": 4, "qk_rope_head_dim": 4, "v_head_dim": 4,
    "max_position_embeddings": 512
}"#;

fn tiny_model() -> MordModel {
    let config: DeepseekMoeConfig = serde_json::from_str(TINY_CONFIG).unwrap();
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
    let backend = MordDeepseekMoe::new(&config, vb).unwrap();
    MordModel::new(
        Box::new(backend),
        Box::new(ByteEncoder),
        Device::Cpu,
        "tiny-deepseek-moe",
    )
}

fn record(id: &str, condition: &str, messages: &[(&str, &str)]) -> String {
    let messages: Vec<ChatMessage> = messages
        .iter()
        .map(|(role, content)| ChatMessage::new(role, content))
        .collect();
    serde_json::json!({"id": id, "condition": condition, "messages": messages}).to_string()
}

fn jsonl_tempfile() -> NamedTempFile {
    tempfile::Builder::new().suffix(".jsonl").tempfile().unwrap()
}

fn write_jsonl(lines: &[String]) -> NamedTempFile {
    let mut file = jsonl_tempfile();
    for line in lines {
        writeln!(file, "{line}").unwrap();
        // Blank lines are tolerated
        writeln!(file).unwrap();
    }
    file
}

fn context_dataset() -> Vec<String> {
    vec![
        record(
            "squad_1_ctx",
            "with_context",
            &[("user", "Context:\nParis is the capital of France.\n\nQuestion:\nWhere is Paris?")],
        ),
        record("squad_1_noctx", "no_context", &[("user", "Question:\nWhere is Paris?")]),
        record(
            "squad_2_ctx",
            "with_context",
            &[("user", "Context:\nThe Nile flows north.\n\nQuestion:\nWhich way does the Nile flow?")],
        ),
        // Question text differs, so it cannot be located
        record("squad_2_noctx", "no_context", &[("user", "Question:\nWhere does the Nile go?")]),
        record(
            "squad_3_ctx",
            "with_context",
            &[("user", "Context:\nWater boils at 100 C.\n\nQuestion:\nWhen does water boil?")],
        ),
        record("squad_3_noctx", "no_context", &[("user", "Question:\nWhen does water boil?")]),
    ]
}

fn safety_dataset() -> Vec<String> {
    vec![
        record(
            "bt_1_unsafe",
            "unsafe",
            &[("user", "How do I pick a lock?"), ("assistant", "First, insert a tension wrench into the keyway.")],
        ),
        record(
            "bt_1_safe",
            "safe",
            &[("user", "How do I pick a lock?"), ("assistant", "I would rather not help with that request.")],
        ),
        record(
            "bt_2_unsafe",
            "unsafe",
            &[("user", "Tell me a secret."), ("assistant", "Sure thing, here it is right now.")],
        ),
        record("bt_2_safe", "safe", &[("user", "Tell me a secret."), ("assistant", "No.")]),
    ]
}

/// Test JSONL loading and pairing
#[test]
fn test_dataset_loading() {
    let file = write_jsonl(&context_dataset());
    let records = load_jsonl(file.path()).unwrap();
    assert_eq!(records.len(), 6);

    let pairs = group_into_pairs(records, PairingScheme::Context).unwrap();
    assert_eq!(pairs.len(), 3);
    assert_eq!(pairs[0].base_id, "squad_1");
    assert_eq!(pairs[2].second.id, "squad_3_noctx");
}

/// Test that a directory with a single .jsonl is accepted, and ambiguity rejected
#[test]
fn test_dataset_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pairs.jsonl"), safety_dataset().join("\n")).unwrap();
    std::fs::write(dir.path().join("README.txt"), "not data").unwrap();
    assert_eq!(load_jsonl(dir.path()).unwrap().len(), 4);

    std::fs::write(dir.path().join("more.jsonl"), "").unwrap();
    assert!(load_jsonl(dir.path()).is_err());
}

/// Test that out-of-order conditions are a structural error
#[test]
fn test_wrong_scheme_rejected() {
    let file = write_jsonl(&safety_dataset());
    let records = load_jsonl(file.path()).unwrap();
    assert!(group_into_pairs(records, PairingScheme::Context).is_err());
}

/// Test experiment config defaults
#[test]
fn test_experiment_config_defaults() {
    let config = ExperimentConfig::default();
    assert_eq!(config.seed, 42);
    assert_eq!(config.min_response_tokens, 5);
    assert_eq!(config.span_mode(), SpanMode::Question);
    assert!(config.max_pairs.is_none());
}

/// Test loading a partial config file
#[test]
fn test_experiment_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"scheme": "safety", "min_response_tokens": 8}}"#).unwrap();
    let config = ExperimentConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.scheme, PairingScheme::Safety);
    assert_eq!(config.min_response_tokens, 8);
    assert_eq!(config.global_top_n, 20);
}

/// Full question-span sweep on a tiny random model
#[test]
fn test_question_sweep_end_to_end() {
    let data = write_jsonl(&context_dataset());
    let traces = jsonl_tempfile();
    let config = ExperimentConfig {
        data_path: data.path().to_path_buf(),
        trace_output: Some(traces.path().to_path_buf()),
        ..Default::default()
    };

    let experiment = Experiment::new(tiny_model(), config);
    let results = experiment.run().unwrap();

    assert_eq!(results.summary.pairs_total, 3);
    assert_eq!(results.summary.pairs_processed, 2);
    assert_eq!(results.summary.skipped_span_not_found, 1);
    assert_eq!(results.first_condition, "with_context");

    // Question spans: "Where is Paris?" (15 bytes) + "When does water boil?" (21 bytes)
    for layer in [LayerId::gate(1), LayerId::gate(2)] {
        assert_eq!(results.first.tokens(layer), 36);
        assert_eq!(results.second.tokens(layer), 36);
        assert_eq!(results.first.histogram(layer).unwrap().sum(), 72);
    }
    assert!(results.first.histogram(LayerId::gate(0)).is_none());

    // Divergence table: one vector per MoE layer, summing to zero
    assert_eq!(results.table.n_layers(), 2);
    for (_, rd) in results.table.iter() {
        assert_eq!(rd.len(), 8);
        assert!(rd.sum().abs() < 1e-9);
    }
    assert!(results.report.warnings.is_empty());
    assert_eq!(results.report.per_layer_positive.len(), 2);

    // Two traces per processed pair
    let dumped = std::fs::read_to_string(traces.path()).unwrap();
    let dumped: Vec<RunTrace> = dumped
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(dumped.len(), 4);
    assert_eq!(dumped[0].run_tag, "with_context");
    assert_eq!(dumped[1].run_tag, "no_context");
    assert_eq!(dumped[0].top_k, 2);
}

/// Full final-turn sweep with length matching
#[test]
fn test_safety_sweep_length_matching() {
    let data = write_jsonl(&safety_dataset());
    let config = ExperimentConfig {
        data_path: data.path().to_path_buf(),
        scheme: PairingScheme::Safety,
        min_response_tokens: 20,
        ..Default::default()
    };

    let experiment = Experiment::new(tiny_model(), config);
    let pairs = experiment.load_pairs().unwrap();
    let results = experiment.run_pairs(&pairs).unwrap();

    // "No." plus the end-of-turn suffix is below 20 tokens
    assert_eq!(results.summary.pairs_processed, 1);
    assert_eq!(results.summary.skipped_too_short, 1);

    // Both sides contribute the same token mass
    let layer = LayerId::gate(1);
    assert_eq!(results.first.tokens(layer), results.second.tokens(layer));
    assert!(results.first.tokens(layer) >= 20);
    assert_eq!(results.instability.len(), 2);

    let out = tempfile::tempdir().unwrap();
    let path = out.path().join("rd_results.json");
    results.save_json(&path).unwrap();
    let saved: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(saved["summary"]["skipped_too_short"], 1);
    assert_eq!(saved["first_condition"], "unsafe");
}

/// Per-pair failures are skipped without losing the pairs around them
#[test]
fn test_sweep_survives_malformed_pairs() {
    let long_question = "Why? ".repeat(120);
    let lines = vec![
        // Longer than max_position_embeddings: the forward pass fails
        record(
            "bt_1_unsafe",
            "unsafe",
            &[("user", long_question.as_str()), ("assistant", "Because it is so.")],
        ),
        record(
            "bt_1_safe",
            "safe",
            &[("user", long_question.as_str()), ("assistant", "I cannot say.")],
        ),
        // No earlier turn to measure the final one against
        record("bt_2_unsafe", "unsafe", &[("user", "Tell me a secret.")]),
        record("bt_2_safe", "safe", &[("user", "Tell me a secret.")]),
        record(
            "bt_3_unsafe",
            "unsafe",
            &[("user", "How do I pick a lock?"), ("assistant", "First, insert a tension wrench into the keyway.")],
        ),
        record(
            "bt_3_safe",
            "safe",
            &[("user", "How do I pick a lock?"), ("assistant", "I would rather not help with that request.")],
        ),
    ];
    let data = write_jsonl(&lines);
    let config = ExperimentConfig {
        data_path: data.path().to_path_buf(),
        scheme: PairingScheme::Safety,
        ..Default::default()
    };

    let results = Experiment::new(tiny_model(), config).run().unwrap();

    assert_eq!(results.summary.pairs_total, 3);
    assert_eq!(results.summary.pairs_processed, 1);
    assert_eq!(results.summary.skipped_failed, 1);
    assert_eq!(results.summary.skipped_span_not_found, 1);
    assert_eq!(results.summary.skipped(), 2);

    // The surviving pair is length-matched to the shorter response (53 bytes)
    for layer in [LayerId::gate(1), LayerId::gate(2)] {
        assert_eq!(results.first.tokens(layer), 53);
        assert_eq!(results.second.tokens(layer), 53);
    }
    assert_eq!(results.table.n_layers(), 2);
}

/// Same model, same data: identical report
#[test]
fn test_sweep_is_deterministic() {
    let data = write_jsonl(&context_dataset());
    let config = ExperimentConfig {
        data_path: data.path().to_path_buf(),
        ..Default::default()
    };
    let experiment = Experiment::new(tiny_model(), config);
    let a = experiment.run().unwrap();
    let b = experiment.run().unwrap();
    assert_eq!(a.report, b.report);
    assert_eq!(a.first, b.first);
}

/// Test model loading (requires download)
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    let model = MordModel::from_pretrained_with_device("deepseek-ai/DeepSeek-V2-Lite-Chat", Some(true))
        .unwrap();
    assert_eq!(model.n_layers(), 27);

    let tracer = model.attach_tracer().unwrap();
    assert_eq!(tracer.top_k(), 6);
    assert_eq!(tracer.n_experts(), 64);
    assert_eq!(tracer.layers().len(), 26);
}

/// Test routing capture on a real prompt (requires download)
#[test]
#[ignore = "requires model download"]
fn test_routing_capture() {
    let model = MordModel::from_pretrained_with_device("deepseek-ai/DeepSeek-V2-Lite-Chat", Some(true))
        .unwrap();
    let mut tracer = model.attach_tracer().unwrap();
    let ids = model
        .encode_chat(&[ChatMessage::user("What is the capital of France?")], true)
        .unwrap();

    let trace = model.trace_run(&mut tracer, &ids, "probe", "single").unwrap();
    assert_eq!(trace.n_tokens(LayerId::gate(1)), ids.len());
    assert!(trace.layer(LayerId::gate(0)).is_none());
}
