//! mord-rs CLI: MoE Routing Divergence

use anyhow::Result;
use clap::Parser;
use mord_rs::{Experiment, ExperimentConfig, MordModel, PairingScheme, SpanMode};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "mord-rs")]
#[command(about = "Routing divergence of mixture-of-experts models across paired conditions")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace` (e.g., "deepseek-ai/DeepSeek-V2-Lite-Chat")
    #[arg(short, long, default_value = "deepseek-ai/DeepSeek-V2-Lite")]
    model: String,

    /// Paired JSONL file, or a directory holding exactly one
    #[arg(short, long)]
    data: Option<PathBuf>,

    /// JSON config file; command-line flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Pairing scheme: context (with_context/no_context) or safety (unsafe/safe)
    #[arg(short, long)]
    scheme: Option<PairingScheme>,

    /// Span to analyse: question or final-turn (default depends on scheme)
    #[arg(long)]
    span: Option<SpanMode>,

    /// Sample this many pairs at random
    #[arg(short = 'n', long)]
    max_pairs: Option<usize>,

    /// Sampling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Minimum length-matched response tokens per pair
    #[arg(long)]
    min_response_tokens: Option<usize>,

    /// Dump raw routing traces to this JSONL file
    #[arg(long)]
    traces: Option<PathBuf>,

    /// Output directory for results
    #[arg(short, long, default_value = "outputs")]
    output: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    /// Config file (or defaults) with command-line overrides applied
    fn experiment_config(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::from_json_file(path)?,
            None => ExperimentConfig::default(),
        };
        if let Some(data) = &self.data {
            config.data_path = data.clone();
        }
        if let Some(scheme) = self.scheme {
            config.scheme = scheme;
        }
        if let Some(span) = self.span {
            config.span_mode = Some(span);
        }
        if let Some(n) = self.max_pairs {
            config.max_pairs = Some(n);
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(min) = self.min_response_tokens {
            config.min_response_tokens = min;
        }
        if let Some(traces) = &self.traces {
            config.trace_output = Some(traces.clone());
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = cli.experiment_config()?;
    let (first, second) = config.scheme.conditions();

    println!("=== mord-rs: MoE Routing Divergence ===");
    println!("Model:  {}", cli.model);
    println!("Data:   {}", config.data_path.display());
    println!("Pairs:  {first} vs {second} ({:?} span)", config.span_mode());
    println!("Output: {}", cli.output.display());
    if cli.cpu {
        println!("Mode:   CPU (forced)");
    }

    // Load model
    info!("Loading model...");
    let model = MordModel::from_pretrained_with_device(&cli.model, Some(cli.cpu))?;
    info!(
        "Model: {} layers, {} hidden",
        model.n_layers(),
        model.d_model()
    );

    let experiment = Experiment::new(model, config);
    let results = experiment.run()?;

    // Print results
    let summary = &results.summary;
    println!("\n=== Sweep ===");
    println!("Pairs:     {}", summary.pairs_total);
    println!("Processed: {}", summary.pairs_processed);
    println!(
        "Skipped:   {} (span not found: {}, too short: {}, failed: {})",
        summary.skipped(),
        summary.skipped_span_not_found,
        summary.skipped_too_short,
        summary.skipped_failed
    );

    println!("\n=== RD = p({first}) - p({second}) ===\n");
    print!("{}", results.report);

    if !results.instability.is_empty() {
        println!("\n=== Mean experts changed per token ===");
        for (layer, mean) in &results.instability {
            println!("Layer {layer}: {mean:.4}");
        }
    }

    // Save results
    std::fs::create_dir_all(&cli.output)?;
    results.save_json(cli.output.join("rd_results.json"))?;

    Ok(())
}
