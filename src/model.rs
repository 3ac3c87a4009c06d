//! MordModel wrapper for routing capture
//!
//! Pairs a MoE backend with a chat encoder and runs teacher-forced forward
//! passes with a [`RouterTracer`] armed.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::Tokenizer;
use tracing::info;

use crate::chat::{ChatEncoder, ChatMessage, ChatTemplate, ChatTokenizer};
use crate::forward_deepseek_moe::MordDeepseekMoe;
use crate::routing::{NoopObserver, RouterTracer, RoutingModule, RoutingObserver, RunTrace};

/// One decoder layer as seen by the router tracer.
///
/// Layers without a mixture-of-experts block (e.g. the leading dense layers
/// of DeepSeekMoE) return `None`.
pub trait MoeDecoderLayer {
    fn moe_gate(&self) -> Option<&dyn RoutingModule>;
}

/// Backend trait for MoE model architectures.
///
/// The tracer discovers routing modules only through
/// [`decoder_layers`](Self::decoder_layers); backends without a layer
/// container return `None` and cannot be traced.
pub trait MoeBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    // --- Structure ---
    fn decoder_layers(&self) -> Option<Vec<&dyn MoeDecoderLayer>>;

    // --- Forward passes ---

    /// Full-sequence forward pass; every gate's outputs go to `observer`
    /// before the experts run. Returns final-normed hidden states.
    fn forward_with_routing(
        &self,
        input_ids: &Tensor,
        observer: &mut dyn RoutingObserver,
    ) -> Result<Tensor>;

    fn forward(&self, input_ids: &Tensor) -> Result<Tensor> {
        self.forward_with_routing(input_ids, &mut NoopObserver)
    }
}

/// High-level model wrapper for routing experiments
pub struct MordModel {
    model: Box<dyn MoeBackend>,
    encoder: Box<dyn ChatEncoder>,
    device: Device,
    model_id: String,
}

impl MordModel {
    /// Load a model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let (device, dtype) = if force_cpu == Some(true) {
            info!("Forcing CPU mode");
            (Device::Cpu, DType::F32)
        } else {
            match Device::cuda_if_available(0) {
                Ok(dev) if dev.is_cuda() => {
                    info!("Using CUDA device");
                    (dev, DType::BF16)
                }
                _ => {
                    info!("CUDA not available, using CPU");
                    (Device::Cpu, DType::F32)
                }
            }
        };

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);
        info!("Dtype: {:?}", dtype);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let template = ChatTemplate::from_model_id(model_id);
        info!("Chat template: {:?}", template);

        let model = MordDeepseekMoe::load(model_id, &device, dtype)?;

        Ok(Self {
            model: Box::new(model),
            encoder: Box::new(ChatTokenizer::new(tokenizer, template)),
            device,
            model_id: model_id.to_string(),
        })
    }

    /// Assemble from an already-built backend and encoder
    pub fn new(
        model: Box<dyn MoeBackend>,
        encoder: Box<dyn ChatEncoder>,
        device: Device,
        model_id: &str,
    ) -> Self {
        Self {
            model,
            encoder,
            device,
            model_id: model_id.to_string(),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn n_layers(&self) -> usize {
        self.model.n_layers()
    }

    pub fn d_model(&self) -> usize {
        self.model.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.model.vocab_size()
    }

    pub fn encoder(&self) -> &dyn ChatEncoder {
        &*self.encoder
    }

    pub fn backend(&self) -> &dyn MoeBackend {
        &*self.model
    }

    /// Attach a router tracer to this model's gates
    pub fn attach_tracer(&self) -> Result<RouterTracer> {
        RouterTracer::attach(&*self.model)
    }

    /// Tokenize a conversation with the model's chat template
    pub fn encode_chat(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<Vec<u32>> {
        self.encoder.encode_chat(messages, add_generation_prompt)
    }

    /// Tokenize raw text without special tokens
    pub fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        self.encoder.encode_text(text)
    }

    /// Teacher-forced forward pass over `input_ids` with the tracer armed
    pub fn trace_run(
        &self,
        tracer: &mut RouterTracer,
        input_ids: &[u32],
        example_id: &str,
        run_tag: &str,
    ) -> Result<RunTrace> {
        anyhow::ensure!(!input_ids.is_empty(), "Empty input for '{example_id}'");
        let input_tensor = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;

        let mut run = tracer.start(example_id, run_tag);
        self.model.forward_with_routing(&input_tensor, &mut run)?;
        let trace = run.stop();

        trace.validate_layout()?;
        Ok(trace)
    }
}
