//! DeepSeekMoE forward pass with routing capture
//!
//! Covers the DeepSeek-V2 family (multi-head latent attention, YaRN RoPE)
//! and the original DeepSeekMoE layout (plain multi-head attention). Both
//! share the MoE block: the first `first_k_dense_replace` layers use a dense
//! SwiGLU MLP, later layers a softmax top-k gate over routed experts plus
//! always-on shared experts.
//!
//! Each gate's outputs are handed to a [`RoutingObserver`] before the
//! experts run; observing never changes the computation.

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_b, linear_no_bias, Embedding, Linear, RmsNorm, VarBuilder};
use hf_hub::api::sync::ApiRepo;
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::masks::causal_mask;
use crate::model::{MoeBackend, MoeDecoderLayer};
use crate::routing::{LayerId, RoutingModule, RoutingObserver};

/// Model configuration (matches HuggingFace config.json for DeepSeek MoE models)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct DeepseekMoeConfig {
    pub hidden_size: usize,
    pub intermediate_size: usize,
    pub moe_intermediate_size: usize,
    pub num_attention_heads: usize,
    #[serde(default)]
    pub num_key_value_heads: Option<usize>,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,

    pub n_routed_experts: usize,
    pub num_experts_per_tok: usize,
    #[serde(default)]
    pub n_shared_experts: Option<usize>,
    #[serde(default)]
    pub first_k_dense_replace: usize,
    #[serde(default = "default_moe_layer_freq")]
    pub moe_layer_freq: usize,
    #[serde(default)]
    pub norm_topk_prob: bool,
    #[serde(default = "default_routed_scaling_factor")]
    pub routed_scaling_factor: f64,
    #[serde(default = "default_topk_method")]
    pub topk_method: String,
    #[serde(default = "default_scoring_func")]
    pub scoring_func: String,

    // Multi-head latent attention; absent on plain-MHA checkpoints
    #[serde(default)]
    pub q_lora_rank: Option<usize>,
    #[serde(default)]
    pub kv_lora_rank: Option<usize>,
    #[serde(default)]
    pub qk_nope_head_dim: Option<usize>,
    #[serde(default)]
    pub qk_rope_head_dim: Option<usize>,
    #[serde(default)]
    pub v_head_dim: Option<usize>,
    #[serde(default)]
    pub attention_bias: bool,

    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling: Option<RopeScaling>,
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
}

/// YaRN context extension parameters
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RopeScaling {
    #[serde(rename = "type")]
    pub kind: String,
    pub factor: f64,
    #[serde(default = "default_max_position_embeddings")]
    pub original_max_position_embeddings: usize,
    #[serde(default = "default_beta_fast")]
    pub beta_fast: f64,
    #[serde(default = "default_beta_slow")]
    pub beta_slow: f64,
    #[serde(default = "default_mscale")]
    pub mscale: f64,
    #[serde(default)]
    pub mscale_all_dim: f64,
}

fn default_moe_layer_freq() -> usize {
    1
}

fn default_routed_scaling_factor() -> f64 {
    1.0
}

fn default_topk_method() -> String {
    "greedy".to_string()
}

fn default_scoring_func() -> String {
    "softmax".to_string()
}

fn default_rope_theta() -> f64 {
    10_000.0
}

fn default_rms_norm_eps() -> f64 {
    1e-6
}

fn default_max_position_embeddings() -> usize {
    4096
}

fn default_beta_fast() -> f64 {
    32.0
}

fn default_beta_slow() -> f64 {
    1.0
}

fn default_mscale() -> f64 {
    1.0
}

impl DeepseekMoeConfig {
    /// Whether decoder layer `i` carries an MoE block
    pub fn is_moe_layer(&self, i: usize) -> bool {
        self.n_routed_experts > 0
            && i >= self.first_k_dense_replace
            && i % self.moe_layer_freq.max(1) == 0
    }

    /// Latent-attention dimensions, if this is a DeepSeek-V2 style checkpoint
    fn mla_dims(&self) -> Option<MlaDims> {
        Some(MlaDims {
            q_lora_rank: self.q_lora_rank,
            kv_lora_rank: self.kv_lora_rank?,
            nope: self.qk_nope_head_dim?,
            rope: self.qk_rope_head_dim?,
            v_head_dim: self.v_head_dim?,
        })
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.topk_method == "greedy",
            "Unsupported topk_method '{}' (only greedy)",
            self.topk_method
        );
        anyhow::ensure!(
            self.scoring_func == "softmax",
            "Unsupported scoring_func '{}' (only softmax)",
            self.scoring_func
        );
        anyhow::ensure!(
            self.num_experts_per_tok > 0 && self.num_experts_per_tok <= self.n_routed_experts,
            "num_experts_per_tok={} must be in 1..={}",
            self.num_experts_per_tok,
            self.n_routed_experts
        );
        if let Some(scaling) = &self.rope_scaling {
            anyhow::ensure!(
                scaling.kind == "yarn",
                "Unsupported rope_scaling type '{}'",
                scaling.kind
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct MlaDims {
    q_lora_rank: Option<usize>,
    kv_lora_rank: usize,
    nope: usize,
    rope: usize,
    v_head_dim: usize,
}

fn yarn_mscale(scale: f64, mscale: f64) -> f64 {
    if scale <= 1.0 {
        1.0
    } else {
        0.1 * mscale * scale.ln() + 1.0
    }
}

/// Dimension index at which `num_rotations` full turns fit in the original context
fn yarn_correction_dim(num_rotations: f64, dim: usize, base: f64, max_pos: usize) -> f64 {
    (dim as f64 * (max_pos as f64 / (num_rotations * 2.0 * std::f64::consts::PI)).ln())
        / (2.0 * base.ln())
}

/// YaRN blend of interpolated and extrapolated frequencies
fn yarn_inv_freq(dim: usize, base: f64, scaling: &RopeScaling) -> Vec<f64> {
    let half = dim / 2;
    let low = yarn_correction_dim(
        scaling.beta_fast,
        dim,
        base,
        scaling.original_max_position_embeddings,
    )
    .floor()
    .max(0.0);
    let high = yarn_correction_dim(
        scaling.beta_slow,
        dim,
        base,
        scaling.original_max_position_embeddings,
    )
    .ceil()
    .min(dim as f64 - 1.0);
    let high = if high == low { high + 0.001 } else { high };

    (0..half)
        .map(|i| {
            let pos_freq = base.powf((2 * i) as f64 / dim as f64);
            let extra = 1.0 / pos_freq;
            let inter = 1.0 / (scaling.factor * pos_freq);
            let ramp = ((i as f64 - low) / (high - low)).clamp(0.0, 1.0);
            let extra_weight = 1.0 - ramp;
            inter * (1.0 - extra_weight) + extra * extra_weight
        })
        .collect()
}

/// How rotary pairs are laid out within a head
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RopeLayout {
    /// Adjacent pairs `(2i, 2i+1)`
    Interleaved,
    /// Split halves `(i, i + d/2)`
    Halves,
}

/// Rotary Position Embeddings (RoPE), optionally YaRN-scaled
struct RotaryEmbedding {
    cos: Tensor,
    sin: Tensor,
    layout: RopeLayout,
}

impl RotaryEmbedding {
    fn new(
        dim: usize,
        config: &DeepseekMoeConfig,
        layout: RopeLayout,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let (inv_freq, mscale) = match &config.rope_scaling {
            Some(scaling) => (
                yarn_inv_freq(dim, config.rope_theta, scaling),
                yarn_mscale(scaling.factor, scaling.mscale)
                    / yarn_mscale(scaling.factor, scaling.mscale_all_dim),
            ),
            None => (
                (0..dim)
                    .step_by(2)
                    .map(|i| 1.0 / config.rope_theta.powf(i as f64 / dim as f64))
                    .collect(),
                1.0,
            ),
        };
        let inv_freq = Tensor::new(inv_freq, device)?.to_dtype(DType::F32)?;

        let positions: Vec<f32> = (0..config.max_position_embeddings)
            .map(|i| i as f32)
            .collect();
        let positions = Tensor::new(positions, device)?;

        // [max_pos, dim/2]
        let freqs = positions.unsqueeze(1)?.matmul(&inv_freq.unsqueeze(0)?)?;
        let cos = (freqs.cos()? * mscale)?.to_dtype(dtype)?;
        let sin = (freqs.sin()? * mscale)?.to_dtype(dtype)?;

        Ok(Self { cos, sin, layout })
    }

    fn apply(&self, q: &Tensor, k: &Tensor) -> Result<(Tensor, Tensor)> {
        let seq_len = q.dim(2)?;
        anyhow::ensure!(
            seq_len <= self.cos.dim(0)?,
            "Sequence of {seq_len} tokens exceeds max_position_embeddings={}",
            self.cos.dim(0)?
        );
        let cos = self.cos.i(..seq_len)?;
        let sin = self.sin.i(..seq_len)?;

        let rotate = |x: &Tensor| match self.layout {
            RopeLayout::Interleaved => apply_rotary_interleaved(x, &cos, &sin),
            RopeLayout::Halves => apply_rotary_halves(x, &cos, &sin),
        };
        Ok((rotate(q)?, rotate(k)?))
    }
}

fn apply_rotary_interleaved(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (_b, _h, seq_len, head_dim) = x.dims4()?;
    let x_reshape = x.reshape(((), seq_len, head_dim / 2, 2))?;
    let x0 = x_reshape.i((.., .., .., 0))?;
    let x1 = x_reshape.i((.., .., .., 1))?;

    let cos = cos.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?;

    let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
    let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;

    let out = Tensor::stack(&[&out0, &out1], D::Minus1)?;
    Ok(out.reshape(x.shape())?)
}

fn apply_rotary_halves(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let head_dim = x.dim(D::Minus1)?;
    let x0 = x.narrow(D::Minus1, 0, head_dim / 2)?;
    let x1 = x.narrow(D::Minus1, head_dim / 2, head_dim / 2)?;

    let cos = cos.unsqueeze(0)?.unsqueeze(0)?;
    let sin = sin.unsqueeze(0)?.unsqueeze(0)?;

    let out0 = (x0.broadcast_mul(&cos)? - x1.broadcast_mul(&sin)?)?;
    let out1 = (x0.broadcast_mul(&sin)? + x1.broadcast_mul(&cos)?)?;
    Ok(Tensor::cat(&[&out0, &out1], D::Minus1)?)
}

fn repeat_kv(x: Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x);
    }
    let (b, num_kv_heads, seq_len, head_dim) = x.dims4()?;
    let x = x.unsqueeze(2)?;
    let x = x.expand((b, num_kv_heads, n_rep, seq_len, head_dim))?;
    Ok(x.reshape((b, num_kv_heads * n_rep, seq_len, head_dim))?)
}

/// `softmax(q k^T * scale + causal) v`, heads merged back into the last dim
fn scaled_dot_product(q: &Tensor, k: &Tensor, v: &Tensor, scale: f64) -> Result<Tensor> {
    let (b, _h, seq_len, _) = q.dims4()?;
    let attn_weights = (q.matmul(&k.t()?)? * scale)?;

    let mask = causal_mask(seq_len, q.device(), q.dtype())?;
    let attn_weights = attn_weights.broadcast_add(&mask)?;

    let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
    let attn_output = attn_weights.matmul(v)?;
    Ok(attn_output.transpose(1, 2)?.reshape((b, seq_len, ()))?)
}

/// Multi-head attention with grouped query attention (DeepSeekMoE 16B)
struct MhaAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    num_kv_heads: usize,
    head_dim: usize,
}

impl MhaAttention {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let num_kv_heads = config.num_key_value_heads.unwrap_or(num_heads);
        let head_dim = config.hidden_size / num_heads;
        let bias = config.attention_bias;

        Ok(Self {
            q_proj: linear_b(config.hidden_size, num_heads * head_dim, bias, vb.pp("q_proj"))?,
            k_proj: linear_b(config.hidden_size, num_kv_heads * head_dim, bias, vb.pp("k_proj"))?,
            v_proj: linear_b(config.hidden_size, num_kv_heads * head_dim, bias, vb.pp("v_proj"))?,
            o_proj: linear_b(num_heads * head_dim, config.hidden_size, bias, vb.pp("o_proj"))?,
            num_heads,
            num_kv_heads,
            head_dim,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;

        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = self
            .k_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = self
            .v_proj
            .forward(x)?
            .reshape((b, seq_len, self.num_kv_heads, self.head_dim))?
            .transpose(1, 2)?;

        let (q, k) = rotary.apply(&q, &k)?;

        let k = repeat_kv(k, self.num_heads / self.num_kv_heads)?;
        let v = repeat_kv(v, self.num_heads / self.num_kv_heads)?.contiguous()?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_output = scaled_dot_product(&q, &k, &v, scale)?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

/// Query projection of latent attention: direct, or low-rank through a norm
enum QueryProj {
    Direct(Linear),
    LowRank { a: Linear, norm: RmsNorm, b: Linear },
}

impl QueryProj {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            QueryProj::Direct(proj) => Ok(proj.forward(x)?),
            QueryProj::LowRank { a, norm, b } => Ok(b.forward(&norm.forward(&a.forward(x)?)?)?),
        }
    }
}

/// Multi-head latent attention (DeepSeek-V2)
///
/// Keys and values are decompressed from a shared low-rank latent; only a
/// `qk_rope_head_dim` slice of each head carries position, and that slice of
/// the key is shared by all heads.
struct MlaAttention {
    q_proj: QueryProj,
    kv_a_proj_with_mqa: Linear,
    kv_a_layernorm: RmsNorm,
    kv_b_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    dims: MlaDims,
    softmax_scale: f64,
}

impl MlaAttention {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig, dims: MlaDims) -> Result<Self> {
        let num_heads = config.num_attention_heads;
        let q_head_dim = dims.nope + dims.rope;
        let hidden = config.hidden_size;
        let bias = config.attention_bias;

        let q_proj = match dims.q_lora_rank {
            None => QueryProj::Direct(linear_no_bias(
                hidden,
                num_heads * q_head_dim,
                vb.pp("q_proj"),
            )?),
            Some(rank) => QueryProj::LowRank {
                a: linear_b(hidden, rank, bias, vb.pp("q_a_proj"))?,
                norm: candle_nn::rms_norm(rank, config.rms_norm_eps, vb.pp("q_a_layernorm"))?,
                b: linear_no_bias(rank, num_heads * q_head_dim, vb.pp("q_b_proj"))?,
            },
        };

        let kv_a_proj_with_mqa = linear_b(
            hidden,
            dims.kv_lora_rank + dims.rope,
            bias,
            vb.pp("kv_a_proj_with_mqa"),
        )?;
        let kv_a_layernorm = candle_nn::rms_norm(
            dims.kv_lora_rank,
            config.rms_norm_eps,
            vb.pp("kv_a_layernorm"),
        )?;
        let kv_b_proj = linear_no_bias(
            dims.kv_lora_rank,
            num_heads * (dims.nope + dims.v_head_dim),
            vb.pp("kv_b_proj"),
        )?;
        let o_proj = linear_b(num_heads * dims.v_head_dim, hidden, bias, vb.pp("o_proj"))?;

        let mut softmax_scale = 1.0 / (q_head_dim as f64).sqrt();
        if let Some(scaling) = &config.rope_scaling {
            if scaling.mscale_all_dim > 0.0 {
                let m = yarn_mscale(scaling.factor, scaling.mscale_all_dim);
                softmax_scale *= m * m;
            }
        }

        Ok(Self {
            q_proj,
            kv_a_proj_with_mqa,
            kv_a_layernorm,
            kv_b_proj,
            o_proj,
            num_heads,
            dims,
            softmax_scale,
        })
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        let (b, seq_len, _) = x.dims3()?;
        let MlaDims {
            kv_lora_rank,
            nope,
            rope,
            v_head_dim,
            ..
        } = self.dims;
        let h = self.num_heads;

        // [b, h, s, nope + rope]
        let q = self
            .q_proj
            .forward(x)?
            .reshape((b, seq_len, h, nope + rope))?
            .transpose(1, 2)?;
        let q_nope = q.narrow(D::Minus1, 0, nope)?;
        let q_pe = q.narrow(D::Minus1, nope, rope)?.contiguous()?;

        let compressed = self.kv_a_proj_with_mqa.forward(x)?;
        let kv_latent = compressed.narrow(D::Minus1, 0, kv_lora_rank)?.contiguous()?;
        // [b, 1, s, rope], shared by every head
        let k_pe = compressed
            .narrow(D::Minus1, kv_lora_rank, rope)?
            .reshape((b, seq_len, 1, rope))?
            .transpose(1, 2)?
            .contiguous()?;

        // [b, h, s, nope + v]
        let kv = self
            .kv_b_proj
            .forward(&self.kv_a_layernorm.forward(&kv_latent)?)?
            .reshape((b, seq_len, h, nope + v_head_dim))?
            .transpose(1, 2)?;
        let k_nope = kv.narrow(D::Minus1, 0, nope)?;
        let v = kv.narrow(D::Minus1, nope, v_head_dim)?.contiguous()?;

        let (q_pe, k_pe) = rotary.apply(&q_pe, &k_pe)?;
        let k_pe = k_pe.broadcast_as((b, h, seq_len, rope))?.contiguous()?;
        let q_nope = q_nope.contiguous()?;
        let k_nope = k_nope.contiguous()?;

        let q = Tensor::cat(&[&q_nope, &q_pe], D::Minus1)?.contiguous()?;
        let k = Tensor::cat(&[&k_nope, &k_pe], D::Minus1)?.contiguous()?;

        let attn_output = scaled_dot_product(&q, &k, &v, self.softmax_scale)?;
        Ok(self.o_proj.forward(&attn_output)?)
    }
}

enum Attention {
    Mha(MhaAttention),
    Mla(MlaAttention),
}

impl Attention {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig) -> Result<Self> {
        match config.mla_dims() {
            Some(dims) => Ok(Attention::Mla(MlaAttention::load(vb, config, dims)?)),
            None => Ok(Attention::Mha(MhaAttention::load(vb, config)?)),
        }
    }

    fn forward(&self, x: &Tensor, rotary: &RotaryEmbedding) -> Result<Tensor> {
        match self {
            Attention::Mha(attn) => attn.forward(x, rotary),
            Attention::Mla(attn) => attn.forward(x, rotary),
        }
    }
}

/// SwiGLU MLP, used for dense layers, routed experts and shared experts
#[allow(clippy::upper_case_acronyms)]
struct MLP {
    gate_proj: Linear,
    up_proj: Linear,
    down_proj: Linear,
}

impl MLP {
    fn load(vb: VarBuilder, hidden_size: usize, intermediate_size: usize) -> Result<Self> {
        Ok(Self {
            gate_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("gate_proj"))?,
            up_proj: linear_no_bias(hidden_size, intermediate_size, vb.pp("up_proj"))?,
            down_proj: linear_no_bias(intermediate_size, hidden_size, vb.pp("down_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // SwiGLU: down(silu(gate(x)) * up(x))
        let gate = candle_nn::ops::silu(&self.gate_proj.forward(x)?)?;
        let up = self.up_proj.forward(x)?;
        Ok(self.down_proj.forward(&(gate * up)?)?)
    }
}

/// Softmax top-k router of one MoE block.
///
/// Routing is computed in f32 regardless of the model dtype.
pub struct TopKGate {
    weight: Tensor,
    top_k: usize,
    n_experts: usize,
    norm_topk_prob: bool,
    routed_scaling_factor: f64,
}

impl TopKGate {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig) -> Result<Self> {
        let weight = vb.get_with_hints(
            (config.n_routed_experts, config.hidden_size),
            "weight",
            candle_nn::init::DEFAULT_KAIMING_NORMAL,
        )?;
        Ok(Self {
            weight,
            top_k: config.num_experts_per_tok,
            n_experts: config.n_routed_experts,
            norm_topk_prob: config.norm_topk_prob,
            routed_scaling_factor: config.routed_scaling_factor,
        })
    }

    /// Expert ids `[b, s, k]` (u32) and their weights `[b, s, k]` (f32)
    fn select(&self, hidden: &Tensor) -> Result<(Tensor, Tensor)> {
        let (b, seq_len, d) = hidden.dims3()?;
        let flat = hidden.reshape((b * seq_len, d))?.to_dtype(DType::F32)?;
        let logits = flat.matmul(&self.weight.to_dtype(DType::F32)?.t()?)?;
        let scores = candle_nn::ops::softmax_last_dim(&logits)?;

        let idx = scores
            .arg_sort_last_dim(false)?
            .narrow(D::Minus1, 0, self.top_k)?
            .contiguous()?;
        let weights = scores.gather(&idx, D::Minus1)?;

        let weights = if self.top_k > 1 && self.norm_topk_prob {
            let denom = (weights.sum_keepdim(D::Minus1)? + 1e-20)?;
            weights.broadcast_div(&denom)?
        } else {
            (weights * self.routed_scaling_factor)?
        };

        Ok((
            idx.reshape((b, seq_len, self.top_k))?,
            weights.reshape((b, seq_len, self.top_k))?,
        ))
    }
}

impl RoutingModule for TopKGate {
    fn top_k(&self) -> usize {
        self.top_k
    }

    fn n_experts(&self) -> usize {
        self.n_experts
    }

    fn route(&self, hidden: &Tensor) -> Result<Vec<Tensor>> {
        let (idx, weights) = self.select(hidden)?;
        Ok(vec![idx, weights])
    }
}

/// Routed experts plus shared experts
struct MoeBlock {
    gate: TopKGate,
    experts: Vec<MLP>,
    shared_experts: Option<MLP>,
}

impl MoeBlock {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig) -> Result<Self> {
        let gate = TopKGate::load(vb.pp("gate"), config)?;

        let vb_experts = vb.pp("experts");
        let experts = (0..config.n_routed_experts)
            .map(|j| {
                MLP::load(
                    vb_experts.pp(j.to_string()),
                    config.hidden_size,
                    config.moe_intermediate_size,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let shared_experts = match config.n_shared_experts {
            Some(n) if n > 0 => Some(MLP::load(
                vb.pp("shared_experts"),
                config.hidden_size,
                config.moe_intermediate_size * n,
            )?),
            _ => None,
        };

        Ok(Self {
            gate,
            experts,
            shared_experts,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        layer: LayerId,
        observer: &mut dyn RoutingObserver,
    ) -> Result<Tensor> {
        let (b, seq_len, d) = x.dims3()?;
        let outputs = self.gate.route(x)?;
        observer.observe(layer, &outputs)?;

        let [idx, weights] = outputs.as_slice() else {
            anyhow::bail!("Gate of {layer} returned {} outputs, expected 2", outputs.len());
        };
        let k = self.gate.top_k;
        let idx: Vec<Vec<u32>> = idx.reshape((b * seq_len, k))?.to_vec2()?;
        let weights: Vec<Vec<f32>> = weights.reshape((b * seq_len, k))?.to_vec2()?;

        // Token rows and routing weights per expert
        let mut assigned: Vec<(Vec<u32>, Vec<f32>)> = vec![(Vec::new(), Vec::new()); self.experts.len()];
        for (row, (ids, ws)) in idx.iter().zip(&weights).enumerate() {
            for (&e, &w) in ids.iter().zip(ws) {
                let slot = assigned
                    .get_mut(e as usize)
                    .ok_or_else(|| anyhow::anyhow!("Gate of {layer} selected unknown expert {e}"))?;
                slot.0.push(row as u32);
                slot.1.push(w);
            }
        }

        let flat = x.reshape((b * seq_len, d))?;
        let mut out = flat.zeros_like()?;
        for (expert, (rows, ws)) in self.experts.iter().zip(&assigned) {
            if rows.is_empty() {
                continue;
            }
            let rows = Tensor::new(rows.as_slice(), x.device())?;
            let ws = Tensor::new(ws.as_slice(), x.device())?
                .to_dtype(x.dtype())?
                .unsqueeze(1)?;
            let y = expert.forward(&flat.index_select(&rows, 0)?)?;
            out = out.index_add(&rows, &y.broadcast_mul(&ws)?, 0)?;
        }

        let out = out.reshape((b, seq_len, d))?;
        match &self.shared_experts {
            Some(shared) => Ok((out + shared.forward(x)?)?),
            None => Ok(out),
        }
    }
}

enum FeedForward {
    Dense(MLP),
    Moe(MoeBlock),
}

/// Single decoder layer
struct DecoderLayer {
    self_attn: Attention,
    mlp: FeedForward,
    input_layernorm: RmsNorm,
    post_attention_layernorm: RmsNorm,
}

impl DecoderLayer {
    fn load(vb: VarBuilder, config: &DeepseekMoeConfig, index: usize) -> Result<Self> {
        let self_attn = Attention::load(vb.pp("self_attn"), config)?;
        let mlp = if config.is_moe_layer(index) {
            FeedForward::Moe(MoeBlock::load(vb.pp("mlp"), config)?)
        } else {
            FeedForward::Dense(MLP::load(
                vb.pp("mlp"),
                config.hidden_size,
                config.intermediate_size,
            )?)
        };
        let input_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("input_layernorm"),
        )?;
        let post_attention_layernorm = candle_nn::rms_norm(
            config.hidden_size,
            config.rms_norm_eps,
            vb.pp("post_attention_layernorm"),
        )?;

        Ok(Self {
            self_attn,
            mlp,
            input_layernorm,
            post_attention_layernorm,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        rotary: &RotaryEmbedding,
        layer: LayerId,
        observer: &mut dyn RoutingObserver,
    ) -> Result<Tensor> {
        // Pre-norm architecture
        let residual = x;
        let x = self.input_layernorm.forward(x)?;
        let x = self.self_attn.forward(&x, rotary)?;
        let x = (residual + x)?;

        let residual = &x;
        let h = self.post_attention_layernorm.forward(&x)?;
        let h = match &self.mlp {
            FeedForward::Dense(mlp) => mlp.forward(&h)?,
            FeedForward::Moe(moe) => moe.forward(&h, layer, observer)?,
        };
        Ok((residual + h)?)
    }
}

impl MoeDecoderLayer for DecoderLayer {
    fn moe_gate(&self) -> Option<&dyn RoutingModule> {
        match &self.mlp {
            FeedForward::Moe(moe) => Some(&moe.gate),
            FeedForward::Dense(_) => None,
        }
    }
}

/// Safetensors index for sharded models
#[derive(Debug, serde::Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

/// Download a single or sharded safetensors checkpoint
fn fetch_weights(repo: &ApiRepo) -> Result<Vec<PathBuf>> {
    if let Ok(index_path) = repo.get("model.safetensors.index.json") {
        info!("Model is sharded, loading index...");
        let index_str = std::fs::read_to_string(&index_path).context("Failed to read index")?;
        let index: SafetensorsIndex = serde_json::from_str(&index_str)?;

        let mut shard_names: Vec<String> = index.weight_map.values().cloned().collect();
        shard_names.sort();
        shard_names.dedup();

        info!("Downloading {} shard files...", shard_names.len());
        shard_names
            .iter()
            .map(|name| {
                repo.get(name)
                    .with_context(|| format!("Failed to download {name}"))
            })
            .collect()
    } else {
        let path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        Ok(vec![path])
    }
}

/// DeepSeek MoE decoder with routing capture
pub struct MordDeepseekMoe {
    embed_tokens: Embedding,
    layers: Vec<DecoderLayer>,
    norm: RmsNorm,
    rotary: RotaryEmbedding,
    n_layers: usize,
    hidden_size: usize,
    vocab_size: usize,
}

impl MordDeepseekMoe {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading DeepSeek MoE from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: DeepseekMoeConfig = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} routed experts (top-{}), {} vocab",
            config.num_hidden_layers,
            config.hidden_size,
            config.n_routed_experts,
            config.num_experts_per_tok,
            config.vocab_size
        );

        let weights_paths = fetch_weights(&repo)?;
        info!("Loading weights from {} file(s)...", weights_paths.len());

        // SAFETY: the mmapped files are not modified while the model is alive
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&weights_paths, dtype, device)? };
        Self::new(&config, vb)
    }

    /// Build from a config and a root var builder (weights under `model.`)
    pub fn new(config: &DeepseekMoeConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let vb_model = vb.pp("model");

        let embed_tokens = embedding(
            config.vocab_size,
            config.hidden_size,
            vb_model.pp("embed_tokens"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            if (i + 1) % 10 == 0 || i == 0 {
                info!("Loading layer {}/{}", i + 1, config.num_hidden_layers);
            }
            layers.push(DecoderLayer::load(
                vb_model.pp(format!("layers.{i}")),
                config,
                i,
            )?);
        }

        let norm =
            candle_nn::rms_norm(config.hidden_size, config.rms_norm_eps, vb_model.pp("norm"))?;

        let (rope_dim, layout) = match config.mla_dims() {
            Some(dims) => (dims.rope, RopeLayout::Interleaved),
            None => (
                config.hidden_size / config.num_attention_heads,
                RopeLayout::Halves,
            ),
        };
        let rotary = RotaryEmbedding::new(rope_dim, config, layout, vb.device(), vb.dtype())?;

        let n_moe = (0..config.num_hidden_layers)
            .filter(|&i| config.is_moe_layer(i))
            .count();
        info!(
            "Model loaded successfully with {} layers ({} MoE)",
            config.num_hidden_layers, n_moe
        );

        Ok(Self {
            embed_tokens,
            layers,
            norm,
            rotary,
            n_layers: config.num_hidden_layers,
            hidden_size: config.hidden_size,
            vocab_size: config.vocab_size,
        })
    }
}

impl MoeBackend for MordDeepseekMoe {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.hidden_size
    }

    fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    fn decoder_layers(&self) -> Option<Vec<&dyn MoeDecoderLayer>> {
        Some(
            self.layers
                .iter()
                .map(|layer| layer as &dyn MoeDecoderLayer)
                .collect(),
        )
    }

    fn forward_with_routing(
        &self,
        input_ids: &Tensor,
        observer: &mut dyn RoutingObserver,
    ) -> Result<Tensor> {
        let mut hidden = self.embed_tokens.forward(input_ids)?;

        for (i, layer) in self.layers.iter().enumerate() {
            hidden = layer.forward(&hidden, &self.rotary, LayerId::gate(i), observer)?;
        }
        debug!("Forward pass over {} tokens done", hidden.dim(1)?);

        Ok(self.norm.forward(&hidden)?)
    }
}
