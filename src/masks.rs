//! Additive causal masks for full-sequence attention
//!
//! One mask per sequence length, device and dtype, shared by every attention
//! layer of a forward pass and reused by later pairs of the same length.
//! Cached tensors are shallow clones of a single storage.

use anyhow::Result;
use candle_core::{DType, Device, DeviceLocation, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex, MutexGuard};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct MaskKey {
    seq_len: usize,
    /// Device kind and ordinal
    device: (u8, usize),
    dtype: DType,
}

impl MaskKey {
    fn new(seq_len: usize, device: &Device, dtype: DType) -> Self {
        let device = match device.location() {
            DeviceLocation::Cpu => (0, 0),
            DeviceLocation::Cuda { gpu_id } => (1, gpu_id),
            DeviceLocation::Metal { gpu_id } => (2, gpu_id),
        };
        Self {
            seq_len,
            device,
            dtype,
        }
    }
}

static MASKS: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> = LazyLock::new(Default::default);

/// A poisoned lock still guards complete tensors
fn masks() -> MutexGuard<'static, HashMap<MaskKey, Tensor>> {
    MASKS.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// `[1, 1, seq_len, seq_len]` mask added to attention scores: `0` where the
/// key position is at or before the query position, `-inf` after it.
pub fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let key = MaskKey::new(seq_len, device, dtype);
    if let Some(mask) = masks().get(&key) {
        return Ok(mask.clone());
    }

    let visible = Tensor::tril2(seq_len, DType::U8, device)?;
    let open = Tensor::zeros((seq_len, seq_len), dtype, device)?;
    let blocked = Tensor::full(f32::NEG_INFINITY, (seq_len, seq_len), device)?.to_dtype(dtype)?;
    let mask = visible
        .where_cond(&open, &blocked)?
        .reshape((1, 1, seq_len, seq_len))?;

    masks().insert(key, mask.clone());
    Ok(mask)
}

/// Drop every cached mask
pub fn clear_masks() {
    masks().clear();
}

pub fn cached_masks() -> usize {
    masks().len()
}
