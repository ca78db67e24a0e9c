use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::attention::{AttentionBackend, AttentionParams, CachePosition, KvCache, repeat_kv};
use crate::models::layers::alibi::{alibi_mask, window_mask};

/// Reference backend built from plain candle ops. Scores and softmax run in F32.
#[derive(Debug, Clone, Copy, Default)]
pub struct EagerAttentionBackend;

impl EagerAttentionBackend {
    pub fn new() -> Self {
        Self
    }
}

impl AttentionBackend for EagerAttentionBackend {
    fn name(&self) -> &'static str {
        "eager"
    }

    fn key_value_cache(
        &self,
        key: &Tensor,
        value: &Tensor,
        at: CachePosition,
        num_repeat: usize,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Tensor)> {
        let (batch, seq, _, _) = key.dims4()?;
        cache.store(at.layer, at.start_pos, key, value)?;
        let (keys, values) = cache.load(at.layer, batch, at.start_pos + seq)?;
        Ok((repeat_kv(&keys, num_repeat)?, repeat_kv(&values, num_repeat)?))
    }

    fn multi_head_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        params: &AttentionParams,
    ) -> Result<Tensor> {
        let (batch, seq, q_heads, q_dim) = query.dims4()?;
        let (kv_batch, kv_len, kv_heads, kv_dim) = key.dims4()?;
        ensure!(key.dims() == value.dims(), "key/value shapes must match");
        ensure!(batch == kv_batch, "query and key batch dims must match");
        ensure!(q_heads == params.num_heads, "query head count mismatch");
        ensure!(q_dim == params.head_dim, "query head_dim mismatch");
        ensure!(
            kv_heads == params.effective_kv_heads(),
            "key/value head count mismatch"
        );
        ensure!(kv_dim == params.head_dim, "key/value head_dim mismatch");
        ensure!(kv_len >= seq, "kv_len {} shorter than seq {}", kv_len, seq);
        ensure!(
            q_heads.is_multiple_of(kv_heads),
            "num_heads must be divisible by num_kv_heads"
        );

        let out_dtype = value.dtype();
        let n_rep = q_heads / kv_heads;
        let q = query.to_dtype(DType::F32)?.transpose(1, 2)?.contiguous()?;
        let k = repeat_kv(&key.to_dtype(DType::F32)?, n_rep)?
            .transpose(1, 2)?
            .contiguous()?;
        let v = repeat_kv(&value.to_dtype(DType::F32)?, n_rep)?
            .transpose(1, 2)?
            .contiguous()?;

        let mut scores = q
            .matmul(&k.transpose(2, 3)?.contiguous()?)?
            .affine(params.scale(), 0.0)?;
        if params.is_causal && seq > 1 {
            let causal = causal_mask(seq, kv_len, query.device())?;
            scores = scores.broadcast_add(&causal)?;
        }
        if params.is_alibi {
            let alibi = alibi_mask(
                seq,
                kv_len,
                None,
                params.alibi_heads,
                DType::F32,
                query.device(),
            )?
            .narrow(0, params.head_offset, q_heads)?
            .unsqueeze(0)?;
            scores = scores.broadcast_add(&alibi)?;
        }
        if let Some(mask) = attn_mask
            && mask.elem_count() > 0
        {
            let mask = expand_mask(mask, seq, kv_len, params)?;
            scores = scores.broadcast_add(&mask)?;
        }

        let probs = softmax_last_dim(&scores)?;
        Ok(probs
            .matmul(&v)?
            .to_dtype(out_dtype)?
            .transpose(1, 2)?
            .contiguous()?)
    }
}

/// `[1, 1, seq, kv_len]` mask where query `q` sees keys `0..=q + kv_len - seq`.
fn causal_mask(seq: usize, kv_len: usize, device: &Device) -> Result<Tensor> {
    let offset = kv_len - seq;
    let mut mask = vec![0f32; seq * kv_len];
    for q in 0..seq {
        for k in (q + offset + 1)..kv_len {
            mask[q * kv_len + k] = f32::NEG_INFINITY;
        }
    }
    Ok(Tensor::from_vec(mask, (1, 1, seq, kv_len), device)?)
}

/// Brings a rank 2, 3 (`[heads, ..]`) or 4 (`[batch, heads, ..]`) additive
/// mask to a shape that broadcasts against `[batch, heads, seq, kv_len]`.
fn expand_mask(
    mask: &Tensor,
    seq: usize,
    kv_len: usize,
    params: &AttentionParams,
) -> Result<Tensor> {
    let mask = window_mask(mask, seq, kv_len)?.to_dtype(DType::F32)?;
    let mask = match mask.rank() {
        2 => mask.reshape((1, 1, seq, kv_len))?,
        3 => mask.unsqueeze(0)?,
        4 => mask,
        rank => anyhow::bail!("attention mask must be rank 2, 3 or 4, got {}", rank),
    };
    let heads = mask.dim(1)?;
    if heads == 1 || heads == params.num_heads {
        return Ok(mask);
    }
    ensure!(
        heads == params.alibi_heads,
        "attention mask has {} heads, expected 1, {} or {}",
        heads,
        params.num_heads,
        params.alibi_heads
    );
    Ok(mask.narrow(1, params.head_offset, params.num_heads)?)
}
