use anyhow::{Result, ensure};
use candle_core::Tensor;

use super::cache::KvCache;

/// Head configuration of one attention call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AttentionParams {
    /// Query heads handled by this call.
    pub num_heads: usize,
    /// Key/value heads; 0 means the same as `num_heads`.
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub is_causal: bool,
    pub is_alibi: bool,
    /// Defaults to `1 / sqrt(head_dim)`.
    pub softmax_scale: Option<f64>,
    /// Head count the ALiBi slopes are derived from.
    pub alibi_heads: usize,
    /// Index of the first local head within `alibi_heads`.
    pub head_offset: usize,
}

impl AttentionParams {
    pub fn new(num_heads: usize, num_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            num_heads,
            num_kv_heads,
            head_dim,
            is_causal: true,
            is_alibi: false,
            softmax_scale: None,
            alibi_heads: num_heads,
            head_offset: 0,
        }
    }

    pub fn effective_kv_heads(&self) -> usize {
        if self.num_kv_heads == 0 {
            self.num_heads
        } else {
            self.num_kv_heads
        }
    }

    pub fn scale(&self) -> f64 {
        self.softmax_scale
            .unwrap_or_else(|| 1.0 / (self.head_dim as f64).sqrt())
    }
}

/// Where in the cache a call reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePosition {
    pub layer: usize,
    pub start_pos: usize,
}

pub trait AttentionBackend: std::fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    /// Stores `[batch, seq, kv_heads, dim]` keys/values and returns every
    /// cached position up to and including them, with each kv head repeated
    /// `num_repeat` times.
    fn key_value_cache(
        &self,
        key: &Tensor,
        value: &Tensor,
        at: CachePosition,
        num_repeat: usize,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Tensor)>;

    /// `query` is `[batch, seq, heads, dim]`, `key`/`value` are
    /// `[batch, kv_len, kv_heads, dim]`; returns `[batch, seq, heads, dim]`.
    fn multi_head_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        attn_mask: Option<&Tensor>,
        params: &AttentionParams,
    ) -> Result<Tensor>;

    /// Cache update and attention in one call.
    fn cache_attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        at: CachePosition,
        cache: &mut KvCache,
        attn_mask: Option<&Tensor>,
        params: &AttentionParams,
    ) -> Result<Tensor> {
        let (keys, values) = self.key_value_cache(key, value, at, 1, cache)?;
        self.multi_head_attention(query, &keys, &values, attn_mask, params)
    }
}

/// Repeats every head of a `[batch, seq, heads, dim]` tensor `n_rep` times in place.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    ensure!(n_rep > 0, "n_rep must be positive");
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, seq, heads, dim) = x.dims4()?;
    Ok(x.unsqueeze(3)?
        .broadcast_as((batch, seq, heads, n_rep, dim))?
        .reshape((batch, seq, heads * n_rep, dim))?)
}
