use anyhow::{Result, ensure};
use candle_core::{DType, Device, Tensor};

/// Per-head ALiBi slopes. Head counts that are not a power of two take the
/// slopes of the nearest lower power and fill the rest from the odd entries
/// of the next power's sequence.
pub fn alibi_slopes(num_heads: usize) -> Vec<f32> {
    if num_heads == 0 {
        return Vec::new();
    }
    let closest = 1usize << num_heads.ilog2();
    let base = 2f64.powf(-8.0 / closest as f64);
    let mut slopes: Vec<f32> = (1..=closest)
        .map(|i| base.powi(i as i32) as f32)
        .collect();
    if closest < num_heads {
        let extra_base = 2f64.powf(-8.0 / (2 * closest) as f64);
        slopes.extend(
            (1..2 * closest)
                .step_by(2)
                .take(num_heads - closest)
                .map(|i| extra_base.powi(i as i32) as f32),
        );
    }
    slopes
}

/// Builds the `[num_heads, seq_len, kv_len]` additive ALiBi mask for a
/// query block that ends at the last key position.
///
/// Key `k` gets `slope_h * (k - kv_len + 1)`; keys after the query's own
/// position are `-inf`. `attn_mask` is added on top when given, narrowed to
/// the leading `[seq_len, kv_len]` window.
pub fn alibi_mask(
    seq_len: usize,
    kv_len: usize,
    attn_mask: Option<&Tensor>,
    num_heads: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor> {
    ensure!(seq_len > 0, "alibi seq_len must be positive");
    ensure!(kv_len >= seq_len, "alibi kv_len must be >= seq_len");
    ensure!(num_heads > 0, "alibi num_heads must be positive");
    let offset = kv_len - seq_len;
    let slopes = alibi_slopes(num_heads);
    let mut values = vec![0f32; num_heads * seq_len * kv_len];
    for (head, slope) in slopes.iter().enumerate() {
        for q in 0..seq_len {
            let row = (head * seq_len + q) * kv_len;
            for k in 0..kv_len {
                values[row + k] = if k > q + offset {
                    f32::NEG_INFINITY
                } else {
                    slope * (k as f32 - (kv_len - 1) as f32)
                };
            }
        }
    }
    let mut mask = Tensor::from_vec(values, (num_heads, seq_len, kv_len), device)?;
    if let Some(attn_mask) = attn_mask {
        let attn_mask = window_mask(attn_mask, seq_len, kv_len)?.to_dtype(DType::F32)?;
        mask = mask.broadcast_add(&attn_mask)?;
    }
    Ok(mask.to_dtype(dtype)?)
}

/// Narrows the last two dims of an additive mask to `[seq_len, kv_len]`.
pub fn window_mask(mask: &Tensor, seq_len: usize, kv_len: usize) -> Result<Tensor> {
    ensure!(mask.rank() >= 2, "attention mask must be at least rank 2");
    let rank = mask.rank();
    let rows = mask.dim(rank - 2)?;
    let cols = mask.dim(rank - 1)?;
    ensure!(
        rows >= seq_len && cols >= kv_len,
        "attention mask {:?} is smaller than [{}, {}]",
        mask.dims(),
        seq_len,
        kv_len
    );
    Ok(mask
        .narrow(rank - 2, 0, seq_len)?
        .narrow(rank - 1, 0, kv_len)?)
}
