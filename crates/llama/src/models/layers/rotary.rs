use anyhow::Result;
use anyhow::ensure;
use candle_core::{D, DType, Device, Tensor};

use crate::utils::{RopeScaling, RopeStyle};

/// Rotary embedding over the leading `rotary_dim` dims of every head. Tables
/// are built per call for the positions actually used, which keeps dynamic
/// NTK scaling exact.
#[derive(Debug, Clone)]
pub struct RotaryEmbedding {
    head_dim: usize,
    rotary_dim: usize,
    max_position_embeddings: usize,
    theta: f64,
    style: RopeStyle,
    scaling: RopeScaling,
    scaling_factor: f64,
    device: Device,
}

impl RotaryEmbedding {
    /// Rotates interleaved pairs unless [`RotaryEmbedding::with_style`] says otherwise.
    pub fn new(
        head_dim: usize,
        rotary_dim: usize,
        max_position_embeddings: usize,
        theta: f64,
        scaling: RopeScaling,
        scaling_factor: f64,
        device: &Device,
    ) -> Result<Self> {
        ensure!(
            rotary_dim.is_multiple_of(2) && rotary_dim > 0,
            "rotary_dim must be even and positive"
        );
        ensure!(rotary_dim <= head_dim, "rotary_dim must not exceed head_dim");
        ensure!(
            max_position_embeddings > 0,
            "max_position_embeddings must be positive"
        );
        ensure!(scaling_factor > 0.0, "rope scaling factor must be positive");
        ensure!(
            scaling != RopeScaling::Dynamic || rotary_dim > 2,
            "dynamic rope scaling needs rotary_dim > 2"
        );
        Ok(Self {
            head_dim,
            rotary_dim,
            max_position_embeddings,
            theta,
            style: RopeStyle::default(),
            scaling,
            scaling_factor,
            device: device.clone(),
        })
    }

    pub fn with_style(mut self, style: RopeStyle) -> Self {
        self.style = style;
        self
    }

    fn base_for(&self, total_len: usize) -> f64 {
        match self.scaling {
            RopeScaling::Dynamic if total_len > self.max_position_embeddings => {
                let dim = self.rotary_dim as f64;
                let ratio = self.scaling_factor * total_len as f64
                    / self.max_position_embeddings as f64
                    - (self.scaling_factor - 1.0);
                self.theta * ratio.powf(dim / (dim - 2.0))
            }
            _ => self.theta,
        }
    }

    /// Returns `(cos, sin)` shaped `[seq_len, rotary_dim / 2]` in F32. Column
    /// `i` is the angle of frequency pair `i`.
    pub fn tables(&self, start_pos: usize, seq_len: usize) -> Result<(Tensor, Tensor)> {
        let half = self.rotary_dim / 2;
        let base = self.base_for(start_pos + seq_len);
        let inv_freq: Vec<f32> = (0..half)
            .map(|i| 1f32 / base.powf((2 * i) as f64 / self.rotary_dim as f64) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, half), &self.device)?;
        let position_scale = match self.scaling {
            RopeScaling::Linear => 1.0 / self.scaling_factor,
            _ => 1.0,
        };
        let positions: Vec<f32> = (start_pos..start_pos + seq_len)
            .map(|pos| (pos as f64 * position_scale) as f32)
            .collect();
        let positions = Tensor::from_vec(positions, (seq_len, 1), &self.device)?;
        let freqs = positions.matmul(&inv_freq)?;
        Ok((freqs.cos()?, freqs.sin()?))
    }

    /// `query` and `key` are `[batch, seq, heads, head_dim]`; position of
    /// token `t` is `start_pos + t`.
    pub fn forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        start_pos: usize,
    ) -> Result<(Tensor, Tensor)> {
        ensure!(
            query.rank() == 4,
            "query must be rank-4 [batch, seq, heads, dim]"
        );
        ensure!(
            key.rank() == 4,
            "key must be rank-4 [batch, seq, heads, dim]"
        );
        let seq_len = query.dim(1)?;
        ensure!(
            key.dim(1)? == seq_len,
            "query and key seq dims must match for rotary embedding"
        );
        ensure!(
            query.dim(D::Minus1)? == self.head_dim,
            "query last dim must match rotary head_dim"
        );
        ensure!(
            key.dim(D::Minus1)? == self.head_dim,
            "key last dim must match rotary head_dim"
        );
        let (cos, sin) = self.tables(start_pos, seq_len)?;
        let half = self.rotary_dim / 2;
        let cos = cos.reshape((1, seq_len, 1, half))?;
        let sin = sin.reshape((1, seq_len, 1, half))?;
        let query = self.apply(query, &cos, &sin)?;
        let key = self.apply(key, &cos, &sin)?;
        Ok((query, key))
    }

    fn apply(&self, x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let head = x.narrow(D::Minus1, 0, self.rotary_dim)?;
        let rotated = match self.style {
            RopeStyle::Interleaved => rotate_interleaved(&head, cos, sin)?,
            RopeStyle::Half => rotate_half(&head, cos, sin)?,
        };
        let out = if self.rotary_dim == self.head_dim {
            rotated
        } else {
            let tail = x.narrow(D::Minus1, self.rotary_dim, self.head_dim - self.rotary_dim)?;
            Tensor::cat(&[&rotated, &tail], D::Minus1)?
        };
        Ok(out.to_dtype(dtype)?)
    }
}

/// Pairs `x[i]` with `x[i + dim / 2]`.
fn rotate_half(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let dim = x.dim(D::Minus1)?;
    let half = dim / 2;
    let x1 = x.narrow(D::Minus1, 0, half)?;
    let x2 = x.narrow(D::Minus1, half, half)?;
    let y1 = (x1.broadcast_mul(cos)? - x2.broadcast_mul(sin)?)?;
    let y2 = (x2.broadcast_mul(cos)? + x1.broadcast_mul(sin)?)?;
    Ok(Tensor::cat(&[&y1, &y2], D::Minus1)?)
}

/// Pairs `x[2i]` with `x[2i + 1]`.
fn rotate_interleaved(x: &Tensor, cos: &Tensor, sin: &Tensor) -> Result<Tensor> {
    let (batch, seq, heads, dim) = x.dims4()?;
    let pairs = x.reshape((batch, seq, heads, dim / 2, 2))?;
    let even = pairs.narrow(D::Minus1, 0, 1)?;
    let odd = pairs.narrow(D::Minus1, 1, 1)?;
    let cos = cos.unsqueeze(D::Minus1)?;
    let sin = sin.unsqueeze(D::Minus1)?;
    let y_even = (even.broadcast_mul(&cos)? - odd.broadcast_mul(&sin)?)?;
    let y_odd = (odd.broadcast_mul(&cos)? + even.broadcast_mul(&sin)?)?;
    Ok(Tensor::cat(&[&y_even, &y_odd], D::Minus1)?.reshape((batch, seq, heads, dim))?)
}
