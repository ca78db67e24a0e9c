use std::ops::Range;

use anyhow::{Context, Result, ensure};
use candle_core::{D, DType, Device, Tensor};

use super::distributed::Comm;
use super::linear::{Linear, conform, random_like};

/// Linear layer whose weight rows (output features) are split across ranks.
///
/// A packed layer concatenates several logical projections along the output
/// axis. Each one is sharded on its own, so a rank holds
/// `[seg0_local | seg1_local | ...]` rather than a contiguous slice of the
/// global matrix.
#[derive(Debug, Clone)]
pub struct ColumnParallelLinear {
    proj: Linear,
    in_features: usize,
    segments: Vec<usize>,
    gather_output: bool,
    comm: Comm,
}

impl ColumnParallelLinear {
    pub fn new(
        comm: &Comm,
        in_features: usize,
        out_features: usize,
        bias: bool,
        gather_output: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Self::packed(
            comm,
            in_features,
            &[out_features],
            bias,
            gather_output,
            dtype,
            device,
        )
    }

    pub fn packed(
        comm: &Comm,
        in_features: usize,
        segments: &[usize],
        bias: bool,
        gather_output: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        ensure!(in_features > 0, "in_features must be positive");
        ensure!(!segments.is_empty(), "column parallel linear needs a segment");
        let mut local_out = 0usize;
        for &segment in segments {
            ensure!(segment > 0, "output segment must be positive");
            local_out += comm
                .shard_size(segment)
                .with_context(|| format!("sharding output features {segment}"))?;
        }
        ensure!(
            !gather_output || segments.len() == 1,
            "packed column parallel output cannot be gathered"
        );
        Ok(Self {
            proj: Linear::zeros(in_features, local_out, bias, dtype, device)?,
            in_features,
            segments: segments.to_vec(),
            gather_output,
            comm: comm.clone(),
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.segments.iter().sum()
    }

    pub fn local_out_features(&self) -> usize {
        self.proj.out_dim()
    }

    pub fn weight(&self) -> &Tensor {
        self.proj.weight()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.proj.bias()
    }

    /// Accepts either this rank's shard or the full, unsharded weight.
    pub fn load_weight(&mut self, weight: &Tensor) -> Result<()> {
        let weight = if weight.dims() == [self.out_features(), self.in_features]
            && self.comm.world_size() > 1
        {
            self.shard_rows(weight)?
        } else {
            weight.clone()
        };
        Ok(self.proj.set_weight(weight)?)
    }

    pub fn load_bias(&mut self, bias: &Tensor) -> Result<()> {
        let bias = if bias.dims() == [self.out_features()] && self.comm.world_size() > 1 {
            self.shard_rows(bias)?
        } else {
            bias.clone()
        };
        Ok(self.proj.set_bias(bias)?)
    }

    /// Splices `weight` into local output rows `rows`. A tensor sized for the
    /// global segment is narrowed to this rank first.
    pub fn load_weight_rows(&mut self, rows: Range<usize>, weight: &Tensor) -> Result<()> {
        let weight = self.narrow_to_local(weight, rows.len())?;
        Ok(self.proj.set_weight_rows(rows, weight)?)
    }

    pub fn load_bias_rows(&mut self, rows: Range<usize>, bias: &Tensor) -> Result<()> {
        let bias = self.narrow_to_local(bias, rows.len())?;
        Ok(self.proj.set_bias_rows(rows, bias)?)
    }

    pub fn randomize(&mut self) -> Result<()> {
        Ok(self.proj.randomize()?)
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = self.proj.forward(x)?;
        if self.gather_output {
            self.comm.all_gather(&y)
        } else {
            Ok(y)
        }
    }

    fn narrow_to_local(&self, tensor: &Tensor, local_rows: usize) -> Result<Tensor> {
        let rows = tensor.dim(0)?;
        if rows == local_rows {
            return Ok(tensor.clone());
        }
        ensure!(
            rows == local_rows * self.comm.world_size(),
            "cannot shard {} rows into {} local rows",
            rows,
            local_rows
        );
        let range = self.comm.shard_range(rows)?;
        Ok(tensor.narrow(0, range.start, range.len())?)
    }

    fn shard_rows(&self, tensor: &Tensor) -> Result<Tensor> {
        let mut parts = Vec::with_capacity(self.segments.len());
        let mut offset = 0usize;
        for &segment in &self.segments {
            let range = self.comm.shard_range(segment)?;
            parts.push(tensor.narrow(0, offset + range.start, range.len())?);
            offset += segment;
        }
        let refs: Vec<&Tensor> = parts.iter().collect();
        Ok(Tensor::cat(&refs, 0)?)
    }
}

/// Linear layer whose weight columns (input features) are split across ranks.
/// Partial products are summed with an all-reduce and the bias is added once,
/// after the reduction.
#[derive(Debug, Clone)]
pub struct RowParallelLinear {
    proj: Linear,
    bias: Option<Tensor>,
    in_features: usize,
    input_is_parallel: bool,
    comm: Comm,
}

impl RowParallelLinear {
    pub fn new(
        comm: &Comm,
        in_features: usize,
        out_features: usize,
        bias: bool,
        input_is_parallel: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        ensure!(out_features > 0, "out_features must be positive");
        let local_in = comm
            .shard_size(in_features)
            .with_context(|| format!("sharding input features {in_features}"))?;
        let bias = if bias {
            Some(Tensor::zeros((out_features,), dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            proj: Linear::zeros(local_in, out_features, false, dtype, device)?,
            bias,
            in_features,
            input_is_parallel,
            comm: comm.clone(),
        })
    }

    pub fn in_features(&self) -> usize {
        self.in_features
    }

    pub fn out_features(&self) -> usize {
        self.proj.out_dim()
    }

    pub fn weight(&self) -> &Tensor {
        self.proj.weight()
    }

    pub fn load_weight(&mut self, weight: &Tensor) -> Result<()> {
        let weight = if weight.dims() == [self.out_features(), self.in_features]
            && self.comm.world_size() > 1
        {
            let range = self.comm.shard_range(self.in_features)?;
            weight.narrow(1, range.start, range.len())?.contiguous()?
        } else {
            weight.clone()
        };
        Ok(self.proj.set_weight(weight)?)
    }

    pub fn load_bias(&mut self, bias: &Tensor) -> Result<()> {
        let current = self
            .bias
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("cannot load bias into linear layer without bias"))?;
        self.bias = Some(conform(current, bias.clone(), "bias")?);
        Ok(())
    }

    pub fn randomize(&mut self) -> Result<()> {
        self.proj.randomize()?;
        if let Some(bias) = self.bias.as_ref() {
            self.bias = Some(random_like(bias)?);
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.input_is_parallel || self.comm.world_size() == 1 {
            x.clone()
        } else {
            let range = self.comm.shard_range(self.in_features)?;
            x.narrow(D::Minus1, range.start, range.len())?.contiguous()?
        };
        let partial = self.proj.forward(&x)?;
        let y = self.comm.all_reduce_sum(&partial)?;
        match &self.bias {
            Some(bias) => Ok(y.broadcast_add(bias)?),
            None => Ok(y),
        }
    }
}

/// Token embedding table with the hidden dimension split across ranks.
#[derive(Debug, Clone)]
pub struct ParallelEmbedding {
    weight: Tensor,
    embedding_dim: usize,
    comm: Comm,
}

impl ParallelEmbedding {
    pub fn new(
        comm: &Comm,
        vocab_size: usize,
        embedding_dim: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        ensure!(vocab_size > 0, "vocab_size must be positive");
        ensure!(embedding_dim > 0, "embedding_dim must be positive");
        let local_dim = comm
            .shard_size(embedding_dim)
            .with_context(|| format!("sharding embedding dim {embedding_dim}"))?;
        Ok(Self {
            weight: Tensor::zeros((vocab_size, local_dim), dtype, device)?,
            embedding_dim,
            comm: comm.clone(),
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn load_weight(&mut self, weight: &Tensor) -> Result<()> {
        let vocab_size = self.weight.dim(0)?;
        let weight = if weight.dims() == [vocab_size, self.embedding_dim]
            && self.comm.world_size() > 1
        {
            let range = self.comm.shard_range(self.embedding_dim)?;
            weight.narrow(1, range.start, range.len())?.contiguous()?
        } else {
            weight.clone()
        };
        self.weight = conform(&self.weight, weight, "embedding weight")?;
        Ok(())
    }

    pub fn randomize(&mut self) -> Result<()> {
        self.weight = random_like(&self.weight)?;
        Ok(())
    }

    /// `tokens` is `[batch, seq]`; returns `[batch, seq, embedding_dim]`.
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        let (batch, seq) = tokens.dims2()?;
        ensure!(batch > 0 && seq > 0, "tokens must not be empty");
        let ids = tokens.to_dtype(DType::U32)?.flatten_all()?;
        let local = self
            .weight
            .index_select(&ids, 0)?
            .reshape((batch, seq, self.weight.dim(1)?))?;
        self.comm.all_gather(&local)
    }
}
