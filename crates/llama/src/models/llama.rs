use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

use anyhow::{Result, ensure};
use candle_core::{D, DType, Device, Tensor};
use candle_nn::ops::sigmoid;
use tracing::{debug, info, warn};

use crate::attention::{AttentionBackend, AttentionParams, CachePosition, CacheSpec, KvCache};
use crate::models::layers::{
    ColumnParallelLinear, Comm, ParallelEmbedding, RmsNorm, RotaryEmbedding, RowParallelLinear,
    alibi_mask,
};
use crate::utils::{ModelOptions, ModelParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackedShard {
    Q,
    K,
    V,
    Gate,
    Up,
}

/// An unfused checkpoint module that lands in a row range of a fused one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PackedModuleMapping {
    parent: &'static str,
    source_module: &'static str,
    packed_module: &'static str,
    shard: PackedShard,
}

const PACKED_MODULES: [PackedModuleMapping; 5] = [
    PackedModuleMapping {
        parent: "attention",
        source_module: "wq",
        packed_module: "wqkv",
        shard: PackedShard::Q,
    },
    PackedModuleMapping {
        parent: "attention",
        source_module: "wk",
        packed_module: "wqkv",
        shard: PackedShard::K,
    },
    PackedModuleMapping {
        parent: "attention",
        source_module: "wv",
        packed_module: "wqkv",
        shard: PackedShard::V,
    },
    PackedModuleMapping {
        parent: "feed_forward",
        source_module: "w1",
        packed_module: "wu",
        shard: PackedShard::Gate,
    },
    PackedModuleMapping {
        parent: "feed_forward",
        source_module: "w3",
        packed_module: "wu",
        shard: PackedShard::Up,
    },
];

fn parse_layer_path(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("layers.")?;
    let (layer_idx, tail) = rest.split_once('.')?;
    let layer_idx = layer_idx.parse::<usize>().ok()?;
    Some((layer_idx, tail))
}

/// Outcome of [`Transformer::load_state_dict`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub unused: Vec<String>,
}

impl LoadReport {
    pub fn loaded_count(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_complete(&self) -> bool {
        self.unused.is_empty()
    }
}

/// Per-rank head and feature counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LocalDims {
    heads: usize,
    kv_heads: usize,
    head_dim: usize,
    head_offset: usize,
    intermediate: usize,
}

impl LocalDims {
    fn new(params: &ModelParams, comm: &Comm) -> Result<Self> {
        let heads = comm.shard_size(params.num_heads)?;
        let kv_heads = comm.shard_size(params.num_kv_heads())?;
        Ok(Self {
            heads,
            kv_heads,
            head_dim: params.head_dim(),
            head_offset: comm.rank() * heads,
            intermediate: comm.shard_size(params.intermediate_dim)?,
        })
    }

    fn q_dim(&self) -> usize {
        self.heads * self.head_dim
    }

    fn kv_dim(&self) -> usize {
        self.kv_heads * self.head_dim
    }

    fn kv_repeats(&self) -> usize {
        self.heads / self.kv_heads
    }
}

#[derive(Debug, Clone)]
enum QkvProjection {
    Fused(ColumnParallelLinear),
    Split {
        wq: ColumnParallelLinear,
        wk: ColumnParallelLinear,
        wv: ColumnParallelLinear,
    },
}

#[derive(Debug, Clone)]
struct Attention {
    layer_idx: usize,
    qkv: QkvProjection,
    wo: RowParallelLinear,
    rotary: Option<RotaryEmbedding>,
    backend: Arc<dyn AttentionBackend>,
    dims: LocalDims,
    num_heads: usize,
    auto_causal: bool,
    fused_kvcache: bool,
    fused_alibi: bool,
    friendly_gqa: bool,
}

impl Attention {
    fn new(
        layer_idx: usize,
        params: &ModelParams,
        options: &ModelOptions,
        comm: &Comm,
        backend: Arc<dyn AttentionBackend>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let dims = LocalDims::new(params, comm)?;
        let head_dim = params.head_dim();
        let q_out = params.num_heads * head_dim;
        let kv_out = params.num_kv_heads() * head_dim;
        let bias = options.attn_wqkv_bias_term;
        let qkv = if options.fused_qkv {
            QkvProjection::Fused(ColumnParallelLinear::packed(
                comm,
                params.hidden_dim,
                &[q_out, kv_out, kv_out],
                bias,
                false,
                dtype,
                device,
            )?)
        } else {
            let column = |out| {
                ColumnParallelLinear::new(comm, params.hidden_dim, out, bias, false, dtype, device)
            };
            QkvProjection::Split {
                wq: column(q_out)?,
                wk: column(kv_out)?,
                wv: column(kv_out)?,
            }
        };
        let wo = RowParallelLinear::new(
            comm,
            q_out,
            params.hidden_dim,
            options.attn_wo_bias_term,
            true,
            dtype,
            device,
        )?;
        let rotary = if options.with_rope {
            let (scaling, scaling_factor) = params.resolved_rope_scaling()?;
            let rotary = RotaryEmbedding::new(
                head_dim,
                options.resolved_rotary_dim(head_dim)?,
                params.max_position_embeddings,
                params.rope_theta,
                scaling,
                scaling_factor,
                device,
            )?;
            Some(rotary.with_style(params.rope_style))
        } else {
            None
        };
        Ok(Self {
            layer_idx,
            qkv,
            wo,
            rotary,
            backend,
            dims,
            num_heads: params.num_heads,
            auto_causal: params.auto_causal,
            fused_kvcache: options.fused_kvcache,
            fused_alibi: options.with_alibi && options.fused_alibi,
            friendly_gqa: options.friendly_gqa,
        })
    }

    fn params(&self, num_kv_heads: usize) -> AttentionParams {
        AttentionParams {
            is_causal: self.auto_causal,
            is_alibi: self.fused_alibi,
            alibi_heads: self.num_heads,
            head_offset: self.dims.head_offset,
            ..AttentionParams::new(self.dims.heads, num_kv_heads, self.dims.head_dim)
        }
    }

    fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (batch, seq, _) = x.dims3()?;
        let head_dim = self.dims.head_dim;
        let (q, k, v) = match &self.qkv {
            QkvProjection::Fused(wqkv) => {
                let qkv = wqkv
                    .forward(x)?
                    .reshape((batch, seq, (), head_dim))?;
                let q = qkv.narrow(2, 0, self.dims.heads)?;
                let k = qkv.narrow(2, self.dims.heads, self.dims.kv_heads)?;
                let v = qkv.narrow(2, self.dims.heads + self.dims.kv_heads, self.dims.kv_heads)?;
                (q, k, v)
            }
            QkvProjection::Split { wq, wk, wv } => (
                wq.forward(x)?.reshape((batch, seq, (), head_dim))?,
                wk.forward(x)?.reshape((batch, seq, (), head_dim))?,
                wv.forward(x)?.reshape((batch, seq, (), head_dim))?,
            ),
        };
        Ok((q.contiguous()?, k.contiguous()?, v.contiguous()?))
    }

    fn forward(
        &self,
        x: &Tensor,
        attn_mask: Option<&Tensor>,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let (batch, seq, _) = x.dims3()?;
        let (q, k, v) = self.project(x)?;
        let (q, k) = match &self.rotary {
            Some(rotary) => rotary.forward(&q, &k, start_pos)?,
            None => (q, k),
        };
        let at = CachePosition {
            layer: self.layer_idx,
            start_pos,
        };
        let attn = if self.fused_kvcache {
            let params = self.params(self.dims.kv_heads);
            self.backend
                .cache_attention(&q, &k, &v, at, cache, attn_mask, &params)?
        } else {
            let (num_repeat, num_kv_heads) = if self.friendly_gqa {
                (self.dims.kv_repeats(), 0)
            } else {
                (1, self.dims.kv_heads)
            };
            let (keys, values) = self
                .backend
                .key_value_cache(&k, &v, at, num_repeat, cache)?;
            self.backend.multi_head_attention(
                &q,
                &keys,
                &values,
                attn_mask,
                &self.params(num_kv_heads),
            )?
        };
        self.wo
            .forward(&attn.reshape((batch, seq, self.dims.q_dim()))?)
    }

    fn load_weight(&mut self, name: &str, tensor: &Tensor) -> Result<bool> {
        match (&mut self.qkv, name) {
            (QkvProjection::Fused(wqkv), "wqkv.weight") => wqkv.load_weight(tensor)?,
            (QkvProjection::Fused(wqkv), "wqkv.bias") => wqkv.load_bias(tensor)?,
            (QkvProjection::Split { wq, .. }, "wq.weight") => wq.load_weight(tensor)?,
            (QkvProjection::Split { wq, .. }, "wq.bias") => wq.load_bias(tensor)?,
            (QkvProjection::Split { wk, .. }, "wk.weight") => wk.load_weight(tensor)?,
            (QkvProjection::Split { wk, .. }, "wk.bias") => wk.load_bias(tensor)?,
            (QkvProjection::Split { wv, .. }, "wv.weight") => wv.load_weight(tensor)?,
            (QkvProjection::Split { wv, .. }, "wv.bias") => wv.load_bias(tensor)?,
            (_, "wo.weight") => self.wo.load_weight(tensor)?,
            (_, "wo.bias") => self.wo.load_bias(tensor)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn load_qkv_packed_shard(
        &mut self,
        packed_name: &str,
        shard: PackedShard,
        tensor: &Tensor,
    ) -> Result<bool> {
        let QkvProjection::Fused(wqkv) = &mut self.qkv else {
            return Ok(false);
        };
        let q = self.dims.q_dim();
        let kv = self.dims.kv_dim();
        let rows: Range<usize> = match shard {
            PackedShard::Q => 0..q,
            PackedShard::K => q..q + kv,
            PackedShard::V => q + kv..q + 2 * kv,
            PackedShard::Gate | PackedShard::Up => return Ok(false),
        };
        match packed_name {
            "wqkv.weight" => wqkv.load_weight_rows(rows, tensor)?,
            "wqkv.bias" => wqkv.load_bias_rows(rows, tensor)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn randomize(&mut self) -> Result<()> {
        match &mut self.qkv {
            QkvProjection::Fused(wqkv) => wqkv.randomize()?,
            QkvProjection::Split { wq, wk, wv } => {
                wq.randomize()?;
                wk.randomize()?;
                wv.randomize()?;
            }
        }
        self.wo.randomize()
    }
}

#[derive(Debug, Clone)]
enum GateUpProjection {
    Fused(ColumnParallelLinear),
    Split {
        w1: ColumnParallelLinear,
        w3: ColumnParallelLinear,
    },
}

#[derive(Debug, Clone)]
struct FeedForward {
    gate_up: GateUpProjection,
    w2: RowParallelLinear,
    local_intermediate: usize,
}

impl FeedForward {
    fn new(
        params: &ModelParams,
        options: &ModelOptions,
        comm: &Comm,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let hidden = params.hidden_dim;
        let imm = params.intermediate_dim;
        let bias = options.ffn_linear_bias_term;
        let gate_up = if options.fused_ffn_glu {
            GateUpProjection::Fused(ColumnParallelLinear::packed(
                comm,
                hidden,
                &[imm, imm],
                bias,
                false,
                dtype,
                device,
            )?)
        } else {
            GateUpProjection::Split {
                w1: ColumnParallelLinear::new(comm, hidden, imm, bias, false, dtype, device)?,
                w3: ColumnParallelLinear::new(comm, hidden, imm, bias, false, dtype, device)?,
            }
        };
        Ok(Self {
            gate_up,
            w2: RowParallelLinear::new(comm, imm, hidden, bias, true, dtype, device)?,
            local_intermediate: comm.shard_size(imm)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (gate, up) = match &self.gate_up {
            GateUpProjection::Fused(wu) => {
                let gate_up = wu.forward(x)?;
                (
                    gate_up.narrow(D::Minus1, 0, self.local_intermediate)?,
                    gate_up.narrow(D::Minus1, self.local_intermediate, self.local_intermediate)?,
                )
            }
            GateUpProjection::Split { w1, w3 } => (w1.forward(x)?, w3.forward(x)?),
        };
        let gated = gate.broadcast_mul(&sigmoid(&gate)?)?;
        self.w2.forward(&gated.broadcast_mul(&up)?)
    }

    fn load_weight(&mut self, name: &str, tensor: &Tensor) -> Result<bool> {
        match (&mut self.gate_up, name) {
            (GateUpProjection::Fused(wu), "wu.weight") => wu.load_weight(tensor)?,
            (GateUpProjection::Fused(wu), "wu.bias") => wu.load_bias(tensor)?,
            (GateUpProjection::Split { w1, .. }, "w1.weight") => w1.load_weight(tensor)?,
            (GateUpProjection::Split { w1, .. }, "w1.bias") => w1.load_bias(tensor)?,
            (GateUpProjection::Split { w3, .. }, "w3.weight") => w3.load_weight(tensor)?,
            (GateUpProjection::Split { w3, .. }, "w3.bias") => w3.load_bias(tensor)?,
            (_, "w2.weight") => self.w2.load_weight(tensor)?,
            (_, "w2.bias") => self.w2.load_bias(tensor)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn load_gate_up_packed_shard(
        &mut self,
        packed_name: &str,
        shard: PackedShard,
        tensor: &Tensor,
    ) -> Result<bool> {
        let GateUpProjection::Fused(wu) = &mut self.gate_up else {
            return Ok(false);
        };
        let imm = self.local_intermediate;
        let rows: Range<usize> = match shard {
            PackedShard::Gate => 0..imm,
            PackedShard::Up => imm..2 * imm,
            PackedShard::Q | PackedShard::K | PackedShard::V => return Ok(false),
        };
        match packed_name {
            "wu.weight" => wu.load_weight_rows(rows, tensor)?,
            "wu.bias" => wu.load_bias_rows(rows, tensor)?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn randomize(&mut self) -> Result<()> {
        match &mut self.gate_up {
            GateUpProjection::Fused(wu) => wu.randomize()?,
            GateUpProjection::Split { w1, w3 } => {
                w1.randomize()?;
                w3.randomize()?;
            }
        }
        self.w2.randomize()
    }
}

#[derive(Debug, Clone)]
pub struct TransformerBlock {
    attention: Attention,
    feed_forward: FeedForward,
    attention_norm: RmsNorm,
    ffn_norm: RmsNorm,
}

impl TransformerBlock {
    fn new(
        layer_idx: usize,
        params: &ModelParams,
        options: &ModelOptions,
        comm: &Comm,
        backend: Arc<dyn AttentionBackend>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(Self {
            attention: Attention::new(layer_idx, params, options, comm, backend, dtype, device)?,
            feed_forward: FeedForward::new(params, options, comm, dtype, device)?,
            attention_norm: RmsNorm::ones(params.hidden_dim, params.norm_eps, dtype, device)?,
            ffn_norm: RmsNorm::ones(params.hidden_dim, params.norm_eps, dtype, device)?,
        })
    }

    /// Returns `(residual, ffn_out)`; the next block receives them as
    /// `(skip, x)` so the FFN output is folded into its attention norm.
    pub fn forward(
        &self,
        x: &Tensor,
        skip: Option<&Tensor>,
        attn_mask: Option<&Tensor>,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> Result<(Tensor, Tensor)> {
        let (normed, residual) = self.attention_norm.forward_skip(x, skip)?;
        let attn = self
            .attention
            .forward(&normed, attn_mask, start_pos, cache)?;
        let (normed, residual) = self.ffn_norm.forward_skip(&residual, Some(&attn))?;
        let ffn = self.feed_forward.forward(&normed)?;
        Ok((residual, ffn))
    }

    fn load_weight(&mut self, name: &str, tensor: &Tensor) -> Result<bool> {
        if let Some(suffix) = name.strip_prefix("attention.") {
            return self.attention.load_weight(suffix, tensor);
        }
        if let Some(suffix) = name.strip_prefix("feed_forward.") {
            return self.feed_forward.load_weight(suffix, tensor);
        }
        match name {
            "attention_norm.weight" => self.attention_norm.set_weight(tensor.clone())?,
            "ffn_norm.weight" => self.ffn_norm.set_weight(tensor.clone())?,
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn load_packed_shard(
        &mut self,
        name: &str,
        shard: PackedShard,
        tensor: &Tensor,
    ) -> Result<bool> {
        if let Some(suffix) = name.strip_prefix("attention.") {
            return self.attention.load_qkv_packed_shard(suffix, shard, tensor);
        }
        if let Some(suffix) = name.strip_prefix("feed_forward.") {
            return self
                .feed_forward
                .load_gate_up_packed_shard(suffix, shard, tensor);
        }
        Ok(false)
    }

    fn randomize(&mut self) -> Result<()> {
        self.attention.randomize()?;
        self.feed_forward.randomize()?;
        self.attention_norm.randomize()?;
        self.ffn_norm.randomize()?;
        Ok(())
    }
}

/// LLaMA decoder for static batches: every row shares `start_pos` and length.
#[derive(Debug, Clone)]
pub struct Transformer {
    params: ModelParams,
    options: ModelOptions,
    comm: Comm,
    dtype: DType,
    device: Device,
    tok_embeddings: ParallelEmbedding,
    layers: Vec<TransformerBlock>,
    norm: RmsNorm,
    output: ColumnParallelLinear,
    cache_spec: CacheSpec,
}

impl Transformer {
    pub fn new(
        params: ModelParams,
        options: ModelOptions,
        comm: Comm,
        backend: Arc<dyn AttentionBackend>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        params.validate()?;
        params.validate_tensor_parallel(comm.world_size())?;
        if options.fused_alibi && !options.with_alibi {
            warn!("fused_alibi is set without with_alibi; alibi stays disabled");
        }
        let dims = LocalDims::new(&params, &comm)?;
        let cache_spec = CacheSpec {
            num_layers: params.num_layers,
            max_batch: params.max_batch_size,
            max_seq_len: params.max_seq_len,
            num_kv_heads: dims.kv_heads,
            head_dim: dims.head_dim,
            layout: params.cache_layout()?,
            quant_bit: params.cache_quant_bit,
            quant_group: params.cache_quant_group,
        };
        cache_spec.validate()?;

        let mut layers = Vec::with_capacity(params.num_layers);
        for layer_idx in 0..params.num_layers {
            layers.push(TransformerBlock::new(
                layer_idx,
                &params,
                &options,
                &comm,
                Arc::clone(&backend),
                dtype,
                device,
            )?);
        }
        let tok_embeddings =
            ParallelEmbedding::new(&comm, params.vocab_size, params.hidden_dim, dtype, device)?;
        let norm = RmsNorm::ones(params.hidden_dim, params.norm_eps, dtype, device)?;
        let output = ColumnParallelLinear::new(
            &comm,
            params.hidden_dim,
            params.vocab_size,
            false,
            true,
            dtype,
            device,
        )?;
        info!(
            rank = comm.rank(),
            world_size = comm.world_size(),
            layers = params.num_layers,
            local_heads = dims.heads,
            local_kv_heads = dims.kv_heads,
            backend = backend.name(),
            "built llama transformer"
        );
        Ok(Self {
            params,
            options,
            comm,
            dtype,
            device: device.clone(),
            tok_embeddings,
            layers,
            norm,
            output,
            cache_spec,
        })
    }

    pub fn params(&self) -> &ModelParams {
        &self.params
    }

    pub fn options(&self) -> &ModelOptions {
        &self.options
    }

    pub fn comm(&self) -> &Comm {
        &self.comm
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn layers(&self) -> &[TransformerBlock] {
        &self.layers
    }

    /// Shape of the cache this rank's layers read and write.
    pub fn cache_spec(&self) -> CacheSpec {
        self.cache_spec
    }

    pub fn new_kv_cache(&self) -> Result<KvCache> {
        KvCache::new(self.cache_spec, self.dtype, &self.device)
    }

    /// F32 logits of the last position, `[batch, vocab]`.
    pub fn forward(
        &self,
        tokens: &Tensor,
        attn_mask: Option<&Tensor>,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let hidden = self.forward_hidden(tokens, attn_mask, start_pos, cache)?;
        let seq = hidden.dim(1)?;
        let last = hidden.narrow(1, seq - 1, 1)?.squeeze(1)?;
        Ok(self.output.forward(&last)?.to_dtype(DType::F32)?)
    }

    /// F32 logits of every position, `[batch, seq, vocab]`.
    pub fn logit_forward(
        &self,
        tokens: &Tensor,
        attn_mask: Option<&Tensor>,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let hidden = self.forward_hidden(tokens, attn_mask, start_pos, cache)?;
        Ok(self.output.forward(&hidden)?.to_dtype(DType::F32)?)
    }

    fn forward_hidden(
        &self,
        tokens: &Tensor,
        attn_mask: Option<&Tensor>,
        start_pos: usize,
        cache: &mut KvCache,
    ) -> Result<Tensor> {
        let (batch, seq) = tokens.dims2()?;
        ensure!(batch > 0 && seq > 0, "tokens must not be empty");
        ensure!(
            batch <= self.params.max_batch_size,
            "batch {} exceeds max_batch_size {}",
            batch,
            self.params.max_batch_size
        );
        ensure!(
            start_pos + seq <= self.params.max_seq_len,
            "start_pos {} + seq {} exceeds max_seq_len {}",
            start_pos,
            seq,
            self.params.max_seq_len
        );
        ensure!(
            *cache.spec() == self.cache_spec,
            "kv cache {:?} does not match model cache {:?}",
            cache.spec(),
            self.cache_spec
        );

        let mut h = self.tok_embeddings.forward(tokens)?;
        let alibi = if self.options.with_alibi && !self.options.fused_alibi {
            Some(alibi_mask(
                seq,
                start_pos + seq,
                attn_mask,
                self.params.num_heads,
                DType::F32,
                &self.device,
            )?)
        } else {
            None
        };
        let attn_mask = alibi.as_ref().or(attn_mask);

        let mut skip: Option<Tensor> = None;
        for layer in &self.layers {
            let (residual, ffn) = layer.forward(&h, skip.as_ref(), attn_mask, start_pos, cache)?;
            h = ffn;
            skip = Some(residual);
        }
        let (normed, _) = self.norm.forward_skip(&h, skip.as_ref())?;
        Ok(normed)
    }

    /// Finds the fused module an unfused checkpoint key belongs to. The
    /// module name has to match a whole path segment after its parent, so
    /// `wq` never matches `wqkv`.
    pub fn packed_module_for(weight_name: &str) -> Option<(String, PackedShard)> {
        let (_, tail) = parse_layer_path(weight_name)?;
        let (parent, rest) = tail.split_once('.')?;
        let (module, param) = rest.split_once('.')?;
        let mapping = PACKED_MODULES
            .iter()
            .find(|mapping| mapping.parent == parent && mapping.source_module == module)?;
        let prefix = &weight_name[..weight_name.len() - tail.len()];
        Some((
            format!("{prefix}{parent}.{}.{param}", mapping.packed_module),
            mapping.shard,
        ))
    }

    fn is_packed(&self, shard: PackedShard) -> bool {
        match shard {
            PackedShard::Q | PackedShard::K | PackedShard::V => self.options.fused_qkv,
            PackedShard::Gate | PackedShard::Up => self.options.fused_ffn_glu,
        }
    }

    pub fn load_weight(&mut self, name: &str, tensor: &Tensor) -> Result<bool> {
        match name {
            "tok_embeddings.weight" => {
                self.tok_embeddings.load_weight(tensor)?;
                return Ok(true);
            }
            "norm.weight" => {
                self.norm.set_weight(tensor.clone())?;
                return Ok(true);
            }
            "output.weight" => {
                self.output.load_weight(tensor)?;
                return Ok(true);
            }
            _ => {}
        }

        if let Some((layer_idx, layer_tail)) = parse_layer_path(name) {
            ensure!(
                layer_idx < self.layers.len(),
                "layer index out of range in weight name: {}",
                name
            );
            return self.layers[layer_idx].load_weight(layer_tail, tensor);
        }
        Ok(false)
    }

    pub fn load_packed_shard(
        &mut self,
        packed_name: &str,
        shard: PackedShard,
        tensor: &Tensor,
    ) -> Result<bool> {
        if let Some((layer_idx, layer_tail)) = parse_layer_path(packed_name) {
            ensure!(
                layer_idx < self.layers.len(),
                "layer index out of range in packed weight name: {}",
                packed_name
            );
            return self.layers[layer_idx].load_packed_shard(layer_tail, shard, tensor);
        }
        Ok(false)
    }

    /// Copies every tensor of `state_dict` into the matching parameter.
    /// Unfused `wq`/`wk`/`wv` and `w1`/`w3` are spliced into `wqkv` and `wu`
    /// when the model is fused. Keys that match nothing are reported back.
    pub fn load_state_dict(&mut self, state_dict: &HashMap<String, Tensor>) -> Result<LoadReport> {
        let mut names: Vec<&String> = state_dict.keys().collect();
        names.sort();
        let mut report = LoadReport::default();
        for name in names {
            let tensor = &state_dict[name];
            if let Some((packed_name, shard)) = Self::packed_module_for(name)
                && self.is_packed(shard)
            {
                ensure!(
                    self.load_packed_shard(&packed_name, shard, tensor)?,
                    "cannot find fused module {} for weight {}",
                    packed_name,
                    name
                );
                debug!(name = %name, target = %packed_name, shape = ?tensor.dims(), "loaded");
                report.loaded.push(name.clone());
                continue;
            }
            if self.load_weight(name, tensor)? {
                debug!(name = %name, shape = ?tensor.dims(), "loaded");
                report.loaded.push(name.clone());
            } else {
                warn!(name = %name, "checkpoint tensor is not loaded");
                report.unused.push(name.clone());
            }
        }
        info!(
            rank = self.comm.rank(),
            loaded = report.loaded_count(),
            unused = report.unused.len(),
            "loaded state dict"
        );
        Ok(report)
    }

    /// Fills every parameter with standard-normal values.
    pub fn random_weights(&mut self) -> Result<()> {
        self.tok_embeddings.randomize()?;
        for layer in &mut self.layers {
            layer.randomize()?;
        }
        self.norm.randomize()?;
        self.output.randomize()?;
        info!(rank = self.comm.rank(), "initialized random weights");
        Ok(())
    }
}
