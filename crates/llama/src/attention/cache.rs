use anyhow::{Result, anyhow, ensure};
use candle_core::{D, DType, Device, Tensor};

const LAYER: usize = 0;
const KV: usize = 1;
const BATCH: usize = 2;
const SEQ: usize = 3;
const HEAD: usize = 4;
const DIM: usize = 5;

const QUANT_ZERO_POINT: f64 = 128.0;
const QUANT_MAX: f64 = 127.0;

/// Physical axis order of the shared cache tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheLayout {
    /// `[batch, layer, 2, seq, kv_heads, head_dim]`
    BatchMajor,
    /// `[layer, batch, 2, seq, kv_heads, head_dim]`
    LayerMajor,
    /// `[layer, 2, batch, kv_heads, seq, head_dim]`
    LayerHeadMajor,
    /// `[batch, layer, 2, kv_heads, seq, head_dim]`
    BatchHeadMajor,
}

impl CacheLayout {
    pub fn from_index(index: usize) -> Result<Self> {
        match index {
            0 => Ok(Self::BatchMajor),
            1 => Ok(Self::LayerMajor),
            2 => Ok(Self::LayerHeadMajor),
            3 => Ok(Self::BatchHeadMajor),
            _ => Err(anyhow!("unsupported cache_layout {}", index)),
        }
    }

    pub fn index(self) -> usize {
        match self {
            Self::BatchMajor => 0,
            Self::LayerMajor => 1,
            Self::LayerHeadMajor => 2,
            Self::BatchHeadMajor => 3,
        }
    }

    /// Whether the head axis precedes the sequence axis in storage.
    pub fn is_head_major(self) -> bool {
        matches!(self, Self::LayerHeadMajor | Self::BatchHeadMajor)
    }

    /// Storage axis `i` holds logical axis `axes()[i]`. The first three are
    /// always layer, kv and batch in some order.
    fn axes(self) -> [usize; 6] {
        match self {
            Self::BatchMajor => [BATCH, LAYER, KV, SEQ, HEAD, DIM],
            Self::LayerMajor => [LAYER, BATCH, KV, SEQ, HEAD, DIM],
            Self::LayerHeadMajor => [LAYER, KV, BATCH, HEAD, SEQ, DIM],
            Self::BatchHeadMajor => [BATCH, LAYER, KV, HEAD, SEQ, DIM],
        }
    }

    fn inverse_axes(self) -> [usize; 6] {
        let axes = self.axes();
        let mut inverse = [0usize; 6];
        for (storage, &logical) in axes.iter().enumerate() {
            inverse[logical] = storage;
        }
        inverse
    }

    fn to_storage<T: Clone>(self, logical: &[T; 6]) -> Vec<T> {
        self.axes().iter().map(|&axis| logical[axis].clone()).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSpec {
    pub num_layers: usize,
    pub max_batch: usize,
    pub max_seq_len: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub layout: CacheLayout,
    pub quant_bit: usize,
    pub quant_group: usize,
}

impl CacheSpec {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.num_layers > 0, "cache num_layers must be positive");
        ensure!(self.max_batch > 0, "cache max_batch must be positive");
        ensure!(self.max_seq_len > 0, "cache max_seq_len must be positive");
        ensure!(self.num_kv_heads > 0, "cache num_kv_heads must be positive");
        ensure!(self.head_dim > 0, "cache head_dim must be positive");
        ensure!(
            matches!(self.quant_bit, 0 | 8),
            "cache quant_bit must be 0 or 8, got {}",
            self.quant_bit
        );
        if self.is_quantized() {
            ensure!(self.quant_group > 0, "cache quant_group must be positive");
            ensure!(
                self.head_dim.is_multiple_of(self.quant_group),
                "head_dim {} must be divisible by quant_group {}",
                self.head_dim,
                self.quant_group
            );
        }
        Ok(())
    }

    pub fn is_quantized(&self) -> bool {
        self.quant_bit > 0
    }

    fn logical_dims(&self, last: usize) -> [usize; 6] {
        [
            self.num_layers,
            2,
            self.max_batch,
            self.max_seq_len,
            self.num_kv_heads,
            last,
        ]
    }

    pub fn data_shape(&self) -> Vec<usize> {
        self.layout.to_storage(&self.logical_dims(self.head_dim))
    }

    pub fn scale_shape(&self) -> Option<Vec<usize>> {
        self.is_quantized().then(|| {
            self.layout
                .to_storage(&self.logical_dims(self.head_dim / self.quant_group))
        })
    }
}

/// Key/value storage shared by every layer of one model replica. Stores write
/// into the preallocated tensors in place.
#[derive(Debug)]
pub struct KvCache {
    spec: CacheSpec,
    dtype: DType,
    data: Tensor,
    scale: Option<Tensor>,
}

impl KvCache {
    /// `dtype` is the compute dtype that reads come back in. Quantized caches
    /// store `u8` values and keep F32 scales.
    pub fn new(spec: CacheSpec, dtype: DType, device: &Device) -> Result<Self> {
        spec.validate()?;
        let (data, scale) = match spec.scale_shape() {
            Some(scale_shape) => (
                Tensor::full(QUANT_ZERO_POINT as u8, spec.data_shape(), device)?.contiguous()?,
                Some(Tensor::zeros(scale_shape, DType::F32, device)?),
            ),
            None => (Tensor::zeros(spec.data_shape(), dtype, device)?, None),
        };
        Ok(Self {
            spec,
            dtype,
            data,
            scale,
        })
    }

    pub fn spec(&self) -> &CacheSpec {
        &self.spec
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &Tensor {
        &self.data
    }

    pub fn scale(&self) -> Option<&Tensor> {
        self.scale.as_ref()
    }

    /// Writes `[batch, seq, kv_heads, head_dim]` keys and values of `layer`
    /// at positions `start_pos..start_pos + seq`.
    pub fn store(
        &mut self,
        layer: usize,
        start_pos: usize,
        key: &Tensor,
        value: &Tensor,
    ) -> Result<()> {
        ensure!(key.dims() == value.dims(), "key/value shapes must match");
        let (batch, seq, kv_heads, head_dim) = key.dims4()?;
        ensure!(layer < self.spec.num_layers, "layer {} out of range", layer);
        ensure!(
            batch <= self.spec.max_batch,
            "batch {} exceeds cache max_batch {}",
            batch,
            self.spec.max_batch
        );
        ensure!(
            start_pos + seq <= self.spec.max_seq_len,
            "positions {}..{} exceed cache max_seq_len {}",
            start_pos,
            start_pos + seq,
            self.spec.max_seq_len
        );
        ensure!(
            kv_heads == self.spec.num_kv_heads && head_dim == self.spec.head_dim,
            "key/value shape must match cache dimensions"
        );

        let stacked = Tensor::stack(&[key, value], 0)?;
        match self.scale.as_ref() {
            Some(scale) => {
                let (quantized, group_scale) = quantize(&stacked, self.spec.quant_group)?;
                self.write(scale, layer, start_pos, &group_scale)?;
                self.write(&self.data, layer, start_pos, &quantized)?;
            }
            None => {
                let stacked = stacked.to_dtype(self.data.dtype())?;
                self.write(&self.data, layer, start_pos, &stacked)?;
            }
        }
        Ok(())
    }

    /// Reads positions `0..kv_len` of `layer` for the first `batch` rows as
    /// `[batch, kv_len, kv_heads, head_dim]` tensors in the compute dtype.
    pub fn load(&self, layer: usize, batch: usize, kv_len: usize) -> Result<(Tensor, Tensor)> {
        ensure!(layer < self.spec.num_layers, "layer {} out of range", layer);
        ensure!(batch > 0 && batch <= self.spec.max_batch, "invalid batch {}", batch);
        ensure!(
            kv_len > 0 && kv_len <= self.spec.max_seq_len,
            "invalid kv_len {}",
            kv_len
        );
        let stacked = self.read(&self.data, layer, batch, kv_len)?;
        let stacked = match self.scale.as_ref() {
            Some(scale) => {
                let group_scale = self.read(scale, layer, batch, kv_len)?;
                dequantize(&stacked, &group_scale, self.spec.quant_group)?
            }
            None => stacked,
        };
        let stacked = stacked.to_dtype(self.dtype)?;
        // owned copies, later stores write into the cache storage in place
        Ok((
            stacked.get(0)?.force_contiguous()?,
            stacked.get(1)?.force_contiguous()?,
        ))
    }

    /// Copies `[2, batch, seq, kv_heads, last]` into `target` at positions
    /// `start_pos..start_pos + seq`, touching only those slots.
    fn write(
        &self,
        target: &Tensor,
        layer: usize,
        start_pos: usize,
        src: &Tensor,
    ) -> Result<()> {
        let head_major = self.spec.layout.is_head_major();
        // rows are [seq, kv_heads, last] or, head major, [kv_heads, seq, last]
        let src = if head_major {
            src.transpose(2, 3)?
        } else {
            src.clone()
        };
        let batch = src.dim(1)?;
        for kv in 0..2 {
            for row in 0..batch {
                let block = src.get(kv)?.get(row)?;
                let slot = self.slot(target, layer, kv, row)?;
                if head_major {
                    for head in 0..self.spec.num_kv_heads {
                        let block = block.get(head)?.contiguous()?;
                        slot.get(head)?.slice_set(&block, 0, start_pos)?;
                    }
                } else {
                    slot.slice_set(&block.contiguous()?, 0, start_pos)?;
                }
            }
        }
        Ok(())
    }

    /// Contiguous view of one `(layer, kv, batch row)` slot of `storage`,
    /// sharing its buffer.
    fn slot(&self, storage: &Tensor, layer: usize, kv: usize, row: usize) -> Result<Tensor> {
        let index = [layer, kv, row];
        let mut view = storage.clone();
        for &axis in &self.spec.layout.axes()[..3] {
            view = view.get(index[axis])?;
        }
        Ok(view)
    }

    /// Returns `[2, batch, kv_len, kv_heads, last]`.
    fn read(&self, source: &Tensor, layer: usize, batch: usize, kv_len: usize) -> Result<Tensor> {
        let last = source.dim(D::Minus1)?;
        let logical: [(usize, usize); 6] = [
            (layer, 1),
            (0, 2),
            (0, batch),
            (0, kv_len),
            (0, self.spec.num_kv_heads),
            (0, last),
        ];
        let mut view = source.clone();
        for (axis, (start, len)) in self.spec.layout.to_storage(&logical).into_iter().enumerate() {
            view = view.narrow(axis, start, len)?;
        }
        Ok(view
            .permute(self.spec.layout.inverse_axes())?
            .squeeze(0)?)
    }
}

fn grouped_dims(dims: &[usize], group: usize) -> Vec<usize> {
    let Some((last, lead)) = dims.split_last() else {
        return Vec::new();
    };
    let mut grouped = lead.to_vec();
    grouped.push(last / group);
    grouped.push(group);
    grouped
}

/// Symmetric int8 quantization over groups of `group` values along the last
/// axis. Values are stored with a zero point of 128.
pub fn quantize(x: &Tensor, group: usize) -> Result<(Tensor, Tensor)> {
    let dims = x.dims().to_vec();
    ensure!(group > 0, "quant group must be positive");
    ensure!(
        dims.last().is_some_and(|last| last.is_multiple_of(group)),
        "last dim of {:?} must be divisible by quant group {}",
        dims,
        group
    );
    let grouped = x.to_dtype(DType::F32)?.reshape(grouped_dims(&dims, group))?;
    let scale = grouped
        .abs()?
        .max_keepdim(D::Minus1)?
        .affine(1.0 / QUANT_MAX, 0.0)?
        .clamp(f32::MIN_POSITIVE, f32::MAX)?;
    let quantized = grouped
        .broadcast_div(&scale)?
        .round()?
        .affine(1.0, QUANT_ZERO_POINT)?
        .clamp(0f32, 255f32)?
        .to_dtype(DType::U8)?
        .reshape(dims)?;
    Ok((quantized, scale.squeeze(D::Minus1)?))
}

pub fn dequantize(quantized: &Tensor, scale: &Tensor, group: usize) -> Result<Tensor> {
    let dims = quantized.dims().to_vec();
    let values = quantized
        .to_dtype(DType::F32)?
        .affine(1.0, -QUANT_ZERO_POINT)?
        .reshape(grouped_dims(&dims, group))?;
    Ok(values
        .broadcast_mul(&scale.unsqueeze(D::Minus1)?)?
        .reshape(dims)?)
}
