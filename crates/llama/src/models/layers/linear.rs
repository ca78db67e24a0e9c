use std::ops::Range;

use candle_core::{DType, Device, Result, Tensor};

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    bias: Option<Tensor>,
}

impl Linear {
    pub fn new(weight: Tensor, bias: Option<Tensor>) -> Self {
        Self { weight, bias }
    }

    pub fn zeros(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        let weight = Tensor::zeros((out_dim, in_dim), dtype, device)?;
        let bias = if bias {
            Some(Tensor::zeros((out_dim,), dtype, device)?)
        } else {
            None
        };
        Ok(Self { weight, bias })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn out_dim(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn in_dim(&self) -> usize {
        self.weight.dims()[1]
    }

    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        self.weight = conform(&self.weight, weight, "weight")?;
        Ok(())
    }

    pub fn set_bias(&mut self, bias: Tensor) -> Result<()> {
        let current = match self.bias.as_ref() {
            Some(current) => current,
            None => candle_core::bail!("cannot load bias into linear layer without bias"),
        };
        self.bias = Some(conform(current, bias, "bias")?);
        Ok(())
    }

    /// Overwrites output rows `rows` of the weight, leaving the others intact.
    pub fn set_weight_rows(&mut self, rows: Range<usize>, weight: Tensor) -> Result<()> {
        let in_dim = self.in_dim();
        if rows.end > self.out_dim() || weight.dims() != [rows.len(), in_dim] {
            candle_core::bail!(
                "weight rows {:?} do not fit: target {:?}, got {:?}",
                rows,
                self.weight.dims(),
                weight.dims()
            );
        }
        let weight = weight
            .to_device(self.weight.device())?
            .to_dtype(self.weight.dtype())?;
        self.weight = self.weight.slice_assign(&[rows, 0..in_dim], &weight)?;
        Ok(())
    }

    pub fn set_bias_rows(&mut self, rows: Range<usize>, bias: Tensor) -> Result<()> {
        let current = match self.bias.as_ref() {
            Some(current) => current,
            None => candle_core::bail!("cannot load bias into linear layer without bias"),
        };
        if rows.end > current.dims1()? || bias.dims() != [rows.len()] {
            candle_core::bail!(
                "bias rows {:?} do not fit: target {:?}, got {:?}",
                rows,
                current.dims(),
                bias.dims()
            );
        }
        let bias = bias.to_device(current.device())?.to_dtype(current.dtype())?;
        self.bias = Some(current.slice_assign(&[rows], &bias)?);
        Ok(())
    }

    pub fn randomize(&mut self) -> Result<()> {
        self.weight = random_like(&self.weight)?;
        if let Some(bias) = self.bias.as_ref() {
            self.bias = Some(random_like(bias)?);
        }
        Ok(())
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let y = x.broadcast_matmul(&self.weight.t()?)?;
        match &self.bias {
            Some(bias) => y.broadcast_add(bias),
            None => Ok(y),
        }
    }
}

/// Checks `value` against the shape of `expected` and moves it onto the same device and dtype.
pub(crate) fn conform(expected: &Tensor, value: Tensor, what: &str) -> Result<Tensor> {
    if value.dims() != expected.dims() {
        candle_core::bail!(
            "{} shape mismatch: expected {:?}, got {:?}",
            what,
            expected.dims(),
            value.dims()
        );
    }
    let mut value = value.to_device(expected.device())?;
    if value.dtype() != expected.dtype() {
        value = value.to_dtype(expected.dtype())?;
    }
    Ok(value)
}

pub(crate) fn random_like(like: &Tensor) -> Result<Tensor> {
    Tensor::randn(0f32, 1f32, like.dims(), like.device())?.to_dtype(like.dtype())
}
