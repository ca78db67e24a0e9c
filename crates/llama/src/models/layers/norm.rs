use candle_core::{DType, Device, Result, Tensor};
use candle_nn::{Module, RmsNorm as CandleRmsNorm};

use super::linear::{conform, random_like};

#[derive(Debug, Clone)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
    inner: CandleRmsNorm,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        let inner = CandleRmsNorm::new(weight.clone(), eps);
        Self { weight, eps, inner }
    }

    pub fn ones(hidden_size: usize, eps: f64, dtype: DType, device: &Device) -> Result<Self> {
        let weight = Tensor::ones((hidden_size,), dtype, device)?;
        Ok(Self::new(weight, eps))
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        self.inner.forward(x)
    }

    /// Folds `skip` into `x` and normalizes the sum.
    ///
    /// Returns `(normalized, running_sum)`; without a skip the running sum is
    /// `x` itself.
    pub fn forward_skip(&self, x: &Tensor, skip: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        let merged = match skip {
            Some(skip) => (x + skip)?,
            None => x.clone(),
        };
        let normalized = self.inner.forward(&merged)?;
        Ok((normalized, merged))
    }

    pub fn set_weight(&mut self, weight: Tensor) -> Result<()> {
        let weight = conform(&self.weight, weight, "rmsnorm weight")?;
        self.inner = CandleRmsNorm::new(weight.clone(), self.eps);
        self.weight = weight;
        Ok(())
    }

    pub fn randomize(&mut self) -> Result<()> {
        let weight = random_like(&self.weight)?;
        self.inner = CandleRmsNorm::new(weight.clone(), self.eps);
        self.weight = weight;
        Ok(())
    }
}
