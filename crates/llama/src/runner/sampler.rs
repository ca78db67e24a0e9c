use anyhow::{Result, anyhow, ensure};
use candle_core::{DType, Tensor};
use parking_lot::Mutex;
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use rand::{SeedableRng, rngs::StdRng};

use crate::utils::SamplingParams;

const MIN_TEMPERATURE: f32 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SamplingStrategy {
    ArgMax,
    Random {
        temperature: f32,
        top_k: Option<usize>,
        top_p: Option<f32>,
    },
}

impl SamplingStrategy {
    pub fn from_params(params: &SamplingParams) -> Self {
        if params.temperature <= MIN_TEMPERATURE {
            return Self::ArgMax;
        }
        Self::Random {
            temperature: params.temperature,
            top_k: (params.top_k > 0).then_some(params.top_k as usize),
            top_p: (params.top_p < 1.0).then_some(params.top_p),
        }
    }
}

/// Picks one token per row of a `[batch, vocab]` logits tensor.
#[derive(Debug)]
pub struct Sampler {
    strategy: SamplingStrategy,
    rng: Mutex<StdRng>,
}

impl Sampler {
    pub fn new(params: &SamplingParams, seed: u64) -> Result<Self> {
        params.validate()?;
        Ok(Self::with_strategy(SamplingStrategy::from_params(params), seed))
    }

    pub fn with_strategy(strategy: SamplingStrategy, seed: u64) -> Self {
        Self {
            strategy,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn strategy(&self) -> SamplingStrategy {
        self.strategy
    }

    pub fn sample(&self, logits: &Tensor) -> Result<Vec<u32>> {
        let rows = logits.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        rows.iter().map(|row| self.sample_row(row)).collect()
    }

    fn sample_row(&self, logits: &[f32]) -> Result<u32> {
        ensure!(!logits.is_empty(), "logits row must not be empty");
        match self.strategy {
            SamplingStrategy::ArgMax => Ok(argmax(logits)? as u32),
            SamplingStrategy::Random {
                temperature,
                top_k,
                top_p,
            } => {
                let mut candidates = ranked_probs(logits, temperature);
                if let Some(k) = top_k {
                    candidates.truncate(k.max(1));
                }
                if let Some(p) = top_p {
                    truncate_nucleus(&mut candidates, p);
                }
                let (indices, probs): (Vec<usize>, Vec<f32>) = candidates.into_iter().unzip();
                let dist = WeightedIndex::new(&probs).map_err(|_| {
                    anyhow!("invalid probabilities: must contain positive finite values")
                })?;
                let picked = dist.sample(&mut *self.rng.lock());
                Ok(indices[picked] as u32)
            }
        }
    }
}

fn argmax(values: &[f32]) -> Result<usize> {
    values
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| a.total_cmp(b))
        .map(|(idx, _)| idx)
        .ok_or_else(|| anyhow!("empty values for argmax"))
}

/// Temperature softmax, sorted by descending probability.
fn ranked_probs(logits: &[f32], temperature: f32) -> Vec<(usize, f32)> {
    let max = logits
        .iter()
        .copied()
        .fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits
        .iter()
        .map(|x| ((x - max) / temperature).exp())
        .collect();
    let sum: f32 = exps.iter().sum();
    let mut pairs: Vec<(usize, f32)> = if sum > 0.0 && sum.is_finite() {
        exps.into_iter().map(|e| e / sum).enumerate().collect()
    } else {
        let mut one_hot = vec![0.0; logits.len()];
        if let Ok(idx) = argmax(logits) {
            one_hot[idx] = 1.0;
        }
        one_hot.into_iter().enumerate().collect()
    };
    pairs.sort_by(|a, b| b.1.total_cmp(&a.1));
    pairs
}

/// Keeps the smallest prefix whose mass reaches `p`.
fn truncate_nucleus(candidates: &mut Vec<(usize, f32)>, p: f32) {
    let total: f32 = candidates.iter().map(|(_, prob)| prob).sum();
    let mut cum = 0.0f32;
    let mut keep = candidates.len();
    for (idx, (_, prob)) in candidates.iter().enumerate() {
        cum += prob / total;
        if cum >= p {
            keep = idx + 1;
            break;
        }
    }
    candidates.truncate(keep);
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zero_temperature_is_argmax() {
        let sampler = Sampler::new(&SamplingParams::greedy(), 0).unwrap();
        assert_eq!(sampler.strategy(), SamplingStrategy::ArgMax);
        let logits = Tensor::new(&[[0.1f32, 3.0, -1.0], [5.0, 4.0, 4.5]], &Device::Cpu).unwrap();
        assert_eq!(sampler.sample(&logits).unwrap(), vec![1, 0]);
    }

    #[test]
    fn top_k_one_always_picks_the_best_token() {
        let params = SamplingParams {
            temperature: 1.0,
            top_k: 1,
            top_p: 1.0,
        };
        let sampler = Sampler::new(&params, 7).unwrap();
        let logits = Tensor::new(&[[0.0f32, 0.5, 0.2, 0.4]], &Device::Cpu).unwrap();
        for _ in 0..16 {
            assert_eq!(sampler.sample(&logits).unwrap(), vec![1]);
        }
    }

    #[test]
    fn nucleus_keeps_smallest_covering_prefix() {
        let mut candidates = vec![(3, 0.5), (0, 0.3), (1, 0.15), (2, 0.05)];
        truncate_nucleus(&mut candidates, 0.75);
        assert_eq!(candidates, vec![(3, 0.5), (0, 0.3)]);
    }

    #[test]
    fn same_seed_gives_same_tokens() {
        let params = SamplingParams {
            temperature: 1.0,
            top_k: -1,
            top_p: 1.0,
        };
        let logits = Tensor::new(&[[0.1f32, 0.2, 0.3, 0.4, 0.5]], &Device::Cpu).unwrap();
        let a = Sampler::new(&params, 11).unwrap();
        let b = Sampler::new(&params, 11).unwrap();
        for _ in 0..8 {
            assert_eq!(a.sample(&logits).unwrap(), b.sample(&logits).unwrap());
        }
    }
}
