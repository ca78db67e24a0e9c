use anyhow::{Result, ensure};
use candle_core::Tensor;
use tracing::{debug, info};

use crate::attention::KvCache;
use crate::models::Transformer;
use crate::runner::Sampler;

/// Tokens produced for each prompt row, in prompt order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationOutput {
    pub tokens: Vec<Vec<u32>>,
    pub prompt_len: usize,
    pub steps: usize,
}

/// Static-batch decoding: one prefill over equal-length prompts, then one
/// token per row per step against the same cache.
#[derive(Debug)]
pub struct Generator {
    model: Transformer,
    sampler: Sampler,
    kv_cache: KvCache,
    eos: Option<u32>,
}

impl Generator {
    pub fn new(model: Transformer, sampler: Sampler, eos: Option<u32>) -> Result<Self> {
        let kv_cache = model.new_kv_cache()?;
        Ok(Self {
            model,
            sampler,
            kv_cache,
            eos,
        })
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    pub fn kv_cache(&self) -> &KvCache {
        &self.kv_cache
    }

    pub fn generate(
        &mut self,
        prompts: &[Vec<u32>],
        max_new_tokens: usize,
    ) -> Result<GenerationOutput> {
        ensure!(!prompts.is_empty(), "generation requires at least one prompt");
        let prompt_len = prompts[0].len();
        ensure!(prompt_len > 0, "prompts must not be empty");
        ensure!(
            prompts.iter().all(|prompt| prompt.len() == prompt_len),
            "static batching requires prompts of equal length"
        );
        let batch = prompts.len();
        let max_seq_len = self.model.params().max_seq_len;
        ensure!(
            prompt_len <= max_seq_len,
            "prompt length {} exceeds max_seq_len {}",
            prompt_len,
            max_seq_len
        );

        let flat: Vec<u32> = prompts.iter().flatten().copied().collect();
        let tokens = Tensor::from_vec(flat, (batch, prompt_len), self.model.device())?;
        let mut outputs: Vec<Vec<u32>> = vec![Vec::new(); batch];
        let mut finished = vec![false; batch];
        if max_new_tokens == 0 {
            return Ok(GenerationOutput {
                tokens: outputs,
                prompt_len,
                steps: 0,
            });
        }

        let logits = self.model.forward(&tokens, None, 0, &mut self.kv_cache)?;
        let mut next = self.sampler.sample(&logits)?;
        let mut start_pos = prompt_len;
        let mut steps = 1usize;
        self.record(&next, &mut outputs, &mut finished);
        debug!(batch, prompt_len, "prefill done");

        while steps < max_new_tokens
            && start_pos < max_seq_len
            && !finished.iter().all(|done| *done)
        {
            let step_tokens: Vec<u32> = next
                .iter()
                .zip(&finished)
                .map(|(&token, &done)| match (done, self.eos) {
                    (true, Some(eos)) => eos,
                    _ => token,
                })
                .collect();
            let tokens = Tensor::from_vec(step_tokens, (batch, 1), self.model.device())?;
            let logits = self
                .model
                .forward(&tokens, None, start_pos, &mut self.kv_cache)?;
            next = self.sampler.sample(&logits)?;
            self.record(&next, &mut outputs, &mut finished);
            start_pos += 1;
            steps += 1;
        }
        info!(
            batch,
            prompt_len,
            steps,
            rank = self.model.comm().rank(),
            "generation finished"
        );
        Ok(GenerationOutput {
            tokens: outputs,
            prompt_len,
            steps,
        })
    }

    fn record(&self, sampled: &[u32], outputs: &mut [Vec<u32>], finished: &mut [bool]) {
        let rows = sampled.iter().zip(outputs.iter_mut()).zip(finished.iter_mut());
        for ((token, output), done) in rows {
            if *done {
                continue;
            }
            output.push(*token);
            if self.eos == Some(*token) {
                *done = true;
            }
        }
    }
}
