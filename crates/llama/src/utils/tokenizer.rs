use std::path::Path;

use anyhow::{Context, Result};
use tokenizers::Tokenizer;

pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Loads `tokenizer.json` from `model_dir`, or `None` when the checkpoint
/// ships without one.
pub fn load_tokenizer(model_dir: &Path) -> Result<Option<Tokenizer>> {
    let path = model_dir.join(TOKENIZER_FILE);
    if !path.exists() {
        return Ok(None);
    }
    let tokenizer = Tokenizer::from_file(&path)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("failed loading tokenizer at {}", path.display()))?;
    Ok(Some(tokenizer))
}

pub fn encode_prompt(tokenizer: &Tokenizer, prompt: &str) -> Result<Vec<u32>> {
    let encoding = tokenizer
        .encode(prompt, true)
        .map_err(anyhow::Error::msg)
        .context("failed encoding prompt")?;
    Ok(encoding.get_ids().to_vec())
}

pub fn decode_tokens(tokenizer: &Tokenizer, token_ids: &[u32]) -> Result<String> {
    tokenizer
        .decode(token_ids, true)
        .map_err(anyhow::Error::msg)
        .context("failed decoding token ids")
}
