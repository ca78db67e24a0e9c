use anyhow::{Result, anyhow};
use candle_core::Device;
use tracing::{info, warn};

use llama::attention::default_backend;
use llama::runner::{GenerationOutput, Generator, Sampler};
use llama::utils::{
    ModelOptions, RunConfig, decode_tokens, encode_prompt, load_model_from_dir, load_tokenizer,
};
use llama::run_tensor_parallel;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let config = RunConfig::from_env()?;
    let tokenizer = load_tokenizer(&config.model)?;
    let prompt = match (&config.tokens, &config.prompt) {
        (Some(tokens), _) => tokens.clone(),
        (None, Some(prompt)) => {
            let tokenizer = tokenizer
                .as_ref()
                .ok_or_else(|| anyhow!("a text prompt needs tokenizer.json in the model dir"))?;
            encode_prompt(tokenizer, prompt)?
        }
        (None, None) => return Err(anyhow!("no prompt given")),
    };
    let prompts = vec![prompt; config.batch];
    info!(
        model = %config.model.display(),
        tp_size = config.tp_size,
        batch = config.batch,
        prompt_len = prompts[0].len(),
        "starting generation"
    );

    let device = Device::Cpu;
    let mut outputs = run_tensor_parallel(config.tp_size, |comm| -> Result<GenerationOutput> {
        let (model, report) = load_model_from_dir(
            &config.model,
            ModelOptions::default(),
            comm,
            default_backend(),
            config.dtype.dtype(),
            &device,
            config.random_weights,
        )?;
        if !report.is_complete() {
            warn!(unused = report.unused.len(), "some checkpoint tensors were not used");
        }
        let sampler = Sampler::new(&config.sampling, config.seed)?;
        let mut generator = Generator::new(model, sampler, config.eos)?;
        generator.generate(&prompts, config.max_new_tokens)
    })?;

    let output = outputs.swap_remove(0);
    for (row, tokens) in output.tokens.iter().enumerate() {
        println!("[{row}] ids: {tokens:?}");
        if let Some(tokenizer) = tokenizer.as_ref() {
            println!("[{row}] text: {}", decode_tokens(tokenizer, tokens)?);
        }
    }
    Ok(())
}
