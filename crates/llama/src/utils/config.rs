use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail, ensure};
use candle_core::DType;
use serde::{Deserialize, Serialize};

use crate::attention::CacheLayout;

const MODEL_ENV: &str = "LLAMA_MODEL";
const PROMPT_ENV: &str = "LLAMA_PROMPT";
const TOKENS_ENV: &str = "LLAMA_TOKENS";
const BATCH_ENV: &str = "LLAMA_BATCH";
const MAX_NEW_TOKENS_ENV: &str = "LLAMA_MAX_NEW_TOKENS";
const TP_SIZE_ENV: &str = "LLAMA_TP_SIZE";
const DTYPE_ENV: &str = "LLAMA_DTYPE";
const TEMPERATURE_ENV: &str = "LLAMA_TEMPERATURE";
const TOP_K_ENV: &str = "LLAMA_TOP_K";
const TOP_P_ENV: &str = "LLAMA_TOP_P";
const SEED_ENV: &str = "LLAMA_SEED";
const EOS_ENV: &str = "LLAMA_EOS";
const RANDOM_WEIGHTS_ENV: &str = "LLAMA_RANDOM_WEIGHTS";

pub const PARAMS_FILE: &str = "params.json";
pub const HF_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RopeScaling {
    #[default]
    None,
    Linear,
    Dynamic,
}

/// How rotary frequency pairs are laid out along a head.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum RopeStyle {
    /// `(x[2i], x[2i + 1])`, the layout of Meta-format checkpoints.
    #[default]
    Interleaved,
    /// `(x[i], x[i + d / 2])`, for weights permuted by the Hugging Face converter.
    Half,
}

/// The `rope_scaling` object of a Hugging Face `config.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HfRopeScaling {
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_type: Option<String>,
    #[serde(default = "default_rope_scaling_factor")]
    pub factor: f64,
}

impl HfRopeScaling {
    pub fn resolve(&self) -> Result<(RopeScaling, f64)> {
        let kind = self.rope_type.as_deref().or(self.kind.as_deref());
        let scaling = match kind {
            None | Some("default") => RopeScaling::None,
            Some("linear") => RopeScaling::Linear,
            Some("dynamic") => RopeScaling::Dynamic,
            Some(other) => bail!("unsupported rope_scaling type {other:?}"),
        };
        Ok((scaling, self.factor))
    }
}

/// Hyperparameters of a checkpoint, read from `params.json`. Hugging Face
/// `config.json` field names are accepted as aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelParams {
    #[serde(alias = "hidden_size")]
    pub hidden_dim: usize,
    #[serde(alias = "intermediate_size")]
    pub intermediate_dim: usize,
    #[serde(alias = "num_hidden_layers")]
    pub num_layers: usize,
    #[serde(alias = "num_attention_heads")]
    pub num_heads: usize,
    #[serde(default, alias = "num_key_value_heads")]
    pub num_kv_heads: Option<usize>,
    #[serde(default)]
    pub head_dim: Option<usize>,
    pub vocab_size: usize,
    #[serde(default = "default_norm_eps", alias = "rms_norm_eps")]
    pub norm_eps: f64,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f64,
    #[serde(default)]
    pub rope_scaling_type: RopeScaling,
    #[serde(default = "default_rope_scaling_factor")]
    pub rope_scaling_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling: Option<HfRopeScaling>,
    #[serde(default)]
    pub rope_style: RopeStyle,
    #[serde(default = "default_max_position_embeddings")]
    pub max_position_embeddings: usize,
    #[serde(default = "default_auto_causal")]
    pub auto_causal: bool,
    #[serde(default)]
    pub cache_quant_bit: usize,
    #[serde(default = "default_cache_quant_group")]
    pub cache_quant_group: usize,
    #[serde(default)]
    pub cache_layout: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl ModelParams {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed reading model params at {}", path.display()))?;
        let params: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed parsing model params at {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    /// Looks for `params.json`, then `config.json`, in `model_dir`.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let params_path = model_dir.join(PARAMS_FILE);
        if params_path.exists() {
            return Self::from_file(&params_path);
        }
        let config_path = model_dir.join(HF_CONFIG_FILE);
        ensure!(
            config_path.exists(),
            "neither {} nor {} found under {}",
            PARAMS_FILE,
            HF_CONFIG_FILE,
            model_dir.display()
        );
        Self::from_file(&config_path)
    }

    pub fn num_kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
            .unwrap_or_else(|| self.hidden_dim / self.num_heads.max(1))
    }

    pub fn cache_layout(&self) -> Result<CacheLayout> {
        CacheLayout::from_index(self.cache_layout)
    }

    /// A `rope_scaling` object takes precedence over the flat fields.
    pub fn resolved_rope_scaling(&self) -> Result<(RopeScaling, f64)> {
        match &self.rope_scaling {
            Some(hf) => hf.resolve(),
            None => Ok((self.rope_scaling_type, self.rope_scaling_factor)),
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.hidden_dim > 0, "hidden_dim must be positive");
        ensure!(self.intermediate_dim > 0, "intermediate_dim must be positive");
        ensure!(self.num_layers > 0, "num_layers must be positive");
        ensure!(self.num_heads > 0, "num_heads must be positive");
        ensure!(self.vocab_size > 0, "vocab_size must be positive");
        let num_kv_heads = self.num_kv_heads();
        ensure!(num_kv_heads > 0, "num_kv_heads must be positive");
        ensure!(
            self.num_heads.is_multiple_of(num_kv_heads),
            "num_heads must be divisible by num_kv_heads"
        );
        if self.head_dim.is_none() {
            ensure!(
                self.hidden_dim.is_multiple_of(self.num_heads),
                "hidden_dim must be divisible by num_heads when head_dim is absent"
            );
        }
        ensure!(self.head_dim() > 0, "head_dim must be positive");
        ensure!(self.norm_eps > 0.0, "norm_eps must be positive");
        ensure!(self.rope_theta > 0.0, "rope_theta must be positive");
        let (_, rope_scaling_factor) = self.resolved_rope_scaling()?;
        ensure!(
            rope_scaling_factor > 0.0,
            "rope_scaling_factor must be positive"
        );
        ensure!(
            self.max_position_embeddings > 0,
            "max_position_embeddings must be positive"
        );
        ensure!(
            matches!(self.cache_quant_bit, 0 | 8),
            "cache_quant_bit must be 0 or 8, got {}",
            self.cache_quant_bit
        );
        if self.cache_quant_bit > 0 {
            ensure!(
                self.cache_quant_group > 0,
                "cache_quant_group must be positive"
            );
            ensure!(
                self.head_dim().is_multiple_of(self.cache_quant_group),
                "head_dim {} must be divisible by cache_quant_group {}",
                self.head_dim(),
                self.cache_quant_group
            );
        }
        self.cache_layout()?;
        ensure!(self.max_batch_size > 0, "max_batch_size must be positive");
        ensure!(self.max_seq_len > 0, "max_seq_len must be positive");
        Ok(())
    }

    /// Checks that every sharded dimension splits evenly over `world_size` ranks.
    pub fn validate_tensor_parallel(&self, world_size: usize) -> Result<()> {
        ensure!(world_size > 0, "world_size must be positive");
        for (name, value) in [
            ("num_heads", self.num_heads),
            ("num_kv_heads", self.num_kv_heads()),
            ("intermediate_dim", self.intermediate_dim),
            ("hidden_dim", self.hidden_dim),
            ("vocab_size", self.vocab_size),
        ] {
            ensure!(
                value.is_multiple_of(world_size),
                "{} {} must be divisible by tensor parallel size {}",
                name,
                value,
                world_size
            );
        }
        Ok(())
    }
}

/// Structural switches fixed when the module tree is built.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelOptions {
    #[serde(default)]
    pub friendly_gqa: bool,
    #[serde(default = "default_true")]
    pub fused_qkv: bool,
    #[serde(default = "default_true")]
    pub fused_kvcache: bool,
    #[serde(default = "default_true")]
    pub fused_ffn_glu: bool,
    #[serde(default)]
    pub fused_alibi: bool,
    #[serde(default = "default_true")]
    pub with_rope: bool,
    #[serde(default)]
    pub with_alibi: bool,
    #[serde(default)]
    pub attn_wqkv_bias_term: bool,
    #[serde(default)]
    pub attn_wo_bias_term: bool,
    #[serde(default)]
    pub ffn_linear_bias_term: bool,
    /// Number of leading head dims that are rotated; 0 means all of them.
    #[serde(default)]
    pub rotary_dim: usize,
}

impl Default for ModelOptions {
    fn default() -> Self {
        Self {
            friendly_gqa: false,
            fused_qkv: true,
            fused_kvcache: true,
            fused_ffn_glu: true,
            fused_alibi: false,
            with_rope: true,
            with_alibi: false,
            attn_wqkv_bias_term: false,
            attn_wo_bias_term: false,
            ffn_linear_bias_term: false,
            rotary_dim: 0,
        }
    }
}

impl ModelOptions {
    /// Separate projections and the two-step cache path.
    pub fn unfused() -> Self {
        Self {
            fused_qkv: false,
            fused_kvcache: false,
            fused_ffn_glu: false,
            ..Self::default()
        }
    }

    pub fn resolved_rotary_dim(&self, head_dim: usize) -> Result<usize> {
        let rotary_dim = if self.rotary_dim == 0 {
            head_dim
        } else {
            self.rotary_dim
        };
        ensure!(
            rotary_dim <= head_dim,
            "rotary_dim {} exceeds head_dim {}",
            rotary_dim,
            head_dim
        );
        ensure!(
            rotary_dim.is_multiple_of(2),
            "rotary_dim must be even, got {}",
            rotary_dim
        );
        Ok(rotary_dim)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelDtype {
    F16,
    Bf16,
    F32,
}

impl ModelDtype {
    pub fn dtype(self) -> DType {
        match self {
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
            Self::F32 => DType::F32,
        }
    }
}

impl FromStr for ModelDtype {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "f16" | "fp16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::Bf16),
            "f32" | "fp32" | "float32" => Ok(Self::F32),
            _ => Err(anyhow!("unsupported dtype '{}'", raw)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SamplingParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_k")]
    pub top_k: isize,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_k: default_top_k(),
            top_p: default_top_p(),
        }
    }
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.temperature >= 0.0 && self.temperature.is_finite(),
            "temperature must be finite and >= 0"
        );
        ensure!(
            self.top_k == -1 || self.top_k >= 1,
            "top_k must be -1 or >= 1"
        );
        ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            "top_p must be in (0, 1]"
        );
        Ok(())
    }
}

/// Settings of the command-line runner, read from `LLAMA_*` variables.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub model: PathBuf,
    pub prompt: Option<String>,
    pub tokens: Option<Vec<u32>>,
    pub batch: usize,
    pub max_new_tokens: usize,
    pub tp_size: usize,
    pub dtype: ModelDtype,
    pub sampling: SamplingParams,
    pub seed: u64,
    pub eos: Option<u32>,
    pub random_weights: bool,
}

impl RunConfig {
    pub fn from_env() -> Result<Self> {
        let model = env::var(MODEL_ENV)
            .map(PathBuf::from)
            .map_err(|_| anyhow!("set {MODEL_ENV} to the model directory path"))?;
        let prompt = env::var(PROMPT_ENV).ok();
        let tokens = env::var(TOKENS_ENV)
            .ok()
            .map(|raw| parse_token_list(&raw))
            .transpose()?;
        let sampling = SamplingParams {
            temperature: parse_env_or_default(TEMPERATURE_ENV, 0.0f32)?,
            top_k: parse_env_or_default(TOP_K_ENV, default_top_k())?,
            top_p: parse_env_or_default(TOP_P_ENV, default_top_p())?,
        };
        let eos = env::var(EOS_ENV)
            .ok()
            .map(|raw| {
                raw.parse::<u32>()
                    .map_err(|err| anyhow!("invalid {EOS_ENV} value '{raw}': {err}"))
            })
            .transpose()?;
        let config = Self {
            model,
            prompt,
            tokens,
            batch: parse_env_or_default(BATCH_ENV, 1usize)?,
            max_new_tokens: parse_env_or_default(MAX_NEW_TOKENS_ENV, 16usize)?,
            tp_size: parse_env_or_default(TP_SIZE_ENV, 1usize)?,
            dtype: parse_env_or_default(DTYPE_ENV, ModelDtype::F32)?,
            sampling,
            seed: parse_env_or_default(SEED_ENV, 42u64)?,
            eos,
            random_weights: parse_env_or_default(RANDOM_WEIGHTS_ENV, false)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.prompt.is_some() || self.tokens.is_some(),
            "set {PROMPT_ENV} or {TOKENS_ENV}"
        );
        ensure!(self.batch > 0, "{BATCH_ENV} must be positive");
        ensure!(self.tp_size > 0, "{TP_SIZE_ENV} must be positive");
        self.sampling.validate()
    }
}

pub fn parse_token_list(raw: &str) -> Result<Vec<u32>> {
    let tokens = raw
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<u32>()
                .map_err(|err| anyhow!("invalid token id '{part}': {err}"))
        })
        .collect::<Result<Vec<_>>>()?;
    ensure!(!tokens.is_empty(), "token list must not be empty");
    Ok(tokens)
}

fn parse_env_or_default<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| anyhow!("invalid {name} value '{raw}': {err}")),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(anyhow!("failed reading {name}: {err}")),
    }
}

const fn default_true() -> bool {
    true
}

const fn default_norm_eps() -> f64 {
    1e-5
}

const fn default_rope_theta() -> f64 {
    10_000.0
}

const fn default_rope_scaling_factor() -> f64 {
    1.0
}

const fn default_max_position_embeddings() -> usize {
    2_048
}

const fn default_auto_causal() -> bool {
    true
}

const fn default_cache_quant_group() -> usize {
    8
}

const fn default_max_batch_size() -> usize {
    1
}

const fn default_max_seq_len() -> usize {
    2_048
}

const fn default_temperature() -> f32 {
    1.0
}

const fn default_top_k() -> isize {
    -1
}

const fn default_top_p() -> f32 {
    1.0
}
