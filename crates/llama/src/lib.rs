pub mod attention;
pub mod models;
pub mod runner;
pub mod utils;

pub use attention::{AttentionBackend, CacheLayout, CacheSpec, EagerAttentionBackend, KvCache};
pub use models::{Comm, LoadReport, Transformer, run_tensor_parallel};
pub use runner::{Generator, Sampler};
pub use utils::{ModelOptions, ModelParams, RunConfig, SamplingParams};
