pub mod base;
pub mod cache;
pub mod eager;

use std::sync::Arc;

pub use base::{AttentionBackend, AttentionParams, CachePosition, repeat_kv};
pub use cache::{CacheLayout, CacheSpec, KvCache, dequantize, quantize};
pub use eager::EagerAttentionBackend;

pub fn default_backend() -> Arc<dyn AttentionBackend> {
    Arc::new(EagerAttentionBackend::new())
}
