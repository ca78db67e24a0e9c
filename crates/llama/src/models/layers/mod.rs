pub mod alibi;
pub mod distributed;
pub mod linear;
pub mod norm;
pub mod parallel;
pub mod rotary;

pub use alibi::{alibi_mask, alibi_slopes, window_mask};
pub use distributed::{
    Comm, LocalGroup, TpBackend, TpInfo, run_tensor_parallel, shard_range, shard_size,
};
pub use linear::Linear;
pub use norm::RmsNorm;
pub use parallel::{ColumnParallelLinear, ParallelEmbedding, RowParallelLinear};
pub use rotary::RotaryEmbedding;
