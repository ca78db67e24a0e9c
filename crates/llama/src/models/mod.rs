pub mod layers;
pub mod llama;

pub use layers::{
    ColumnParallelLinear, Comm, LocalGroup, ParallelEmbedding, RmsNorm, RotaryEmbedding,
    RowParallelLinear, TpBackend, TpInfo, run_tensor_parallel,
};
pub use llama::{LoadReport, PackedShard, Transformer};
