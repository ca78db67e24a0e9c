pub mod generator;
pub mod sampler;

pub use generator::{GenerationOutput, Generator};
pub use sampler::{Sampler, SamplingStrategy};
