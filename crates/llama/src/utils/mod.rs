pub mod config;
pub mod loader;
pub mod tokenizer;

pub use config::{
    HF_CONFIG_FILE, HfRopeScaling, ModelDtype, ModelOptions, ModelParams, PARAMS_FILE,
    RopeScaling, RopeStyle, RunConfig, SamplingParams, parse_token_list,
};
pub use loader::{
    load_model_from_dir, load_state_dict_from_dir, resolve_weight_files, save_state_dict,
    weights_dir_for_rank,
};
pub use tokenizer::{decode_tokens, encode_prompt, load_tokenizer};
