#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use candle_core::{DType, Device, Tensor};
use llama::attention::{AttentionBackend, EagerAttentionBackend};
use llama::models::layers::Comm;
use llama::utils::{ModelOptions, ModelParams, RopeScaling, RopeStyle};
use llama::{KvCache, Transformer};

pub fn tiny_params() -> ModelParams {
    ModelParams {
        hidden_dim: 32,
        intermediate_dim: 48,
        num_layers: 2,
        num_heads: 4,
        num_kv_heads: Some(2),
        head_dim: None,
        vocab_size: 40,
        norm_eps: 1e-5,
        rope_theta: 10_000.0,
        rope_scaling_type: RopeScaling::None,
        rope_scaling_factor: 1.0,
        rope_scaling: None,
        rope_style: RopeStyle::Interleaved,
        max_position_embeddings: 64,
        auto_causal: true,
        cache_quant_bit: 0,
        cache_quant_group: 8,
        cache_layout: 0,
        max_batch_size: 2,
        max_seq_len: 16,
    }
}

pub fn backend() -> Arc<dyn AttentionBackend> {
    Arc::new(EagerAttentionBackend::new())
}

pub fn small_randn(shape: &[usize]) -> Tensor {
    Tensor::randn(0f32, 0.02f32, shape, &Device::Cpu).unwrap()
}

fn norm_weight(dim: usize) -> Tensor {
    (Tensor::ones(dim, DType::F32, &Device::Cpu).unwrap() + small_randn(&[dim])).unwrap()
}

/// Full-size, unfused checkpoint in the `layers.{i}.attention.wq.weight` naming.
pub fn unfused_state_dict(
    params: &ModelParams,
    options: &ModelOptions,
) -> HashMap<String, Tensor> {
    let hidden = params.hidden_dim;
    let q_dim = params.num_heads * params.head_dim();
    let kv_dim = params.num_kv_heads() * params.head_dim();
    let imm = params.intermediate_dim;
    let mut dict = HashMap::new();
    dict.insert(
        "tok_embeddings.weight".to_string(),
        small_randn(&[params.vocab_size, hidden]),
    );
    dict.insert("norm.weight".to_string(), norm_weight(hidden));
    dict.insert(
        "output.weight".to_string(),
        small_randn(&[params.vocab_size, hidden]),
    );
    for layer in 0..params.num_layers {
        let prefix = format!("layers.{layer}");
        let mut put = |name: &str, tensor: Tensor| {
            dict.insert(format!("{prefix}.{name}"), tensor);
        };
        put("attention_norm.weight", norm_weight(hidden));
        put("ffn_norm.weight", norm_weight(hidden));
        put("attention.wq.weight", small_randn(&[q_dim, hidden]));
        put("attention.wk.weight", small_randn(&[kv_dim, hidden]));
        put("attention.wv.weight", small_randn(&[kv_dim, hidden]));
        put("attention.wo.weight", small_randn(&[hidden, q_dim]));
        put("feed_forward.w1.weight", small_randn(&[imm, hidden]));
        put("feed_forward.w3.weight", small_randn(&[imm, hidden]));
        put("feed_forward.w2.weight", small_randn(&[hidden, imm]));
        if options.attn_wqkv_bias_term {
            put("attention.wq.bias", small_randn(&[q_dim]));
            put("attention.wk.bias", small_randn(&[kv_dim]));
            put("attention.wv.bias", small_randn(&[kv_dim]));
        }
        if options.attn_wo_bias_term {
            put("attention.wo.bias", small_randn(&[hidden]));
        }
        if options.ffn_linear_bias_term {
            put("feed_forward.w1.bias", small_randn(&[imm]));
            put("feed_forward.w3.bias", small_randn(&[imm]));
            put("feed_forward.w2.bias", small_randn(&[hidden]));
        }
    }
    dict
}

/// Same weights with `wq|wk|wv` and `w1|w3` concatenated into `wqkv` and `wu`.
pub fn fused_state_dict(
    unfused: &HashMap<String, Tensor>,
    num_layers: usize,
) -> HashMap<String, Tensor> {
    let mut dict = unfused.clone();
    for layer in 0..num_layers {
        let prefix = format!("layers.{layer}");
        for param in ["weight", "bias"] {
            let names = ["wq", "wk", "wv"].map(|m| format!("{prefix}.attention.{m}.{param}"));
            if names.iter().all(|name| dict.contains_key(name)) {
                let parts: Vec<Tensor> =
                    names.iter().filter_map(|name| dict.remove(name)).collect();
                dict.insert(
                    format!("{prefix}.attention.wqkv.{param}"),
                    Tensor::cat(&parts, 0).unwrap(),
                );
            }
            let names = ["w1", "w3"].map(|m| format!("{prefix}.feed_forward.{m}.{param}"));
            if names.iter().all(|name| dict.contains_key(name)) {
                let parts: Vec<Tensor> =
                    names.iter().filter_map(|name| dict.remove(name)).collect();
                dict.insert(
                    format!("{prefix}.feed_forward.wu.{param}"),
                    Tensor::cat(&parts, 0).unwrap(),
                );
            }
        }
    }
    dict
}

pub fn build_model(
    params: &ModelParams,
    options: ModelOptions,
    comm: Comm,
    state_dict: &HashMap<String, Tensor>,
) -> Transformer {
    let mut model = Transformer::new(
        params.clone(),
        options,
        comm,
        backend(),
        DType::F32,
        &Device::Cpu,
    )
    .unwrap();
    let report = model.load_state_dict(state_dict).unwrap();
    assert!(report.is_complete(), "unused tensors: {:?}", report.unused);
    model
}

pub fn tokens(rows: &[&[u32]]) -> Tensor {
    let seq = rows[0].len();
    let flat: Vec<u32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Tensor::from_vec(flat, (rows.len(), seq), &Device::Cpu).unwrap()
}

pub fn full_logits(model: &Transformer, tokens: &Tensor) -> Tensor {
    let mut cache: KvCache = model.new_kv_cache().unwrap();
    model.logit_forward(tokens, None, 0, &mut cache).unwrap()
}

pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
    assert_eq!(a.dims(), b.dims());
    (a.to_dtype(DType::F32).unwrap() - b.to_dtype(DType::F32).unwrap())
        .unwrap()
        .abs()
        .unwrap()
        .flatten_all()
        .unwrap()
        .max(0)
        .unwrap()
        .to_scalar::<f32>()
        .unwrap()
}

pub fn assert_close(a: &Tensor, b: &Tensor, tol: f32) {
    let diff = max_abs_diff(a, b);
    assert!(diff <= tol, "max abs diff {diff} exceeds {tol}");
}
