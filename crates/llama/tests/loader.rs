mod common;

use std::collections::HashMap;
use std::fs;

use candle_core::{DType, Device, Tensor};
use llama::models::layers::{Comm, run_tensor_parallel};
use llama::utils::{
    ModelOptions, ModelParams, load_model_from_dir, load_state_dict_from_dir, resolve_weight_files,
    save_state_dict, weights_dir_for_rank,
};

use common::{
    assert_close, backend, build_model, full_logits, tiny_params, tokens, unfused_state_dict,
};

fn write_params(dir: &std::path::Path, params: &ModelParams) {
    fs::write(
        dir.join("params.json"),
        serde_json::to_string_pretty(params).unwrap(),
    )
    .unwrap();
}

#[test]
fn loads_params_and_safetensors_from_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let params = tiny_params();
    let options = ModelOptions::default();
    let state_dict = unfused_state_dict(&params, &options);
    write_params(dir.path(), &params);
    save_state_dict(&state_dict, &dir.path().join("model.safetensors")).unwrap();

    let (model, report) = load_model_from_dir(
        dir.path(),
        options,
        Comm::single(),
        backend(),
        DType::F32,
        &Device::Cpu,
        false,
    )
    .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.loaded_count(), state_dict.len());
    assert_eq!(model.params(), &params);

    let reference = build_model(&params, options, Comm::single(), &state_dict);
    let input = tokens(&[&[1, 2, 3, 4]]);
    assert_close(&full_logits(&model, &input), &full_logits(&reference, &input), 0.0);
}

#[test]
fn index_file_selects_the_listed_shards() {
    let dir = tempfile::tempdir().unwrap();
    let a = Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap();
    let b = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
    save_state_dict(
        &HashMap::from([("a".to_string(), a)]),
        &dir.path().join("part-1.safetensors"),
    )
    .unwrap();
    save_state_dict(
        &HashMap::from([("b".to_string(), b)]),
        &dir.path().join("part-2.safetensors"),
    )
    .unwrap();
    let stale = Tensor::zeros(1, DType::F32, &Device::Cpu).unwrap();
    save_state_dict(
        &HashMap::from([("stale".to_string(), stale)]),
        &dir.path().join("unlisted.safetensors"),
    )
    .unwrap();
    fs::write(
        dir.path().join("model.safetensors.index.json"),
        r#"{"metadata": {}, "weight_map": {"a": "part-1.safetensors", "b": "part-2.safetensors"}}"#,
    )
    .unwrap();

    let files = resolve_weight_files(dir.path()).unwrap();
    assert_eq!(files.len(), 2);
    let state_dict = load_state_dict_from_dir(dir.path(), &Device::Cpu).unwrap();
    let mut names: Vec<_> = state_dict.keys().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}

#[test]
fn missing_weights_are_an_error() {
    let dir = tempfile::tempdir().unwrap();
    write_params(dir.path(), &tiny_params());
    assert!(resolve_weight_files(dir.path()).is_err());
    assert!(
        load_model_from_dir(
            dir.path(),
            ModelOptions::default(),
            Comm::single(),
            backend(),
            DType::F32,
            &Device::Cpu,
            false,
        )
        .is_err()
    );
}

#[test]
fn random_weights_skip_the_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    write_params(dir.path(), &tiny_params());
    let (model, report) = load_model_from_dir(
        dir.path(),
        ModelOptions::default(),
        Comm::single(),
        backend(),
        DType::F32,
        &Device::Cpu,
        true,
    )
    .unwrap();
    assert_eq!(report.loaded_count(), 0);
    assert_eq!(model.params().num_layers, 2);
}

#[test]
fn hf_config_is_used_without_params_json() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("config.json"),
        r#"{"hidden_size": 32, "intermediate_size": 48, "num_hidden_layers": 1,
            "num_attention_heads": 4, "vocab_size": 40, "rms_norm_eps": 1e-6}"#,
    )
    .unwrap();
    let params = ModelParams::from_model_dir(dir.path()).unwrap();
    assert_eq!(params.num_layers, 1);
    assert_eq!(params.num_kv_heads(), 4);
}

#[test]
fn rank_slices_take_precedence_over_the_full_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let params = tiny_params();
    let options = ModelOptions::default();
    let full = unfused_state_dict(&params, &options);
    write_params(dir.path(), &params);
    save_state_dict(&full, &dir.path().join("model.safetensors")).unwrap();

    // slice 1 carries the rank-local shards of every tensor
    let slice_dir = dir.path().join("model_slice_1");
    fs::create_dir(&slice_dir).unwrap();
    let shards = run_tensor_parallel(2, |comm| {
        let mut local = HashMap::new();
        for (name, tensor) in &full {
            let local_tensor = if name.ends_with("wq.weight")
                || name.ends_with("wk.weight")
                || name.ends_with("wv.weight")
                || name.ends_with("w1.weight")
                || name.ends_with("w3.weight")
                || name == "output.weight"
            {
                let range = comm.shard_range(tensor.dim(0)?)?;
                tensor.narrow(0, range.start, range.len())?
            } else if name.ends_with("wo.weight")
                || name.ends_with("w2.weight")
                || name == "tok_embeddings.weight"
            {
                let range = comm.shard_range(tensor.dim(1)?)?;
                tensor.narrow(1, range.start, range.len())?.contiguous()?
            } else {
                tensor.clone()
            };
            local.insert(name.clone(), local_tensor);
        }
        Ok(local)
    })
    .unwrap();
    save_state_dict(&shards[1], &slice_dir.join("model.safetensors")).unwrap();

    assert_eq!(weights_dir_for_rank(dir.path(), 1), slice_dir);
    assert_eq!(weights_dir_for_rank(dir.path(), 0), dir.path());

    let input = tokens(&[&[5, 6, 7]]);
    let expected = full_logits(&build_model(&params, options, Comm::single(), &full), &input);
    let outputs = run_tensor_parallel(2, |comm| {
        let (model, report) = load_model_from_dir(
            dir.path(),
            options,
            comm,
            backend(),
            DType::F32,
            &Device::Cpu,
            false,
        )?;
        assert!(report.is_complete());
        let mut cache = model.new_kv_cache()?;
        model.logit_forward(&input, None, 0, &mut cache)
    })
    .unwrap();
    for out in outputs {
        assert_close(&out, &expected, 1e-4);
    }
}
