use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, ensure};
use candle_core::{DType, Device, Tensor};
use serde::Deserialize;
use tracing::info;

use crate::attention::AttentionBackend;
use crate::models::layers::Comm;
use crate::models::{LoadReport, Transformer};
use crate::utils::{ModelOptions, ModelParams};

pub const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: BTreeMap<String, String>,
}

pub fn resolve_weight_files(model_dir: &Path) -> Result<Vec<PathBuf>> {
    let index_path = model_dir.join(SAFETENSORS_INDEX_FILE);
    if index_path.exists() {
        let raw = fs::read_to_string(&index_path).with_context(|| {
            format!(
                "failed reading safetensors index at {}",
                index_path.display()
            )
        })?;
        let index: SafetensorsIndex = serde_json::from_str(&raw).with_context(|| {
            format!(
                "failed parsing safetensors index at {}",
                index_path.display()
            )
        })?;
        let unique_files: BTreeSet<&String> = index.weight_map.values().collect();
        let files: Vec<PathBuf> = unique_files
            .into_iter()
            .map(|filename| model_dir.join(filename))
            .collect();
        ensure!(
            !files.is_empty(),
            "safetensors index has no weight_map entries at {}",
            index_path.display()
        );
        for file in &files {
            ensure!(
                file.exists(),
                "indexed safetensor file missing: {}",
                file.display()
            );
        }
        Ok(files)
    } else {
        let mut files = Vec::new();
        for entry in fs::read_dir(model_dir)
            .with_context(|| format!("failed listing model dir {}", model_dir.display()))?
        {
            let entry = entry.with_context(|| "failed reading model dir entry")?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "safetensors") {
                files.push(path);
            }
        }
        files.sort();
        ensure!(
            !files.is_empty(),
            "no .safetensors files found under {}",
            model_dir.display()
        );
        Ok(files)
    }
}

/// Directory holding the weights of `rank`: `model_slice_{rank}/` when the
/// checkpoint was pre-sliced, otherwise `model_dir` itself.
pub fn weights_dir_for_rank(model_dir: &Path, rank: usize) -> PathBuf {
    let slice_dir = model_dir.join(format!("model_slice_{rank}"));
    if slice_dir.is_dir() {
        slice_dir
    } else {
        model_dir.to_path_buf()
    }
}

/// Reads every safetensors file under `weights_dir` into one flat state dict.
pub fn load_state_dict_from_dir(
    weights_dir: &Path,
    device: &Device,
) -> Result<HashMap<String, Tensor>> {
    let mut state_dict = HashMap::new();
    for file in resolve_weight_files(weights_dir)? {
        let tensors = candle_core::safetensors::load(&file, device)
            .with_context(|| format!("failed loading safetensors file {}", file.display()))?;
        for (name, tensor) in tensors {
            ensure!(
                state_dict.insert(name.clone(), tensor).is_none(),
                "tensor {} appears in more than one checkpoint file",
                name
            );
        }
    }
    Ok(state_dict)
}

pub fn save_state_dict(state_dict: &HashMap<String, Tensor>, path: &Path) -> Result<()> {
    candle_core::safetensors::save(state_dict, path)
        .with_context(|| format!("failed writing safetensors file {}", path.display()))
}

/// Builds a model from `params.json` (or `config.json`) in `model_dir` and
/// fills it either with the checkpoint weights or with random values.
pub fn load_model_from_dir(
    model_dir: &Path,
    options: ModelOptions,
    comm: Comm,
    backend: Arc<dyn AttentionBackend>,
    dtype: DType,
    device: &Device,
    random_weights: bool,
) -> Result<(Transformer, LoadReport)> {
    ensure!(
        model_dir.is_dir(),
        "model path must be a directory: {}",
        model_dir.display()
    );
    let params = ModelParams::from_model_dir(model_dir)?;
    let rank = comm.rank();
    let mut model = Transformer::new(params, options, comm, backend, dtype, device)?;
    if random_weights {
        model.random_weights()?;
        return Ok((model, LoadReport::default()));
    }
    let weights_dir = weights_dir_for_rank(model_dir, rank);
    info!(rank, dir = %weights_dir.display(), "loading checkpoint");
    let state_dict = load_state_dict_from_dir(&weights_dir, device)?;
    let report = model.load_state_dict(&state_dict)?;
    Ok((model, report))
}
