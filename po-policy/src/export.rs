//! Portable graph export.
//!
//! The export is a single safetensors file: the weights plus a `__metadata__` map that spells
//! out the computation (`gemm`/`relu`/`argmax` ops), the input/output names and the Q-values for
//! a sample input, so a consumer outside this workspace can rebuild and verify the network.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use rand_distr::StandardNormal;
use serde::Serialize;
use thiserror::Error;

use crate::mlp::{layers_to_safetensors, MlpPolicy};
use crate::{PolicyError, PolicyOracle};

/// Value of the `format` metadata key.
pub const GRAPH_FORMAT: &str = "po-graph-v1";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("this policy has no portable form")]
    Unsupported,
    #[error("policy: {0}")]
    Policy(#[from] PolicyError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum GraphOp {
    Gemm { weight: String, bias: String },
    Relu,
    Argmax,
}

pub(crate) fn export_graph(policy: &MlpPolicy, sample: &[f32]) -> Result<Vec<u8>, ExportError> {
    let q = policy.q_values(sample)?;
    let layers = policy.layers();

    let mut ops = Vec::with_capacity(layers.len() * 2 + 1);
    for i in 0..layers.len() {
        if i > 0 {
            ops.push(GraphOp::Relu);
        }
        ops.push(GraphOp::Gemm {
            weight: format!("layers.{i}.weight"),
            bias: format!("layers.{i}.bias"),
        });
    }
    ops.push(GraphOp::Argmax);

    let mut meta = HashMap::new();
    meta.insert("format".to_string(), GRAPH_FORMAT.to_string());
    meta.insert("graph".to_string(), serde_json::to_string(&ops)?);
    meta.insert("input_name".to_string(), "obs".to_string());
    meta.insert(
        "input_shape".to_string(),
        serde_json::to_string(&[1, policy.input_len()])?,
    );
    meta.insert("output_name".to_string(), "output".to_string());
    meta.insert("sample_input".to_string(), serde_json::to_string(sample)?);
    meta.insert("sample_output".to_string(), serde_json::to_string(&q)?);

    Ok(layers_to_safetensors(layers, Some(meta))?)
}

/// Deterministic standard-normal sample used to trace the export.
pub fn sample_state(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..len).map(|_| rng.sample::<f32, _>(StandardNormal)).collect()
}

/// Write export bytes atomically, creating parent directories.
pub fn write_export(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), ExportError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
