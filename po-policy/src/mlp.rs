//! Fully-connected Q-network loaded from a safetensors checkpoint.
//!
//! Checkpoint layout: `layers.{i}.weight` as f32 `[out, in]` and `layers.{i}.bias` as f32
//! `[out]`, for `i = 0..n` with no gaps. ReLU sits between layers; the last layer emits one
//! Q-value per action.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bytemuck::cast_slice;
use po_core::{Action, PolicyConfig};
use safetensors::tensor::{Dtype, TensorView};
use safetensors::SafeTensors;
use thiserror::Error;

use crate::{check_input, PolicyError, PolicyOracle};

/// File looked up inside a checkpoint directory.
pub const CHECKPOINT_FILE_NAME: &str = "policy.safetensors";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("checkpoint not found: {0}")]
    Missing(PathBuf),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),
    #[error("malformed checkpoint: {0}")]
    Format(String),
    #[error("checkpoint does not match the configured architecture: {0}")]
    Incompatible(String),
}

/// One affine layer, row-major weights.
#[derive(Debug, Clone, PartialEq)]
pub struct Dense {
    pub inputs: usize,
    pub outputs: usize,
    pub weight: Vec<f32>,
    pub bias: Vec<f32>,
}

impl Dense {
    pub fn new(inputs: usize, outputs: usize, weight: Vec<f32>, bias: Vec<f32>) -> Result<Self, LoadError> {
        let layer = Self {
            inputs,
            outputs,
            weight,
            bias,
        };
        layer.check_shape()?;
        Ok(layer)
    }

    fn check_shape(&self) -> Result<(), LoadError> {
        let (inputs, outputs) = (self.inputs, self.outputs);
        if inputs == 0 || outputs == 0 {
            return Err(LoadError::Format(format!(
                "dense {inputs}x{outputs}: zero-width layer"
            )));
        }
        if self.weight.len() != inputs * outputs || self.bias.len() != outputs {
            return Err(LoadError::Format(format!(
                "dense {inputs}x{outputs}: weight len {}, bias len {}",
                self.weight.len(),
                self.bias.len()
            )));
        }
        Ok(())
    }

    fn forward_into(&self, x: &[f32], out: &mut Vec<f32>) {
        out.clear();
        out.reserve(self.outputs);
        for (row, b) in self.weight.chunks_exact(self.inputs).zip(&self.bias) {
            let dot: f32 = row.iter().zip(x).map(|(w, v)| w * v).sum();
            out.push(dot + b);
        }
    }
}

#[derive(Debug, Clone)]
pub struct MlpPolicy {
    layers: Vec<Dense>,
}

impl MlpPolicy {
    /// Load a checkpoint file (or a directory holding [`CHECKPOINT_FILE_NAME`]) and check it
    /// against the configured architecture.
    pub fn load(path: impl AsRef<Path>, cfg: &PolicyConfig) -> Result<Self, LoadError> {
        let path = resolve_checkpoint(path.as_ref())?;
        let bytes = fs::read(&path)?;
        let policy = Self::from_safetensors(&bytes)?;
        policy.check_architecture(cfg)?;
        Ok(policy)
    }

    pub fn from_safetensors(bytes: &[u8]) -> Result<Self, LoadError> {
        let st = SafeTensors::deserialize(bytes)?;
        let mut layers = Vec::new();
        loop {
            let i = layers.len();
            let w_name = format!("layers.{i}.weight");
            if !st.names().iter().any(|n| **n == w_name) {
                break;
            }
            let w = st.tensor(&w_name)?;
            let b = st.tensor(&format!("layers.{i}.bias"))?;
            if w.dtype() != Dtype::F32 || b.dtype() != Dtype::F32 {
                return Err(LoadError::Format(format!("layer {i}: expected f32 tensors")));
            }
            let (outputs, inputs) = match w.shape() {
                [o, n] => (*o, *n),
                other => {
                    return Err(LoadError::Format(format!(
                        "layer {i}: weight shape {other:?} is not 2-D"
                    )))
                }
            };
            if b.shape() != [outputs] {
                return Err(LoadError::Format(format!(
                    "layer {i}: bias shape {:?}, expected [{outputs}]",
                    b.shape()
                )));
            }
            // Tensor data inside the file is not guaranteed to be 4-byte aligned.
            let weight: Vec<f32> = bytemuck::pod_collect_to_vec(w.data());
            let bias: Vec<f32> = bytemuck::pod_collect_to_vec(b.data());
            layers.push(Dense::new(inputs, outputs, weight, bias)?);
        }
        Self::from_layers(layers)
    }

    pub fn from_layers(layers: Vec<Dense>) -> Result<Self, LoadError> {
        if layers.is_empty() {
            return Err(LoadError::Format("checkpoint has no layers".to_string()));
        }
        // Fields are public, so layers built by hand are checked here too.
        for layer in &layers {
            layer.check_shape()?;
        }
        for pair in layers.windows(2) {
            if pair[0].outputs != pair[1].inputs {
                return Err(LoadError::Format(format!(
                    "layer widths do not chain: {} -> {}",
                    pair[0].outputs, pair[1].inputs
                )));
            }
        }
        Ok(Self { layers })
    }

    fn check_architecture(&self, cfg: &PolicyConfig) -> Result<(), LoadError> {
        if self.input_len() != cfg.state_size {
            return Err(LoadError::Incompatible(format!(
                "input width {} != state_size {}",
                self.input_len(),
                cfg.state_size
            )));
        }
        if self.action_space() != cfg.action_space_size {
            return Err(LoadError::Incompatible(format!(
                "output width {} != action_space_size {}",
                self.action_space(),
                cfg.action_space_size
            )));
        }
        let hidden: Vec<usize> = self.layers[..self.layers.len() - 1]
            .iter()
            .map(|l| l.outputs)
            .collect();
        if hidden != cfg.hidden {
            return Err(LoadError::Incompatible(format!(
                "hidden widths {hidden:?} != configured {:?}",
                cfg.hidden
            )));
        }
        Ok(())
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    /// Raw Q-values for `state`.
    pub fn q_values(&self, state: &[f32]) -> Result<Vec<f32>, PolicyError> {
        check_input(state, self.input_len())?;
        let mut cur = state.to_vec();
        let mut next = Vec::new();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            layer.forward_into(&cur, &mut next);
            if i != last {
                for v in next.iter_mut() {
                    *v = v.max(0.0);
                }
            }
            std::mem::swap(&mut cur, &mut next);
        }
        if let Some(i) = cur.iter().position(|v| !v.is_finite()) {
            return Err(PolicyError::NonFinite(i));
        }
        Ok(cur)
    }
}

impl PolicyOracle for MlpPolicy {
    fn input_len(&self) -> usize {
        self.layers[0].inputs
    }

    fn action_space(&self) -> usize {
        self.layers[self.layers.len() - 1].outputs
    }

    fn choose_action(&self, state: &[f32]) -> Result<Action, PolicyError> {
        let q = self.q_values(state)?;
        // Strict `>` keeps the lowest index on ties.
        let mut best_i = 0usize;
        for (i, &v) in q.iter().enumerate().skip(1) {
            if v > q[best_i] {
                best_i = i;
            }
        }
        Ok(best_i as Action)
    }

    fn export_portable(&self, sample: &[f32]) -> Result<Vec<u8>, crate::ExportError> {
        crate::export::export_graph(self, sample)
    }
}

fn resolve_checkpoint(path: &Path) -> Result<PathBuf, LoadError> {
    let p = if path.is_dir() {
        path.join(CHECKPOINT_FILE_NAME)
    } else {
        path.to_path_buf()
    };
    if !p.is_file() {
        return Err(LoadError::Missing(p));
    }
    Ok(p)
}

/// Serialize `layers` into the checkpoint layout understood by [`MlpPolicy::load`].
pub fn write_checkpoint(path: impl AsRef<Path>, layers: &[Dense]) -> Result<(), LoadError> {
    let bytes = layers_to_safetensors(layers, None)?;
    let path = path.as_ref();
    let tmp = path.with_extension("safetensors.tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

pub(crate) fn layers_to_safetensors(
    layers: &[Dense],
    metadata: Option<std::collections::HashMap<String, String>>,
) -> Result<Vec<u8>, safetensors::SafeTensorError> {
    let mut tensors: BTreeMap<String, TensorView<'_>> = BTreeMap::new();
    for (i, l) in layers.iter().enumerate() {
        tensors.insert(
            format!("layers.{i}.weight"),
            TensorView::new(Dtype::F32, vec![l.outputs, l.inputs], cast_slice(&l.weight))?,
        );
        tensors.insert(
            format!("layers.{i}.bias"),
            TensorView::new(Dtype::F32, vec![l.outputs], cast_slice(&l.bias))?,
        );
    }
    safetensors::serialize(&tensors, &metadata)
}
