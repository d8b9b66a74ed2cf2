use std::collections::HashSet;
use std::path::Path;

use candle::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::{VarBuilder, VarMap};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::classes::ClassTable;
use crate::error::ClassifierError;
use crate::vit::{class_probabilities, ViTConfig, VisionTransformer};

/// Number of ranked labels returned per image.
pub const TOP_K: usize = 3;

pub const MODEL_NAME: &str = "Vision Transformer";

/// Checkpoints saved alongside optimizer state nest the weights under this key.
const STATE_DICT_KEY: &str = "model_state_dict";

/// Prefix left by the training-side wrapper module.
const WRAPPER_PREFIX: &str = "vit.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub class: String,
    pub confidence: f32,
}

/// Outcome of a non-strict weight load.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    pub loaded: usize,
    pub missing: Vec<String>,
    pub unexpected: Vec<String>,
}

/// Loaded classifier network plus the labels it predicts over.
pub struct Classifier {
    network: Box<dyn Module + Send + Sync>,
    classes: ClassTable,
    device: Device,
}

impl Classifier {
    pub fn load(
        checkpoint: impl AsRef<Path>,
        classes: ClassTable,
        device: Device,
    ) -> Result<Self, ClassifierError> {
        let config = ViTConfig::deit_base_patch16_224(classes.len());
        Self::load_with_config(checkpoint, classes, &config, device)
    }

    pub fn load_with_config(
        checkpoint: impl AsRef<Path>,
        classes: ClassTable,
        config: &ViTConfig,
        device: Device,
    ) -> Result<Self, ClassifierError> {
        let checkpoint = checkpoint.as_ref();
        let state_dict = read_checkpoint(checkpoint)?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let network = VisionTransformer::new(config, vb).map_err(model_load)?;

        let report = apply_state_dict(&varmap, state_dict, &device)?;
        if !report.missing.is_empty() {
            warn!(
                "{} parameters missing from checkpoint, keeping initial values: {:?}",
                report.missing.len(),
                report.missing
            );
        }
        if !report.unexpected.is_empty() {
            debug!("Ignored unexpected checkpoint keys: {:?}", report.unexpected);
        }
        info!(
            "Model loaded successfully on {:?} ({} tensors from {})",
            device,
            report.loaded,
            checkpoint.display()
        );

        Self::from_network(network, classes, device)
    }

    /// Wraps an already-built network. Used for tests and alternative backbones.
    pub fn from_network(
        network: impl Module + Send + Sync + 'static,
        classes: ClassTable,
        device: Device,
    ) -> Result<Self, ClassifierError> {
        if classes.len() < TOP_K {
            return Err(ClassifierError::ModelLoad(format!(
                "need at least {} classes, class table has {}",
                TOP_K,
                classes.len()
            )));
        }
        Ok(Self {
            network: Box::new(network),
            classes,
            device,
        })
    }

    /// Runs one forward pass on a `[3, H, W]` image tensor.
    pub fn predict(&self, image: &Tensor) -> Result<Vec<Prediction>, ClassifierError> {
        let probabilities = self
            .probabilities(image)
            .map_err(|e| ClassifierError::Inference(e.to_string()))?;

        if probabilities.len() != self.classes.len() {
            return Err(ClassifierError::Inference(format!(
                "network produced {} scores for {} classes",
                probabilities.len(),
                self.classes.len()
            )));
        }

        Ok(rank(&probabilities, &self.classes, TOP_K))
    }

    fn probabilities(&self, image: &Tensor) -> candle::Result<Vec<f32>> {
        let input = image.unsqueeze(0)?.to_device(&self.device)?;
        let logits = self.network.forward(&input)?;
        class_probabilities(&logits)?
            .i(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()
    }

    pub fn classes(&self) -> &ClassTable {
        &self.classes
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

/// Highest-probability labels first, confidence as a percentage with two decimals.
fn rank(probabilities: &[f32], classes: &ClassTable, k: usize) -> Vec<Prediction> {
    let mut indexed: Vec<(usize, f32)> = probabilities.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| b.1.total_cmp(&a.1));

    indexed
        .into_iter()
        .take(k)
        .map(|(idx, prob)| Prediction {
            class: classes.get(idx).unwrap_or("Unknown").to_string(),
            confidence: (prob * 100.0 * 100.0).round() / 100.0,
        })
        .collect()
}

fn read_checkpoint(path: &Path) -> Result<Vec<(String, Tensor)>, ClassifierError> {
    if !path.exists() {
        return Err(ClassifierError::ModelLoad(format!(
            "checkpoint not found at {}",
            path.display()
        )));
    }

    let is_safetensors = path.extension().and_then(|ext| ext.to_str()) == Some("safetensors");
    let tensors: Vec<(String, Tensor)> = if is_safetensors {
        candle::safetensors::load(path, &Device::Cpu)
            .map_err(model_load)?
            .into_iter()
            .collect()
    } else {
        match candle::pickle::read_all_with_key(path, Some(STATE_DICT_KEY)) {
            Ok(tensors) if !tensors.is_empty() => tensors,
            _ => candle::pickle::read_all(path).map_err(model_load)?,
        }
    };

    if tensors.is_empty() {
        return Err(ClassifierError::ModelLoad(format!(
            "no tensors found in {}",
            path.display()
        )));
    }
    Ok(tensors)
}

/// Copies checkpoint tensors into the network's variables, tolerating missing
/// and unexpected keys. A shape disagreement on a shared key is fatal.
fn apply_state_dict(
    varmap: &VarMap,
    state_dict: Vec<(String, Tensor)>,
    device: &Device,
) -> Result<LoadReport, ClassifierError> {
    let vars = varmap
        .data()
        .lock()
        .map_err(|_| ClassifierError::ModelLoad("parameter map lock poisoned".into()))?;

    let mut report = LoadReport::default();
    let mut seen = HashSet::new();

    for (key, tensor) in state_dict {
        let name = key.strip_prefix(WRAPPER_PREFIX).unwrap_or(&key);
        let Some(var) = vars.get(name) else {
            report.unexpected.push(name.to_string());
            continue;
        };
        if var.dims() != tensor.dims() {
            return Err(ClassifierError::ModelLoad(format!(
                "size mismatch for {}: checkpoint has {:?}, model expects {:?}",
                name,
                tensor.dims(),
                var.dims()
            )));
        }
        let tensor = tensor
            .to_dtype(DType::F32)
            .and_then(|t| t.to_device(device))
            .map_err(model_load)?;
        var.set(&tensor).map_err(model_load)?;
        seen.insert(name.to_string());
        report.loaded += 1;
    }

    report.missing = vars
        .keys()
        .filter(|name| !seen.contains(*name))
        .cloned()
        .collect();
    report.missing.sort();
    Ok(report)
}

fn model_load(err: candle::Error) -> ClassifierError {
    ClassifierError::ModelLoad(err.to_string())
}
