//! Runtime adapter: owns the artifact and executes forward passes.

use std::path::Path;
use std::sync::Arc;

use fairprop_core::{ArtifactLoadError, EncodedInput, Label, RawPrediction, RuntimeError};
use tracing::debug;

use crate::artifact::{ModelArtifact, ModelWeights};
use crate::pooled::PooledBackend;

/// Largest batch handed to a backend in one call; bigger batches are chunked.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 32;

/// A numeric backend able to score encoded inputs.
///
/// Implementations must be deterministic and must not let batch items
/// influence each other.
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// One logit pair per input, in model output order.
    fn forward(&self, batch: &[&EncodedInput]) -> Result<Vec<[f32; 2]>, RuntimeError>;
}

/// The loaded model: a shared artifact plus the backend that executes it.
pub struct Runtime {
    artifact: Arc<ModelArtifact>,
    backend: Box<dyn Backend>,
    max_batch_size: usize,
}

impl Runtime {
    /// Load an artifact directory and build its backend.
    pub fn load(dir: &Path) -> Result<Self, ArtifactLoadError> {
        Self::new(Arc::new(ModelArtifact::load(dir)?))
    }

    /// Build the backend the artifact declares.
    pub fn new(artifact: Arc<ModelArtifact>) -> Result<Self, ArtifactLoadError> {
        let backend: Box<dyn Backend> = match artifact.weights() {
            ModelWeights::Pooled(weights) => Box::new(PooledBackend::new(Arc::clone(weights))),
            #[cfg(feature = "onnx")]
            ModelWeights::Onnx(path) => Box::new(crate::onnx::OnnxBackend::load(
                path,
                artifact.encoder().pad_id(),
            )?),
            #[cfg(not(feature = "onnx"))]
            ModelWeights::Onnx(path) => {
                return Err(ArtifactLoadError::Backend(format!(
                    "{} needs ONNX Runtime; rebuild with the `onnx` feature",
                    path.display()
                )));
            }
        };
        Ok(Self::with_backend(artifact, backend))
    }

    /// Pair an artifact with an explicit backend.
    pub fn with_backend(artifact: Arc<ModelArtifact>, backend: Box<dyn Backend>) -> Self {
        Self {
            artifact,
            backend,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }

    pub fn with_max_batch_size(mut self, max_batch_size: usize) -> Self {
        self.max_batch_size = max_batch_size.max(1);
        self
    }

    pub fn artifact(&self) -> &Arc<ModelArtifact> {
        &self.artifact
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Score a batch. Output has the same length and order as the input.
    pub fn infer(&self, batch: &[EncodedInput]) -> Result<Vec<RawPrediction>, RuntimeError> {
        let refs: Vec<&EncodedInput> = batch.iter().collect();
        self.infer_refs(&refs)
    }

    pub fn infer_refs(&self, batch: &[&EncodedInput]) -> Result<Vec<RawPrediction>, RuntimeError> {
        let max = self.artifact.max_sequence_length();
        if let Some(input) = batch.iter().find(|input| input.len() > max) {
            return Err(RuntimeError::SequenceTooLong {
                len: input.len(),
                max,
            });
        }

        let order = self.artifact.label_order();
        let mut predictions = Vec::with_capacity(batch.len());
        for chunk in batch.chunks(self.max_batch_size) {
            let logits = self.backend.forward(chunk)?;
            if logits.len() != chunk.len() {
                return Err(RuntimeError::OutputMismatch {
                    expected: chunk.len(),
                    got: logits.len(),
                });
            }
            for pair in logits {
                let raw = to_raw(pair, order);
                if !raw.is_finite() {
                    return Err(RuntimeError::NonFinite {
                        index: predictions.len(),
                    });
                }
                predictions.push(raw);
            }
        }

        debug!(
            backend = self.backend.name(),
            batch_size = batch.len(),
            "forward pass complete"
        );
        Ok(predictions)
    }
}

fn to_raw(pair: [f32; 2], order: [Label; 2]) -> RawPrediction {
    let mut raw = RawPrediction {
        compliant: 0.0,
        non_compliant: 0.0,
    };
    for (label, logit) in order.into_iter().zip(pair) {
        match label {
            Label::Compliant => raw.compliant = logit,
            Label::NonCompliant => raw.non_compliant = logit,
        }
    }
    raw
}
