//! Pure-Rust pooled-embedding classifier backend.
//!
//! Forward pass: masked mean of token embeddings, L2-normalized, then a
//! two-row linear head. Each batch item is computed independently, so batching
//! never changes an item's logits.

use std::path::Path;
use std::sync::Arc;

use fairprop_core::{ArtifactLoadError, ArtifactMetadata, EncodedInput, RuntimeError};
use serde::Deserialize;

use crate::runtime::Backend;

/// On-disk layout of `weights.json`.
#[derive(Debug, Deserialize)]
struct WeightsFile {
    dim: usize,
    #[serde(default)]
    scale: Option<f32>,
    embeddings: Vec<Vec<f32>>,
    head: Vec<Vec<f32>>,
    bias: Vec<f32>,
}

/// Dequantized, precision-rounded weights held for the process lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct PooledWeights {
    dim: usize,
    /// Row-major `[vocab_size, dim]`.
    embeddings: Vec<f32>,
    /// Row-major `[2, dim]` in model output order.
    head: Vec<f32>,
    bias: [f32; 2],
}

impl PooledWeights {
    /// Build from full-precision rows, checking every shape.
    pub fn new(
        dim: usize,
        embeddings: Vec<Vec<f32>>,
        head: Vec<Vec<f32>>,
        bias: Vec<f32>,
    ) -> Result<Self, ArtifactLoadError> {
        if dim == 0 {
            return Err(invalid("embedding dimension must be positive"));
        }
        if embeddings.is_empty() {
            return Err(invalid("embedding table is empty"));
        }
        if let Some(row) = embeddings.iter().position(|r| r.len() != dim) {
            return Err(invalid(format!("embedding row {row} is not {dim} wide")));
        }
        if head.len() != 2 || head.iter().any(|r| r.len() != dim) {
            return Err(invalid(format!("head must be 2 rows of {dim}")));
        }
        let bias: [f32; 2] = bias
            .try_into()
            .map_err(|b: Vec<f32>| invalid(format!("bias must have 2 values, got {}", b.len())))?;

        let weights = Self {
            dim,
            embeddings: embeddings.into_iter().flatten().collect(),
            head: head.into_iter().flatten().collect(),
            bias,
        };
        if !weights.all_values().all(|v| v.is_finite()) {
            return Err(invalid("weights contain non-finite values"));
        }
        Ok(weights)
    }

    /// Load `weights.json`, dequantizing per the metadata.
    pub fn load(path: &Path, metadata: &ArtifactMetadata) -> Result<Self, ArtifactLoadError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ArtifactLoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: WeightsFile =
            serde_json::from_str(&raw).map_err(|source| ArtifactLoadError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_file(file, metadata)
    }

    fn from_file(file: WeightsFile, metadata: &ArtifactMetadata) -> Result<Self, ArtifactLoadError> {
        let mut weights = Self::new(file.dim, file.embeddings, file.head, file.bias)?;

        if let Some((lo, hi)) = metadata.quantization_mode.integer_range() {
            let scale = file
                .scale
                .filter(|s| s.is_finite() && *s > 0.0)
                .ok_or_else(|| {
                    invalid(format!(
                        "{} weights need a positive scale",
                        metadata.quantization_mode.as_str()
                    ))
                })?;
            let on_grid = |v: &f32| v.fract() == 0.0 && (lo as f32..=hi as f32).contains(v);
            if !weights.embeddings.iter().chain(&weights.head).all(on_grid) {
                return Err(invalid(format!(
                    "{} weights must be integers in [{lo}, {hi}]",
                    metadata.quantization_mode.as_str()
                )));
            }
            for v in weights.embeddings.iter_mut().chain(weights.head.iter_mut()) {
                *v *= scale;
            }
        }

        let precision = metadata.precision;
        for v in weights
            .embeddings
            .iter_mut()
            .chain(weights.head.iter_mut())
            .chain(weights.bias.iter_mut())
        {
            *v = precision.round(*v);
        }
        Ok(weights)
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn vocab_size(&self) -> usize {
        self.embeddings.len() / self.dim
    }

    fn all_values(&self) -> impl Iterator<Item = &f32> {
        self.embeddings.iter().chain(&self.head).chain(&self.bias)
    }

    fn forward_one(&self, input: &EncodedInput) -> Result<[f32; 2], RuntimeError> {
        let vocab_size = self.vocab_size();
        let mut pooled = vec![0.0f32; self.dim];
        let mut count = 0usize;

        for (&id, &attend) in input.ids().iter().zip(input.attention_mask()) {
            if !attend {
                continue;
            }
            let row = id as usize;
            if row >= vocab_size {
                return Err(RuntimeError::TokenOutOfRange { id, vocab_size });
            }
            let embedding = &self.embeddings[row * self.dim..(row + 1) * self.dim];
            for (p, &e) in pooled.iter_mut().zip(embedding) {
                *p += e;
            }
            count += 1;
        }

        if count > 0 {
            for p in &mut pooled {
                *p /= count as f32;
            }
        }
        normalize(&mut pooled);

        let mut logits = self.bias;
        for (k, logit) in logits.iter_mut().enumerate() {
            let row = &self.head[k * self.dim..(k + 1) * self.dim];
            *logit += row.iter().zip(&pooled).map(|(w, x)| w * x).sum::<f32>();
        }
        Ok(logits)
    }
}

/// [`Backend`] over [`PooledWeights`].
pub struct PooledBackend {
    weights: Arc<PooledWeights>,
}

impl PooledBackend {
    pub fn new(weights: Arc<PooledWeights>) -> Self {
        Self { weights }
    }
}

impl Backend for PooledBackend {
    fn name(&self) -> &'static str {
        "pooled"
    }

    fn forward(&self, batch: &[&EncodedInput]) -> Result<Vec<[f32; 2]>, RuntimeError> {
        batch
            .iter()
            .map(|input| self.weights.forward_one(input))
            .collect()
    }
}

/// L2-normalize a vector in place.
fn normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

fn invalid(msg: impl Into<String>) -> ArtifactLoadError {
    ArtifactLoadError::Invalid(msg.into())
}
