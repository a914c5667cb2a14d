//! Versioned model artifact: metadata, vocabulary, and weights loaded once.
//!
//! The artifact directory must contain `metadata.json`, a vocabulary
//! (`vocab.txt`, or `tokenizer.json` with the `onnx` feature), and the
//! weights for the declared runtime (`weights.json` or `model.onnx`).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fairprop_core::{ArtifactLoadError, ArtifactMetadata, Label, RuntimeKind};
use tracing::info;

use crate::pooled::PooledWeights;
use crate::tokenizer::{TextEncoder, Vocabulary};

const METADATA_FILE: &str = "metadata.json";
const VOCAB_FILE: &str = "vocab.txt";
#[cfg(feature = "onnx")]
const TOKENIZER_FILE: &str = "tokenizer.json";
const WEIGHTS_FILE: &str = "weights.json";
const ONNX_FILE: &str = "model.onnx";
const ONNX_QUANT_FILE: &str = "model.quant.onnx";

/// Weight source for the runtime backend.
#[derive(Debug, Clone)]
pub enum ModelWeights {
    Pooled(Arc<PooledWeights>),
    /// Path to the ONNX graph; the session is owned by the backend.
    Onnx(PathBuf),
}

/// Immutable, shared model artifact. Never mutated after load.
pub struct ModelArtifact {
    metadata: ArtifactMetadata,
    encoder: TextEncoder,
    weights: ModelWeights,
    label_order: [Label; 2],
    source: Option<PathBuf>,
}

impl ModelArtifact {
    /// Load and validate an artifact directory. Any defect fails the whole load.
    pub fn load(dir: &Path) -> Result<Self, ArtifactLoadError> {
        if !dir.is_dir() {
            return Err(ArtifactLoadError::NotFound(dir.to_path_buf()));
        }

        let metadata = read_metadata(&dir.join(METADATA_FILE))?;
        metadata.validate()?;

        #[cfg(not(feature = "onnx"))]
        if metadata.runtime == RuntimeKind::Onnx {
            return Err(ArtifactLoadError::Backend(
                "artifact needs ONNX Runtime; rebuild with the `onnx` feature".into(),
            ));
        }

        let encoder = load_encoder(dir, &metadata)?;
        let weights = match metadata.runtime {
            RuntimeKind::Pooled => {
                let path = require_file(dir.join(WEIGHTS_FILE))?;
                ModelWeights::Pooled(Arc::new(PooledWeights::load(&path, &metadata)?))
            }
            RuntimeKind::Onnx => ModelWeights::Onnx(onnx_graph(dir, &metadata)?),
        };

        let artifact = Self::finish(metadata, encoder, weights, Some(dir.to_path_buf()))?;
        info!(
            version = %artifact.metadata.artifact_version,
            max_sequence_length = artifact.metadata.max_sequence_length,
            quantization = artifact.metadata.quantization_mode.as_str(),
            temperature = artifact.metadata.temperature(),
            vocab_size = artifact.encoder.vocab_size(),
            path = %dir.display(),
            "loaded model artifact"
        );
        Ok(artifact)
    }

    /// Assemble an in-memory pooled artifact with the same validation as [`load`](Self::load).
    pub fn from_parts(
        metadata: ArtifactMetadata,
        vocab: Vocabulary,
        weights: PooledWeights,
    ) -> Result<Self, ArtifactLoadError> {
        metadata.validate()?;
        if metadata.runtime != RuntimeKind::Pooled {
            return Err(ArtifactLoadError::Invalid(
                "in-memory artifacts must use the pooled runtime".into(),
            ));
        }
        let encoder = TextEncoder::wordpiece(vocab, &metadata)?;
        Self::finish(metadata, encoder, ModelWeights::Pooled(Arc::new(weights)), None)
    }

    fn finish(
        metadata: ArtifactMetadata,
        encoder: TextEncoder,
        weights: ModelWeights,
        source: Option<PathBuf>,
    ) -> Result<Self, ArtifactLoadError> {
        if let ModelWeights::Pooled(w) = &weights
            && w.vocab_size() != encoder.vocab_size()
        {
            return Err(ArtifactLoadError::Invalid(format!(
                "embedding table has {} rows but vocabulary has {} tokens",
                w.vocab_size(),
                encoder.vocab_size()
            )));
        }
        let label_order = metadata.label_order()?;
        Ok(Self {
            metadata,
            encoder,
            weights,
            label_order,
            source,
        })
    }

    pub fn metadata(&self) -> &ArtifactMetadata {
        &self.metadata
    }

    pub fn encoder(&self) -> &TextEncoder {
        &self.encoder
    }

    pub fn weights(&self) -> &ModelWeights {
        &self.weights
    }

    /// Label of each model output index.
    pub fn label_order(&self) -> [Label; 2] {
        self.label_order
    }

    pub fn version(&self) -> &str {
        &self.metadata.artifact_version
    }

    pub fn max_sequence_length(&self) -> usize {
        self.metadata.max_sequence_length
    }

    /// Directory the artifact was loaded from, if any.
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

fn read_metadata(path: &Path) -> Result<ArtifactMetadata, ArtifactLoadError> {
    let path = require_file(path.to_path_buf())?;
    let raw = std::fs::read_to_string(&path).map_err(|source| ArtifactLoadError::Io {
        path: path.clone(),
        source,
    })?;
    ArtifactMetadata::from_json(&raw).map_err(|source| ArtifactLoadError::Parse { path, source })
}

fn load_encoder(dir: &Path, metadata: &ArtifactMetadata) -> Result<TextEncoder, ArtifactLoadError> {
    let vocab_path = dir.join(VOCAB_FILE);
    if vocab_path.is_file() {
        return TextEncoder::wordpiece(Vocabulary::load(&vocab_path)?, metadata);
    }

    #[cfg(feature = "onnx")]
    {
        let tokenizer_path = dir.join(TOKENIZER_FILE);
        if tokenizer_path.is_file() {
            let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
                .map_err(|e| ArtifactLoadError::Invalid(format!("load tokenizer: {e}")))?;
            return TextEncoder::huggingface(tokenizer, metadata);
        }
    }

    Err(ArtifactLoadError::NotFound(vocab_path))
}

/// The export tool writes its int8 graph next to the float one.
fn onnx_graph(dir: &Path, metadata: &ArtifactMetadata) -> Result<PathBuf, ArtifactLoadError> {
    let quantized = dir.join(ONNX_QUANT_FILE);
    if metadata.quantization_mode == fairprop_core::QuantizationMode::Int8 && quantized.is_file() {
        return Ok(quantized);
    }
    require_file(dir.join(ONNX_FILE))
}

fn require_file(path: PathBuf) -> Result<PathBuf, ArtifactLoadError> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(ArtifactLoadError::NotFound(path))
    }
}
