//! AI inference layer: artifact loading, text encoding, forward passes, and calibration.

mod artifact;
mod calibration;
mod classifier;
mod pooled;
mod runtime;
mod samples;
mod tokenizer;

#[cfg(feature = "onnx")]
mod onnx;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use artifact::{ModelArtifact, ModelWeights};
pub use calibration::{Calibrated, Calibrator};
pub use classifier::{ClassifyError, Classifier};
pub use pooled::{PooledBackend, PooledWeights};
pub use runtime::{Backend, DEFAULT_MAX_BATCH_SIZE, Runtime};
pub use samples::SAMPLE_LISTINGS;
pub use tokenizer::{EncodeOptions, TextEncoder, Vocabulary, normalize};

#[cfg(feature = "onnx")]
pub use onnx::OnnxBackend;
