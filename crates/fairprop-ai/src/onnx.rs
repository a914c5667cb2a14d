//! ONNX Runtime backend for exported sequence-classification graphs.
//!
//! Expects inputs `input_ids` and `attention_mask` (int64, `[batch, seq]`) and
//! a single `logits` output of shape `[batch, 2]`.

use std::path::Path;

use fairprop_core::{ArtifactLoadError, EncodedInput, RuntimeError};
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use tracing::info;

use crate::runtime::Backend;

/// Sequence classifier executed by ONNX Runtime on CPU.
pub struct OnnxBackend {
    session: Mutex<Session>,
    pad_id: i64,
}

impl OnnxBackend {
    pub fn load(model_path: &Path, pad_id: u32) -> Result<Self, ArtifactLoadError> {
        let session = Session::builder()
            .map_err(|e| load_error(model_path, e))?
            .commit_from_file(model_path)
            .map_err(|e| load_error(model_path, e))?;

        info!(model = %model_path.display(), "loaded ONNX classifier");
        Ok(Self {
            session: Mutex::new(session),
            pad_id: pad_id as i64,
        })
    }
}

impl Backend for OnnxBackend {
    fn name(&self) -> &'static str {
        "onnx"
    }

    fn forward(&self, batch: &[&EncodedInput]) -> Result<Vec<[f32; 2]>, RuntimeError> {
        if batch.is_empty() {
            return Ok(vec![]);
        }

        let batch_size = batch.len();
        let seq_len = batch.iter().map(|e| e.len()).max().unwrap_or(0).max(1);

        // Pad every row to the longest; padded positions are masked out.
        let mut input_ids = vec![self.pad_id; batch_size * seq_len];
        let mut attention_mask = vec![0i64; batch_size * seq_len];
        for (i, encoding) in batch.iter().enumerate() {
            let offset = i * seq_len;
            for (j, &id) in encoding.ids().iter().enumerate() {
                input_ids[offset + j] = id as i64;
            }
            for (j, &mask) in encoding.attention_mask().iter().enumerate() {
                attention_mask[offset + j] = mask as i64;
            }
        }

        let shape = [batch_size as i64, seq_len as i64];
        let ids_tensor =
            Tensor::from_array((shape, input_ids.into_boxed_slice())).map_err(backend_error)?;
        let mask_tensor =
            Tensor::from_array((shape, attention_mask.into_boxed_slice())).map_err(backend_error)?;

        let mut session = self.session.lock();
        let outputs = session
            .run(ort::inputs![
                "input_ids" => ids_tensor,
                "attention_mask" => mask_tensor,
            ])
            .map_err(backend_error)?;

        let (output_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(backend_error)?;
        let dims: &[i64] = output_shape;
        if dims.len() != 2 || dims[0] as usize != batch_size || dims[1] != 2 {
            return Err(RuntimeError::Backend(format!(
                "unexpected logits shape {dims:?}, expected [{batch_size}, 2]"
            )));
        }

        Ok(data.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
    }
}

fn load_error(path: &Path, e: impl std::fmt::Display) -> ArtifactLoadError {
    ArtifactLoadError::Backend(format!("{}: {e}", path.display()))
}

fn backend_error(e: impl std::fmt::Display) -> RuntimeError {
    RuntimeError::Backend(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::Runtime;
    use std::path::PathBuf;

    fn model_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("..")
            .join("..")
            .join("models")
            .join("fairprop-onnx")
    }

    fn require_model() -> PathBuf {
        let dir = model_dir();
        if !dir.join("model.onnx").exists() {
            panic!(
                "Model not found. Export one with the training tooling:\n  \
                 python src/deploy/export_onnx.py --model artifacts/model \
                 --output models/fairprop-onnx/model.onnx"
            );
        }
        dir
    }

    #[test]
    fn classifies_reference_scenarios() {
        let dir = require_model();
        let rt = Runtime::load(&dir).unwrap();
        let encoder = rt.artifact().encoder();
        let inputs = vec![
            encoder.encode("No kids under 12 allowed").unwrap(),
            encoder.encode("Great school district nearby").unwrap(),
        ];
        let raw = rt.infer(&inputs).unwrap();
        assert!(raw[0].non_compliant > raw[0].compliant);
        assert!(raw[1].compliant > raw[1].non_compliant);
    }

    #[test]
    fn batch_matches_single() {
        let dir = require_model();
        let rt = Runtime::load(&dir).unwrap();
        let encoder = rt.artifact().encoder();
        let inputs: Vec<_> = ["No section 8", "Walking distance to shops and restaurants"]
            .iter()
            .map(|t| encoder.encode(t).unwrap())
            .collect();
        let batched = rt.infer(&inputs).unwrap();
        for (input, expected) in inputs.iter().zip(&batched) {
            let single = rt.infer(std::slice::from_ref(input)).unwrap();
            assert!((single[0].compliant - expected.compliant).abs() < 1e-4);
            assert!((single[0].non_compliant - expected.non_compliant).abs() < 1e-4);
        }
    }
}
