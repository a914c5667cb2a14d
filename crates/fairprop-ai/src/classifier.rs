//! Synchronous classification pipeline.
//!
//! Runs encode → infer → calibrate → assemble on the calling thread. The
//! async scheduler executes its batches through the same [`Classifier`], so the
//! offline path and the served path produce identical verdicts.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use fairprop_core::{
    ArtifactLoadError, EncodedInput, EncodingError, Prediction, RuntimeError, TruncationPolicy,
    assemble,
};
use tracing::debug;

use crate::calibration::{Calibrated, Calibrator};
use crate::runtime::Runtime;
use crate::tokenizer::EncodeOptions;

/// Per-request failure of the synchronous pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClassifyError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

/// Loaded runtime plus the calibration and encoding policy applied to it.
#[derive(Clone)]
pub struct Classifier {
    runtime: Arc<Runtime>,
    calibrator: Calibrator,
    truncation: TruncationPolicy,
}

impl Classifier {
    /// Load an artifact directory into a ready classifier.
    pub fn load(dir: &Path) -> Result<Self, ArtifactLoadError> {
        Ok(Self::new(Arc::new(Runtime::load(dir)?)))
    }

    /// Calibration comes from the artifact's metadata.
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let calibrator = Calibrator::from_metadata(runtime.artifact().metadata());
        Self {
            runtime,
            calibrator,
            truncation: TruncationPolicy::default(),
        }
    }

    pub fn with_truncation(mut self, truncation: TruncationPolicy) -> Self {
        self.truncation = truncation;
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn calibrator(&self) -> Calibrator {
        self.calibrator
    }

    pub fn truncation(&self) -> TruncationPolicy {
        self.truncation
    }

    pub fn max_sequence_length(&self) -> usize {
        self.runtime.artifact().max_sequence_length()
    }

    /// Encode under this classifier's truncation policy, optionally capping the window.
    pub fn encode(&self, text: &str, cap: Option<usize>) -> Result<EncodedInput, EncodingError> {
        let options = EncodeOptions {
            truncation: self.truncation,
            cap,
        };
        self.runtime.artifact().encoder().encode_with(text, options)
    }

    /// One forward pass over already-encoded inputs, calibrated.
    pub fn infer_calibrated(
        &self,
        batch: &[&EncodedInput],
    ) -> Result<Vec<Calibrated>, RuntimeError> {
        let raw = self.runtime.infer_refs(batch)?;
        Ok(raw.iter().map(|r| self.calibrator.calibrate(r)).collect())
    }

    /// Classify a single text on the calling thread.
    pub fn classify(&self, text: &str) -> Result<Prediction, ClassifyError> {
        let start = Instant::now();
        let encoded = self.encode(text, None)?;
        let calibrated = self.infer_calibrated(&[&encoded])?;
        let Some(verdict) = calibrated.first() else {
            return Err(RuntimeError::OutputMismatch {
                expected: 1,
                got: 0,
            }
            .into());
        };
        Ok(assemble(
            verdict.label,
            verdict.confidence,
            start,
            false,
            encoded.is_truncated(),
        ))
    }

    /// Classify many texts in one forward pass.
    ///
    /// Results keep input order. An encoding failure affects only its own
    /// item; a runtime failure is reported for every item in the pass.
    pub fn classify_batch(&self, texts: &[&str]) -> Vec<Result<Prediction, ClassifyError>> {
        let start = Instant::now();
        let encoded: Vec<Result<EncodedInput, EncodingError>> =
            texts.iter().map(|t| self.encode(t, None)).collect();
        let ready: Vec<&EncodedInput> = encoded.iter().filter_map(|e| e.as_ref().ok()).collect();

        let mut verdicts = match self.infer_calibrated(&ready) {
            Ok(v) => v.into_iter().map(Ok).collect::<Vec<_>>(),
            Err(e) => vec![Err(e); ready.len()],
        }
        .into_iter();

        debug!(
            batch_size = texts.len(),
            encoded = ready.len(),
            "classified batch"
        );

        encoded
            .iter()
            .map(|item| {
                let input = item.as_ref().map_err(|e| e.clone())?;
                let verdict = verdicts.next().unwrap_or(Err(RuntimeError::OutputMismatch {
                    expected: ready.len(),
                    got: 0,
                }))?;
                Ok(assemble(
                    verdict.label,
                    verdict.confidence,
                    start,
                    false,
                    input.is_truncated(),
                ))
            })
            .collect()
    }
}
