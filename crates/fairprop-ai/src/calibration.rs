//! Temperature-scaled softmax calibration over the two-label space.

use fairprop_core::{ArtifactMetadata, Label, RawPrediction};

/// A decision with the calibrated probability of the chosen label.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrated {
    pub label: Label,
    /// Always in `[0.5, 1.0]`.
    pub confidence: f32,
}

/// Maps raw logits to calibrated probabilities. Pure and infallible.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibrator {
    temperature: f32,
}

impl Default for Calibrator {
    fn default() -> Self {
        Self { temperature: 1.0 }
    }
}

impl Calibrator {
    /// A non-positive or non-finite temperature falls back to neutral scaling.
    pub fn new(temperature: f32) -> Self {
        if temperature.is_finite() && temperature > 0.0 {
            Self { temperature }
        } else {
            Self::default()
        }
    }

    pub fn from_metadata(metadata: &ArtifactMetadata) -> Self {
        Self::new(metadata.temperature())
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// `[p(COMPLIANT), p(NON_COMPLIANT)]`.
    ///
    /// Logistic of the scaled logit gap; an overflowing gap saturates to 0 or 1.
    pub fn probabilities(&self, raw: &RawPrediction) -> [f32; 2] {
        let gap = (raw.non_compliant - raw.compliant) / self.temperature;
        let p_violation = 1.0 / (1.0 + (-gap).exp());
        let p_compliant = 1.0 / (1.0 + gap.exp());
        [p_compliant, p_violation]
    }

    /// Pick the more probable label. Ties go to `COMPLIANT`.
    pub fn calibrate(&self, raw: &RawPrediction) -> Calibrated {
        let [p_compliant, p_violation] = self.probabilities(raw);
        if p_violation > p_compliant {
            Calibrated {
                label: Label::NonCompliant,
                confidence: p_violation.min(1.0),
            }
        } else {
            Calibrated {
                label: Label::Compliant,
                confidence: p_compliant.min(1.0),
            }
        }
    }
}
