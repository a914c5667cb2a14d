//! Metadata record shipped inside every model artifact (`metadata.json`).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ArtifactLoadError;
use crate::label::Label;

/// Artifact major version this build can serve.
pub const SUPPORTED_MAJOR_VERSION: u32 = 1;

/// Smallest usable window: the two framing tokens.
pub const MIN_SEQUENCE_LENGTH: usize = 2;

/// Versioned description of a serialized model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub artifact_version: String,
    /// Window size in tokens, framing tokens included.
    pub max_sequence_length: usize,
    #[serde(default)]
    pub quantization_mode: QuantizationMode,
    #[serde(default)]
    pub precision: Precision,
    /// Softmax temperature; absent means neutral 1.0.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub calibration_temperature: Option<f32>,
    #[serde(default)]
    pub runtime: RuntimeKind,
    #[serde(default)]
    pub normalization: Normalization,
    #[serde(default)]
    pub special_tokens: SpecialTokens,
    /// Model output index → label. Keys are stringified indices, as exporters write them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id2label: Option<BTreeMap<String, Label>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuantizationMode {
    #[default]
    None,
    Int8,
    Int4,
}

impl QuantizationMode {
    /// Inclusive range of stored integer weights, if quantized.
    pub fn integer_range(&self) -> Option<(i32, i32)> {
        match self {
            Self::None => None,
            Self::Int8 => Some((-128, 127)),
            Self::Int4 => Some((-8, 7)),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Int8 => "int8",
            Self::Int4 => "int4",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    Fp32,
    Bf16,
    Int8,
}

impl Precision {
    /// Round a weight to the representable grid of this precision.
    ///
    /// `Int8` weights are already on their quantization grid, so only `Bf16` changes values.
    pub fn round(&self, value: f32) -> f32 {
        match self {
            Self::Bf16 => round_bf16(value),
            Self::Fp32 | Self::Int8 => value,
        }
    }
}

/// Round-to-nearest-even into bfloat16, returned widened to f32.
fn round_bf16(value: f32) -> f32 {
    if !value.is_finite() {
        return value;
    }
    let bits = value.to_bits();
    let lsb = (bits >> 16) & 1;
    f32::from_bits(bits.wrapping_add(0x7FFF + lsb) & 0xFFFF_0000)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeKind {
    /// Pure-Rust pooled-embedding classifier (`weights.json`).
    #[default]
    Pooled,
    /// ONNX Runtime graph (`model.onnx`).
    Onnx,
}

/// Text normalization the vocabulary was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Normalization {
    pub lowercase: bool,
    pub collapse_whitespace: bool,
    pub strip_control: bool,
}

impl Default for Normalization {
    fn default() -> Self {
        Self {
            lowercase: true,
            collapse_whitespace: true,
            strip_control: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecialTokens {
    pub cls: String,
    pub sep: String,
    pub pad: String,
    pub unk: String,
}

impl Default for SpecialTokens {
    fn default() -> Self {
        Self {
            cls: "[CLS]".into(),
            sep: "[SEP]".into(),
            pad: "[PAD]".into(),
            unk: "[UNK]".into(),
        }
    }
}

impl ArtifactMetadata {
    /// Parse and validate a metadata record.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Reject records this build cannot serve.
    pub fn validate(&self) -> Result<(), ArtifactLoadError> {
        let major = self.major_version()?;
        if major != SUPPORTED_MAJOR_VERSION {
            return Err(ArtifactLoadError::IncompatibleVersion {
                found: self.artifact_version.clone(),
                supported: SUPPORTED_MAJOR_VERSION,
            });
        }

        if self.max_sequence_length < MIN_SEQUENCE_LENGTH {
            return Err(ArtifactLoadError::Invalid(format!(
                "max_sequence_length {} leaves no room for framing tokens",
                self.max_sequence_length
            )));
        }

        if let Some(t) = self.calibration_temperature
            && !(t.is_finite() && t > 0.0)
        {
            return Err(ArtifactLoadError::Invalid(format!(
                "calibration_temperature must be finite and positive, got {t}"
            )));
        }

        if self.precision == Precision::Int8 && self.quantization_mode != QuantizationMode::Int8 {
            return Err(ArtifactLoadError::Invalid(format!(
                "int8 precision requires int8 quantization, got {}",
                self.quantization_mode.as_str()
            )));
        }

        self.label_order()?;
        Ok(())
    }

    /// Leading numeric component of `artifact_version`.
    pub fn major_version(&self) -> Result<u32, ArtifactLoadError> {
        let version = self.artifact_version.trim().trim_start_matches('v');
        version
            .split('.')
            .next()
            .and_then(|major| major.parse().ok())
            .ok_or_else(|| ArtifactLoadError::IncompatibleVersion {
                found: self.artifact_version.clone(),
                supported: SUPPORTED_MAJOR_VERSION,
            })
    }

    /// Effective calibration temperature.
    pub fn temperature(&self) -> f32 {
        self.calibration_temperature.unwrap_or(1.0)
    }

    /// Label for each model output index.
    pub fn label_order(&self) -> Result<[Label; 2], ArtifactLoadError> {
        let Some(map) = &self.id2label else {
            return Ok(Label::ALL);
        };

        let lookup = |index: &str| {
            map.get(index).copied().ok_or_else(|| {
                ArtifactLoadError::Invalid(format!("id2label is missing output index {index}"))
            })
        };
        let order = [lookup("0")?, lookup("1")?];

        if map.len() != 2 || order[0] == order[1] {
            return Err(ArtifactLoadError::Invalid(format!(
                "id2label must map outputs 0 and 1 to distinct labels, got {map:?}"
            )));
        }
        Ok(order)
    }
}
