//! Small calibrated reference artifact for tests and demos.
//!
//! A two-dimensional pooled model: one axis carries fair-housing violation
//! signal, the other neutral property description. Enough vocabulary to
//! classify [`SAMPLE_LISTINGS`] the way a trained model would.

use std::path::Path;

use fairprop_core::{ArtifactMetadata, QuantizationMode};
use serde_json::json;

use crate::artifact::ModelArtifact;
use crate::pooled::PooledWeights;
use crate::tokenizer::Vocabulary;

pub const REFERENCE_VERSION: &str = "1.0.0";
pub const REFERENCE_TEMPERATURE: f32 = 1.5;

pub use crate::samples::SAMPLE_LISTINGS;

const HEAD_STRENGTH: f32 = 4.0;
const BIAS: [f32; 2] = [0.25, -0.25];

/// `(token, [violation, neutral])`, in vocabulary id order.
const TOKENS: &[(&str, [f32; 2])] = &[
    ("[PAD]", [0.0, 0.0]),
    ("[UNK]", [0.0, 0.0]),
    ("[CLS]", [0.0, 0.0]),
    ("[SEP]", [0.0, 0.0]),
    ("##s", [0.0, 0.0]),
    ("-", [0.0, 0.1]),
    ("+", [0.5, 0.0]),
    // Exclusionary language.
    ("no", [1.0, 0.0]),
    ("kids", [1.0, 0.0]),
    ("children", [1.0, 0.0]),
    ("adults", [0.9, 0.0]),
    ("only", [0.8, 0.0]),
    ("under", [0.6, 0.0]),
    ("christian", [1.0, 0.0]),
    ("muslim", [1.0, 0.0]),
    ("jewish", [1.0, 0.0]),
    ("preferred", [0.8, 0.0]),
    ("young", [0.9, 0.0]),
    ("professionals", [0.7, 0.0]),
    ("active", [0.6, 0.0]),
    ("mature", [0.9, 0.0]),
    ("55", [0.9, 0.0]),
    ("section", [0.9, 0.0]),
    ("8", [0.6, 0.0]),
    ("vouchers", [0.9, 0.0]),
    ("must", [0.6, 0.0]),
    ("credit", [0.8, 0.0]),
    ("ideal", [0.3, 0.0]),
    ("perfect", [0.3, 0.0]),
    // Context-dependent.
    ("allowed", [0.2, 0.2]),
    ("community", [0.3, 0.3]),
    ("for", [0.1, 0.1]),
    ("have", [0.2, 0.1]),
    ("accepted", [0.3, 0.1]),
    ("good", [0.1, 0.2]),
    // Neutral property description.
    ("great", [0.0, 1.0]),
    ("school", [0.0, 1.0]),
    ("district", [0.0, 1.0]),
    ("nearby", [0.0, 1.0]),
    ("walking", [0.0, 1.0]),
    ("distance", [0.0, 1.0]),
    ("to", [0.0, 0.5]),
    ("shops", [0.0, 1.0]),
    ("and", [0.0, 0.5]),
    ("restaurants", [0.0, 1.0]),
    ("beautiful", [0.0, 1.0]),
    ("hardwood", [0.0, 1.0]),
    ("floors", [0.0, 1.0]),
    ("recently", [0.0, 1.0]),
    ("renovated", [0.0, 1.0]),
    ("kitchen", [0.0, 1.0]),
    ("large", [0.0, 1.0]),
    ("backyard", [0.0, 1.0]),
    ("wheelchair", [0.0, 1.0]),
    ("accessible", [0.0, 1.0]),
    ("entrance", [0.0, 1.0]),
    ("bathroom", [0.0, 1.0]),
    ("elevator", [0.0, 1.0]),
    ("access", [0.0, 1.0]),
    ("wide", [0.0, 1.0]),
    ("doorways", [0.0, 1.0]),
    ("family", [0.0, 1.0]),
    ("friendly", [0.0, 1.0]),
    ("neighborhood", [0.0, 1.0]),
    ("with", [0.0, 0.5]),
    ("parks", [0.0, 1.0]),
    ("playground", [0.0, 1.0]),
    ("spacious", [0.0, 1.0]),
    ("apartment", [0.0, 1.0]),
    ("modern", [0.0, 1.0]),
    ("amenities", [0.0, 1.0]),
    ("pet", [0.0, 1.0]),
    ("building", [0.0, 1.0]),
    ("close", [0.0, 1.0]),
    ("public", [0.0, 1.0]),
    ("transportation", [0.0, 1.0]),
    ("quiet", [0.0, 1.0]),
    ("home", [0.0, 1.0]),
    ("in", [0.0, 0.5]),
];

pub fn reference_metadata(max_sequence_length: usize) -> ArtifactMetadata {
    ArtifactMetadata {
        artifact_version: REFERENCE_VERSION.into(),
        max_sequence_length,
        quantization_mode: QuantizationMode::None,
        precision: Default::default(),
        calibration_temperature: Some(REFERENCE_TEMPERATURE),
        runtime: Default::default(),
        normalization: Default::default(),
        special_tokens: Default::default(),
        id2label: None,
    }
}

pub fn reference_vocabulary() -> Vocabulary {
    Vocabulary::from_tokens(TOKENS.iter().map(|(token, _)| *token))
}

fn embedding_rows() -> Vec<Vec<f32>> {
    TOKENS.iter().map(|(_, e)| e.to_vec()).collect()
}

fn head_rows() -> Vec<Vec<f32>> {
    vec![
        vec![-HEAD_STRENGTH, HEAD_STRENGTH],
        vec![HEAD_STRENGTH, -HEAD_STRENGTH],
    ]
}

pub fn reference_weights() -> PooledWeights {
    PooledWeights::new(2, embedding_rows(), head_rows(), BIAS.to_vec())
        .expect("reference weights are well-formed")
}

/// In-memory reference artifact with the given window.
pub fn reference_artifact(max_sequence_length: usize) -> ModelArtifact {
    ModelArtifact::from_parts(
        reference_metadata(max_sequence_length),
        reference_vocabulary(),
        reference_weights(),
    )
    .expect("reference artifact is valid")
}

/// Write the reference artifact as an on-disk bundle.
pub fn write_reference_artifact(dir: &Path, max_sequence_length: usize) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;

    let metadata = serde_json::to_string_pretty(&reference_metadata(max_sequence_length))?;
    std::fs::write(dir.join("metadata.json"), metadata)?;

    let mut vocab = String::new();
    for (token, _) in TOKENS {
        vocab.push_str(token);
        vocab.push('\n');
    }
    std::fs::write(dir.join("vocab.txt"), vocab)?;

    let weights = json!({
        "dim": 2,
        "embeddings": embedding_rows(),
        "head": head_rows(),
        "bias": BIAS,
    });
    std::fs::write(dir.join("weights.json"), serde_json::to_string(&weights)?)?;
    Ok(())
}
