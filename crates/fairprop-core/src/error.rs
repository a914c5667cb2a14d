use std::path::PathBuf;

use thiserror::Error;

/// Input text cannot be represented under the artifact vocabulary.
///
/// A data problem with the request, never a fault of the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodingError {
    #[error("input is not valid UTF-8 (valid up to byte {valid_up_to})")]
    InvalidUtf8 { valid_up_to: usize },

    #[error("vocabulary cannot represent {word:?} and defines no unknown token")]
    Unrepresentable { word: String },

    #[error("tokenizer error: {0}")]
    Tokenizer(String),
}

/// The model artifact is missing, corrupt, or version-incompatible.
#[derive(Debug, Error)]
pub enum ArtifactLoadError {
    #[error("artifact not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("incompatible artifact version {found:?} (supported major version: {supported})")]
    IncompatibleVersion { found: String, supported: u32 },

    #[error("invalid artifact: {0}")]
    Invalid(String),

    #[error("runtime backend unavailable: {0}")]
    Backend(String),
}

/// The numeric backend failed during a forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("token id {id} outside vocabulary of {vocab_size}")]
    TokenOutOfRange { id: u32, vocab_size: usize },

    #[error("sequence of {len} tokens exceeds the {max}-token window")]
    SequenceTooLong { len: usize, max: usize },

    #[error("backend returned {got} predictions for {expected} inputs")]
    OutputMismatch { expected: usize, got: usize },

    #[error("backend produced non-finite logits for batch item {index}")]
    NonFinite { index: usize },

    #[error("backend failure: {0}")]
    Backend(String),
}
