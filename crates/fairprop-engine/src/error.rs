use std::time::Duration;

use fairprop_ai::ClassifyError;
use fairprop_core::{ArtifactLoadError, EncodingError, RuntimeError};
use thiserror::Error;

use crate::config::ConfigError;

/// Everything a caller of the engine can see go wrong.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Encoding(#[from] EncodingError),

    #[error(transparent)]
    ArtifactLoad(#[from] ArtifactLoadError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The request queue is full. Shed load; do not retry in a tight loop.
    #[error("request queue is full ({capacity} pending)")]
    Backpressure { capacity: usize },

    #[error("no result within {}ms", budget.as_millis())]
    Timeout { budget: Duration },

    #[error("engine is shut down")]
    ShutDown,
}

impl From<ClassifyError> for EngineError {
    fn from(e: ClassifyError) -> Self {
        match e {
            ClassifyError::Encoding(e) => Self::Encoding(e),
            ClassifyError::Runtime(e) => Self::Runtime(e),
        }
    }
}

/// Coarse error category, stable across variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Encoding,
    ArtifactLoad,
    Runtime,
    Config,
    Backpressure,
    Timeout,
    ShutDown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Encoding => "encoding",
            Self::ArtifactLoad => "artifact_load",
            Self::Runtime => "runtime",
            Self::Config => "config",
            Self::Backpressure => "backpressure",
            Self::Timeout => "timeout",
            Self::ShutDown => "shut_down",
        }
    }

    /// Process exit status for a command that failed with this kind (sysexits.h).
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Encoding => 65,
            Self::ArtifactLoad => 66,
            Self::ShutDown => 69,
            Self::Runtime => 70,
            Self::Timeout => 74,
            Self::Backpressure => 75,
            Self::Config => 78,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Encoding(_) => ErrorKind::Encoding,
            Self::ArtifactLoad(_) => ErrorKind::ArtifactLoad,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Config(_) => ErrorKind::Config,
            Self::Backpressure { .. } => ErrorKind::Backpressure,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::ShutDown => ErrorKind::ShutDown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_have_distinct_exit_codes() {
        let kinds = [
            ErrorKind::Encoding,
            ErrorKind::ArtifactLoad,
            ErrorKind::Runtime,
            ErrorKind::Config,
            ErrorKind::Backpressure,
            ErrorKind::Timeout,
            ErrorKind::ShutDown,
        ];
        let mut codes: Vec<u8> = kinds.iter().map(|k| k.exit_code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn classify_errors_keep_their_kind() {
        let e: EngineError = ClassifyError::Runtime(RuntimeError::Backend("oom".into())).into();
        assert_eq!(e.kind(), ErrorKind::Runtime);

        let e: EngineError = ClassifyError::Encoding(EncodingError::InvalidUtf8 { valid_up_to: 3 }).into();
        assert_eq!(e.kind(), ErrorKind::Encoding);
    }

    #[test]
    fn timeout_and_backpressure_are_distinct() {
        let timeout = EngineError::Timeout {
            budget: Duration::from_millis(52),
        };
        let full = EngineError::Backpressure { capacity: 256 };
        assert_ne!(timeout.kind(), full.kind());
        assert_eq!(timeout.to_string(), "no result within 52ms");
    }
}
