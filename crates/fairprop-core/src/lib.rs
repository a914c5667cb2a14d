pub mod encoded;
pub mod error;
pub mod label;
pub mod metadata;
pub mod prediction;

pub use encoded::{EncodedInput, RawPrediction, TruncationPolicy};
pub use error::{ArtifactLoadError, EncodingError, RuntimeError};
pub use label::Label;
pub use metadata::{
    ArtifactMetadata, Normalization, Precision, QuantizationMode, RuntimeKind, SpecialTokens,
};
pub use prediction::{Prediction, assemble};
