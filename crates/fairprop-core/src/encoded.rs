//! Per-request numeric encodings flowing between the tokenizer, runtime, and calibration.

use serde::{Deserialize, Serialize};

use crate::label::Label;

/// Token ids for one request, framed and bounded to the artifact window.
///
/// Produced by the text encoder; consumed by a single forward pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedInput {
    ids: Vec<u32>,
    attention_mask: Vec<bool>,
    truncated: bool,
}

impl EncodedInput {
    /// Wrap an already-bounded id sequence. Every position is attended.
    pub fn new(ids: Vec<u32>, truncated: bool) -> Self {
        let attention_mask = vec![true; ids.len()];
        Self {
            ids,
            attention_mask,
            truncated,
        }
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn attention_mask(&self) -> &[bool] {
        &self.attention_mask
    }

    /// True when the source text did not fit the window and tokens were dropped.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// The two raw scores for one input, already mapped to label order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawPrediction {
    pub compliant: f32,
    pub non_compliant: f32,
}

impl RawPrediction {
    pub fn logit(&self, label: Label) -> f32 {
        match label {
            Label::Compliant => self.compliant,
            Label::NonCompliant => self.non_compliant,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.compliant.is_finite() && self.non_compliant.is_finite()
    }
}

/// Which tokens survive when text overflows the context window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TruncationPolicy {
    /// Keep the first tokens.
    #[default]
    Head,
    /// Keep the last tokens.
    Tail,
}

impl TruncationPolicy {
    /// Bound `tokens` to at most `keep` entries. Returns whether anything was dropped.
    pub fn truncate(&self, tokens: &mut Vec<u32>, keep: usize) -> bool {
        if tokens.len() <= keep {
            return false;
        }
        match self {
            Self::Head => tokens.truncate(keep),
            Self::Tail => {
                let excess = tokens.len() - keep;
                tokens.drain(..excess);
            }
        }
        true
    }
}
