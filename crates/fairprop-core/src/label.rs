//! The closed two-label decision space.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Fair-housing verdict for a piece of listing text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Label {
    Compliant,
    NonCompliant,
}

impl Label {
    /// Both labels, in the default model output order.
    pub const ALL: [Label; 2] = [Label::Compliant, Label::NonCompliant];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "COMPLIANT",
            Self::NonCompliant => "NON_COMPLIANT",
        }
    }

    pub fn is_violation(&self) -> bool {
        matches!(self, Self::NonCompliant)
    }
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Label {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLIANT" => Ok(Self::Compliant),
            "NON_COMPLIANT" => Ok(Self::NonCompliant),
            other => Err(format!("unknown label {other:?}")),
        }
    }
}
