//! Final per-request result and its assembly.

use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};

use crate::label::Label;

/// Calibrated verdict returned to the caller.
///
/// `confidence` is the probability of `label`, never of a fixed class.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub label: Label,
    pub confidence: f32,
    #[serde(rename = "latency_ms", serialize_with = "serialize_millis")]
    pub latency: Duration,
    /// Served while the latency monitor forced the fallback path.
    pub degraded: bool,
    pub truncated: bool,
}

impl Prediction {
    pub fn with_request_id(mut self, id: Option<String>) -> Self {
        self.request_id = id;
        self
    }

    pub fn latency_ms(&self) -> f64 {
        self.latency.as_secs_f64() * 1000.0
    }
}

/// Package a calibrated verdict, measuring latency from `start`.
pub fn assemble(
    label: Label,
    confidence: f32,
    start: Instant,
    degraded: bool,
    truncated: bool,
) -> Prediction {
    Prediction {
        request_id: None,
        label,
        confidence: confidence.clamp(0.0, 1.0),
        latency: start.elapsed(),
        degraded,
        truncated,
    }
}

fn serialize_millis<S: Serializer>(latency: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(latency.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_measures_elapsed_time() {
        let start = Instant::now() - Duration::from_millis(5);
        let p = assemble(Label::Compliant, 0.93, start, false, false);
        assert!(p.latency >= Duration::from_millis(5));
        assert_eq!(p.label, Label::Compliant);
        assert!(p.request_id.is_none());
    }

    #[test]
    fn confidence_is_kept_in_unit_interval() {
        let p = assemble(Label::NonCompliant, 1.000_001, Instant::now(), false, false);
        assert!(p.confidence <= 1.0);
    }

    #[test]
    fn serializes_output_contract() {
        let p = Prediction {
            request_id: None,
            label: Label::NonCompliant,
            confidence: 0.5,
            latency: Duration::from_micros(2500),
            degraded: true,
            truncated: false,
        };
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["label"], "NON_COMPLIANT");
        assert_eq!(json["confidence"], 0.5);
        assert_eq!(json["latency_ms"], 2.5);
        assert_eq!(json["degraded"], true);
        assert_eq!(json["truncated"], false);
        assert!(json.get("request_id").is_none());
    }

    #[test]
    fn request_id_is_carried() {
        let p = assemble(Label::Compliant, 0.7, Instant::now(), false, true)
            .with_request_id(Some("prop-001".into()));
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["request_id"], "prop-001");
        assert_eq!(json["truncated"], true);
    }
}
