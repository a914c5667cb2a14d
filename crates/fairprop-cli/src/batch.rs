//! Portfolio audit: classify every listing in a JSON file and summarize.

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::{DateTime, Utc};
use fairprop_core::{Label, Prediction};
use fairprop_engine::{Engine, EngineError, InferenceRequest};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct Listing {
    pub id: String,
    pub description: String,
}

#[derive(Debug, Serialize)]
pub struct ListingResult {
    pub id: String,
    pub description: String,
    #[serde(flatten)]
    pub outcome: Outcome,
}

/// Per-listing result; failures are recorded, never fatal to the audit.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Outcome {
    Processed(Prediction),
    Error { kind: &'static str, error: String },
}

#[derive(Debug, Serialize)]
pub struct Report {
    pub generated_at: DateTime<Utc>,
    pub total_processed: usize,
    pub violations_detected: usize,
    pub compliant: usize,
    pub errors: usize,
    pub violation_rate: f64,
    pub average_confidence: f64,
    pub elapsed_secs: f64,
    /// Listings per second.
    pub throughput: f64,
}

#[derive(Debug, Serialize)]
pub struct Audit {
    pub report: Report,
    pub results: Vec<ListingResult>,
}

impl Audit {
    pub fn violations(&self) -> impl Iterator<Item = (&ListingResult, &Prediction)> {
        self.results.iter().filter_map(|r| match &r.outcome {
            Outcome::Processed(p) if p.label.is_violation() => Some((r, p)),
            _ => None,
        })
    }
}

pub fn read_listings(path: &Path) -> anyhow::Result<Vec<Listing>> {
    let raw =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing listings in {}", path.display()))
}

/// Classify every listing through the engine, in input order.
pub async fn run_audit(engine: &Engine, listings: Vec<Listing>, timeout: Duration) -> Audit {
    let start = Instant::now();
    let requests = listings
        .iter()
        .map(|l| {
            InferenceRequest::new(l.description.as_str())
                .with_id(l.id.as_str())
                .with_deadline(timeout)
        })
        .collect();
    let predictions = engine.classify_all(requests).await;

    let results = listings
        .into_iter()
        .zip(predictions)
        .map(|(listing, result)| ListingResult {
            id: listing.id,
            description: listing.description,
            outcome: outcome(result),
        })
        .collect::<Vec<_>>();

    let report = summarize(&results, start.elapsed());
    Audit { report, results }
}

fn outcome(result: Result<Prediction, EngineError>) -> Outcome {
    match result {
        Ok(p) => Outcome::Processed(p),
        Err(e) => Outcome::Error {
            kind: e.kind().as_str(),
            error: e.to_string(),
        },
    }
}

pub fn summarize(results: &[ListingResult], elapsed: Duration) -> Report {
    let total = results.len();
    let predictions: Vec<&Prediction> = results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Processed(p) => Some(p),
            Outcome::Error { .. } => None,
        })
        .collect();
    let violations = predictions.iter().filter(|p| p.label == Label::NonCompliant).count();
    let compliant = predictions.len() - violations;
    let errors = total - predictions.len();

    let confidence_sum: f64 = predictions.iter().map(|p| p.confidence as f64).sum();
    let elapsed_secs = elapsed.as_secs_f64();

    Report {
        generated_at: Utc::now(),
        total_processed: total,
        violations_detected: violations,
        compliant,
        errors,
        violation_rate: if total == 0 {
            0.0
        } else {
            violations as f64 / total as f64
        },
        average_confidence: confidence_sum / predictions.len().max(1) as f64,
        elapsed_secs,
        throughput: if elapsed_secs > 0.0 {
            total as f64 / elapsed_secs
        } else {
            0.0
        },
    }
}

pub fn save(path: &Path, audit: &Audit) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(audit)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fairprop_core::RuntimeError;

    fn prediction(label: Label, confidence: f32) -> Prediction {
        Prediction {
            request_id: None,
            label,
            confidence,
            latency: Duration::from_millis(3),
            degraded: false,
            truncated: false,
        }
    }

    fn result(id: &str, outcome: Outcome) -> ListingResult {
        ListingResult {
            id: id.into(),
            description: format!("listing {id}"),
            outcome,
        }
    }

    #[test]
    fn report_counts_every_outcome() {
        let results = vec![
            result("a", Outcome::Processed(prediction(Label::NonCompliant, 0.9))),
            result("b", Outcome::Processed(prediction(Label::Compliant, 0.7))),
            result("c", outcome(Err(EngineError::Runtime(RuntimeError::Backend("x".into()))))),
            result("d", Outcome::Processed(prediction(Label::Compliant, 0.8))),
        ];
        let report = summarize(&results, Duration::from_secs(2));
        assert_eq!(report.total_processed, 4);
        assert_eq!(report.violations_detected, 1);
        assert_eq!(report.compliant, 2);
        assert_eq!(report.errors, 1);
        assert!((report.violation_rate - 0.25).abs() < 1e-9);
        assert!((report.average_confidence - 0.8).abs() < 1e-6);
        assert!((report.throughput - 2.0).abs() < 1e-9);
    }

    #[test]
    fn empty_audit_has_zero_rates() {
        let report = summarize(&[], Duration::ZERO);
        assert_eq!(report.violation_rate, 0.0);
        assert_eq!(report.average_confidence, 0.0);
        assert_eq!(report.throughput, 0.0);
    }

    #[test]
    fn outcomes_serialize_with_status_tag() {
        let ok = serde_json::to_value(result(
            "prop-002",
            Outcome::Processed(prediction(Label::NonCompliant, 0.99)),
        ))
        .unwrap();
        assert_eq!(ok["status"], "processed");
        assert_eq!(ok["label"], "NON_COMPLIANT");
        assert_eq!(ok["id"], "prop-002");

        let err = serde_json::to_value(result(
            "prop-003",
            outcome(Err(EngineError::Backpressure { capacity: 4 })),
        ))
        .unwrap();
        assert_eq!(err["status"], "error");
        assert_eq!(err["kind"], "backpressure");
    }

    #[test]
    fn reads_listing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("listings.json");
        std::fs::write(
            &path,
            r#"[{"id": "prop-001", "description": "Beautiful 3BR home in quiet neighborhood"},
                {"id": "prop-002", "description": "No kids under 12 allowed"}]"#,
        )
        .unwrap();
        let listings = read_listings(&path).unwrap();
        assert_eq!(listings.len(), 2);
        assert_eq!(listings[1].id, "prop-002");

        std::fs::write(&path, "not json").unwrap();
        assert!(read_listings(&path).is_err());
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output").join("batch_results.json");
        let audit = Audit {
            report: summarize(&[], Duration::ZERO),
            results: vec![],
        };
        save(&path, &audit).unwrap();
        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["report"]["total_processed"], 0);
    }
}
