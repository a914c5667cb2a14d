//! Human-readable reports for single checks, audits, and benchmarks.

use fairprop_core::Prediction;

use crate::batch::{Audit, Outcome};
use crate::bench::BenchReport;

const RULE_WIDTH: usize = 40;
const MAX_EXCERPT: usize = 60;

/// Print a single verdict as a card.
pub fn print_prediction(text: &str, prediction: &Prediction) {
    let rule = "-".repeat(RULE_WIDTH);
    println!("{rule}");
    println!("FairProp Inspector Analysis");
    println!("{rule}");
    println!("Input:      {text}");
    println!("Prediction: {}", prediction.label);
    println!("Confidence: {:.2}%", prediction.confidence * 100.0);
    println!("Latency:    {:.2}ms", prediction.latency_ms());
    if prediction.truncated {
        println!("Note:       input truncated to the model's sequence limit");
    }
    if prediction.degraded {
        println!("Note:       served in degraded mode");
    }
    println!("{rule}");
}

pub fn print_audit(audit: &Audit) {
    let report = &audit.report;
    println!("=== Portfolio Audit ===");
    println!();
    println!("  {:<22} {}", "Total processed", report.total_processed);
    println!("  {:<22} {}", "Violations detected", report.violations_detected);
    println!("  {:<22} {}", "Compliant", report.compliant);
    if report.errors > 0 {
        println!("  {:<22} {}", "Errors", report.errors);
    }
    println!("  {:<22} {:.1}%", "Violation rate", report.violation_rate * 100.0);
    println!("  {:<22} {:.1}%", "Average confidence", report.average_confidence * 100.0);
    println!("  {:<22} {:.1} listings/s", "Throughput", report.throughput);
    println!();

    let violations: Vec<_> = audit.violations().collect();
    if !violations.is_empty() {
        println!("Flagged listings ({}):", violations.len());
        for (result, prediction) in violations {
            println!(
                "  {:<12} {:>6.1}%  {}",
                result.id,
                prediction.confidence * 100.0,
                excerpt(&result.description)
            );
        }
        println!();
    }

    let failures: Vec<_> = audit
        .results
        .iter()
        .filter_map(|r| match &r.outcome {
            Outcome::Error { error, .. } => Some((r.id.as_str(), error.as_str())),
            Outcome::Processed(_) => None,
        })
        .collect();
    if !failures.is_empty() {
        println!("Failed listings ({}):", failures.len());
        for (id, error) in failures {
            println!("  {id:<12} {error}");
        }
        println!();
    }
}

pub fn print_bench(report: &BenchReport) {
    let s = &report.single;
    println!("=== Single Request Latency ({} runs) ===", s.samples);
    println!();
    println!("  {:<8} {:>10.2}ms", "Mean", s.mean_ms);
    println!("  {:<8} {:>10.2}ms", "Median", s.median_ms);
    println!("  {:<8} {:>10.2}ms", "Min", s.min_ms);
    println!("  {:<8} {:>10.2}ms", "Max", s.max_ms);
    println!("  {:<8} {:>10.2}ms", "P95", s.p95_ms);
    println!("  {:<8} {:>10.2}ms", "P99", s.p99_ms);
    println!();

    println!("=== Batch Throughput ===");
    println!();
    println!("  {:>5}  {:>10}  {:>12}  {:>12}", "Size", "Total", "Per listing", "Listings/s");
    for b in &report.batches {
        println!(
            "  {:>5}  {:>8.2}ms  {:>10.2}ms  {:>12.1}",
            b.batch_size, b.total_ms, b.avg_latency_ms, b.throughput
        );
    }
    println!();

    let stats = &report.stats;
    println!("=== Scheduler ===");
    println!();
    println!("  {:<18} {}", "Health", report.health);
    println!("  {:<18} {}", "Batches", stats.batches);
    println!("  {:<18} {:.2}", "Mean batch size", stats.mean_batch_size);
    println!("  {:<18} {:.1}%", "SLO attainment", stats.slo_attainment * 100.0);
    println!();

    let verdict = if report.passed { "PASSED" } else { "FAILED" };
    println!(
        "P95 {:.2}ms against {}ms budget: {verdict}",
        s.p95_ms, report.budget_ms
    );
}

fn excerpt(text: &str) -> String {
    if text.chars().count() <= MAX_EXCERPT {
        return text.to_string();
    }
    let cut: String = text.chars().take(MAX_EXCERPT - 3).collect();
    format!("{cut}...")
}
