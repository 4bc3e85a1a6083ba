//! JSON/Markdown rendering for the two report kinds this CLI produces.

use crate::ReportFormat;
use broker_core::models::{BenchmarkRun, ManifestEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct CostReport {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub consumer_id: Option<String>,
    pub provider: Option<String>,
    pub gpu_type: Option<String>,
    pub total: f64,
}

pub fn render_cost(report: &CostReport, format: ReportFormat) -> anyhow::Result<String> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(report)?),
        ReportFormat::Markdown => {
            let mut out = String::new();
            out.push_str("# Cost rollup\n\n");
            out.push_str(&format!("- Range: {} .. {}\n", report.from.to_rfc3339(), report.to.to_rfc3339()));
            if let Some(consumer_id) = &report.consumer_id {
                out.push_str(&format!("- Consumer: {}\n", consumer_id));
            }
            if let Some(provider) = &report.provider {
                out.push_str(&format!("- Provider: {}\n", provider));
            }
            if let Some(gpu_type) = &report.gpu_type {
                out.push_str(&format!("- GPU type: {}\n", gpu_type));
            }
            out.push_str(&format!("\n**Total: {:.4}**\n", report.total));
            Ok(out)
        }
    }
}

#[derive(Debug, Serialize)]
struct BenchmarkReport<'a> {
    run: &'a BenchmarkRun,
    entries: &'a [ManifestEntry],
}

pub fn render_benchmark(
    run: &BenchmarkRun,
    entries: &[ManifestEntry],
    format: ReportFormat,
) -> anyhow::Result<String> {
    match format {
        ReportFormat::Json => Ok(serde_json::to_string_pretty(&BenchmarkReport { run, entries })?),
        ReportFormat::Markdown => {
            let mut out = String::new();
            out.push_str(&format!("# Benchmark run {}\n\n", run.id));
            out.push_str(&format!("- Status: {:?}\n", run.status));
            out.push_str(&format!("- Models: {}\n", run.models.join(", ")));
            out.push_str(&format!("- GPU types: {}\n", run.gpu_types.join(", ")));
            out.push_str(&format!("- Providers: {}\n", run.providers.join(", ")));
            out.push_str(&format!("- Max budget: {:.4}\n\n", run.max_budget));
            out.push_str("| model | gpu_type | provider | status | throughput | cost |\n");
            out.push_str("|---|---|---|---|---|---|\n");
            for entry in entries {
                out.push_str(&format!(
                    "| {} | {} | {} | {:?} | {} | {} |\n",
                    entry.model,
                    entry.gpu_type,
                    entry.provider,
                    entry.status,
                    entry
                        .throughput
                        .map(|t| format!("{:.2}", t))
                        .unwrap_or_else(|| "-".to_string()),
                    entry
                        .cost
                        .map(|c| format!("{:.4}", c))
                        .unwrap_or_else(|| "-".to_string()),
                ));
            }
            Ok(out)
        }
    }
}
