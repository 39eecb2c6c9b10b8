//! Telemetry output writer.
//!
//! Writes one finished [`ExchangeSpan`] per file, named
//! `<local timestamp>_<trace id>.<json|txt>`.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::path::{Path, PathBuf};

use super::span::{ExchangeSpan, SpanEventKind};
use crate::engine::config::TelemetryFormat;

pub struct TelemetryWriter;

impl TelemetryWriter {
    /// Write an exchange span to `destination` and return the file path.
    pub fn write_exchange(
        span: &ExchangeSpan,
        format: TelemetryFormat,
        destination: &Path,
    ) -> Result<PathBuf> {
        if !destination.exists() {
            fs::create_dir_all(destination).with_context(|| {
                format!(
                    "Failed to create telemetry directory {}",
                    destination.display()
                )
            })?;
        }

        let datetime: DateTime<Local> = span.timestamp.into();
        let extension = match format {
            TelemetryFormat::Json => "json",
            TelemetryFormat::Text => "txt",
        };
        let filename = format!(
            "{}_{}.{}",
            datetime.format("%Y-%m-%d_%H-%M-%S"),
            span.trace_id,
            extension
        );
        let file_path = destination.join(filename);

        // Trailing newline keeps line-oriented log shippers happy
        let content = match format {
            TelemetryFormat::Json => format!("{}\n", serde_json::to_string(span)?),
            TelemetryFormat::Text => Self::format_human_readable(span)?,
        };

        fs::write(&file_path, content)
            .with_context(|| format!("Failed to write telemetry to {}", file_path.display()))?;
        Ok(file_path)
    }

    /// Format an exchange as human-readable text.
    pub fn format_human_readable(span: &ExchangeSpan) -> Result<String> {
        let datetime: DateTime<Local> = span.timestamp.into();
        let mut output = String::new();

        output.push_str(&format!(
            "===== Warden Exchange [{}] [{}] =====\n",
            datetime.format("%Y-%m-%d %H:%M:%S"),
            span.trace_id
        ));
        output.push_str(&format!("Request: {} '{}'\n", span.method, span.path));
        output.push_str(&format!("TEE: {}\n", span.tee_type));
        output.push_str(&format!("Total Duration: {}ms\n\n", span.total_duration_ms));

        if span.phases.is_empty() {
            output.push_str("(No phases processed)\n\n");
        }

        for (i, phase) in span.phases.iter().enumerate() {
            output.push_str(&format!("[Phase {}: {}]\n", i + 1, phase.phase));
            if let Some(ref query) = phase.query {
                output.push_str(&format!("  Query: {query}\n"));
            }
            if let Some(ref decision) = phase.decision {
                output.push_str(&format!("  Decision: {decision}\n"));
            }
            if !phase.print_output.is_empty() {
                output.push_str("  Print Output:\n");
                for line in &phase.print_output {
                    output.push_str(&format!("    {line}\n"));
                }
            }
            for event in &phase.events {
                let tag = match event.kind {
                    SpanEventKind::Fault => "FAULT",
                    SpanEventKind::Disallowed => "DISALLOWED",
                };
                output.push_str(&format!("  [{}] {}\n", tag, event.message));
            }
            output.push_str(&format!(
                "  Verdict: {}\n",
                phase.verdict.as_deref().unwrap_or("-")
            ));
            output.push_str(&format!("  Duration: {}ms\n\n", phase.duration_ms));
        }

        output.push_str(&format!(
            "===== End Exchange [{}ms] =====\n",
            span.total_duration_ms
        ));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::phase::Phase;
    use serde_json::json;
    use tempfile::tempdir;

    fn sample() -> ExchangeSpan {
        let mut span = ExchangeSpan::new("sevsnp");
        span.set_request("POST", "/v1/items");
        let mut phase = span.start_phase(Phase::RequestHeaders);
        phase.record_query("cleanroom/policy/on_request_headers");
        phase.record_decision(&json!({"allowed": false}));
        phase.record_disallowed("forbidden");
        phase.finalize("terminate");
        span.add_phase(phase);
        span.finalize();
        span
    }

    #[test]
    fn test_write_json() {
        let dir = tempdir().unwrap();
        let path =
            TelemetryWriter::write_exchange(&sample(), TelemetryFormat::Json, dir.path()).unwrap();

        assert_eq!(path.extension().unwrap(), "json");
        let content = fs::read_to_string(path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["method"], "POST");
        assert_eq!(value["phases"][0]["status"], "error");
    }

    #[test]
    fn test_write_text_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        let path =
            TelemetryWriter::write_exchange(&sample(), TelemetryFormat::Text, &nested).unwrap();

        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("Warden Exchange"));
        assert!(content.contains("Request: POST '/v1/items'"));
        assert!(content.contains("[DISALLOWED] forbidden"));
        assert!(content.contains("Verdict: terminate"));
    }
}
