use crate::campaign::CampaignReport;
use crate::outcome::{ObservedValue, RunRecord};
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReportError {
    #[error("Failed to write CSV report: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to write JSON report: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to write report: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReportFormat {
    /// One row per run, preceded by the golden run when there is one.
    #[default]
    Csv,
    /// The whole report, golden run and seed included.
    Json,
}

impl ReportFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Csv => "csv",
            ReportFormat::Json => "json",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "csv" => Ok(ReportFormat::Csv),
            "json" => Ok(ReportFormat::Json),
            other => Err(format!("unknown report format '{other}' (expected csv or json)")),
        }
    }
}

#[derive(Serialize)]
struct CsvRow<'a> {
    /// The run index, or `golden` for the baseline run.
    run: String,
    category: Option<&'a str>,
    target: Option<&'a str>,
    operation: Option<&'a str>,
    outcome: &'a str,
    injection_delay_ms: u64,
    timeout_ms: u64,
    wall_clock_ms: u64,
    address: Option<String>,
    original: Option<String>,
    injected: Option<String>,
    parameter: Option<u64>,
    exit_code: Option<i32>,
    signal: Option<&'a str>,
    breakpoint_hits: u32,
    result_condition: Option<&'a str>,
    fingerprint: Option<&'a str>,
    /// `identifier=value` per declared target, `;`-separated.
    snapshot: String,
    diagnostic: Option<&'a str>,
}

impl<'a> From<&'a RunRecord> for CsvRow<'a> {
    fn from(record: &'a RunRecord) -> Self {
        let injection = record.injection.as_ref();
        CsvRow {
            run: record.run_index.to_string(),
            category: record.target.as_ref().map(|t| t.category.as_str()),
            target: record.target.as_ref().map(|t| t.identifier.as_str()),
            operation: record.operation.map(|kind| kind.as_str()),
            outcome: record.outcome.as_str(),
            injection_delay_ms: record.injection_delay.as_millis() as u64,
            timeout_ms: record.timeout.as_millis() as u64,
            wall_clock_ms: record.wall_clock.as_millis() as u64,
            address: injection
                .and_then(|i| i.address)
                .map(|address| format!("{address:#x}")),
            original: injection.map(|i| hex_le(&i.original)),
            injected: injection.map(|i| hex_le(&i.injected)),
            parameter: injection.and_then(|i| i.parameter),
            exit_code: record.exit_code,
            signal: record.signal.as_deref(),
            breakpoint_hits: record.breakpoint_hits,
            result_condition: record.result_condition.as_deref(),
            fingerprint: injection.map(|i| i.fingerprint.as_str()),
            snapshot: snapshot_column(&record.snapshot),
            diagnostic: record.diagnostic.as_deref(),
        }
    }
}

/// Renders little-endian bytes as a `0x`-prefixed number, most significant byte first.
fn hex_le(bytes: &[u8]) -> String {
    let msb_first: Vec<u8> = bytes.iter().rev().copied().collect();
    format!("0x{}", hex::encode(msb_first))
}

/// Unreadable targets are written as `identifier=?`.
fn snapshot_column(snapshot: &[ObservedValue]) -> String {
    snapshot
        .iter()
        .map(|observed| {
            let value = observed.value.as_deref().map_or_else(|| "?".to_string(), hex_le);
            format!("{}={value}", observed.target.identifier)
        })
        .collect::<Vec<_>>()
        .join(";")
}

pub fn write_csv<W: Write>(report: &CampaignReport, writer: W) -> Result<(), ReportError> {
    let mut csv = csv::Writer::from_writer(writer);
    if let Some(golden) = &report.golden {
        let mut row = CsvRow::from(&golden.record);
        row.run = "golden".to_string();
        csv.serialize(row)?;
    }
    for record in &report.runs {
        csv.serialize(CsvRow::from(record))?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_json<W: Write>(report: &CampaignReport, writer: W) -> Result<(), ReportError> {
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}

pub fn write_report<W: Write>(
    report: &CampaignReport,
    format: ReportFormat,
    writer: W,
) -> Result<(), ReportError> {
    match format {
        ReportFormat::Csv => write_csv(report, writer),
        ReportFormat::Json => write_json(report, writer),
    }
}

/// Writes the report to `path`, replacing any existing file.
pub fn export(
    report: &CampaignReport,
    format: ReportFormat,
    path: &Path,
) -> Result<(), ReportError> {
    let mut writer = BufWriter::new(File::create(path)?);
    write_report(report, format, &mut writer)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::CampaignController;
    use crate::outcome::TargetRef;
    use crate::target::Category;
    use crate::session::StopEvent;
    use crate::testing::{ScriptedFactory, campaign};
    use tempfile::tempdir;

    fn report() -> CampaignReport {
        let config = campaign(3, 1, true);
        let factory = ScriptedFactory::new(vec![
            StopEvent::BreakpointHit,
            StopEvent::Exited(0),
            StopEvent::Signaled("SIGSEGV".into()),
        ]);
        CampaignController::new(&factory, &config, 11).run()
    }

    #[test]
    fn csv_has_a_header_the_golden_run_and_one_row_per_run() {
        let report = report();
        let mut out = Vec::new();
        write_csv(&report, &mut out).expect("CSV export");
        let text = String::from_utf8(out).expect("UTF-8 CSV");
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5, "Header, golden run and three runs:\n{text}");
        assert!(lines[0].starts_with("run,category,target,operation,outcome"));
        assert!(lines[0].contains("result_condition"));
        assert!(lines[0].contains("snapshot"));
        assert!(lines[1].starts_with("golden,"));
        assert!(lines[1].contains("completed"), "The golden run exits:\n{text}");
        assert!(lines[2].starts_with("0,"));
        assert!(lines[2].contains("crashed"), "Run 0 sees SIGSEGV:\n{text}");
        assert!(lines[2].contains("SIGSEGV"));
        assert!(lines[2].contains("i=0x5a5a5a5a"), "Crash snapshot:\n{text}");
        assert!(lines[3].starts_with("1,"));
        assert!(lines[4].contains("timed-out"));
    }

    #[test]
    fn csv_without_golden_run_starts_at_run_zero() {
        let mut report = report();
        report.golden = None;
        let mut out = Vec::new();
        write_csv(&report, &mut out).expect("CSV export");
        let text = String::from_utf8(out).expect("UTF-8 CSV");
        assert_eq!(text.lines().count(), 4);
        assert!(text.lines().nth(1).is_some_and(|line| line.starts_with("0,")));
    }

    #[test]
    fn json_keeps_seed_and_golden_run() {
        let report = report();
        let mut out = Vec::new();
        write_json(&report, &mut out).expect("JSON export");
        let value: serde_json::Value = serde_json::from_slice(&out).expect("Valid JSON");
        assert_eq!(value["seed"], 11);
        assert_eq!(value["experiment"], "foo");
        assert_eq!(value["golden"]["record"]["outcome"], "completed");
        assert_eq!(value["runs"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["interrupted"], false);
    }

    #[test]
    fn export_writes_the_file() {
        let dir = tempdir().expect("Temp dir");
        let path = dir.path().join("foo.json");
        export(&report(), ReportFormat::Json, &path).expect("Export");
        let content = std::fs::read_to_string(&path).expect("Read back");
        assert!(content.contains("\"runs\""));
    }

    #[test]
    fn formats_parse_case_insensitively() {
        assert_eq!("CSV".parse::<ReportFormat>(), Ok(ReportFormat::Csv));
        assert_eq!("json".parse::<ReportFormat>(), Ok(ReportFormat::Json));
        assert!("xml".parse::<ReportFormat>().is_err());
        assert_eq!(ReportFormat::Json.extension(), "json");
    }

    #[test]
    fn values_render_most_significant_byte_first() {
        assert_eq!(hex_le(&[0x00, 0xf0, 0xfd, 0x7f]), "0x7ffdf000");
    }

    #[test]
    fn snapshot_column_marks_unreadable_targets() {
        let observed = |identifier: &str, value: Option<Vec<u8>>| ObservedValue {
            target: TargetRef {
                category: Category::Variable,
                identifier: identifier.to_string(),
            },
            error: value.is_none().then(|| "no symbol".to_string()),
            value,
        };
        let snapshot = [observed("i", Some(vec![0x2a, 0])), observed("j", None)];
        assert_eq!(snapshot_column(&snapshot), "i=0x002a;j=?");
    }
}
