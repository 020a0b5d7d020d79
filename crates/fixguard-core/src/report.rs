use std::{
    fmt::Write,
    io,
    path::{Path, PathBuf},
};

use colored::Colorize;
use serde::Serialize;
use thiserror::Error;

use crate::model::{
    Finding, OverallStatus, RunReport, Severity, ValidatorResult, ValidatorStatus, SCHEMA_VERSION,
};

/// Format styles supported by the reporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    Json,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to format report: {0}")]
    Format(#[from] std::fmt::Error),
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write report to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Produce a report string from a sealed `RunReport` using the desired format.
pub fn render_report(report: &RunReport, format: OutputFormat) -> Result<String, ReportError> {
    match format {
        OutputFormat::Human => render_human(report),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(&JsonReport::from(report))?),
    }
}

fn render_human(report: &RunReport) -> Result<String, ReportError> {
    let mut out = String::new();
    writeln!(
        out,
        "{} {}",
        "Validation run".bold(),
        report.run_id.to_string().dimmed()
    )?;
    writeln!(
        out,
        "Host: {} ({}, {}) at {}",
        report.host_info.hostname,
        report.host_info.os,
        report.host_info.user,
        report.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    )?;
    writeln!(out)?;

    for result in &report.results {
        render_result(&mut out, result)?;
    }

    writeln!(out)?;
    writeln!(
        out,
        "Totals: {} errors, {} warnings, {} fixed",
        report.totals.errors, report.totals.warnings, report.totals.fixed
    )?;
    let verdict = match report.overall_status {
        OverallStatus::Pass => "PASS".green().bold(),
        OverallStatus::Warn => "WARN".yellow().bold(),
        OverallStatus::Fail => "FAIL".red().bold(),
    };
    writeln!(out, "Overall: {verdict}")?;
    Ok(out)
}

fn render_result(out: &mut String, result: &ValidatorResult) -> Result<(), ReportError> {
    let tag = match (result.status, result.verdict()) {
        (ValidatorStatus::Cancelled, _) => "[SKIP]".dimmed(),
        (_, OverallStatus::Pass) => "[PASS]".green(),
        (_, OverallStatus::Warn) => "[WARN]".yellow(),
        (_, OverallStatus::Fail) => "[FAIL]".red(),
    };
    writeln!(
        out,
        "{tag} {name} ({duration} ms)",
        name = result.validator_name.bold(),
        duration = result.duration_ms
    )?;

    for (severity, heading) in [
        (Severity::Error, "Errors"),
        (Severity::Warning, "Warnings"),
        (Severity::Fixed, "Fixed"),
        (Severity::Info, "Info"),
    ] {
        let group: Vec<&Finding> = result
            .findings
            .iter()
            .filter(|finding| finding.severity == severity)
            .collect();
        if group.is_empty() {
            continue;
        }
        writeln!(out, "    {heading}:")?;
        for finding in group {
            writeln!(
                out,
                "      - {}: {}",
                finding.component,
                single_line(&finding.message)
            )?;
            if finding.severity != Severity::Fixed {
                if let Some(hint) = &finding.fix_suggestion {
                    writeln!(out, "        fix: {}", hint.cyan())?;
                }
            }
        }
    }
    Ok(())
}

fn single_line(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\n' | '\r' => ' ',
            _ => c,
        })
        .collect()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonReport<'a> {
    schema_version: u32,
    #[serde(flatten)]
    report: &'a RunReport,
}

impl<'a> From<&'a RunReport> for JsonReport<'a> {
    fn from(report: &'a RunReport) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            report,
        }
    }
}

/// File name a persisted report is stored under.
pub fn report_file_name(report: &RunReport) -> String {
    format!(
        "report-{}-{}.json",
        report.timestamp.format("%Y%m%dT%H%M%SZ"),
        report.run_id
    )
}

/// Write the JSON report into `dir`. The file appears atomically and never replaces
/// an existing report.
pub fn persist_report(report: &RunReport, dir: &Path) -> Result<PathBuf, ReportError> {
    let body = render_report(report, OutputFormat::Json)?;
    let path = dir.join(report_file_name(report));
    let write_error = |source: io::Error| ReportError::Write {
        path: path.clone(),
        source,
    };

    std::fs::create_dir_all(dir).map_err(write_error)?;
    let mut staged = tempfile::NamedTempFile::new_in(dir).map_err(write_error)?;
    io::Write::write_all(&mut staged, body.as_bytes()).map_err(write_error)?;
    io::Write::write_all(&mut staged, b"\n").map_err(write_error)?;
    staged.as_file().sync_all().map_err(write_error)?;
    staged
        .persist_noclobber(&path)
        .map_err(|err| write_error(err.error))?;
    Ok(path)
}
