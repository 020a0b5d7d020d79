use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Version of the machine-readable report layout. Bump on any breaking change.
pub const SCHEMA_VERSION: u32 = 1;
/// Upper bound for captured validator output kept in a result.
pub const MAX_RAW_OUTPUT_BYTES: usize = 64 * 1024;

/// Exit code a validator result carries when surviving errors were reported.
pub const EXIT_FINDINGS: i32 = 1;
pub const EXIT_MALFORMED: i32 = 65;
pub const EXIT_CRASHED: i32 = 70;
pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_CANCELLED: i32 = 130;

/// Process exit code for orchestrator-level fatal errors.
pub const EXIT_FATAL: u8 = 3;

/// Severity attached to a single finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
    Fixed,
}

impl Severity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Info => "info",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One observation reported by a validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub severity: Severity,
    /// Checked subject: a file path, package name, setting, ...
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub fix_suggestion: Option<String>,
    /// Whether an automated fix exists for this finding.
    #[serde(default)]
    pub fixable: bool,
}

impl Finding {
    pub fn new(severity: Severity, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity,
            component: component.into(),
            message: message.into(),
            fix_suggestion: None,
            fixable: false,
        }
    }

    pub fn error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, component, message)
    }

    pub fn warning(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, component, message)
    }

    pub fn info(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, component, message)
    }

    pub fn with_fix_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.fix_suggestion = Some(suggestion.into());
        self
    }

    pub fn fixable(mut self) -> Self {
        self.fixable = true;
        self
    }

    /// Whether this finding may be handed to the remediation engine.
    pub fn is_remediable(&self) -> bool {
        self.fixable && matches!(self.severity, Severity::Error | Severity::Warning)
    }

    /// Mark an error or warning as remediated. Other severities are returned untouched.
    pub fn into_fixed(mut self) -> Self {
        if matches!(self.severity, Severity::Error | Severity::Warning) {
            self.severity = Severity::Fixed;
        }
        self
    }

    /// Synthetic error recorded when a validator could not run to completion.
    pub fn infrastructure_failure(validator: &str, reason: &str) -> Self {
        Self::error(
            validator,
            format!("validator infrastructure failure: {reason}"),
        )
    }

    /// Validate the invariants every reported finding must satisfy.
    pub fn validate(&self) -> Result<(), FindingValidationError> {
        if self.component.trim().is_empty() {
            return Err(FindingValidationError::EmptyComponent {
                message: self.message.clone(),
            });
        }
        if self.message.trim().is_empty() {
            return Err(FindingValidationError::EmptyMessage {
                component: self.component.clone(),
            });
        }
        Ok(())
    }
}

/// Validation errors for findings received across the validator boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FindingValidationError {
    #[error("finding `{message}` has a blank component")]
    EmptyComponent { message: String },
    #[error("finding for `{component}` has a blank message")]
    EmptyMessage { component: String },
}

/// How a validator invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorStatus {
    Completed,
    InfrastructureFailure,
    Cancelled,
}

/// Per-severity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub errors: usize,
    pub warnings: usize,
    pub fixed: usize,
}

impl Totals {
    pub fn from_findings<'a>(findings: impl IntoIterator<Item = &'a Finding>) -> Self {
        let mut totals = Self::default();
        for finding in findings {
            totals.add(finding.severity);
        }
        totals
    }

    pub fn add(&mut self, severity: Severity) {
        match severity {
            Severity::Error => self.errors += 1,
            Severity::Warning => self.warnings += 1,
            Severity::Fixed => self.fixed += 1,
            Severity::Info => {}
        }
    }

    pub fn merge(&mut self, other: Totals) {
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.fixed += other.fixed;
    }
}

/// Verdict of a whole run (or of a single validator's findings).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Pass,
    Warn,
    Fail,
}

impl OverallStatus {
    /// `Fixed` findings never count against the verdict.
    pub fn from_totals(totals: &Totals) -> Self {
        if totals.errors > 0 {
            Self::Fail
        } else if totals.warnings > 0 {
            Self::Warn
        } else {
            Self::Pass
        }
    }

    /// Stable process exit code: 0 pass, 1 warn (2 when warnings fail the run), 2 fail.
    pub fn exit_code(self, warn_as_failure: bool) -> u8 {
        match self {
            Self::Pass => 0,
            Self::Warn if warn_as_failure => 2,
            Self::Warn => 1,
            Self::Fail => 2,
        }
    }
}

/// Outcome of one validator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidatorResult {
    pub validator_name: String,
    pub started_at: DateTime<Utc>,
    /// Wall-clock duration in milliseconds.
    #[serde(rename = "duration")]
    pub duration_ms: u64,
    pub exit_code: i32,
    pub status: ValidatorStatus,
    pub findings: Vec<Finding>,
    pub raw_output: String,
}

impl ValidatorResult {
    /// Build a completed result; the exit code is derived from the findings so that
    /// a zero exit never coexists with a surviving error.
    pub fn from_findings(
        validator_name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        findings: Vec<Finding>,
        raw_output: impl Into<String>,
    ) -> Self {
        let mut result = Self {
            validator_name: validator_name.into(),
            started_at,
            duration_ms: duration_millis(duration),
            exit_code: 0,
            status: ValidatorStatus::Completed,
            findings,
            raw_output: bound_output(raw_output.into(), MAX_RAW_OUTPUT_BYTES),
        };
        result.normalize();
        result
    }

    /// Result for a validator that crashed, timed out or returned garbage.
    pub fn infrastructure_failure(
        validator_name: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
        exit_code: i32,
        reason: &str,
        raw_output: impl Into<String>,
    ) -> Self {
        let validator_name = validator_name.into();
        let finding = Finding::infrastructure_failure(&validator_name, reason);
        Self {
            validator_name,
            started_at,
            duration_ms: duration_millis(duration),
            exit_code: if exit_code == 0 { EXIT_CRASHED } else { exit_code },
            status: ValidatorStatus::InfrastructureFailure,
            findings: vec![finding],
            raw_output: bound_output(raw_output.into(), MAX_RAW_OUTPUT_BYTES),
        }
    }

    /// Sentinel entry for a validator that never ran because the run was cancelled.
    pub fn cancelled(validator_name: impl Into<String>) -> Self {
        let validator_name = validator_name.into();
        let finding = Finding::error(
            validator_name.clone(),
            "validator not run: run cancelled",
        );
        Self {
            validator_name,
            started_at: Utc::now(),
            duration_ms: 0,
            exit_code: EXIT_CANCELLED,
            status: ValidatorStatus::Cancelled,
            findings: vec![finding],
            raw_output: String::new(),
        }
    }

    /// Re-establish the exit-code invariant for completed results.
    pub fn normalize(&mut self) {
        if self.status != ValidatorStatus::Completed {
            return;
        }
        self.exit_code = if self.totals().errors > 0 {
            EXIT_FINDINGS
        } else {
            0
        };
    }

    pub fn totals(&self) -> Totals {
        Totals::from_findings(&self.findings)
    }

    pub fn verdict(&self) -> OverallStatus {
        OverallStatus::from_totals(&self.totals())
    }

    pub fn is_infrastructure_failure(&self) -> bool {
        self.status == ValidatorStatus::InfrastructureFailure
    }
}

/// Where the run happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    pub os: String,
    pub user: String,
    pub hostname: String,
}

impl HostInfo {
    pub fn detect() -> Self {
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown".to_string());
        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        Self {
            os: std::env::consts::OS.to_string(),
            user,
            hostname,
        }
    }
}

/// Sealed aggregate of one orchestrator invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    #[serde(rename = "runID")]
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub host_info: HostInfo,
    pub results: Vec<ValidatorResult>,
    pub totals: Totals,
    pub overall_status: OverallStatus,
}

impl RunReport {
    pub fn exit_code(&self, warn_as_failure: bool) -> u8 {
        self.overall_status.exit_code(warn_as_failure)
    }

    pub fn result(&self, validator_name: &str) -> Option<&ValidatorResult> {
        self.results
            .iter()
            .find(|result| result.validator_name == validator_name)
    }
}

/// A report that is still being populated. Slots are indexed by registration order,
/// so completion order never leaks into the sealed report.
#[derive(Debug)]
pub struct PendingReport {
    run_id: Uuid,
    timestamp: DateTime<Utc>,
    names: Vec<String>,
    slots: Vec<Option<ValidatorResult>>,
}

impl PendingReport {
    pub fn new(names: Vec<String>) -> Self {
        let slots = vec![None; names.len()];
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            names,
            slots,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Store the result for the validator registered at `index`.
    pub fn record(&mut self, index: usize, result: ValidatorResult) {
        if let Some(slot) = self.slots.get_mut(index) {
            *slot = Some(result);
        }
    }

    pub fn completed(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Aggregate totals and freeze the report. Validators without a result get the
    /// cancellation sentinel.
    pub fn seal(self, host_info: HostInfo) -> RunReport {
        let results: Vec<_> = self
            .slots
            .into_iter()
            .zip(self.names)
            .map(|(slot, name)| slot.unwrap_or_else(|| ValidatorResult::cancelled(name)))
            .collect();
        let mut totals = Totals::default();
        for result in &results {
            totals.merge(result.totals());
        }
        RunReport {
            run_id: self.run_id,
            timestamp: self.timestamp,
            host_info,
            overall_status: OverallStatus::from_totals(&totals),
            results,
            totals,
        }
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Truncate captured output to `limit` bytes without splitting a UTF-8 character.
pub fn bound_output(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[output truncated]");
    text
}
