use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Instant,
};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::context::RunContext;
use crate::model::{Finding, Severity, Totals, ValidatorResult};
use crate::remediation::{RemediationEngine, RemediationError, Target};
use crate::validator::ValidatorError;

/// Whether validators may attempt automated remediation in this run.
pub fn is_fix_mode(ctx: &RunContext) -> bool {
    ctx.fix_mode()
}

/// Findings and counters owned by a single validator invocation.
///
/// Safe to share between the validator's own tasks; merged into a
/// [`ValidatorResult`] only by [`ValidatorLog::finish`].
#[derive(Debug)]
pub struct ValidatorLog {
    validator: String,
    started_at: DateTime<Utc>,
    clock: Instant,
    errors: AtomicUsize,
    warnings: AtomicUsize,
    infos: AtomicUsize,
    fixed: AtomicUsize,
    findings: Mutex<Vec<Finding>>,
    output: Mutex<String>,
}

impl ValidatorLog {
    pub fn new(validator: impl Into<String>) -> Self {
        Self {
            validator: validator.into(),
            started_at: Utc::now(),
            clock: Instant::now(),
            errors: AtomicUsize::new(0),
            warnings: AtomicUsize::new(0),
            infos: AtomicUsize::new(0),
            fixed: AtomicUsize::new(0),
            findings: Mutex::new(Vec::new()),
            output: Mutex::new(String::new()),
        }
    }

    pub fn validator(&self) -> &str {
        &self.validator
    }

    /// Record a finding at `severity`.
    pub fn log(&self, severity: Severity, component: impl Into<String>, message: impl Into<String>) {
        self.report(Finding::new(severity, component, message));
    }

    pub fn report(&self, finding: Finding) {
        let counter = match finding.severity {
            Severity::Error => &self.errors,
            Severity::Warning => &self.warnings,
            Severity::Info => &self.infos,
            Severity::Fixed => &self.fixed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let validator = self.validator.as_str();
        match finding.severity {
            Severity::Error => error!(validator, component = %finding.component, "{}", finding.message),
            Severity::Warning => warn!(validator, component = %finding.component, "{}", finding.message),
            Severity::Info => debug!(validator, component = %finding.component, "{}", finding.message),
            Severity::Fixed => info!(validator, component = %finding.component, "fixed: {}", finding.message),
        }
        self.findings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(finding);
    }

    /// Append captured tool output to the result's raw output.
    pub fn append_output(&self, text: &str) {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.push_str(text);
        if !text.ends_with('\n') {
            output.push('\n');
        }
    }

    pub fn counts(&self) -> Totals {
        Totals {
            errors: self.errors.load(Ordering::Relaxed),
            warnings: self.warnings.load(Ordering::Relaxed),
            fixed: self.fixed.load(Ordering::Relaxed),
        }
    }

    pub fn info_count(&self) -> usize {
        self.infos.load(Ordering::Relaxed)
    }

    /// Report `finding`, remediating it first when fix mode allows.
    ///
    /// The mutation must check whether the target is already in the desired state
    /// before changing anything. Snapshot and mutation failures surface as errors;
    /// only a failed rollback escapes as `Err`.
    pub async fn remediate<F, Fut>(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
        finding: Finding,
        targets: Vec<Target>,
        mutation: F,
    ) -> Result<(), ValidatorError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if !is_fix_mode(ctx) || !finding.is_remediable() {
            self.report(finding);
            return Ok(());
        }
        if ctx.cancellation().is_cancelled() {
            debug!(validator = %self.validator, "run cancelled; leaving finding unfixed");
            self.report(finding);
            return Ok(());
        }

        let snapshot = match engine.create_snapshot(&targets).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                self.report(Finding {
                    severity: Severity::Error,
                    message: format!("{} (fix not attempted: {err})", finding.message),
                    ..finding
                });
                return Ok(());
            }
        };

        match engine.apply_fix(snapshot, mutation).await {
            Ok(()) => {
                self.report(finding.into_fixed());
                Ok(())
            }
            Err(err @ RemediationError::MutationFailed { .. }) => {
                self.report(Finding {
                    severity: Severity::Error,
                    message: format!("{} ({err})", finding.message),
                    ..finding
                });
                Ok(())
            }
            Err(RemediationError::RollbackFailed(failure)) => {
                self.report(Finding {
                    severity: Severity::Error,
                    message: format!("{} ({failure})", finding.message),
                    ..finding
                });
                Err(ValidatorError::RollbackFailed(failure))
            }
        }
    }

    /// Seal the log into the validator's result.
    pub fn finish(self) -> ValidatorResult {
        let findings = self
            .findings
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        let output = self
            .output
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        ValidatorResult::from_findings(
            self.validator,
            self.started_at,
            self.clock.elapsed(),
            findings,
            output,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::MemoryEnv;
    use std::sync::Arc;

    fn engine() -> RemediationEngine {
        RemediationEngine::new(Arc::new(MemoryEnv::with_vars([("PATH", "/usr/bin:/opt/bin")])))
    }

    fn path_finding() -> Finding {
        Finding::warning("PATH", "/opt/bin should precede /usr/bin")
            .with_fix_suggestion("export PATH=/opt/bin:/usr/bin")
            .fixable()
    }

    #[test]
    fn counters_track_each_severity() {
        let log = ValidatorLog::new("env");
        log.log(Severity::Error, "HOME", "unset");
        log.log(Severity::Warning, "EDITOR", "unset");
        log.log(Severity::Warning, "PAGER", "unset");
        log.log(Severity::Info, "SHELL", "zsh");
        assert_eq!(
            log.counts(),
            Totals {
                errors: 1,
                warnings: 2,
                fixed: 0
            }
        );
        assert_eq!(log.info_count(), 1);

        let result = log.finish();
        assert_eq!(result.findings.len(), 4);
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn concurrent_logging_is_race_free() {
        let log = Arc::new(ValidatorLog::new("pkg"));
        let handles: Vec<_> = (0..8)
            .map(|worker| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for idx in 0..50 {
                        log.log(Severity::Warning, format!("pkg-{worker}-{idx}"), "duplicate");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(log.counts().warnings, 400);
        let log = Arc::try_unwrap(log).unwrap();
        assert_eq!(log.finish().findings.len(), 400);
    }

    #[tokio::test]
    async fn report_only_mode_leaves_state_alone() {
        let engine = engine();
        let log = ValidatorLog::new("env");
        let ctx = RunContext::new("/");
        let store = engine.env();
        log.remediate(&ctx, &engine, path_finding(), vec![Target::env("PATH")], move || async move {
            store.set("PATH", "/opt/bin:/usr/bin")?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(log.counts().warnings, 1);
        assert_eq!(engine.env().get("PATH").as_deref(), Some("/usr/bin:/opt/bin"));
    }

    #[tokio::test]
    async fn fix_mode_records_fixed_finding() {
        let engine = engine();
        let log = ValidatorLog::new("env");
        let ctx = RunContext::new("/").with_fix_mode(true);
        let store = engine.env();
        log.remediate(&ctx, &engine, path_finding(), vec![Target::env("PATH")], move || async move {
            store.set("PATH", "/opt/bin:/usr/bin")?;
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(log.counts().fixed, 1);
        assert_eq!(log.counts().warnings, 0);
        assert_eq!(engine.env().get("PATH").as_deref(), Some("/opt/bin:/usr/bin"));
    }

    #[tokio::test]
    async fn failed_fix_is_reported_as_error_not_fixed() {
        let engine = engine();
        let log = ValidatorLog::new("env");
        let ctx = RunContext::new("/").with_fix_mode(true);
        let store = engine.env();
        log.remediate(&ctx, &engine, path_finding(), vec![Target::env("PATH")], move || async move {
            store.set("PATH", "garbage")?;
            anyhow::bail!("shell profile is read-only")
        })
        .await
        .unwrap();

        let result = log.finish();
        assert_eq!(result.totals().fixed, 0);
        assert_eq!(result.totals().errors, 1);
        assert!(result.findings[0].message.contains("rolled back"));
        assert_eq!(engine.env().get("PATH").as_deref(), Some("/usr/bin:/opt/bin"));
    }

    #[tokio::test]
    async fn snapshot_failure_keeps_finding_as_error() {
        let engine = engine();
        let log = ValidatorLog::new("sec");
        let ctx = RunContext::new("/").with_fix_mode(true);
        log.remediate(
            &ctx,
            &engine,
            Finding::warning("ssh", "bad perms").fixable(),
            Vec::new(),
            || async { Ok(()) },
        )
        .await
        .unwrap();
        let result = log.finish();
        assert_eq!(result.findings[0].severity, Severity::Error);
        assert!(result.findings[0].message.contains("fix not attempted"));
    }

    #[test]
    fn fix_mode_query_reads_context() {
        assert!(!is_fix_mode(&RunContext::new("/")));
        assert!(is_fix_mode(&RunContext::new("/").with_fix_mode(true)));
    }
}
