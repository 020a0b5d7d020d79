use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use super::{Validator, ValidatorError};
use crate::command::{safe_run, CommandError, CommandSpec};
use crate::context::RunContext;
use crate::helpers::ValidatorLog;
use crate::model::{bound_output, Finding, Severity, ValidatorResult, MAX_RAW_OUTPUT_BYTES};
use crate::remediation::RemediationEngine;

/// Largest result document accepted on stdout.
pub const MAX_RESULT_DOCUMENT_BYTES: usize = 16 * 1024 * 1024;

/// Validator implemented by an external executable.
///
/// The run context is exported through environment variables. The process prints a
/// single JSON document `{"findings": [...]}` on stdout and uses its exit status only
/// to report its own health.
#[derive(Debug, Clone)]
pub struct CommandValidator {
    name: String,
    program: String,
    args: Vec<String>,
    shared_resources: Vec<String>,
}

impl CommandValidator {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            shared_resources: Vec::new(),
        }
    }

    pub fn with_shared_resources(mut self, resources: Vec<String>) -> Self {
        self.shared_resources = resources;
        self
    }

    fn parse_output(&self, ctx: &RunContext, stdout: &str) -> Result<Vec<Finding>, ValidatorError> {
        if stdout.len() > MAX_RESULT_DOCUMENT_BYTES {
            return Err(ValidatorError::malformed(format!(
                "result document is {} bytes, more than the {} byte limit",
                stdout.len(),
                MAX_RESULT_DOCUMENT_BYTES
            )));
        }
        let document: PluginDocument = serde_json::from_str(stdout.trim())
            .map_err(|err| ValidatorError::malformed(format!("invalid JSON on stdout: {err}")))?;
        if let Some(name) = document.validator_name.as_deref() {
            if name != self.name {
                return Err(ValidatorError::malformed(format!(
                    "result names validator `{name}`, expected `{}`",
                    self.name
                )));
            }
        }
        for finding in &document.findings {
            finding
                .validate()
                .map_err(|err| ValidatorError::malformed(err.to_string()))?;
            if finding.severity == Severity::Fixed && !ctx.fix_mode() {
                return Err(ValidatorError::malformed(format!(
                    "finding for `{}` reports a fix outside fix mode",
                    finding.component
                )));
            }
        }
        Ok(document.findings)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginDocument {
    #[serde(default)]
    validator_name: Option<String>,
    findings: Vec<Finding>,
}

#[async_trait]
impl Validator for CommandValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn shared_resources(&self) -> &[String] {
        &self.shared_resources
    }

    #[instrument(name = "command_validator", skip_all, fields(validator = %self.name))]
    async fn run(
        &self,
        ctx: &RunContext,
        _engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new(&self.name);
        let spec = CommandSpec::new(&self.program)
            .args(self.args.iter().cloned())
            .envs(ctx.plugin_env());

        let output = match safe_run(&spec, ctx).await {
            Ok(output) => output,
            Err(CommandError::Timeout { .. }) => return Err(ValidatorError::Timeout),
            Err(CommandError::Cancelled { .. }) => return Err(ValidatorError::Cancelled),
            Err(CommandError::NonZeroExit { code, stderr, .. }) => {
                return Err(ValidatorError::Crashed {
                    exit_code: code,
                    detail: if stderr.trim().is_empty() {
                        "exited without output on stderr".to_string()
                    } else {
                        bound_output(stderr.trim().to_string(), MAX_RAW_OUTPUT_BYTES)
                    },
                })
            }
            Err(err) => return Err(ValidatorError::crashed(err.to_string())),
        };

        debug!(bytes = output.stdout.len(), "plugin output received");
        for finding in self.parse_output(ctx, &output.stdout)? {
            log.report(finding);
        }
        // stderr first; the document must not push diagnostics out of the bound.
        if !output.stderr.trim().is_empty() {
            log.append_output(&output.stderr);
        }
        if !output.stdout.trim().is_empty() {
            log.append_output(&bound_output(output.stdout, MAX_RAW_OUTPUT_BYTES));
        }
        Ok(log.finish())
    }
}
