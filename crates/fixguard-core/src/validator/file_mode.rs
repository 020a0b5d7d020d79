use std::{io, path::PathBuf};

use async_trait::async_trait;
use tracing::instrument;

use super::{Validator, ValidatorError};
use crate::context::RunContext;
use crate::helpers::ValidatorLog;
use crate::model::{Finding, Severity, ValidatorResult};
use crate::remediation::{file_mode, set_file_mode, RemediationEngine, Target};

const PERMISSION_BITS: u32 = 0o777;

/// Requires a file or directory to carry exact permission bits (e.g. `~/.ssh` at 700).
#[derive(Debug, Clone)]
pub struct FileModeValidator {
    name: String,
    path: PathBuf,
    mode: u32,
    shared_resources: Vec<String>,
}

impl FileModeValidator {
    /// Only the permission bits (`0o777`) of `mode` are checked and set.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, mode: u32) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            mode: mode & PERMISSION_BITS,
            shared_resources: Vec::new(),
        }
    }

    pub fn with_shared_resources(mut self, resources: Vec<String>) -> Self {
        self.shared_resources = resources;
        self
    }
}

#[async_trait]
impl Validator for FileModeValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn shared_resources(&self) -> &[String] {
        &self.shared_resources
    }

    #[instrument(name = "file_mode_validator", skip_all, fields(validator = %self.name))]
    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new(&self.name);
        let path = ctx.resolve(&self.path);
        let component = path.display().to_string();

        let metadata = match std::fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                log.log(Severity::Warning, component, "does not exist");
                return Ok(log.finish());
            }
            Err(err) => {
                return Err(ValidatorError::crashed(format!(
                    "cannot stat {component}: {err}"
                )))
            }
        };

        let current = file_mode(&metadata) & PERMISSION_BITS;
        if current == self.mode {
            if ctx.verbosity() > 0 {
                log.log(Severity::Info, component, format!("mode {current:o} as required"));
            }
            return Ok(log.finish());
        }

        let finding = Finding::error(
            component.clone(),
            format!("mode {current:o} should be {:o}", self.mode),
        )
        .with_fix_suggestion(format!("chmod {:o} {component}", self.mode))
        .fixable();

        let mode = self.mode;
        let target = path.clone();
        log.remediate(ctx, engine, finding, vec![Target::File(path)], move || async move {
            let current = file_mode(&std::fs::metadata(&target)?) & PERMISSION_BITS;
            if current != mode {
                set_file_mode(&target, mode)?;
            }
            Ok(())
        })
        .await?;

        Ok(log.finish())
    }
}
