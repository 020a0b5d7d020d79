use async_trait::async_trait;
use tracing::instrument;

use super::{Validator, ValidatorError};
use crate::context::RunContext;
use crate::helpers::ValidatorLog;
use crate::model::{Finding, ValidatorResult};
use crate::remediation::{RemediationEngine, Target};

/// Requires an environment key to hold an exact value.
///
/// The finding is only fixable when the engine's store persists; changing the
/// orchestrator's own process environment would not survive the run.
#[derive(Debug, Clone)]
pub struct EnvVarValidator {
    name: String,
    key: String,
    expected: String,
    shared_resources: Vec<String>,
}

impl EnvVarValidator {
    pub fn new(name: impl Into<String>, key: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
            expected: expected.into(),
            shared_resources: Vec::new(),
        }
    }

    pub fn with_shared_resources(mut self, resources: Vec<String>) -> Self {
        self.shared_resources = resources;
        self
    }
}

#[async_trait]
impl Validator for EnvVarValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn shared_resources(&self) -> &[String] {
        &self.shared_resources
    }

    #[instrument(name = "env_var_validator", skip_all, fields(validator = %self.name))]
    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new(&self.name);
        let store = engine.env();
        let message = match store.get(&self.key) {
            Some(value) if value == self.expected => return Ok(log.finish()),
            Some(value) => format!("is `{value}`, expected `{}`", self.expected),
            None => format!("is unset, expected `{}`", self.expected),
        };

        let finding = Finding::warning(self.key.clone(), message)
            .with_fix_suggestion(format!("export {}={}", self.key, self.expected));
        if !store.persists() {
            log.report(finding);
            return Ok(log.finish());
        }
        let finding = finding.fixable();
        let key = self.key.clone();
        let expected = self.expected.clone();
        log.remediate(ctx, engine, finding, vec![Target::Env(self.key.clone())], move || async move {
            if store.get(&key).as_deref() != Some(expected.as_str()) {
                store.set(&key, &expected)?;
            }
            Ok(())
        })
        .await?;

        Ok(log.finish())
    }
}
