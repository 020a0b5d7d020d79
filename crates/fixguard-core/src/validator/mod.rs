use async_trait::async_trait;
use thiserror::Error;

use crate::context::RunContext;
use crate::model::{ValidatorResult, EXIT_CRASHED, EXIT_MALFORMED, EXIT_TIMEOUT};
use crate::remediation::{RemediationEngine, RollbackFailure};

pub mod env_var;
pub mod file_mode;
pub mod process;
pub mod registry;

/// Calling convention shared by every validator.
///
/// Implementations must be idempotent: two runs with no intervening state change
/// report the same findings. All state changes go through the remediation engine.
#[async_trait]
pub trait Validator: Send + Sync {
    /// Unique name used in reports.
    fn name(&self) -> &str;

    /// Resource tags this validator may mutate. Validators sharing a tag never run
    /// concurrently.
    fn shared_resources(&self) -> &[String] {
        &[]
    }

    /// Check the environment (and fix it when the context allows).
    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError>;
}

/// Infrastructure failures crossing the validator boundary.
#[derive(Debug, Error)]
pub enum ValidatorError {
    #[error("timeout")]
    Timeout,

    #[error("malformed result: {reason}")]
    MalformedResult { reason: String },

    #[error("crashed: {detail}")]
    Crashed {
        exit_code: Option<i32>,
        detail: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    RollbackFailed(#[from] RollbackFailure),
}

impl ValidatorError {
    pub fn crashed(detail: impl Into<String>) -> Self {
        Self::Crashed {
            exit_code: None,
            detail: detail.into(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedResult {
            reason: reason.into(),
        }
    }

    /// Exit code recorded on the synthetic result for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Timeout => EXIT_TIMEOUT,
            Self::MalformedResult { .. } => EXIT_MALFORMED,
            Self::Crashed {
                exit_code: Some(code),
                ..
            } if *code != 0 => *code,
            Self::Crashed { .. } | Self::Cancelled | Self::RollbackFailed(_) => EXIT_CRASHED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_reasons_feed_synthetic_findings() {
        assert_eq!(ValidatorError::Timeout.to_string(), "timeout");
        assert_eq!(
            ValidatorError::malformed("expected JSON").to_string(),
            "malformed result: expected JSON"
        );
        assert_eq!(
            ValidatorError::crashed("segfault").to_string(),
            "crashed: segfault"
        );
    }

    #[test]
    fn exit_codes_are_never_zero() {
        assert_eq!(ValidatorError::Timeout.exit_code(), EXIT_TIMEOUT);
        assert_eq!(ValidatorError::malformed("x").exit_code(), EXIT_MALFORMED);
        assert_eq!(
            ValidatorError::Crashed {
                exit_code: Some(9),
                detail: String::new()
            }
            .exit_code(),
            9
        );
        assert_eq!(
            ValidatorError::Crashed {
                exit_code: Some(0),
                detail: String::new()
            }
            .exit_code(),
            EXIT_CRASHED
        );
    }
}
