pub mod command;
pub mod context;
pub mod helpers;
pub mod model;
pub mod orchestrator;
pub mod remediation;
pub mod report;
pub mod validator;

pub use context::{Cancellation, Config, ConfigError, RunContext};
pub use helpers::{is_fix_mode, ValidatorLog};
pub use model::{
    Finding, FindingValidationError, HostInfo, OverallStatus, RunReport, Severity, Totals,
    ValidatorResult, ValidatorStatus, EXIT_FATAL, SCHEMA_VERSION,
};
pub use orchestrator::{Orchestrator, OrchestratorError, Schedule};
pub use remediation::{
    AbandonedFix, EnvFile, EnvStore, MemoryEnv, ProcessEnv, RemediationEngine, RemediationError,
    RollbackFailure, Snapshot, SnapshotError, Target,
};
pub use report::{persist_report, render_report, OutputFormat, ReportError};
pub use validator::{
    registry::{build_validators, CheckKind, RegistryError, ValidatorSpec},
    Validator, ValidatorError,
};
