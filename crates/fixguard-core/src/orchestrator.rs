//! Validator scheduling and run aggregation.
//!
//! Failure isolation:
//! - A validator that crashes, panics, times out or returns garbage gets a synthetic
//!   infrastructure-failure result; the run continues.
//! - Validators that never start because the run was cancelled get the cancellation
//!   sentinel.
//! - A failed rollback aborts the run, since the host may be left inconsistent.
//!
//! Results are slotted by registration index, so the sealed report never depends on
//! completion order.

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use thiserror::Error;
use tokio::{
    sync::{watch, Semaphore},
    task::{JoinError, JoinSet},
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::context::RunContext;
use crate::model::{Finding, HostInfo, PendingReport, RunReport, Severity, ValidatorResult};
use crate::remediation::{RemediationEngine, RemediationError, RollbackFailure};
use crate::validator::{Validator, ValidatorError};

/// How validators are scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// One at a time, in registration order.
    Sequential,
    /// Bounded worker pool.
    Parallel { workers: usize },
}

impl Schedule {
    /// Parallel schedule; `0` workers means one per CPU.
    pub fn parallel(workers: usize) -> Self {
        let workers = if workers == 0 { num_cpus::get() } else { workers };
        Self::Parallel {
            workers: workers.max(1),
        }
    }
}

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Pending,
    Running,
    Aggregating,
    Sealed,
}

/// Lifecycle of one validator within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidatorPhase {
    Scheduled,
    Executing,
    Completed,
    Failed,
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("no validators registered")]
    NoValidators,
    #[error("run cancelled before any validator started")]
    CancelledBeforeStart,
    #[error("validator `{validator}` left the system inconsistent: {failure}")]
    RollbackFailed {
        validator: String,
        #[source]
        failure: RollbackFailure,
    },
}

/// Drives every registered validator and seals the run report.
pub struct Orchestrator {
    validators: Vec<Arc<dyn Validator>>,
    schedule: Schedule,
    engine: RemediationEngine,
}

impl Orchestrator {
    pub fn new(validators: Vec<Arc<dyn Validator>>, schedule: Schedule) -> Self {
        Self {
            validators,
            schedule,
            engine: RemediationEngine::default(),
        }
    }

    pub fn with_engine(mut self, engine: RemediationEngine) -> Self {
        self.engine = engine;
        self
    }

    pub fn validators(&self) -> &[Arc<dyn Validator>] {
        &self.validators
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    /// Execute the run to completion (or cancellation) and return the sealed report.
    #[instrument(name = "orchestrator_run", skip_all, fields(validators = self.validators.len(), schedule = ?self.schedule))]
    pub async fn run(&self, ctx: &RunContext) -> Result<RunReport, OrchestratorError> {
        debug!(phase = ?RunPhase::Pending, "preparing run");
        if self.validators.is_empty() {
            return Err(OrchestratorError::NoValidators);
        }
        if ctx.cancellation().is_cancelled() {
            return Err(OrchestratorError::CancelledBeforeStart);
        }

        let names = self
            .validators
            .iter()
            .map(|validator| validator.name().to_string())
            .collect();
        let mut pending = PendingReport::new(names);
        info!(phase = ?RunPhase::Running, run_id = %pending.run_id(), fix_mode = ctx.fix_mode(), "run started");

        let outcome = match self.schedule {
            Schedule::Sequential => self.run_sequential(ctx, &mut pending).await,
            Schedule::Parallel { workers } => self.run_parallel(workers, ctx, &mut pending).await,
        };
        if let Err(err) = outcome {
            ctx.cancellation().cancel();
            return Err(err);
        }

        debug!(phase = ?RunPhase::Aggregating, completed = pending.completed(), "aggregating results");
        let report = pending.seal(HostInfo::detect());
        info!(
            phase = ?RunPhase::Sealed,
            status = ?report.overall_status,
            errors = report.totals.errors,
            warnings = report.totals.warnings,
            fixed = report.totals.fixed,
            "run sealed"
        );
        Ok(report)
    }

    async fn run_sequential(
        &self,
        ctx: &RunContext,
        pending: &mut PendingReport,
    ) -> Result<(), OrchestratorError> {
        for (index, validator) in self.validators.iter().enumerate() {
            if ctx.cancellation().is_cancelled() {
                warn!("run cancelled; skipping remaining validators");
                break;
            }
            let result = execute(Arc::clone(validator), ctx.clone(), self.engine.clone()).await?;
            pending.record(index, result);
        }
        Ok(())
    }

    async fn run_parallel(
        &self,
        workers: usize,
        ctx: &RunContext,
        pending: &mut PendingReport,
    ) -> Result<(), OrchestratorError> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut gates = ResourceGates::new(&self.validators);
        let mut tasks = JoinSet::new();

        for (index, validator) in self.validators.iter().enumerate() {
            let validator = Arc::clone(validator);
            let ctx = ctx.clone();
            let engine = self.engine.clone();
            let semaphore = Arc::clone(&semaphore);
            let (waits, done) = gates.take(index);
            tasks.spawn(async move {
                let _done = done;
                for predecessor in waits {
                    wait_until_done(predecessor).await;
                }
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (index, Ok(None));
                };
                if ctx.cancellation().is_cancelled() {
                    return (index, Ok(None));
                }
                (index, execute(validator, ctx, engine).await.map(Some))
            });
        }

        // After a fatal error the remaining workers are cancelled, then drained so
        // their in-flight fixes settle before the run returns.
        let mut fatal = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, Ok(Some(result)))) => pending.record(index, result),
                Ok((_, Ok(None))) => {}
                Ok((_, Err(err))) => {
                    ctx.cancellation().cancel();
                    fatal.get_or_insert(err);
                }
                Err(err) => warn!(error = %err, "validator task aborted"),
            }
        }
        match fatal {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Run one validator under the hard deadline, converting every failure except a
/// failed rollback into a result.
///
/// Fixes the validator started are awaited before the result is returned, even
/// when the validator itself was cut off.
async fn execute(
    validator: Arc<dyn Validator>,
    ctx: RunContext,
    engine: RemediationEngine,
) -> Result<ValidatorResult, OrchestratorError> {
    let name = validator.name().to_string();
    let started_at = Utc::now();
    let clock = Instant::now();
    debug!(validator = %name, phase = ?ValidatorPhase::Executing, "validator started");

    let deadline = ctx.timeout();
    let task_ctx = ctx.clone();
    let engine = engine.scoped();
    let task_engine = engine.clone();
    let mut task = tokio::spawn(async move {
        match tokio::time::timeout(deadline, validator.run(&task_ctx, &task_engine)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(ValidatorError::Timeout),
        }
    });

    let outcome = tokio::select! {
        joined = &mut task => joined_outcome(joined),
        _ = ctx.cancellation().cancelled() => {
            task.abort();
            // An abort only lands at the next await point; no fix may start after settling.
            let _ = (&mut task).await;
            Err(ValidatorError::Cancelled)
        }
    };
    let elapsed = clock.elapsed();
    let abandoned = engine.settle().await;

    let mut result = match outcome {
        Ok(mut result) => {
            result.validator_name = name.clone();
            debug!(validator = %name, phase = ?ValidatorPhase::Completed, exit_code = result.exit_code, "validator finished");
            result
        }
        Err(ValidatorError::Cancelled) => {
            warn!(validator = %name, "validator cancelled");
            ValidatorResult::cancelled(name.clone())
        }
        Err(ValidatorError::RollbackFailed(failure)) => {
            warn!(validator = %name, phase = ?ValidatorPhase::Failed, "rollback failed");
            return Err(OrchestratorError::RollbackFailed {
                validator: name,
                failure,
            });
        }
        Err(err) => {
            warn!(validator = %name, phase = ?ValidatorPhase::Failed, error = %err, "validator infrastructure failure");
            let raw_output = match &err {
                ValidatorError::Crashed { detail, .. } => detail.clone(),
                _ => String::new(),
            };
            ValidatorResult::infrastructure_failure(
                name.clone(),
                started_at,
                elapsed,
                err.exit_code(),
                &err.to_string(),
                raw_output,
            )
        }
    };

    for fix in abandoned {
        let component = fix.targets.join(", ");
        match fix.outcome {
            Ok(()) => result.findings.push(Finding::new(
                Severity::Fixed,
                component,
                format!("fix completed after the validator stopped (snapshot {})", fix.snapshot_id),
            )),
            Err(RemediationError::MutationFailed { source, .. }) => {
                result.findings.push(Finding::new(
                    Severity::Info,
                    component,
                    format!("fix failed after the validator stopped and was rolled back: {source:#}"),
                ))
            }
            Err(RemediationError::RollbackFailed(failure)) => {
                warn!(validator = %name, phase = ?ValidatorPhase::Failed, "rollback failed after validator stopped");
                return Err(OrchestratorError::RollbackFailed {
                    validator: name,
                    failure,
                });
            }
        }
    }
    result.normalize();
    Ok(result)
}

fn joined_outcome(
    joined: Result<Result<ValidatorResult, ValidatorError>, JoinError>,
) -> Result<ValidatorResult, ValidatorError> {
    match joined {
        Ok(outcome) => outcome,
        Err(err) if err.is_panic() => Err(ValidatorError::crashed("validator panicked")),
        Err(err) => Err(ValidatorError::crashed(err.to_string())),
    }
}

/// Completion signals that serialize validators sharing a resource tag in
/// registration order.
struct ResourceGates {
    waits: Vec<Vec<watch::Receiver<bool>>>,
    done: Vec<Option<DoneSignal>>,
}

impl ResourceGates {
    fn new(validators: &[Arc<dyn Validator>]) -> Self {
        let mut senders = Vec::with_capacity(validators.len());
        let mut receivers = Vec::with_capacity(validators.len());
        for _ in validators {
            let (sender, receiver) = watch::channel(false);
            senders.push(Some(DoneSignal(sender)));
            receivers.push(receiver);
        }

        let mut last_holder: HashMap<&str, usize> = HashMap::new();
        let mut waits = Vec::with_capacity(validators.len());
        for (index, validator) in validators.iter().enumerate() {
            let mut predecessors: Vec<usize> = Vec::new();
            for tag in validator.shared_resources() {
                if let Some(previous) = last_holder.insert(tag.as_str(), index) {
                    if !predecessors.contains(&previous) {
                        predecessors.push(previous);
                    }
                }
            }
            waits.push(
                predecessors
                    .into_iter()
                    .map(|previous| receivers[previous].clone())
                    .collect(),
            );
        }

        Self {
            waits,
            done: senders,
        }
    }

    fn take(&mut self, index: usize) -> (Vec<watch::Receiver<bool>>, Option<DoneSignal>) {
        (
            std::mem::take(&mut self.waits[index]),
            self.done[index].take(),
        )
    }
}

/// Signals completion when dropped, however the task ends.
struct DoneSignal(watch::Sender<bool>);

impl Drop for DoneSignal {
    fn drop(&mut self) {
        self.0.send_replace(true);
    }
}

async fn wait_until_done(mut receiver: watch::Receiver<bool>) {
    while !*receiver.borrow_and_update() {
        if receiver.changed().await.is_err() {
            return;
        }
    }
}
