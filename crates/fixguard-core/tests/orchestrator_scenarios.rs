use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use fixguard_core::{
    validator::{env_var::EnvVarValidator, file_mode::FileModeValidator},
    Finding, MemoryEnv, Orchestrator, OrchestratorError, OverallStatus, RemediationEngine,
    RunContext, Schedule, Target, Validator, ValidatorError, ValidatorLog, ValidatorResult,
    ValidatorStatus,
};

/// Flags packages listed more than once in a manifest and rewrites it deduplicated.
struct PackageValidator {
    manifest: PathBuf,
}

#[async_trait]
impl Validator for PackageValidator {
    fn name(&self) -> &str {
        "pkg"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new("pkg");
        let contents = std::fs::read_to_string(&self.manifest)
            .map_err(|err| ValidatorError::crashed(err.to_string()))?;
        let packages: Vec<&str> = contents.lines().collect();
        let mut seen = Vec::new();
        let mut duplicates = Vec::new();
        for package in &packages {
            if seen.contains(package) {
                duplicates.push(package.to_string());
            } else {
                seen.push(*package);
            }
        }
        if duplicates.is_empty() {
            return Ok(log.finish());
        }

        let deduplicated = seen.join("\n");
        let manifest = self.manifest.clone();
        let finding = Finding::error(duplicates.join(","), "installed more than once")
            .with_fix_suggestion("remove the duplicate install")
            .fixable();
        log.remediate(
            ctx,
            engine,
            finding,
            vec![Target::file(&self.manifest)],
            move || async move {
                std::fs::write(&manifest, deduplicated)?;
                Ok(())
            },
        )
        .await?;
        Ok(log.finish())
    }
}

struct Sleeper {
    name: &'static str,
    delay: Duration,
    findings: Vec<Finding>,
}

#[async_trait]
impl Validator for Sleeper {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(
        &self,
        _ctx: &RunContext,
        _engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        tokio::time::sleep(self.delay).await;
        Ok(ValidatorResult::from_findings(
            self.name,
            Utc::now(),
            self.delay,
            self.findings.clone(),
            "",
        ))
    }
}

fn sleeper(name: &'static str, millis: u64, findings: Vec<Finding>) -> Arc<dyn Validator> {
    Arc::new(Sleeper {
        name,
        delay: Duration::from_millis(millis),
        findings,
    })
}

struct Workstation {
    _temp: tempfile::TempDir,
    manifest: PathBuf,
    ssh_dir: PathBuf,
    engine: RemediationEngine,
}

fn workstation() -> Workstation {
    let temp = tempfile::tempdir().unwrap();
    let manifest = temp.path().join("packages.txt");
    std::fs::write(&manifest, "jq\nripgrep\njq").unwrap();
    let ssh_dir = temp.path().join(".ssh");
    std::fs::create_dir(&ssh_dir).unwrap();
    set_mode(&ssh_dir, 0o755);
    let engine = RemediationEngine::new(Arc::new(MemoryEnv::with_vars([(
        "PATH",
        "/usr/bin:/opt/homebrew/bin",
    )])));
    Workstation {
        _temp: temp,
        manifest,
        ssh_dir,
        engine,
    }
}

fn workstation_validators(station: &Workstation) -> Vec<Arc<dyn Validator>> {
    vec![
        Arc::new(PackageValidator {
            manifest: station.manifest.clone(),
        }),
        Arc::new(EnvVarValidator::new(
            "env",
            "PATH",
            "/opt/homebrew/bin:/usr/bin",
        )),
        Arc::new(FileModeValidator::new("sec", &station.ssh_dir, 0o700)),
    ]
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).unwrap();
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) {}

#[cfg(unix)]
#[tokio::test]
async fn report_only_run_leaves_workstation_untouched() {
    let station = workstation();
    let orchestrator = Orchestrator::new(workstation_validators(&station), Schedule::Sequential)
        .with_engine(station.engine.clone());

    let report = orchestrator.run(&RunContext::new("/")).await.unwrap();
    assert_eq!(report.totals.errors, 2);
    assert_eq!(report.totals.warnings, 1);
    assert_eq!(report.totals.fixed, 0);
    assert_eq!(report.overall_status, OverallStatus::Fail);
    assert_eq!(report.exit_code(false), 2);
    assert_eq!(
        std::fs::read_to_string(&station.manifest).unwrap(),
        "jq\nripgrep\njq"
    );
}

#[cfg(unix)]
#[tokio::test]
async fn fix_run_resolves_every_finding_and_is_idempotent() {
    let station = workstation();
    let orchestrator = Orchestrator::new(workstation_validators(&station), Schedule::Sequential)
        .with_engine(station.engine.clone());
    let ctx = RunContext::new("/").with_fix_mode(true);

    let report = orchestrator.run(&ctx).await.unwrap();
    let names: Vec<_> = report
        .results
        .iter()
        .map(|result| result.validator_name.as_str())
        .collect();
    assert_eq!(names, vec!["pkg", "env", "sec"]);
    assert_eq!(report.totals.errors, 0);
    assert_eq!(report.totals.warnings, 0);
    assert_eq!(report.totals.fixed, 3);
    assert_eq!(report.overall_status, OverallStatus::Pass);
    assert_eq!(report.exit_code(false), 0);
    assert_eq!(
        std::fs::read_to_string(&station.manifest).unwrap(),
        "jq\nripgrep"
    );

    let second = orchestrator.run(&ctx).await.unwrap();
    assert!(second.results.iter().all(|result| result.findings.is_empty()));
    assert_eq!(second.totals.fixed, 0);
    assert_eq!(second.overall_status, OverallStatus::Pass);
}

#[cfg(unix)]
#[tokio::test]
async fn crashing_plugin_does_not_affect_neighbours() {
    use fixguard_core::validator::process::CommandValidator;

    let validators: Vec<Arc<dyn Validator>> = vec![
        sleeper("before", 1, vec![Finding::warning("brew", "outdated")]),
        Arc::new(CommandValidator::new(
            "broken",
            "sh",
            vec!["-c".into(), "echo 'segfault' >&2; exit 139".into()],
        )),
        sleeper("after", 1, Vec::new()),
    ];
    let report = Orchestrator::new(validators, Schedule::Sequential)
        .run(&RunContext::new("/").with_timeout(Duration::from_secs(10)))
        .await
        .unwrap();

    let broken = report.result("broken").unwrap();
    assert_eq!(broken.status, ValidatorStatus::InfrastructureFailure);
    assert_eq!(broken.exit_code, 139);
    assert_eq!(
        broken.findings[0].message,
        "validator infrastructure failure: crashed: segfault"
    );
    assert_eq!(report.result("before").unwrap().findings.len(), 1);
    assert_eq!(report.result("after").unwrap().status, ValidatorStatus::Completed);
    assert_eq!(report.totals.errors, 1);
    assert_eq!(report.totals.warnings, 1);
}

#[tokio::test(start_paused = true)]
async fn slow_validator_is_cut_off_at_the_deadline() {
    let validators = vec![
        sleeper("slow", 5_000, Vec::new()),
        sleeper("quick", 10, Vec::new()),
    ];
    let ctx = RunContext::new("/").with_timeout(Duration::from_secs(2));
    let report = Orchestrator::new(validators, Schedule::Sequential)
        .run(&ctx)
        .await
        .unwrap();

    let slow = &report.results[0];
    assert_eq!(slow.status, ValidatorStatus::InfrastructureFailure);
    assert_eq!(slow.exit_code, 124);
    assert_eq!(
        slow.findings[0].message,
        "validator infrastructure failure: timeout"
    );
    assert!(slow.duration_ms >= 2_000 && slow.duration_ms < 5_000);
    assert_eq!(report.results[1].status, ValidatorStatus::Completed);
    assert_eq!(report.overall_status, OverallStatus::Fail);
    assert_eq!(report.exit_code(false), 2);
}

#[tokio::test(start_paused = true)]
async fn parallel_and_sequential_runs_agree() {
    let build = || {
        vec![
            sleeper("c-slow", 300, vec![Finding::error("disk", "almost full")]),
            sleeper("b-medium", 200, vec![Finding::warning("git", "unsigned commits")]),
            sleeper("a-fast", 100, vec![Finding::info("shell", "zsh")]),
            sleeper("d-instant", 0, Vec::new()),
        ]
    };
    let ctx = RunContext::new("/");
    let sequential = Orchestrator::new(build(), Schedule::Sequential)
        .run(&ctx)
        .await
        .unwrap();
    let parallel = Orchestrator::new(build(), Schedule::parallel(4))
        .run(&ctx)
        .await
        .unwrap();

    let shape = |report: &fixguard_core::RunReport| {
        report
            .results
            .iter()
            .map(|result| (result.validator_name.clone(), result.findings.clone()))
            .collect::<Vec<_>>()
    };
    assert_eq!(shape(&sequential), shape(&parallel));
    assert_eq!(sequential.totals, parallel.totals);
    assert_eq!(sequential.overall_status, parallel.overall_status);
}

/// Cancels the run as soon as it starts, then waits for the orchestrator to stop it.
struct Interrupt;

#[async_trait]
impl Validator for Interrupt {
    fn name(&self) -> &str {
        "interrupt"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        _engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        ctx.cancellation().cancel();
        std::future::pending::<()>().await;
        Err(ValidatorError::Cancelled)
    }
}

#[tokio::test(start_paused = true)]
async fn cancellation_marks_unfinished_validators() {
    let validators: Vec<Arc<dyn Validator>> = vec![
        sleeper("done", 10, Vec::new()),
        Arc::new(Interrupt),
        sleeper("never", 10, Vec::new()),
    ];
    let report = Orchestrator::new(validators, Schedule::Sequential)
        .run(&RunContext::new("/"))
        .await
        .unwrap();

    assert_eq!(report.results.len(), 3);
    assert_eq!(report.results[0].status, ValidatorStatus::Completed);
    assert_eq!(report.results[1].status, ValidatorStatus::Cancelled);
    assert_eq!(report.results[2].status, ValidatorStatus::Cancelled);
    assert_eq!(
        report.results[2].findings[0].message,
        "validator not run: run cancelled"
    );
    assert_eq!(report.overall_status, OverallStatus::Fail);
}

#[tokio::test(start_paused = true)]
async fn cancellation_reaches_parallel_workers() {
    let validators: Vec<Arc<dyn Validator>> = vec![
        Arc::new(Interrupt),
        sleeper("long", 60_000, Vec::new()),
        sleeper("queued", 10, Vec::new()),
    ];
    let report = Orchestrator::new(validators, Schedule::parallel(2))
        .run(&RunContext::new("/"))
        .await
        .unwrap();

    assert!(report
        .results
        .iter()
        .all(|result| result.status == ValidatorStatus::Cancelled));
    assert_eq!(report.results[1].validator_name, "long");
}

#[tokio::test]
async fn run_without_validators_is_refused() {
    let err = Orchestrator::new(Vec::new(), Schedule::parallel(2))
        .run(&RunContext::new("/"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NoValidators));
}

/// Breaks its own target so thoroughly that the snapshot cannot be restored.
#[cfg(unix)]
struct Vandal {
    dir: PathBuf,
}

#[cfg(unix)]
#[async_trait]
impl Validator for Vandal {
    fn name(&self) -> &str {
        "vandal"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new("vandal");
        let config = self.dir.join("config");
        let dir = self.dir.clone();
        log.remediate(
            ctx,
            engine,
            Finding::error("ssh config", "weak ciphers").fixable(),
            vec![Target::file(config)],
            move || async move {
                std::fs::remove_dir_all(&dir)?;
                std::fs::write(&dir, "not a directory")?;
                anyhow::bail!("rewrite failed")
            },
        )
        .await?;
        Ok(log.finish())
    }
}

#[cfg(unix)]
#[tokio::test]
async fn failed_rollback_aborts_the_run() {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("ssh");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("config"), "Ciphers 3des").unwrap();

    let validators: Vec<Arc<dyn Validator>> = vec![
        Arc::new(Vandal { dir }),
        sleeper("never", 1, Vec::new()),
    ];
    let ctx = RunContext::new("/").with_fix_mode(true);
    let err = Orchestrator::new(validators, Schedule::Sequential)
        .run(&ctx)
        .await
        .unwrap_err();

    match err {
        OrchestratorError::RollbackFailed { validator, .. } => assert_eq!(validator, "vandal"),
        other => panic!("expected rollback failure, got {other:?}"),
    }
    assert!(ctx.cancellation().is_cancelled());
}

/// Starts a fix that outlasts the validator deadline. With `sabotage`, the fix
/// also makes its own rollback impossible.
struct SlowFixer {
    dir: PathBuf,
    sabotage: bool,
}

#[async_trait]
impl Validator for SlowFixer {
    fn name(&self) -> &str {
        "motd"
    }

    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        let log = ValidatorLog::new("motd");
        let path = self.dir.join("motd");
        let dir = self.dir.clone();
        let sabotage = self.sabotage;
        log.remediate(
            ctx,
            engine,
            Finding::warning("motd", "banner is stale").fixable(),
            vec![Target::file(&path)],
            move || async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                if sabotage {
                    std::fs::remove_dir_all(&dir)?;
                    std::fs::write(&dir, "not a directory")?;
                    anyhow::bail!("banner rewrite failed");
                }
                std::fs::write(&path, "MUTATED")?;
                Ok(())
            },
        )
        .await?;
        Ok(log.finish())
    }
}

fn motd_dir() -> (tempfile::TempDir, PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let dir = temp.path().join("etc");
    std::fs::create_dir(&dir).unwrap();
    std::fs::write(dir.join("motd"), "orig").unwrap();
    (temp, dir)
}

#[tokio::test]
async fn fix_outlasting_the_deadline_lands_before_the_report() {
    let (_temp, dir) = motd_dir();
    let validators: Vec<Arc<dyn Validator>> = vec![Arc::new(SlowFixer {
        dir: dir.clone(),
        sabotage: false,
    })];
    let ctx = RunContext::new("/")
        .with_fix_mode(true)
        .with_timeout(Duration::from_millis(50));
    let report = Orchestrator::new(validators, Schedule::Sequential)
        .run(&ctx)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(dir.join("motd")).unwrap(), "MUTATED");
    let result = &report.results[0];
    assert_eq!(result.status, ValidatorStatus::InfrastructureFailure);
    assert_eq!(result.exit_code, 124);
    assert_eq!(result.totals().fixed, 1);
    assert!(result.findings[1]
        .message
        .contains("fix completed after the validator stopped"));
    assert_eq!(report.totals.fixed, 1);
}

#[cfg(unix)]
#[tokio::test]
async fn rollback_failure_after_the_deadline_aborts_the_run() {
    let (_temp, dir) = motd_dir();
    let validators: Vec<Arc<dyn Validator>> = vec![Arc::new(SlowFixer {
        dir,
        sabotage: true,
    })];
    let ctx = RunContext::new("/")
        .with_fix_mode(true)
        .with_timeout(Duration::from_millis(50));
    let err = Orchestrator::new(validators, Schedule::parallel(2))
        .run(&ctx)
        .await
        .unwrap_err();

    match err {
        OrchestratorError::RollbackFailed { validator, .. } => assert_eq!(validator, "motd"),
        other => panic!("expected rollback failure, got {other:?}"),
    }
}

#[tokio::test]
async fn cancelled_validator_still_settles_its_fix() {
    let (_temp, dir) = motd_dir();
    let validators: Vec<Arc<dyn Validator>> = vec![Arc::new(SlowFixer {
        dir: dir.clone(),
        sabotage: false,
    })];
    let ctx = RunContext::new("/")
        .with_fix_mode(true)
        .with_timeout(Duration::from_secs(10));
    let cancellation = ctx.cancellation().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();
    });
    let report = Orchestrator::new(validators, Schedule::Sequential)
        .run(&ctx)
        .await
        .unwrap();

    assert_eq!(std::fs::read_to_string(dir.join("motd")).unwrap(), "MUTATED");
    assert_eq!(report.results[0].status, ValidatorStatus::Cancelled);
    assert_eq!(report.results[0].totals().fixed, 1);
}

struct Delayed<V> {
    delay: Duration,
    inner: V,
}

#[async_trait]
impl<V: Validator> Validator for Delayed<V> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn run(
        &self,
        ctx: &RunContext,
        engine: &RemediationEngine,
    ) -> Result<ValidatorResult, ValidatorError> {
        tokio::time::sleep(self.delay).await;
        self.inner.run(ctx, engine).await
    }
}

#[cfg(unix)]
#[tokio::test]
async fn fatal_rollback_waits_for_fixes_of_parallel_workers() {
    let temp = tempfile::tempdir().unwrap();
    let ssh = temp.path().join("ssh");
    std::fs::create_dir(&ssh).unwrap();
    std::fs::write(ssh.join("config"), "Ciphers 3des").unwrap();
    let (_motd_temp, etc) = motd_dir();

    let validators: Vec<Arc<dyn Validator>> = vec![
        Arc::new(SlowFixer {
            dir: etc.clone(),
            sabotage: false,
        }),
        Arc::new(Delayed {
            delay: Duration::from_millis(100),
            inner: Vandal { dir: ssh },
        }),
    ];
    let ctx = RunContext::new("/")
        .with_fix_mode(true)
        .with_timeout(Duration::from_secs(10));
    let err = Orchestrator::new(validators, Schedule::parallel(2))
        .run(&ctx)
        .await
        .unwrap_err();

    assert!(matches!(err, OrchestratorError::RollbackFailed { ref validator, .. } if validator == "vandal"));
    assert_eq!(std::fs::read_to_string(etc.join("motd")).unwrap(), "MUTATED");
}
