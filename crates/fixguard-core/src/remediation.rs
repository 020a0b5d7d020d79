//! Snapshot, apply and rollback primitives for automated fixes.
//!
//! A snapshot holds a per-target lock for its whole lifetime, so two remediation
//! units never hold uncommitted state on the same file or environment key.
//! Fixes run on their own task: once started, a fix and its rollback complete even
//! if the validator that requested them is dropped. Such abandoned fixes are kept
//! per engine scope and handed back by [`RemediationEngine::settle`].

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    future::Future,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::{
    sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard},
    task::JoinSet,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Something a fix may change.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    File(PathBuf),
    Env(String),
}

impl Target {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    pub fn env(key: impl Into<String>) -> Self {
        Self::Env(key.into())
    }

    fn normalized(&self) -> io::Result<Self> {
        match self {
            Self::File(path) if path.is_absolute() => Ok(Self::File(path.clone())),
            Self::File(path) => Ok(Self::File(std::env::current_dir()?.join(path))),
            Self::Env(key) => Ok(Self::Env(key.clone())),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file {}", path.display()),
            Self::Env(key) => write!(f, "env {key}"),
        }
    }
}

/// Storage for environment values that fixes may touch.
pub trait EnvStore: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> io::Result<()>;
    fn remove(&self, key: &str) -> io::Result<()>;

    /// Whether a change outlives the current process.
    fn persists(&self) -> bool {
        true
    }
}

/// The environment of the current process. Changes die with the process.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnv;

impl EnvStore for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        std::env::set_var(key, value);
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        std::env::remove_var(key);
        Ok(())
    }

    fn persists(&self) -> bool {
        false
    }
}

/// Isolated in-memory environment.
#[derive(Debug, Default)]
pub struct MemoryEnv {
    vars: Mutex<BTreeMap<String, String>>,
}

impl MemoryEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            vars: Mutex::new(
                vars.into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }
}

impl EnvStore for MemoryEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.vars
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
        Ok(())
    }
}

/// Environment kept in a shell-sourceable file of `KEY=VALUE` lines, such as a
/// profile fragment. Other lines are preserved; writes replace the file atomically.
#[derive(Debug)]
pub struct EnvFile {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl EnvFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lines(&self) -> io::Result<Vec<String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(body) => Ok(body.lines().map(str::to_string).collect()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err),
        }
    }

    fn rewrite(&self, key: &str, value: Option<&str>) -> io::Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut lines: Vec<String> = self
            .lines()?
            .into_iter()
            .filter(|line| parse_assignment(line).map(|(k, _)| k) != Some(key))
            .collect();
        if let Some(value) = value {
            lines.push(format!("{key}={value}"));
        }
        let mut body = lines.join("\n");
        if !body.is_empty() {
            body.push('\n');
        }

        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(body.as_bytes())?;
        temp.as_file().sync_all()?;
        if let Ok(metadata) = std::fs::metadata(&self.path) {
            set_file_mode(temp.path(), file_mode(&metadata))?;
        }
        temp.persist(&self.path).map_err(|err| err.error)?;
        Ok(())
    }
}

impl EnvStore for EnvFile {
    fn get(&self, key: &str) -> Option<String> {
        let lines = match self.lines() {
            Ok(lines) => lines,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "cannot read env file");
                return None;
            }
        };
        lines
            .iter()
            .rev()
            .filter_map(|line| parse_assignment(line))
            .find(|(k, _)| *k == key)
            .map(|(_, value)| value.to_string())
    }

    fn set(&self, key: &str, value: &str) -> io::Result<()> {
        self.rewrite(key, Some(value))
    }

    fn remove(&self, key: &str) -> io::Result<()> {
        self.rewrite(key, None)
    }
}

/// `KEY=VALUE`, optionally prefixed with `export` and with a double-quoted value.
fn parse_assignment(line: &str) -> Option<(&str, &str)> {
    let line = line.trim();
    if line.starts_with('#') {
        return None;
    }
    let line = line.strip_prefix("export ").unwrap_or(line).trim_start();
    let (key, value) = line.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    let value = value.trim();
    let value = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .unwrap_or(value);
    Some((key, value))
}

/// Captured state of a file target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapturedFile {
    Missing,
    Regular { contents: Vec<u8>, mode: u32 },
    Directory { mode: u32 },
}

/// Pre-change checkpoint owned by the remediation engine.
pub struct Snapshot {
    id: Uuid,
    created_at: DateTime<Utc>,
    files: BTreeMap<PathBuf, CapturedFile>,
    env: BTreeMap<String, Option<String>>,
    _guards: Vec<OwnedMutexGuard<()>>,
}

impl Snapshot {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn captured_files(&self) -> &BTreeMap<PathBuf, CapturedFile> {
        &self.files
    }

    /// `None` records a key that was unset when captured.
    pub fn captured_env(&self) -> &BTreeMap<String, Option<String>> {
        &self.env
    }

    pub fn targets(&self) -> Vec<String> {
        self.files
            .keys()
            .map(|path| Target::File(path.clone()).to_string())
            .chain(self.env.keys().map(|key| Target::Env(key.clone()).to_string()))
            .collect()
    }
}

impl fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("files", &self.files.keys().collect::<Vec<_>>())
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("cannot capture {target}: {source}")]
    Capture {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("snapshot requires at least one target")]
    NoTargets,
}

/// Restore did not succeed; system state may be inconsistent.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("rollback of snapshot {snapshot_id} failed; unrestored targets: {}", .targets.join(", "))]
pub struct RollbackFailure {
    pub snapshot_id: Uuid,
    pub targets: Vec<String>,
    pub reasons: Vec<String>,
}

#[derive(Debug, Error)]
pub enum RemediationError {
    #[error("fix failed and was rolled back: {source:#}")]
    MutationFailed {
        snapshot_id: Uuid,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    RollbackFailed(#[from] RollbackFailure),
}

/// A fix whose requester stopped waiting before it finished.
#[derive(Debug)]
pub struct AbandonedFix {
    pub snapshot_id: Uuid,
    pub targets: Vec<String>,
    pub outcome: Result<(), RemediationError>,
}

#[derive(Debug)]
enum FixState {
    Running,
    Finished(Result<(), RemediationError>),
    Claimed,
}

#[derive(Debug)]
struct InFlightFix {
    snapshot_id: Uuid,
    targets: Vec<String>,
    state: Mutex<FixState>,
    done: Notify,
}

impl InFlightFix {
    fn finish(&self, outcome: Result<(), RemediationError>) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = FixState::Finished(outcome);
    }

    fn take(&self) -> FixState {
        std::mem::replace(
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner),
            FixState::Claimed,
        )
    }

    fn lost(&self, reason: impl Into<String>) -> RemediationError {
        RemediationError::RollbackFailed(RollbackFailure {
            snapshot_id: self.snapshot_id,
            targets: self.targets.clone(),
            reasons: vec![reason.into()],
        })
    }

    async fn wait(&self) -> Result<(), RemediationError> {
        self.done.notified().await;
        match self.take() {
            FixState::Finished(outcome) => outcome,
            FixState::Running | FixState::Claimed => {
                Err(self.lost("fix task ended without an outcome"))
            }
        }
    }

    fn abandoned(&self) -> Option<AbandonedFix> {
        let outcome = match self.take() {
            FixState::Finished(outcome) => outcome,
            FixState::Running => Err(self.lost("fix task ended without an outcome")),
            FixState::Claimed => return None,
        };
        Some(AbandonedFix {
            snapshot_id: self.snapshot_id,
            targets: self.targets.clone(),
            outcome,
        })
    }
}

/// Wakes the requester however the fix task ends.
struct NotifyOnDrop(Arc<InFlightFix>);

impl Drop for NotifyOnDrop {
    fn drop(&mut self) {
        self.0.done.notify_one();
    }
}

#[derive(Debug, Default)]
struct FixTasks(JoinSet<()>);

impl Drop for FixTasks {
    fn drop(&mut self) {
        // Fixes must never be aborted half-way.
        self.0.detach_all();
    }
}

#[derive(Debug, Default)]
struct FixScope {
    tasks: FixTasks,
    fixes: Vec<Arc<InFlightFix>>,
}

/// Creates snapshots, applies fixes and rolls them back.
///
/// Clones share targets locks, the environment store and the fix scope;
/// [`scoped`](Self::scoped) starts a fresh fix scope.
#[derive(Debug, Clone)]
pub struct RemediationEngine {
    inner: Arc<EngineInner>,
    scope: Arc<Mutex<FixScope>>,
}

#[derive(Debug)]
struct EngineInner {
    env: Arc<dyn EnvStore>,
    locks: Mutex<HashMap<Target, Arc<AsyncMutex<()>>>>,
}

impl Default for RemediationEngine {
    fn default() -> Self {
        Self::new(Arc::new(ProcessEnv))
    }
}

impl RemediationEngine {
    pub fn new(env: Arc<dyn EnvStore>) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                env,
                locks: Mutex::new(HashMap::new()),
            }),
            scope: Arc::default(),
        }
    }

    /// Same environment and locks, separate set of tracked fixes.
    pub fn scoped(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            scope: Arc::default(),
        }
    }

    /// Wait for every fix started through this scope and return those whose
    /// requester was dropped before reading the outcome.
    pub async fn settle(&self) -> Vec<AbandonedFix> {
        let (mut tasks, fixes) = {
            let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
            (
                std::mem::take(&mut scope.tasks),
                std::mem::take(&mut scope.fixes),
            )
        };
        while tasks.0.join_next().await.is_some() {}
        let abandoned: Vec<AbandonedFix> =
            fixes.iter().filter_map(|fix| fix.abandoned()).collect();
        if !abandoned.is_empty() {
            warn!(count = abandoned.len(), "fixes finished after their validator stopped");
        }
        abandoned
    }

    /// Environment store fixes should mutate.
    pub fn env(&self) -> Arc<dyn EnvStore> {
        Arc::clone(&self.inner.env)
    }

    fn lock_for(&self, target: &Target) -> Arc<AsyncMutex<()>> {
        let mut locks = self
            .inner
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(target.clone()).or_default())
    }

    /// Capture every target. Fails closed: one unreadable target aborts the snapshot.
    #[instrument(name = "create_snapshot", skip(self, targets), fields(targets = targets.len()))]
    pub async fn create_snapshot(&self, targets: &[Target]) -> Result<Snapshot, SnapshotError> {
        if targets.is_empty() {
            return Err(SnapshotError::NoTargets);
        }
        let mut normalized = Vec::with_capacity(targets.len());
        for target in targets {
            let target = target.normalized().map_err(|source| SnapshotError::Capture {
                target: target.to_string(),
                source,
            })?;
            normalized.push(target);
        }
        // Sorted acquisition keeps overlapping snapshots deadlock-free.
        normalized.sort();
        normalized.dedup();

        let mut guards = Vec::with_capacity(normalized.len());
        for target in &normalized {
            guards.push(self.lock_for(target).lock_owned().await);
        }

        let mut files = BTreeMap::new();
        let mut env = BTreeMap::new();
        for target in normalized {
            match target {
                Target::File(path) => {
                    let captured = capture_file(&path).map_err(|source| SnapshotError::Capture {
                        target: Target::File(path.clone()).to_string(),
                        source,
                    })?;
                    files.insert(path, captured);
                }
                Target::Env(key) => {
                    let value = self.inner.env.get(&key);
                    env.insert(key, value);
                }
            }
        }

        let snapshot = Snapshot {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            files,
            env,
            _guards: guards,
        };
        debug!(snapshot = %snapshot.id, "snapshot created");
        Ok(snapshot)
    }

    /// Run `mutation` under `snapshot`; on error the snapshot is restored before returning.
    /// On success the snapshot is discarded.
    #[instrument(name = "apply_fix", skip_all, fields(snapshot = %snapshot.id))]
    pub async fn apply_fix<F, Fut>(
        &self,
        snapshot: Snapshot,
        mutation: F,
    ) -> Result<(), RemediationError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let fix = Arc::new(InFlightFix {
            snapshot_id: snapshot.id,
            targets: snapshot.targets(),
            state: Mutex::new(FixState::Running),
            done: Notify::new(),
        });
        let engine = self.clone();
        let notify = NotifyOnDrop(Arc::clone(&fix));
        {
            let mut scope = self.scope.lock().unwrap_or_else(PoisonError::into_inner);
            scope.fixes.push(Arc::clone(&fix));
            scope.tasks.0.spawn(async move {
                let outcome = match tokio::spawn(mutation()).await {
                    Ok(outcome) => outcome,
                    Err(join) => Err(anyhow::anyhow!("fix aborted: {join}")),
                };
                let outcome = match outcome {
                    Ok(()) => {
                        debug!(snapshot = %snapshot.id, "fix applied; snapshot discarded");
                        Ok(())
                    }
                    Err(source) => {
                        warn!(snapshot = %snapshot.id, error = %format!("{source:#}"), "fix failed; rolling back");
                        match engine.rollback(&snapshot) {
                            Ok(()) => Err(RemediationError::MutationFailed {
                                snapshot_id: snapshot.id,
                                source,
                            }),
                            Err(failure) => Err(RemediationError::RollbackFailed(failure)),
                        }
                    }
                };
                notify.0.finish(outcome);
            });
        }
        fix.wait().await
    }

    /// Restore every captured target. Already-restored targets are left untouched,
    /// so repeated calls are no-ops.
    pub fn rollback(&self, snapshot: &Snapshot) -> Result<(), RollbackFailure> {
        let mut targets = Vec::new();
        let mut reasons = Vec::new();
        for (path, captured) in &snapshot.files {
            if let Err(err) = restore_file(path, captured) {
                targets.push(path.display().to_string());
                reasons.push(format!("{}: {err}", path.display()));
            }
        }
        for (key, value) in &snapshot.env {
            let current = self.inner.env.get(key);
            if current == *value {
                continue;
            }
            let restored = match value {
                Some(value) => self.inner.env.set(key, value),
                None => self.inner.env.remove(key),
            };
            if let Err(err) = restored {
                targets.push(Target::Env(key.clone()).to_string());
                reasons.push(format!("{key}: {err}"));
            }
        }
        if targets.is_empty() {
            debug!(snapshot = %snapshot.id, "snapshot restored");
            Ok(())
        } else {
            Err(RollbackFailure {
                snapshot_id: snapshot.id,
                targets,
                reasons,
            })
        }
    }
}

fn capture_file(path: &Path) -> io::Result<CapturedFile> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(CapturedFile::Missing),
        Err(err) => return Err(err),
    };
    let metadata = if metadata.file_type().is_symlink() {
        std::fs::metadata(path)?
    } else {
        metadata
    };
    let mode = file_mode(&metadata);
    if metadata.is_dir() {
        return Ok(CapturedFile::Directory { mode });
    }
    let contents = std::fs::read(path)?;
    Ok(CapturedFile::Regular { contents, mode })
}

fn restore_file(path: &Path, captured: &CapturedFile) -> io::Result<()> {
    if capture_file(path).ok().as_ref() == Some(captured) {
        return Ok(());
    }
    match captured {
        CapturedFile::Missing => match std::fs::symlink_metadata(path) {
            Ok(metadata) if metadata.is_dir() => std::fs::remove_dir(path),
            Ok(_) => std::fs::remove_file(path),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        },
        CapturedFile::Directory { mode } => {
            if !path.is_dir() {
                std::fs::create_dir_all(path)?;
            }
            set_file_mode(path, *mode)
        }
        CapturedFile::Regular { contents, mode } => {
            let parent = match path.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let mut temp = tempfile::NamedTempFile::new_in(parent)?;
            temp.write_all(contents)?;
            temp.as_file().sync_all()?;
            set_file_mode(temp.path(), *mode)?;
            temp.persist(path).map_err(|err| err.error)?;
            Ok(())
        }
    }
}

#[cfg(unix)]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
pub(crate) fn file_mode(metadata: &std::fs::Metadata) -> u32 {
    if metadata.permissions().readonly() {
        0o444
    } else {
        0o644
    }
}

#[cfg(unix)]
pub(crate) fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub(crate) fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    let mut permissions = std::fs::metadata(path)?.permissions();
    permissions.set_readonly(mode & 0o222 == 0);
    std::fs::set_permissions(path, permissions)
}
