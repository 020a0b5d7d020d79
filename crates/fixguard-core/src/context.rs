use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tokio::sync::watch;

use crate::orchestrator::Schedule;
use crate::validator::registry::ValidatorSpec;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_REPORT_DIR: &str = "validation-reports";

/// Run-level cancellation handle. Clones observe the same signal.
#[derive(Debug, Clone)]
pub struct Cancellation {
    sender: Arc<watch::Sender<bool>>,
    receiver: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> Self {
        let (sender, receiver) = watch::channel(false);
        Self {
            sender: Arc::new(sender),
            receiver,
        }
    }

    pub fn cancel(&self) {
        self.sender.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once the run has been cancelled.
    pub async fn cancelled(&self) {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow_and_update() {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::new()
    }
}

/// Settings loaded once at start-up and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fix_mode: bool,
    /// Worker count for parallel scheduling; `0` means one worker per CPU.
    /// Absent means sequential execution.
    pub parallel: Option<usize>,
    #[serde(
        serialize_with = "serialize_duration",
        deserialize_with = "deserialize_duration"
    )]
    pub timeout: Duration,
    pub report_dir: PathBuf,
    pub warn_as_failure: bool,
    pub verbosity: u8,
    pub working_dir: Option<PathBuf>,
    /// Extra `KEY=VALUE` pairs exported to every validator.
    pub environment: Vec<String>,
    /// `KEY=VALUE` file that environment fixes are written to. Without it,
    /// environment findings are reported but never fixed.
    pub env_file: Option<PathBuf>,
    pub ci: bool,
    pub validators: Vec<ValidatorSpec>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            fix_mode: false,
            parallel: None,
            timeout: DEFAULT_TIMEOUT,
            report_dir: PathBuf::from(DEFAULT_REPORT_DIR),
            warn_as_failure: false,
            verbosity: 0,
            working_dir: None,
            environment: Vec::new(),
            env_file: None,
            ci: false,
            validators: Vec::new(),
        }
    }
}

impl Config {
    pub fn schedule(&self) -> Schedule {
        match self.parallel {
            None => Schedule::Sequential,
            Some(workers) => Schedule::parallel(workers),
        }
    }

    pub fn environment_overrides(&self) -> Result<BTreeMap<String, String>, ConfigError> {
        let mut overrides = BTreeMap::new();
        for entry in &self.environment {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(ConfigError::InvalidEnvironmentEntry(entry.clone()));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(ConfigError::InvalidEnvironmentEntry(entry.clone()));
            }
            overrides.insert(key.to_string(), value.to_string());
        }
        Ok(overrides)
    }
}

/// Errors raised while turning a `Config` into a `RunContext`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment entry `{0}` must have the form KEY=VALUE")]
    InvalidEnvironmentEntry(String),
    #[error("timeout must be greater than zero")]
    ZeroTimeout,
    #[error("failed to resolve working directory: {0}")]
    WorkingDir(#[source] std::io::Error),
}

/// Immutable context handed to every validator.
#[derive(Debug, Clone)]
pub struct RunContext {
    fix_mode: bool,
    verbosity: u8,
    working_dir: PathBuf,
    timeout: Duration,
    environment_overrides: BTreeMap<String, String>,
    ci: bool,
    cancellation: Cancellation,
}

impl RunContext {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            fix_mode: false,
            verbosity: 0,
            working_dir: working_dir.into(),
            timeout: DEFAULT_TIMEOUT,
            environment_overrides: BTreeMap::new(),
            ci: false,
            cancellation: Cancellation::new(),
        }
    }

    pub fn from_config(config: &Config, cancellation: Cancellation) -> Result<Self, ConfigError> {
        if config.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        let working_dir = match &config.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir().map_err(ConfigError::WorkingDir)?,
        };
        Ok(Self {
            fix_mode: config.fix_mode,
            verbosity: config.verbosity,
            working_dir,
            timeout: config.timeout,
            environment_overrides: config.environment_overrides()?,
            ci: config.ci,
            cancellation,
        })
    }

    pub fn with_fix_mode(mut self, fix_mode: bool) -> Self {
        self.fix_mode = fix_mode;
        self
    }

    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_environment(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment_overrides.insert(key.into(), value.into());
        self
    }

    pub fn with_ci(mut self, ci: bool) -> Self {
        self.ci = ci;
        self
    }

    pub fn with_cancellation(mut self, cancellation: Cancellation) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn fix_mode(&self) -> bool {
        self.fix_mode
    }

    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn environment_overrides(&self) -> &BTreeMap<String, String> {
        &self.environment_overrides
    }

    pub fn ci(&self) -> bool {
        self.ci
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancellation
    }

    /// Resolve a possibly relative path against the working directory. A leading
    /// `~` expands to `$HOME`.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if let Ok(rest) = path.strip_prefix("~") {
            if let Some(home) = std::env::var_os("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// The context as exported to external validator processes.
    pub fn plugin_env(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            (
                "FIX_MODE".to_string(),
                if self.fix_mode { "1" } else { "0" }.to_string(),
            ),
            (
                "VALIDATION_VERBOSITY".to_string(),
                self.verbosity.to_string(),
            ),
            (
                "VALIDATION_TIMEOUT".to_string(),
                humantime::format_duration(self.timeout).to_string(),
            ),
            (
                "VALIDATION_WORKDIR".to_string(),
                self.working_dir.display().to_string(),
            ),
        ];
        if self.ci {
            vars.push(("CI".to_string(), "1".to_string()));
        }
        vars.extend(
            self.environment_overrides
                .iter()
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        vars
    }
}

fn serialize_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
}
