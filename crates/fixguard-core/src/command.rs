use std::{
    path::PathBuf,
    process::Stdio,
    time::{Duration, Instant},
};

use thiserror::Error;
use tracing::{debug, instrument};

use crate::context::RunContext;

/// External command to execute through [`safe_run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(vars);
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Overrides the context timeout for this command only.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// Captured result of a command that exited successfully.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("program not found: {program}")]
    NotFound { program: String },

    #[error("failed to run `{program}`: {reason}")]
    Spawn { program: String, reason: String },

    #[error("`{program}` timed out after {}", humantime::format_duration(*.timeout))]
    Timeout { program: String, timeout: Duration },

    #[error("`{program}` exited with {}: {stderr}", exit_label(*.code))]
    NonZeroExit {
        program: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("`{program}` aborted: run cancelled")]
    Cancelled { program: String },
}

fn exit_label(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("status {code}"),
        None => "a termination signal".to_string(),
    }
}

/// Execute a command with captured output, bounded by the context timeout and
/// aborted on run cancellation. The child is killed whenever the call gives up on it.
/// Output is returned whole; callers bound whatever they keep.
#[instrument(name = "safe_run", skip_all, fields(program = %spec.program))]
pub async fn safe_run(spec: &CommandSpec, ctx: &RunContext) -> Result<CommandOutput, CommandError> {
    let program = spec.program.clone();
    if ctx.cancellation().is_cancelled() {
        return Err(CommandError::Cancelled { program });
    }

    let mut command = tokio::process::Command::new(&spec.program);
    command
        .args(&spec.args)
        .envs(spec.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .current_dir(
            spec.current_dir
                .clone()
                .unwrap_or_else(|| ctx.working_dir().to_path_buf()),
        )
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let timeout = spec.timeout.unwrap_or_else(|| ctx.timeout());
    let start = Instant::now();
    let child = command.spawn().map_err(|err| match err.kind() {
        std::io::ErrorKind::NotFound => CommandError::NotFound {
            program: program.clone(),
        },
        _ => CommandError::Spawn {
            program: program.clone(),
            reason: err.to_string(),
        },
    })?;

    let output = tokio::select! {
        output = child.wait_with_output() => output.map_err(|err| CommandError::Spawn {
            program: program.clone(),
            reason: err.to_string(),
        })?,
        _ = tokio::time::sleep(timeout) => {
            return Err(CommandError::Timeout { program, timeout });
        }
        _ = ctx.cancellation().cancelled() => {
            return Err(CommandError::Cancelled { program });
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    let duration = start.elapsed();
    debug!(status = ?output.status.code(), elapsed_ms = duration.as_millis() as u64, "command finished");

    if !output.status.success() {
        return Err(CommandError::NonZeroExit {
            program,
            code: output.status.code(),
            stdout,
            stderr,
        });
    }

    Ok(CommandOutput {
        stdout,
        stderr,
        exit_code: output.status.code().unwrap_or_default(),
        duration,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::context::Cancellation;

    fn ctx() -> RunContext {
        RunContext::new(std::env::temp_dir()).with_timeout(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]);
        let output = safe_run(&spec, &ctx()).await.unwrap();
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.exit_code, 0);
    }

    #[tokio::test]
    async fn nonzero_exit_carries_stderr() {
        let spec = CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 3"]);
        let err = safe_run(&spec, &ctx()).await.unwrap_err();
        match err {
            CommandError::NonZeroExit { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr.trim(), "broken");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_program_is_typed() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-4711");
        let err = safe_run(&spec, &ctx()).await.unwrap_err();
        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(100));
        let started = Instant::now();
        let err = safe_run(&spec, &ctx()).await.unwrap_err();
        assert!(matches!(err, CommandError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cancellation_aborts_running_command() {
        let cancellation = Cancellation::new();
        let ctx = ctx().with_cancellation(cancellation.clone());
        let spec = CommandSpec::new("sleep").arg("5");
        let handle = tokio::spawn(async move { safe_run(&spec, &ctx).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, CommandError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn large_output_is_returned_whole() {
        let spec = CommandSpec::new("sh").args(["-c", "head -c 200000 /dev/zero | tr '\\0' x"]);
        let output = safe_run(&spec, &ctx()).await.unwrap();
        assert_eq!(output.stdout.len(), 200_000);
        assert!(!output.stdout.contains("[output truncated]"));
    }

    #[tokio::test]
    async fn passes_environment() {
        let spec = CommandSpec::new("sh")
            .args(["-c", "printf %s \"$FIX_MODE\""])
            .envs(ctx().with_fix_mode(true).plugin_env());
        let output = safe_run(&spec, &ctx()).await.unwrap();
        assert_eq!(output.stdout, "1");
    }
}
