use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use config::{Config as Layers, File, FileFormat};
use fixguard_core::Config;

/// Configuration file read when `--config` is not given. It may be absent.
pub const DEFAULT_CONFIG_FILE: &str = "fixguard.toml";

/// Values supplied on the command line; they win over every other layer.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub fix: bool,
    pub parallel: Option<usize>,
    pub timeout: Option<Duration>,
    pub report_dir: Option<PathBuf>,
    pub warn_as_failure: bool,
    pub verbosity: u8,
}

/// Load configuration from the process environment and the optional file.
pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Config> {
    load_with_env(path, overrides, |key| std::env::var(key).ok())
}

/// Layering: defaults < TOML file < environment variables < flags.
pub fn load_with_env<F>(path: Option<&Path>, overrides: &Overrides, lookup: F) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let file = match path {
        Some(path) => File::from(path).format(FileFormat::Toml).required(true),
        None => File::new(DEFAULT_CONFIG_FILE, FileFormat::Toml).required(false),
    };

    let fix_mode = lookup("FIX_MODE")
        .map(|value| is_truthy(&value))
        .filter(|enabled| *enabled)
        .or(overrides.fix.then_some(true));
    let timeout = overrides
        .timeout
        .map(|timeout| humantime::format_duration(timeout).to_string())
        .or(lookup("VALIDATION_TIMEOUT").map(|raw| normalize_timeout(&raw)));
    let report_dir = overrides
        .report_dir
        .as_ref()
        .map(|dir| dir.to_string_lossy().into_owned())
        .or(lookup("VALIDATION_REPORT_DIR").filter(|dir| !dir.trim().is_empty()));
    let ci = lookup("CI")
        .filter(|value| !value.is_empty() && !matches!(value.as_str(), "0" | "false"))
        .map(|_| true);

    let layers = Layers::builder()
        .add_source(file)
        .set_override_option("fix_mode", fix_mode)?
        .set_override_option("timeout", timeout)?
        .set_override_option("report_dir", report_dir)?
        .set_override_option("ci", ci)?
        .set_override_option("parallel", overrides.parallel.map(|workers| workers as u64))?
        .set_override_option("warn_as_failure", overrides.warn_as_failure.then_some(true))?
        .set_override_option(
            "verbosity",
            (overrides.verbosity > 0).then_some(u64::from(overrides.verbosity)),
        )?
        .build()
        .context("failed to load configuration")?;

    layers
        .try_deserialize::<Config>()
        .context("invalid configuration")
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Bare numbers are taken as seconds.
fn normalize_timeout(raw: &str) -> String {
    let raw = raw.trim();
    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        format!("{raw}s")
    } else {
        raw.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixguard_core::{CheckKind, Schedule};
    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn explicit_file_must_exist_and_empty_file_means_defaults() {
        let missing = Path::new("/definitely/not/here.toml");
        let err = load_with_env(Some(missing), &Overrides::default(), env(&[])).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load configuration"));

        let file = config_file("");
        let config = load_with_env(Some(file.path()), &Overrides::default(), env(&[])).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn file_declares_validators_in_order() {
        let file = config_file(
            r#"
timeout = "10s"
environment = ["LANG=C"]

[[validators]]
name = "pkg"
kind = "command"
program = "./checks/packages.sh"
shared_resources = ["brew"]

[[validators]]
name = "sec"
kind = "file_mode"
path = "~/.ssh"
mode = "700"
"#,
        );
        let config = load_with_env(Some(file.path()), &Overrides::default(), env(&[])).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.environment, vec!["LANG=C".to_string()]);
        assert_eq!(config.validators.len(), 2);
        assert_eq!(config.validators[0].name, "pkg");
        assert_eq!(config.validators[0].shared_resources, vec!["brew".to_string()]);
        assert_eq!(
            config.validators[1].check,
            CheckKind::FileMode {
                path: "~/.ssh".into(),
                mode: "700".into()
            }
        );
    }

    #[test]
    fn environment_overrides_file() {
        let file = config_file("timeout = \"10s\"\nreport_dir = \"from-file\"\n");
        let config = load_with_env(
            Some(file.path()),
            &Overrides::default(),
            env(&[
                ("FIX_MODE", "1"),
                ("VALIDATION_TIMEOUT", "45"),
                ("VALIDATION_REPORT_DIR", "/var/reports"),
                ("CI", "true"),
            ]),
        )
        .unwrap();
        assert!(config.fix_mode);
        assert!(config.ci);
        assert_eq!(config.timeout, Duration::from_secs(45));
        assert_eq!(config.report_dir, PathBuf::from("/var/reports"));
    }

    #[test]
    fn flags_override_environment() {
        let file = config_file("");
        let overrides = Overrides {
            fix: true,
            parallel: Some(0),
            timeout: Some(Duration::from_secs(2)),
            report_dir: Some(PathBuf::from("out")),
            warn_as_failure: true,
            verbosity: 2,
        };
        let config = load_with_env(
            Some(file.path()),
            &overrides,
            env(&[("FIX_MODE", "0"), ("VALIDATION_TIMEOUT", "1m")]),
        )
        .unwrap();
        assert!(config.fix_mode);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.report_dir, PathBuf::from("out"));
        assert!(config.warn_as_failure);
        assert_eq!(config.verbosity, 2);
        assert!(matches!(config.schedule(), Schedule::Parallel { .. }));
    }

    #[test]
    fn timeout_normalization() {
        assert_eq!(normalize_timeout("30"), "30s");
        assert_eq!(normalize_timeout(" 2m "), "2m");
        assert!(is_truthy("TRUE"));
        assert!(!is_truthy("0"));
    }
}
