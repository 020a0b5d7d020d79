use std::{collections::HashSet, path::PathBuf, sync::Arc};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::env_var::EnvVarValidator;
use super::file_mode::FileModeValidator;
use super::process::CommandValidator;
use super::Validator;

/// The kinds of validator the registry knows how to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckKind {
    /// External executable speaking the JSON plugin protocol.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
    /// Permission bits of a file or directory, given in octal (`"700"`).
    FileMode { path: PathBuf, mode: String },
    /// Exact value of an environment key.
    EnvVar { key: String, expected: String },
}

impl CheckKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Command { .. } => "command",
            Self::FileMode { .. } => "file_mode",
            Self::EnvVar { .. } => "env_var",
        }
    }
}

/// Declaration of one validator, in registration order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSpec {
    pub name: String,
    #[serde(default)]
    pub shared_resources: Vec<String>,
    #[serde(flatten)]
    pub check: CheckKind,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no validators registered")]
    Empty,
    #[error("validator name must not be blank")]
    BlankName,
    #[error("duplicate validator name `{0}`")]
    DuplicateName(String),
    #[error("validator `{name}` has invalid octal mode `{mode}`")]
    InvalidMode { name: String, mode: String },
    #[error("validator `{0}` declares an empty program")]
    EmptyProgram(String),
}

impl ValidatorSpec {
    /// Resolve the declaration into its implementation.
    pub fn build(&self) -> Result<Arc<dyn Validator>, RegistryError> {
        let resources = self.shared_resources.clone();
        let validator: Arc<dyn Validator> = match &self.check {
            CheckKind::Command { program, args } => {
                if program.trim().is_empty() {
                    return Err(RegistryError::EmptyProgram(self.name.clone()));
                }
                Arc::new(
                    CommandValidator::new(&self.name, program, args.clone())
                        .with_shared_resources(resources),
                )
            }
            CheckKind::FileMode { path, mode } => {
                let parsed = parse_mode(mode).ok_or_else(|| RegistryError::InvalidMode {
                    name: self.name.clone(),
                    mode: mode.clone(),
                })?;
                Arc::new(
                    FileModeValidator::new(&self.name, path, parsed)
                        .with_shared_resources(resources),
                )
            }
            CheckKind::EnvVar { key, expected } => Arc::new(
                EnvVarValidator::new(&self.name, key, expected).with_shared_resources(resources),
            ),
        };
        Ok(validator)
    }
}

/// Build the ordered validator list once at start-up.
pub fn build_validators(specs: &[ValidatorSpec]) -> Result<Vec<Arc<dyn Validator>>, RegistryError> {
    if specs.is_empty() {
        return Err(RegistryError::Empty);
    }
    let mut seen = HashSet::new();
    let mut validators = Vec::with_capacity(specs.len());
    for spec in specs {
        let name = spec.name.trim();
        if name.is_empty() {
            return Err(RegistryError::BlankName);
        }
        if !seen.insert(name.to_string()) {
            return Err(RegistryError::DuplicateName(name.to_string()));
        }
        validators.push(spec.build()?);
    }
    Ok(validators)
}

/// Permission bits only; setuid, setgid and sticky bits are rejected.
fn parse_mode(raw: &str) -> Option<u32> {
    let digits = raw.trim().trim_start_matches("0o");
    if digits.is_empty() || digits.len() > 4 {
        return None;
    }
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|mode| *mode <= 0o777)
}
