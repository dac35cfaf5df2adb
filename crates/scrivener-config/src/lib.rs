#![warn(missing_docs)]

//! # scrivener-config
//!
//! Configuration loading for the Scrivener agent render sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! timeout_ms = 2000
//! render_grace_ms = 4000
//! max_heap_mb = 64
//! execution_mode = "child_process"
//!
//! [debug]
//! enabled = false
//! ```

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level Scrivener configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScrivenerConfig {
    /// Sandbox execution settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Debug switches. Never enable these in production.
    #[serde(default)]
    pub debug: DebugOverrides,
}

/// Sandbox configuration overrides. Unset fields keep the runner defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SandboxOverrides {
    /// Initial render deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Floor applied to every armed deadline, in milliseconds.
    #[serde(default)]
    pub min_timeout_ms: Option<u64>,

    /// Extra time granted once the frame reports `render-started`.
    #[serde(default)]
    pub render_grace_ms: Option<u64>,

    /// Maximum V8 heap size in megabytes.
    #[serde(default)]
    pub max_heap_mb: Option<usize>,

    /// Maximum render code size in characters accepted by the validator.
    #[serde(default)]
    pub max_code_size: Option<usize>,

    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Maximum IPC message size in megabytes (child process mode).
    #[serde(default)]
    pub max_ipc_message_size_mb: Option<usize>,
}

/// Debug overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DebugOverrides {
    /// Relax frame isolation and inject code raw. Weakens the sandbox.
    #[serde(default)]
    pub enabled: bool,
}

impl ScrivenerConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ScrivenerConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        if let Some(mode) = &sandbox.execution_mode {
            match mode.as_str() {
                "in_process" | "child_process" => {}
                other => {
                    return Err(ConfigError::Invalid(format!(
                        "sandbox.execution_mode: unsupported mode '{}', supported: in_process, child_process",
                        other
                    )));
                }
            }
        }
        if sandbox.timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.timeout_ms must be greater than zero".into(),
            ));
        }
        if sandbox.max_heap_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_heap_mb must be greater than zero".into(),
            ));
        }
        if sandbox.max_code_size == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_code_size must be greater than zero".into(),
            ));
        }
        if sandbox.max_ipc_message_size_mb == Some(0) {
            return Err(ConfigError::Invalid(
                "sandbox.max_ipc_message_size_mb must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Expand `${ENV_VAR}` patterns in a string using environment variables.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                // unresolved placeholders stay verbatim
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(ch);
        }
    }

    result
}
