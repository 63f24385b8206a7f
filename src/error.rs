//! Error handling module for labstrap
//!
//! Provides the central error type for the data layer (config files, state,
//! prompts). Orchestration code wraps these in `anyhow` with step context.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for labstrap
#[derive(Error, Debug)]
pub enum LabError {
    /// IO errors (file operations, pipes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A key-value file could not be parsed
    #[error("{}:{line}: {message}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },

    /// Configuration errors (missing record, bad value)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation errors (user input, config values)
    #[error("Validation error: {0}")]
    Validation(String),

    /// External command failed
    #[error("`{command}` failed (exit code {code}): {stderr}")]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    /// State file errors
    #[error("State error: {0}")]
    State(String),

    /// Interactive prompt failed or has no answer in non-interactive mode
    #[error("Prompt error: {0}")]
    Prompt(String),

    /// Operator cancelled a prompt (Ctrl-C / Esc)
    #[error("Interrupted by operator")]
    Interrupted,

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for labstrap data-layer operations
pub type Result<T> = std::result::Result<T, LabError>;

impl LabError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a state error
    pub fn state(msg: impl Into<String>) -> Self {
        Self::State(msg.into())
    }

    /// Create a prompt error
    pub fn prompt(msg: impl Into<String>) -> Self {
        Self::Prompt(msg.into())
    }

    /// Create a parse error for `path` at 1-based `line`
    pub fn parse(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            message: msg.into(),
        }
    }
}
