//! Error types for the script runner

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Script parse error in {path}: {reason}")]
    ScriptParse { path: String, reason: String },

    #[error("Script not found: {0}")]
    ScriptNotFound(String),

    #[error("Invalid step at {at}: {reason}")]
    InvalidStep { at: String, reason: String },

    #[error(transparent)]
    Driver(#[from] apidrive::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
