// src/errors.rs

//! Crate-wide error aliases and helpers.

use std::fmt;

use thiserror::Error;

use crate::types::SourceUnitId;

/// Step of a launch that failed, for user-facing reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStep {
    Privilege,
    Spawn,
    Claim,
    Connect,
    Write,
}

impl fmt::Display for LaunchStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LaunchStep::Privilege => "privilege transition",
            LaunchStep::Spawn => "process start",
            LaunchStep::Claim => "preloaded helper claim",
            LaunchStep::Connect => "pipe connection",
            LaunchStep::Write => "pipe write",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum TaskhostError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Unknown source unit: {0}")]
    UnknownUnit(SourceUnitId),

    #[error("Failed to compile unit {unit}: {message}")]
    Compile { unit: SourceUnitId, message: String },

    #[error("Cannot start unit {unit} ({step}): {message}")]
    Launch {
        unit: SourceUnitId,
        step: LaunchStep,
        message: String,
    },

    #[error("Privilege error: {0}")]
    Privilege(String),

    #[error("Handoff error: {0}")]
    Handoff(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl TaskhostError {
    pub fn launch(unit: SourceUnitId, step: LaunchStep, err: impl fmt::Display) -> Self {
        TaskhostError::Launch {
            unit,
            step,
            message: err.to_string(),
        }
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, TaskhostError>;
