//! Engine error types.

use std::fmt;

use chunkstash_store::{RetryError, StoreError};
use chunkstash_transfer::{TransferError, TransferPhase};
use serde::Serialize;

use crate::state::InvalidTransition;

/// Where in a transfer an error happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub phase: TransferPhase,
    /// Chunk (or batch file) index, when the failure is tied to one.
    pub index: Option<usize>,
    /// Object path involved, when known.
    pub path: Option<String>,
}

impl Stage {
    pub fn new(phase: TransferPhase) -> Self {
        Self {
            phase,
            index: None,
            path: None,
        }
    }

    pub fn chunk(phase: TransferPhase, index: usize, path: impl Into<String>) -> Self {
        Self {
            phase,
            index: Some(index),
            path: Some(path.into()),
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.phase)?;
        if let Some(index) = self.index {
            write!(f, " chunk {index}")?;
        }
        if let Some(path) = &self.path {
            write!(f, " ({path})")?;
        }
        Ok(())
    }
}

/// A file rejected for exceeding the size ceiling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OversizedFile {
    pub name: String,
    pub size: u64,
}

impl fmt::Display for OversizedFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.name, self.size)
    }
}

fn list(files: &[OversizedFile]) -> String {
    files
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Errors produced by the transfer engine.
///
/// Each failed operation surfaces exactly one of these. Remote failures
/// carry the [`Stage`] they happened in.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("files exceed the {limit}-byte limit: {}", list(.files))]
    FilesTooLarge {
        limit: u64,
        files: Vec<OversizedFile>,
    },

    #[error("transfer failed while {stage} after {attempts} attempts: {source}")]
    TransferFailed {
        stage: Stage,
        attempts: u32,
        source: StoreError,
    },

    #[error("remote rejected {stage}: {source}")]
    PermanentRemote { stage: Stage, source: StoreError },

    #[error("integrity error while {stage}: {reason}")]
    Integrity { stage: Stage, reason: String },

    #[error("cancelled while {stage}")]
    Cancelled { stage: Stage },

    #[error("read failed while {stage}: {source}")]
    Read { stage: Stage, source: TransferError },

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    State(#[from] InvalidTransition),
}

impl EngineError {
    /// Converts a retry outcome into the matching engine error.
    pub fn from_retry(err: RetryError, stage: Stage) -> Self {
        match err {
            RetryError::Exhausted { attempts, source } => Self::TransferFailed {
                stage,
                attempts,
                source,
            },
            RetryError::Permanent { source, .. } => Self::PermanentRemote { stage, source },
            RetryError::Cancelled => Self::Cancelled { stage },
        }
    }

    /// Stage the failure happened in, for remote and integrity errors.
    pub fn stage(&self) -> Option<&Stage> {
        match self {
            Self::TransferFailed { stage, .. }
            | Self::PermanentRemote { stage, .. }
            | Self::Integrity { stage, .. }
            | Self::Cancelled { stage }
            | Self::Read { stage, .. } => Some(stage),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Maps a failed blocking task to an engine error.
pub(crate) fn join_error(e: tokio::task::JoinError) -> EngineError {
    EngineError::Io(std::io::Error::other(format!("task join error: {e}")))
}
