// src/error.rs

//! Error type shared by the operator engine and the check harness.

use std::fmt;

use bincode::error::{DecodeError, EncodeError};
use tch::TchError;
use thiserror::Error;

/// Which of the three checks produced a mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Reference,
    Device,
    Gradient,
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CheckKind::Reference => "reference",
            CheckKind::Device => "device",
            CheckKind::Gradient => "gradient",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CheckError {
    #[error(
        "{check} check failed for {what} at index {index}: expected {expected}, got {actual} \
         ({failures} element(s) out of tolerance)"
    )]
    Mismatch {
        check: CheckKind,
        what: String,
        index: usize,
        expected: f64,
        actual: f64,
        failures: usize,
    },

    #[error("{check} check failed for {what}: expected shape {expected:?}, got {found:?}")]
    ShapeMismatch {
        check: CheckKind,
        what: String,
        expected: Vec<i64>,
        found: Vec<i64>,
    },

    #[error("{check} check failed: expected {expected} output(s), got {found}")]
    OutputCountMismatch {
        check: CheckKind,
        expected: usize,
        found: usize,
    },

    #[error("Unknown operator type: {0}")]
    UnknownOperator(String),

    #[error("Invalid input for {op}: {reason}")]
    InvalidInput { op: String, reason: String },

    #[error("Blob not found in workspace: {0}")]
    MissingBlob(String),

    #[error("Output {index} missing: operator produced {produced} output(s)")]
    MissingOutput { index: usize, produced: usize },

    #[error("Tch tensor error: {0}")]
    TchError(#[from] TchError),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bincode Encode error: {0}")]
    BincodeEncodeError(#[from] EncodeError),

    #[error("Bincode Decode error: {0}")]
    BincodeDecodeError(#[from] DecodeError),
}

impl CheckError {
    pub(crate) fn invalid_input(op: &str, reason: impl Into<String>) -> Self {
        CheckError::InvalidInput {
            op: op.to_string(),
            reason: reason.into(),
        }
    }

    /// True for the assertion failures raised by the checks themselves.
    pub fn is_mismatch(&self) -> bool {
        matches!(
            self,
            CheckError::Mismatch { .. }
                | CheckError::ShapeMismatch { .. }
                | CheckError::OutputCountMismatch { .. }
        )
    }
}
