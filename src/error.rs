//! Error and result types for the r-tree engine.

use thiserror::Error;

/// Errors produced by r-tree operations.
#[derive(Debug, Error)]
pub enum RtreeError {
    /// A structural invariant of the stored tree does not hold. The engine
    /// surfaces this and makes no attempt to repair the structure.
    #[error("r-tree structure is corrupt: {0}")]
    Corrupt(String),

    /// Caller-supplied data violates an input invariant (inverted
    /// coordinate range, duplicate rowid, malformed geometry blob).
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// The table declaration handed to create/connect is not acceptable.
    #[error("{0}")]
    Schema(String),

    /// Pass-through from the host backing store or a geometry callback.
    #[error("host error: {0}")]
    Host(String),
}

impl RtreeError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        RtreeError::Corrupt(msg.into())
    }

    pub(crate) fn constraint(msg: impl Into<String>) -> Self {
        RtreeError::Constraint(msg.into())
    }
}

/// Result type for r-tree operations.
pub type RtreeResult<T> = Result<T, RtreeError>;
