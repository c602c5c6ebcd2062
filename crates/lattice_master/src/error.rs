//! Error kinds used by the index lifecycle control plane.
//!
//! Persistence and shard-RPC failures fall into a small number of classes
//! with very different recovery policies, so the controller carries a typed
//! error instead of an opaque one:
//! - `AlreadyPresent` is success for the caller (another actor finished the
//!   same work first).
//! - `NotLeader`/`Io` abandon the current operation; the next reconcile pass
//!   or the next master leader picks it back up.
//! - Fatal shard errors abort the backfill through the removal side of the
//!   permission state machine.

use serde::{Deserialize, Serialize};

/// Error codes a shard leader can return on an admin RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShardErrorCode {
    /// The target shard does not exist on the addressed server.
    ShardNotFound,
    /// The shard is on a different schema version than the request.
    MismatchedSchema,
    /// The shard has already moved past the request's schema version.
    ShardHasNewerSchema,
    /// The shard server does not implement the requested operation.
    OperationNotSupported,
    /// The shard replica has not established leadership yet.
    LeaderNotReady,
    /// The shard leader is overloaded and asked the caller to back off.
    Busy,
}

impl ShardErrorCode {
    /// Codes on which a task must not retry; everything else is retried with
    /// backoff up to the configured ceiling.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ShardErrorCode::ShardNotFound
                | ShardErrorCode::MismatchedSchema
                | ShardErrorCode::ShardHasNewerSchema
                | ShardErrorCode::OperationNotSupported
        )
    }
}

/// One failed shard admin RPC.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("shard error ({code:?}): {message}")]
pub struct ShardError {
    pub code: ShardErrorCode,
    pub message: String,
}

impl ShardError {
    pub fn new(code: ShardErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Classified controller error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MasterError {
    /// The work was already done by somebody else; callers treat this as
    /// success.
    #[error("already present: {0}")]
    AlreadyPresent(String),

    /// A persist was rejected because this node is no longer the catalog
    /// leader. The operation is abandoned; the incoming leader reconstructs.
    #[error("not leader: {0}")]
    NotLeader(String),

    /// The catalog store failed to persist.
    #[error("io error: {0}")]
    Io(String),

    /// A shard RPC failed on a non-retryable code, or exhausted its retry
    /// ceiling. `code` is absent when the final failure was a timeout.
    #[error("fatal shard error: {message}")]
    FatalShardError {
        code: Option<ShardErrorCode>,
        message: String,
    },

    /// A shard RPC failed on a retryable code.
    #[error("transient shard error: {0}")]
    TransientShardError(String),

    /// A shard RPC attempt did not complete before its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A requested entity or property does not exist.
    #[error("incomplete: {0}")]
    Incomplete(String),

    /// A completion handler observed a task outside the COMPLETE state, or
    /// an internal invariant was violated.
    #[error("internal error: {0}")]
    InternalError(String),
}

impl MasterError {
    pub fn internal(message: impl Into<String>) -> Self {
        MasterError::InternalError(message.into())
    }

    /// Whether the caller should treat the error as "the work is done".
    pub fn is_already_present(&self) -> bool {
        matches!(self, MasterError::AlreadyPresent(_))
    }

    /// Whether the error means the current operation must be abandoned and
    /// left for the next reconcile pass.
    pub fn is_abandonment(&self) -> bool {
        matches!(self, MasterError::NotLeader(_) | MasterError::Io(_))
    }
}

impl From<std::io::Error> for MasterError {
    fn from(err: std::io::Error) -> Self {
        MasterError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MasterError {
    fn from(err: serde_json::Error) -> Self {
        MasterError::Io(format!("catalog encoding: {err}"))
    }
}
