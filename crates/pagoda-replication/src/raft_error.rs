//! Replication-layer status codes
//!
//! Codes follow the replication library's numbering. Everything the
//! replication layer does not act on collapses to [`RaftError::Other`] via
//! [`RaftError::classify`].

use crate::error::{ApplyError, SnapshotError};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RaftError {
    Success,
    /// Internal failure
    EInternal,
    /// Request canceled
    ECanceled,
    /// Not permitted on this node; ask another replica
    EPerm,
    /// I/O failure
    EIo,
    /// State machine failure
    EStateMachine,
    /// Peer is catching up; retry later
    ECatchup,
    Other(i32),
}

impl RaftError {
    pub const fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::EInternal => 1004,
            Self::ECanceled => 1005,
            Self::EPerm => 1008,
            Self::EIo => 1014,
            Self::EStateMachine => 10002,
            Self::ECatchup => 10003,
            Self::Other(code) => code,
        }
    }

    pub const fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1004 => Self::EInternal,
            1005 => Self::ECanceled,
            1008 => Self::EPerm,
            1014 => Self::EIo,
            10002 => Self::EStateMachine,
            10003 => Self::ECatchup,
            other => Self::Other(other),
        }
    }

    /// Collapse to the codes the replication layer distinguishes
    pub const fn classify(self) -> Self {
        match self {
            Self::Success | Self::ECatchup | Self::EPerm => self,
            other => Self::Other(other.code()),
        }
    }
}

/// Error code plus message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Status {
    pub error: RaftError,
    pub message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self::new(RaftError::Success, "")
    }

    pub fn new(error: RaftError, message: impl Into<String>) -> Self {
        Self {
            error,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error == RaftError::Success
    }

    pub const fn code(&self) -> i32 {
        self.error.code()
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.error, self.code(), self.message)
    }
}

impl std::error::Error for Status {}

impl From<&ApplyError> for Status {
    fn from(e: &ApplyError) -> Self {
        let error = match e {
            ApplyError::Storage(_) | ApplyError::TxState(_) => RaftError::EIo,
            ApplyError::Decode(_) | ApplyError::Halted(_) => RaftError::EStateMachine,
        };
        Self::new(error, e.to_string())
    }
}

impl From<&SnapshotError> for Status {
    fn from(e: &SnapshotError) -> Self {
        let error = match e {
            SnapshotError::NotFrozen(_) => RaftError::ECatchup,
            SnapshotError::WrongSession { .. } => RaftError::EPerm,
            SnapshotError::Storage(_) | SnapshotError::TxState(_) => RaftError::EIo,
        };
        Self::new(error, e.to_string())
    }
}
