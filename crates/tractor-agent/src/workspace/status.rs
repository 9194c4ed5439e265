use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Availability of a workspace process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The process failed or exited before it became ready.
    Unavailable = 0,
    /// No process, or a process that has not signalled readiness yet.
    PartiallyAvailable = 1,
    /// The process is running and ready.
    Available = 2,
}

impl Status {
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => Status::Unavailable,
            2 => Status::Available,
            _ => Status::PartiallyAvailable,
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Unavailable => write!(f, "unavailable"),
            Status::PartiallyAvailable => write!(f, "partially_available"),
            Status::Available => write!(f, "available"),
        }
    }
}

/// Raised synchronously on every workspace status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub workspace: String,
    pub target: PathBuf,
    pub previous: Status,
    pub current: Status,
}
