//! How a submission finished.

use serde::{Deserialize, Serialize};

/// Completion signal for one submission.
///
/// Exactly one outcome is delivered per admitted submission, after the
/// last output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    /// Process exited with status 0.
    Succeeded,
    /// Process exited unsuccessfully. `code` is `None` when killed by a signal.
    Exited {
        /// Exit code, if the process exited on its own.
        code: Option<i32>,
    },
    /// The executable could not be started.
    SpawnFailed {
        /// OS error text.
        reason: String,
    },
    /// Reading the process's output failed mid-stream.
    StreamFailed {
        /// I/O error text.
        reason: String,
    },
    /// The process exceeded the submission timeout and was killed.
    TimedOut,
    /// The session went away before the submission finished.
    Cancelled,
}

impl Outcome {
    /// True only for [`Outcome::Succeeded`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }

    /// Outcome for a finished process's exit status.
    pub(crate) fn from_exit(status: std::process::ExitStatus) -> Self {
        if status.success() {
            Self::Succeeded
        } else {
            Self::Exited {
                code: status.code(),
            }
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Exited { code: Some(code) } => write!(f, "exited with code {code}"),
            Self::Exited { code: None } => write!(f, "killed by signal"),
            Self::SpawnFailed { reason } => write!(f, "spawn failed: {reason}"),
            Self::StreamFailed { reason } => write!(f, "output stream failed: {reason}"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
