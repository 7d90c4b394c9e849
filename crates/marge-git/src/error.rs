//! Typed failures for git operations
//!
//! The worker maps these onto its retry/abort policy; nothing here retries.

use thiserror::Error;

/// Why the remote refused a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushRejection {
    /// The branch is protected; rewritten commits can never land there.
    Protected,
    /// Our lease was stale: someone pushed while we were rebasing.
    Stale,
    /// A server-side hook declined the commits.
    Hook,
}

/// Error returned by [`crate::Repo`] operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The rebase (or cherry-pick replay) hit a conflict.
    #[error("rebase conflict:\n{diagnostic}")]
    RebaseConflict { diagnostic: String },

    /// Nothing remains after rebasing; the changes already exist on the
    /// target branch.
    #[error("no changes left after rebase")]
    EmptyDiff,

    /// A local hook rejected the rewritten commits.
    #[error("hook rejected the commit")]
    HookRejected,

    /// The remote refused the push.
    #[error("push rejected ({reason:?})")]
    PushRejected { reason: PushRejection },

    /// An approver has no visible email address; trailers cannot be
    /// written without one.
    #[error("no email known for approver {username}")]
    MissingEmail { username: String },

    /// Connection or authentication failure talking to the remote.
    #[error("git network error: {detail}")]
    Network { detail: String },

    /// The configured git timeout elapsed.
    #[error("git operation `{op}` timed out")]
    Timeout { op: String },

    /// Any other non-zero git exit.
    #[error("git {op} failed: {detail}")]
    Failed { op: String, detail: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, GitError>;
