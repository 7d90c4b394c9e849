//! Local git plumbing for the marge merge-bot
//!
//! Two halves: [`worktree`] wraps a long-lived clone and the `git` binary
//! behind the [`Repo`] trait; [`trailers`] rewrites commit messages to
//! carry review metadata. Both return typed failures and never decide
//! retry policy themselves.

pub mod error;
pub mod trailers;
pub mod worktree;

pub use error::{GitError, PushRejection, Result};
pub use trailers::{parse_trailers, rewrite_message, Reviewer, TrailerSpec};
pub use worktree::{Identity, Repo, Worktree};
