//! GitLab API client for the marge merge-bot
//!
//! This crate provides a trait-based forge client. The design keeps the
//! transport concerns (deadlines, retry budget, paging, version routing)
//! below the [`ForgeClient`] trait so the merge engine above it never
//! retries based on semantics it doesn't own.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │               ForgeClient trait                  │
//! │  - list_assigned_mrs()                           │
//! │  - get_pipelines_for_mr()                        │
//! │  - accept_mr() / approve_mr() / post_note()      │
//! └─────────────────────────────────────────────────┘
//!                        │
//!        ┌───────────────┴───────────────┐
//!        ▼                               ▼
//! ┌─────────────────┐         ┌─────────────────────┐
//! │  GitLabClient   │         │   test fakes        │
//! │  (reqwest)      │         │   (in-memory)       │
//! └─────────────────┘         └─────────────────────┘
//! ```

pub mod client;
pub mod error;
pub mod gitlab;
pub mod types;

pub use client::ForgeClient;
pub use error::{ClientError, Result};
pub use gitlab::GitLabClient;
pub use types::{
    Approvals, Capabilities, Commit, ForgeVersion, MergeMethod, MergeRequest, MrState, Pipeline,
    PipelineStatus, Project, User, ACCESS_LEVEL_REPORTER,
};
