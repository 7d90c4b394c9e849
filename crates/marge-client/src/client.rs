//! Forge client trait
//!
//! Defines the interface the merge engine uses to talk to the forge.
//! The production implementation is [`crate::GitLabClient`]; tests swap in
//! in-memory fakes.

use crate::error::Result;
use crate::types::{
    Approvals, Capabilities, Commit, MergeRequest, Pipeline, Project, User,
};
use async_trait::async_trait;

/// Typed access to the forge's HTTP API.
///
/// Implementations must be `Send + Sync` so a single client can be shared
/// across worker tasks behind an `Arc`.
///
/// Every operation carries the client's default 60 second deadline and the
/// transport retry policy described in [`crate::error::ClientError`].
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// Capability set detected from the forge version at construction.
    fn capabilities(&self) -> Capabilities;

    /// The user the auth token belongs to.
    async fn current_user(&self) -> Result<User>;

    /// Look a user up by username.
    ///
    /// With admin credentials the result includes the email address; the
    /// commit rewriter needs that for `Reviewed-by` trailers.
    async fn fetch_user_by_username(&self, username: &str) -> Result<User>;

    /// All projects the current user is a member of.
    async fn list_projects_for_member(&self) -> Result<Vec<Project>>;

    /// A single project by id.
    async fn get_project(&self, project_id: u64) -> Result<Project>;

    /// Open MRs in the project assigned to the given user.
    async fn list_assigned_mrs(&self, project_id: u64, user_id: u64) -> Result<Vec<MergeRequest>>;

    /// A fresh snapshot of one MR.
    async fn get_mr(&self, project_id: u64, iid: u64) -> Result<MergeRequest>;

    /// Current approval state of an MR.
    async fn get_approvals(&self, project_id: u64, iid: u64) -> Result<Approvals>;

    /// Pipelines for the MR's source branch, newest first.
    ///
    /// Routes through the MR-indexed endpoint when the forge supports it
    /// (>= 10.5), otherwise falls back to the branch-ref listing on the
    /// source project.
    async fn get_pipelines_for_mr(&self, mr: &MergeRequest) -> Result<Vec<Pipeline>>;

    /// Head sha of a branch.
    async fn get_branch_sha(&self, project_id: u64, branch: &str) -> Result<String>;

    /// A single commit.
    async fn get_commit(&self, project_id: u64, sha: &str) -> Result<Commit>;

    /// Finalise the merge, pinned to `sha`.
    ///
    /// `squash` is only transmitted when the capability set allows it.
    async fn accept_mr(
        &self,
        project_id: u64,
        iid: u64,
        sha: &str,
        remove_source_branch: bool,
        squash: bool,
    ) -> Result<MergeRequest>;

    /// Approve the MR at `sha`, optionally impersonating another user.
    ///
    /// Impersonation requires admin credentials on the forge.
    async fn approve_mr(
        &self,
        project_id: u64,
        iid: u64,
        sha: &str,
        impersonate: Option<&str>,
    ) -> Result<()>;

    /// Withdraw the current user's approval.
    async fn unapprove_mr(&self, project_id: u64, iid: u64) -> Result<()>;

    /// Clear all approvals on the MR (bot-token privilege).
    async fn reset_approvals(&self, project_id: u64, iid: u64) -> Result<()>;

    /// Post a comment on the MR.
    async fn post_note(&self, project_id: u64, iid: u64, body: &str) -> Result<()>;

    /// Replace the MR's assignee set.
    async fn set_assignees(&self, project_id: u64, iid: u64, assignee_ids: &[u64]) -> Result<()>;
}
