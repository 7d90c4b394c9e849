//! GitLab API data transfer objects
//!
//! These types are snapshots of forge state at one poll cycle. They are
//! intentionally separate from the bot's domain logic so the client crate
//! stays pure and reusable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How the project lands MRs on the target branch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMethod {
    /// Plain merge commit.
    #[default]
    Merge,
    /// Rebase, then merge commit (semi-linear history).
    #[serde(alias = "semi_linear")]
    RebaseMerge,
    /// Fast-forward only; no merge commits ever.
    #[serde(rename = "ff")]
    FastForward,
}

/// A project the bot is a member of.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Numeric project id.
    pub id: u64,

    /// Full path, e.g. "group/repo".
    pub path_with_namespace: String,

    /// SSH clone URL.
    pub ssh_url_to_repo: String,

    /// Merge method configured on the project.
    #[serde(default)]
    pub merge_method: MergeMethod,

    /// Number of approvals an MR needs before it may merge.
    #[serde(default)]
    pub approvals_before_merge: u32,

    /// Whether a push to the source branch wipes existing approvals.
    #[serde(default)]
    pub reset_approvals_on_push: bool,

    /// Whether the forge refuses merges with open discussions.
    #[serde(default)]
    pub only_allow_merge_if_all_discussions_are_resolved: bool,

    /// Access level the bot holds on this project, when the membership
    /// listing provided one.
    #[serde(default)]
    pub permissions: Option<Permissions>,
}

impl Project {
    /// Effective access level of the bot on this project, 0 when unknown.
    pub fn access_level(&self) -> u32 {
        let p = match &self.permissions {
            Some(p) => p,
            None => return 0,
        };
        let project = p.project_access.as_ref().map(|a| a.access_level);
        let group = p.group_access.as_ref().map(|a| a.access_level);
        project.max(group).unwrap_or(0)
    }
}

/// GitLab's nested permission blob on project listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Permissions {
    pub project_access: Option<Access>,
    pub group_access: Option<Access>,
}

/// One access grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Access {
    pub access_level: u32,
}

/// Minimum access level to browse merge requests.
pub const ACCESS_LEVEL_REPORTER: u32 = 20;

/// A forge user.
///
/// `email` is only populated when the client authenticates with admin
/// credentials; regular tokens see `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub is_admin: bool,
}

/// Lifecycle state of an MR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MrState {
    Opened,
    Closed,
    Merged,
    Locked,
    /// Older forges report reopened MRs distinctly; treat as opened.
    Reopened,
}

impl MrState {
    pub fn is_open(self) -> bool {
        matches!(self, MrState::Opened | MrState::Reopened)
    }
}

/// Snapshot of a merge request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    /// Globally unique id.
    pub id: u64,

    /// Per-project id, the one humans see.
    pub iid: u64,

    /// Project the MR targets.
    pub project_id: u64,

    /// Project holding the source branch (differs for forks).
    #[serde(default)]
    pub source_project_id: Option<u64>,

    pub source_branch: String,
    pub target_branch: String,

    /// Current head sha of the source branch.
    #[serde(default)]
    pub sha: Option<String>,

    pub title: String,

    #[serde(default)]
    pub description: Option<String>,

    pub author: User,

    /// Multi-assignee forges populate this; single-assignee ones fill
    /// `assignee` instead and we merge the two on access.
    #[serde(default)]
    pub assignees: Vec<User>,

    #[serde(default)]
    pub assignee: Option<User>,

    pub state: MrState,

    #[serde(default)]
    pub work_in_progress: bool,

    /// Whether the forge will squash on merge.
    #[serde(default)]
    pub squash: bool,

    #[serde(default)]
    pub blocking_discussions_resolved: Option<bool>,

    pub web_url: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeRequest {
    /// All assignees, whichever field the forge populated.
    pub fn all_assignees(&self) -> Vec<&User> {
        if !self.assignees.is_empty() {
            self.assignees.iter().collect()
        } else {
            self.assignee.iter().collect()
        }
    }

    /// Whether the given user is currently assigned.
    pub fn is_assigned_to(&self, user_id: u64) -> bool {
        self.all_assignees().iter().any(|u| u.id == user_id)
    }
}

/// Approval state of an MR, fetched from the approvals endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Approvals {
    /// Approvals still missing before the MR may merge.
    #[serde(default)]
    pub approvals_left: u32,

    #[serde(default)]
    pub approved_by: Vec<ApprovalEntry>,
}

/// One approver, as nested by the forge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalEntry {
    pub user: User,
}

impl Approvals {
    pub fn is_sufficient(&self) -> bool {
        self.approvals_left == 0
    }

    pub fn approvers(&self) -> impl Iterator<Item = &User> {
        self.approved_by.iter().map(|e| &e.user)
    }
}

/// CI execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Created,
    #[serde(alias = "waiting_for_resource", alias = "preparing")]
    Pending,
    Running,
    Success,
    Failed,
    Canceled,
    Skipped,
    Manual,
    Scheduled,
}

impl PipelineStatus {
    /// Terminal states the worker treats as "CI accepted this sha".
    ///
    /// `skipped` counts: CI was intentionally not run.
    pub fn is_green(self) -> bool {
        matches!(self, PipelineStatus::Success | PipelineStatus::Skipped)
    }

    /// Terminal states that kill the candidate.
    pub fn is_red(self) -> bool {
        matches!(self, PipelineStatus::Failed | PipelineStatus::Canceled)
    }
}

/// A CI pipeline record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: u64,

    /// Commit the pipeline ran on.
    pub sha: String,

    /// Ref the pipeline was triggered for (the source branch, for MRs).
    #[serde(rename = "ref")]
    pub ref_name: String,

    pub status: PipelineStatus,

    #[serde(default)]
    pub web_url: Option<String>,
}

/// A single commit, as returned by the commits endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commit {
    pub id: String,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub committer_email: Option<String>,
    pub message: String,
}

/// Parsed forge version, e.g. "13.2.3-ee" -> (13, 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ForgeVersion {
    pub major: u32,
    pub minor: u32,
}

impl ForgeVersion {
    /// Parse the `version` field of `GET /version`.
    ///
    /// Suffixes like "-ee" or "-rc1" are ignored; anything without two
    /// leading numeric components is rejected.
    pub fn parse(raw: &str) -> Option<ForgeVersion> {
        let mut parts = raw.split('.');
        let major = parts.next()?.parse().ok()?;
        let minor_raw = parts.next()?;
        let minor = minor_raw
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()?;
        Some(ForgeVersion { major, minor })
    }

    pub fn at_least(self, major: u32, minor: u32) -> bool {
        (self.major, self.minor) >= (major, minor)
    }
}

/// What this forge version can do.
///
/// Detected once at client construction; all version-dependent endpoints
/// route through this instead of probing attributes at call time.
#[derive(Debug, Clone, Copy)]
pub struct Capabilities {
    /// MR-indexed pipeline lookup exists (>= 10.5); otherwise pipelines
    /// are found by branch ref.
    pub supports_mr_pipelines_endpoint: bool,

    /// `squash` may be passed to the accept endpoint (>= 10.7).
    pub supports_squash: bool,

    /// The `locked` MR state exists (>= 9.0).
    pub supports_locked_state: bool,
}

impl Capabilities {
    pub fn for_version(v: ForgeVersion) -> Capabilities {
        Capabilities {
            supports_mr_pipelines_endpoint: v.at_least(10, 5),
            supports_squash: v.at_least(10, 7),
            supports_locked_state: v.at_least(9, 0),
        }
    }
}
