//! Read-only projection of an MR's forge state
//!
//! Built once per poll cycle and discarded. Bundles the MR snapshot with
//! its approvals, the owning project, and (when known) the tip commit, and
//! answers the predicates the worker's candidate selection needs.

use marge_client::{Approvals, Commit, MergeRequest, MrState, Project, User};
use regex::Regex;

/// One candidate MR, as seen at the start of an iteration.
#[derive(Debug, Clone)]
pub struct MrView {
    pub mr: MergeRequest,
    pub approvals: Approvals,
    pub project: Project,
    /// Tip commit of the source branch, when the worker fetched it.
    pub tip_commit: Option<Commit>,
}

impl MrView {
    pub fn new(mr: MergeRequest, approvals: Approvals, project: Project) -> MrView {
        MrView {
            mr,
            approvals,
            project,
            tip_commit: None,
        }
    }

    pub fn with_tip_commit(mut self, commit: Commit) -> MrView {
        self.tip_commit = Some(commit);
        self
    }

    /// Whether the bot currently sits in the assignee set. Works for
    /// single- and multi-assignee forges.
    pub fn is_assigned_to(&self, user: &User) -> bool {
        self.mr.is_assigned_to(user.id)
    }

    /// Approval check with the reviewer-not-author guard: the threshold
    /// must be met by approvers who are neither the MR author nor the
    /// committer of the tip commit.
    pub fn is_approved(&self) -> bool {
        let effective = self.effective_approvers().count();
        self.approvals.is_sufficient()
            && effective >= self.project.approvals_before_merge as usize
    }

    /// Approvers excluding the author and the tip committer.
    pub fn effective_approvers(&self) -> impl Iterator<Item = &User> {
        let author_id = self.mr.author.id;
        let committer_email = self
            .tip_commit
            .as_ref()
            .and_then(|c| c.committer_email.clone());
        self.approvals.approvers().filter(move |u| {
            if u.id == author_id {
                return false;
            }
            match (&u.email, &committer_email) {
                (Some(a), Some(c)) => a != c,
                _ => true,
            }
        })
    }

    pub fn source_branch_matches(&self, re: &Regex) -> bool {
        re.is_match(&self.mr.source_branch)
    }

    pub fn target_branch_matches(&self, re: &Regex) -> bool {
        re.is_match(&self.mr.target_branch)
    }

    /// Guard against MRs whose source is the target itself; rebasing a
    /// branch onto itself would "succeed" vacuously.
    pub fn is_trivial_source_branch(&self) -> bool {
        self.mr.source_branch == self.mr.target_branch
    }

    /// Why this MR cannot be a candidate right now, or `None` when it can.
    ///
    /// `rewriting` is true when trailer injection is configured; the forge
    /// squashing such an MR afterwards would destroy the trailers, so we
    /// refuse up front.
    pub fn reject_reason(&self, bot: &User, branch_re: &Regex, rewriting: bool) -> Option<String> {
        if self.mr.state == MrState::Locked {
            return Some("the MR is locked".to_string());
        }
        if !self.mr.state.is_open() {
            return Some(format!("state is {:?}", self.mr.state));
        }
        if self.mr.work_in_progress {
            return Some("marked as Work-In-Progress".to_string());
        }
        if !self.is_assigned_to(bot) {
            return Some("not assigned to me".to_string());
        }
        if self.is_trivial_source_branch() {
            return Some("source branch is the target branch".to_string());
        }
        if !self.source_branch_matches(branch_re) {
            return Some("source branch excluded by branch-regexp".to_string());
        }
        if self.project.only_allow_merge_if_all_discussions_are_resolved
            && self.mr.blocking_discussions_resolved == Some(false)
        {
            return Some("unresolved discussions".to_string());
        }
        if rewriting && self.mr.squash {
            return Some("auto-squash would ruin the commit tagging".to_string());
        }
        if !self.is_approved() {
            return Some("not approved to the required threshold".to_string());
        }
        None
    }
}

/// Order candidates by the configured policy.
pub fn sort_candidates(views: &mut [MrView], order: marge_config::CandidateOrder) {
    match order {
        marge_config::CandidateOrder::OldestCreated => {
            views.sort_by_key(|v| v.mr.created_at);
        }
        marge_config::CandidateOrder::OldestUpdated => {
            views.sort_by_key(|v| v.mr.updated_at);
        }
    }
}
