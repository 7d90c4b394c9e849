//! Batch planning
//!
//! Decides how many candidates from the head of the ordered queue are
//! rebased and tested as one unit. Conflict-driven shrinking happens in
//! the worker, where the rebase actually runs; the planner only sizes
//! the prefix.

use crate::view::MrView;
use marge_client::MergeMethod;

/// Sizes merge-train prefixes.
#[derive(Debug, Clone, Copy)]
pub struct BatchPlanner {
    enabled: bool,
    max_size: usize,
}

/// An ordered prefix of the candidate queue, merged as a unit.
///
/// A plan of size 1 is always legal and is what a disabled planner
/// produces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchPlan {
    pub iids: Vec<u64>,
}

impl BatchPlan {
    pub fn is_batch(&self) -> bool {
        self.iids.len() > 1
    }
}

impl BatchPlanner {
    pub fn new(enabled: bool, max_size: usize) -> BatchPlanner {
        BatchPlanner {
            enabled,
            max_size: max_size.max(1),
        }
    }

    /// Plan the next run from the ordered candidate queue.
    ///
    /// Fast-forward-only projects cannot tolerate one batch member
    /// rewriting history under another, so the prefix stops before any
    /// candidate whose project requires fast-forward, unless it is the
    /// head itself.
    pub fn plan(&self, queue: &[MrView]) -> Option<BatchPlan> {
        if queue.is_empty() {
            return None;
        }
        if !self.enabled {
            return Some(BatchPlan {
                iids: vec![queue[0].mr.iid],
            });
        }

        let mut iids = Vec::new();
        for view in queue.iter().take(self.max_size) {
            let ff_only = view.project.merge_method == MergeMethod::FastForward;
            if ff_only && !iids.is_empty() {
                break;
            }
            iids.push(view.mr.iid);
        }
        Some(BatchPlan { iids })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::MrView;
    use chrono::{TimeZone, Utc};
    use marge_client::{Approvals, MergeRequest, MrState, Project, User};

    fn view(iid: u64, merge_method: MergeMethod) -> MrView {
        let user = User {
            id: 2,
            name: "A".into(),
            username: "a".into(),
            email: None,
            is_admin: false,
        };
        let mr = MergeRequest {
            id: iid,
            iid,
            project_id: 1,
            source_project_id: Some(1),
            source_branch: format!("feat/{iid}"),
            target_branch: "main".into(),
            sha: Some("aaaa".into()),
            title: String::new(),
            description: None,
            author: user.clone(),
            assignees: vec![],
            assignee: None,
            state: MrState::Opened,
            work_in_progress: false,
            squash: false,
            blocking_discussions_resolved: None,
            web_url: String::new(),
            created_at: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
            updated_at: Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap(),
        };
        let project: Project = serde_json::from_value(serde_json::json!({
            "id": 1,
            "path_with_namespace": "g/r",
            "ssh_url_to_repo": "git@example.com:g/r.git",
            "merge_method": match merge_method {
                MergeMethod::Merge => "merge",
                MergeMethod::RebaseMerge => "rebase_merge",
                MergeMethod::FastForward => "ff",
            },
        }))
        .unwrap();
        MrView::new(mr, Approvals::default(), project)
    }

    #[test]
    fn test_disabled_planner_yields_singles() {
        let planner = BatchPlanner::new(false, 4);
        let queue = vec![view(7, MergeMethod::Merge), view(8, MergeMethod::Merge)];
        let plan = planner.plan(&queue).unwrap();
        assert_eq!(plan.iids, vec![7]);
        assert!(!plan.is_batch());
    }

    #[test]
    fn test_enabled_planner_takes_bounded_prefix() {
        let planner = BatchPlanner::new(true, 2);
        let queue = vec![
            view(7, MergeMethod::Merge),
            view(8, MergeMethod::Merge),
            view(9, MergeMethod::Merge),
        ];
        let plan = planner.plan(&queue).unwrap();
        assert_eq!(plan.iids, vec![7, 8]);
        assert!(plan.is_batch());
    }

    #[test]
    fn test_ff_only_member_stops_the_prefix() {
        let planner = BatchPlanner::new(true, 4);
        let queue = vec![
            view(7, MergeMethod::Merge),
            view(8, MergeMethod::FastForward),
            view(9, MergeMethod::Merge),
        ];
        let plan = planner.plan(&queue).unwrap();
        assert_eq!(plan.iids, vec![7]);

        // At the head, an ff-only candidate still merges (batch of one).
        let queue = vec![view(8, MergeMethod::FastForward), view(9, MergeMethod::Merge)];
        let plan = planner.plan(&queue).unwrap();
        assert_eq!(plan.iids, vec![8]);
    }

    #[test]
    fn test_empty_queue_has_no_plan() {
        let planner = BatchPlanner::new(true, 4);
        assert!(planner.plan(&[]).is_none());
    }
}
