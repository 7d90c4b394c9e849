//! The per-project merge state machine
//!
//! One worker serialises landings onto one (project, target branch) pair.
//! Each candidate walks PREPARE -> PUSH -> REAPPROVE -> AWAIT_CI ->
//! FINALISE; transient races (the target moving, someone pushing over us,
//! sha-mismatch on accept) restart the walk from PREPARE, terminal
//! failures post a note and unassign the bot so a human knows to act.

use crate::batch::{BatchPlan, BatchPlanner};
use crate::embargo::IntervalUnion;
use crate::view::{sort_candidates, MrView};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use marge_client::{
    Approvals, ClientError, ForgeClient, MergeRequest, MrState, Project, User,
};
use marge_config::{BotConfig, CandidateOrder};
use marge_git::{GitError, PushRejection, Repo, Reviewer, TrailerSpec};
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Semantic restarts per candidate before the worker gives up.
const MAX_SEMANTIC_ATTEMPTS: u32 = 6;

/// Bounded retries when the forge reports the MR as locked.
const MAX_LOCKED_RETRIES: u32 = 3;

/// Idle pulses before a worker retires itself; the coordinator respawns
/// it when assigned MRs reappear.
const IDLE_PULSES_BEFORE_RETIRE: u32 = 5;

/// Knobs the worker needs, distilled from [`BotConfig`].
#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub add_reviewers: bool,
    pub add_tested: bool,
    pub add_part_of: bool,
    pub impersonate_approvers: bool,
    pub approval_reset_timeout: Option<Duration>,
    pub ci_timeout: Duration,
    pub idle_sleep: Duration,
    pub busy_sleep: Duration,
    pub use_merge_strategy: bool,
    pub batch: bool,
    pub batch_max_size: usize,
    pub ordering: CandidateOrder,
}

impl MergeOptions {
    pub fn from_config(cfg: &BotConfig) -> MergeOptions {
        MergeOptions {
            add_reviewers: cfg.add_reviewers,
            add_tested: cfg.add_tested,
            add_part_of: cfg.add_part_of,
            impersonate_approvers: cfg.impersonate_approvers,
            approval_reset_timeout: cfg.approval_reset_timeout,
            ci_timeout: cfg.ci_timeout,
            idle_sleep: cfg.idle_sleep,
            busy_sleep: cfg.busy_sleep,
            use_merge_strategy: cfg.use_merge_strategy,
            batch: cfg.batch,
            batch_max_size: cfg.batch_max_size,
            ordering: cfg.ordering,
        }
    }
}

/// What one poll cycle did.
#[derive(Debug, PartialEq, Eq)]
pub enum Pulse {
    /// Nothing assigned; the caller may sleep the long sleep.
    Idle,
    /// A candidate (or embargo wait) was processed.
    Worked,
}

/// Result of one full pass over a single candidate.
#[derive(Debug, PartialEq, Eq)]
enum Attempt {
    Merged,
    /// State went stale under us; take it from PREPARE again.
    Restart,
    /// A note was posted and the bot unassigned; move on.
    Terminal,
    /// Shutdown requested; leave the MR untouched.
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
enum CiWait {
    Green,
    Restart,
    Failed { status: String, url: Option<String> },
    TimedOut,
    ExternallyMerged,
    ExternallyClosed,
    Aborted,
}

#[derive(Debug, PartialEq, Eq)]
enum BatchOutcome {
    Done,
    /// The batch could not proceed as a unit; run members singly.
    Fallback,
}

/// The merge state machine for one (project, target branch) pair.
pub struct ProjectWorker {
    forge: Arc<dyn ForgeClient>,
    repo: Arc<dyn Repo>,
    project: Project,
    target_branch: String,
    bot: User,
    options: MergeOptions,
    branch_re: Regex,
    embargo: IntervalUnion,
    shutdown: watch::Receiver<bool>,
    clock: fn() -> DateTime<Utc>,
}

impl ProjectWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        repo: Arc<dyn Repo>,
        project: Project,
        target_branch: String,
        bot: User,
        options: MergeOptions,
        branch_re: Regex,
        embargo: IntervalUnion,
        shutdown: watch::Receiver<bool>,
    ) -> ProjectWorker {
        ProjectWorker {
            forge,
            repo,
            project,
            target_branch,
            bot,
            options,
            branch_re,
            embargo,
            shutdown,
            clock: Utc::now,
        }
    }

    /// Swap the wall clock out; embargo tests steer time with this.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> ProjectWorker {
        self.clock = clock;
        self
    }

    /// Run until shutdown, project loss, or a long idle streak.
    pub async fn run(mut self) {
        info!(
            "Worker up for {} -> {}",
            self.project.path_with_namespace, self.target_branch
        );
        let mut idle_streak = 0;
        loop {
            if self.shutting_down() {
                break;
            }
            match self.pulse().await {
                Ok(Pulse::Worked) => idle_streak = 0,
                Ok(Pulse::Idle) => {
                    idle_streak += 1;
                    if idle_streak >= IDLE_PULSES_BEFORE_RETIRE {
                        info!(
                            "Nothing to merge in {} -> {}; retiring",
                            self.project.path_with_namespace, self.target_branch
                        );
                        break;
                    }
                    let idle = self.options.idle_sleep;
                    self.sleep_checked(idle).await;
                }
                Err(e) => {
                    if is_project_terminal(&e) {
                        warn!(
                            "Lost access to {}; retiring worker: {e:#}",
                            self.project.path_with_namespace
                        );
                        break;
                    }
                    warn!("Worker iteration failed (will retry): {e:#}");
                    let idle = self.options.idle_sleep;
                    self.sleep_checked(idle).await;
                }
            }
        }
        info!(
            "Worker down for {} -> {}",
            self.project.path_with_namespace, self.target_branch
        );
    }

    /// One poll cycle: honour the embargo, pick candidates, run the plan.
    pub async fn pulse(&mut self) -> Result<Pulse> {
        let now = (self.clock)();
        if self.embargo.covers(now) {
            let wait = self.embargo.wait_until_clear(now);
            info!("Inside merge embargo; holding for {wait:?}");
            self.sleep_checked(wait).await;
            return Ok(Pulse::Worked);
        }

        let queue = self.candidates().await?;
        if queue.is_empty() {
            return Ok(Pulse::Idle);
        }
        info!(
            "{} candidate(s) for {} -> {}",
            queue.len(),
            self.project.path_with_namespace,
            self.target_branch
        );

        let planner = BatchPlanner::new(self.options.batch, self.options.batch_max_size);
        let plan = match planner.plan(&queue) {
            Some(plan) => plan,
            None => return Ok(Pulse::Idle),
        };

        if plan.is_batch() {
            match self.execute_batch(&plan).await? {
                BatchOutcome::Done => return Ok(Pulse::Worked),
                BatchOutcome::Fallback => {
                    info!("Batch could not land as a unit; running members singly");
                    for &iid in &plan.iids {
                        if self.shutting_down() {
                            break;
                        }
                        self.execute_single(iid).await?;
                    }
                    return Ok(Pulse::Worked);
                }
            }
        }

        self.execute_single(plan.iids[0]).await?;
        Ok(Pulse::Worked)
    }

    fn shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn sleep_checked(&mut self, dur: Duration) {
        let mut rx = self.shutdown.clone();
        tokio::select! {
            _ = tokio::time::sleep(dur) => {}
            _ = rx.changed() => {}
        }
    }

    fn rewriting(&self) -> bool {
        self.options.add_reviewers || self.options.add_tested || self.options.add_part_of
    }

    /// Assigned, open, filtered and ordered MRs for this target branch.
    async fn candidates(&self) -> Result<Vec<MrView>> {
        let mrs = self
            .forge
            .list_assigned_mrs(self.project.id, self.bot.id)
            .await?;

        let mut views = Vec::new();
        for mr in mrs {
            if mr.target_branch != self.target_branch {
                continue;
            }
            let iid = mr.iid;
            let approvals = self.forge.get_approvals(self.project.id, iid).await?;
            let mut view = MrView::new(mr, approvals, self.project.clone());
            if let Some(sha) = view.mr.sha.clone() {
                if let Ok(commit) = self.forge.get_commit(self.project.id, &sha).await {
                    view = view.with_tip_commit(commit);
                }
            }
            match view.reject_reason(&self.bot, &self.branch_re, self.rewriting()) {
                Some(reason) => debug!("Skipping MR !{iid}: {reason}"),
                None => views.push(view),
            }
        }
        sort_candidates(&mut views, self.options.ordering);
        Ok(views)
    }

    /// Post the abort note and take the bot off the assignee list.
    ///
    /// Other assignees are left in place; only the bot's own claim is
    /// withdrawn.
    async fn give_up(&self, mr: &MergeRequest, sha: &str, reason: &str) -> Result<()> {
        warn!("Giving up on MR !{}: {reason}", mr.iid);
        let note = format!("I couldn't merge this branch: {reason} (sha: {sha})");
        self.forge
            .post_note(self.project.id, mr.iid, &note)
            .await?;
        let remaining: Vec<u64> = mr
            .all_assignees()
            .iter()
            .map(|u| u.id)
            .filter(|&id| id != self.bot.id)
            .collect();
        self.forge
            .set_assignees(self.project.id, mr.iid, &remaining)
            .await?;
        Ok(())
    }

    /// Resolve approvers into trailers, or a terminal reason.
    async fn trailer_spec(
        &self,
        mr: &MergeRequest,
        approvals: &Approvals,
    ) -> Result<std::result::Result<TrailerSpec, String>> {
        let mut spec = TrailerSpec::default();
        if self.options.add_reviewers {
            for approver in approvals.approvers() {
                let email = match &approver.email {
                    Some(email) => Some(email.clone()),
                    // The listing may omit emails even for admins; a
                    // direct user lookup is authoritative.
                    None => self
                        .forge
                        .fetch_user_by_username(&approver.username)
                        .await?
                        .email,
                };
                match Reviewer::try_new(&approver.name, &approver.username, email.as_deref()) {
                    Ok(reviewer) => spec.reviewers.push(reviewer),
                    Err(GitError::MissingEmail { username }) => {
                        return Ok(Err(format!(
                            "I can't find an email address for approver {username}; \
                             adding Reviewed-by trailers needs admin credentials"
                        )));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        if self.options.add_tested {
            spec.tested_by = Some(format!("{} <{}>", self.bot.username, mr.web_url));
        }
        if self.options.add_part_of {
            spec.part_of = Some(mr.web_url.clone());
        }
        Ok(Ok(spec))
    }

    async fn rewrite(
        &self,
        onto: &str,
        source_branch: &str,
        trailers: &TrailerSpec,
    ) -> std::result::Result<String, GitError> {
        if self.options.use_merge_strategy {
            self.repo.merge_onto(onto, source_branch, trailers).await
        } else {
            self.repo.rebase_onto(onto, source_branch, trailers).await
        }
    }

    /// Drive one candidate to a conclusion, restarting from PREPARE on
    /// stale state, bounded by [`MAX_SEMANTIC_ATTEMPTS`].
    async fn execute_single(&mut self, iid: u64) -> Result<()> {
        let mut attempts = 0;
        loop {
            if self.shutting_down() {
                return Ok(());
            }
            attempts += 1;
            if attempts > MAX_SEMANTIC_ATTEMPTS {
                let mr = self.forge.get_mr(self.project.id, iid).await?;
                let sha = mr.sha.clone().unwrap_or_default();
                self.give_up(
                    &mr,
                    &sha,
                    "the state kept changing under me; giving up after repeated attempts",
                )
                .await?;
                return Ok(());
            }
            match self.attempt(iid).await? {
                Attempt::Restart => {
                    debug!("MR !{iid}: restarting from PREPARE");
                    continue;
                }
                Attempt::Merged | Attempt::Terminal | Attempt::Aborted => return Ok(()),
            }
        }
    }

    /// One pass: PREPARE -> PUSH -> REAPPROVE -> AWAIT_CI -> FINALISE.
    async fn attempt(&mut self, iid: u64) -> Result<Attempt> {
        // PREPARE
        let mr = self.forge.get_mr(self.project.id, iid).await?;
        match mr.state {
            MrState::Merged => return Ok(Attempt::Merged),
            MrState::Closed => {
                // Nothing to do and nobody to tell; whoever closed it knows.
                info!("MR !{iid} was closed; dropping it");
                return Ok(Attempt::Terminal);
            }
            MrState::Locked => return Ok(Attempt::Restart),
            MrState::Opened | MrState::Reopened => {}
        }
        let mr_sha = mr.sha.clone().unwrap_or_default();
        if mr.work_in_progress {
            self.give_up(&mr, &mr_sha, "someone marked this as Work-In-Progress")
                .await?;
            return Ok(Attempt::Terminal);
        }

        let approvals = self.forge.get_approvals(self.project.id, iid).await?;
        let trailers = match self.trailer_spec(&mr, &approvals).await? {
            Ok(spec) => spec,
            Err(reason) => {
                self.give_up(&mr, &mr_sha, &reason).await?;
                return Ok(Attempt::Terminal);
            }
        };

        self.repo.fetch().await.context("fetching from origin")?;
        let target_sha = self
            .repo
            .remote_branch_sha(&self.target_branch)
            .await
            .context("resolving target branch")?;

        let tip = match self.rewrite(&target_sha, &mr.source_branch, &trailers).await {
            Ok(tip) => tip,
            Err(GitError::EmptyDiff) => {
                self.give_up(
                    &mr,
                    &mr_sha,
                    &format!("these changes already exist in branch `{}`", self.target_branch),
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
            Err(GitError::RebaseConflict { diagnostic }) => {
                self.give_up(
                    &mr,
                    &mr_sha,
                    &format!(
                        "it does not rebase cleanly onto `{}`:\n\n```\n{diagnostic}\n```",
                        self.target_branch
                    ),
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
            Err(GitError::HookRejected) => {
                self.give_up(&mr, &mr_sha, "a local git hook rejected the rewritten commits")
                    .await?;
                return Ok(Attempt::Terminal);
            }
            Err(e) => return Err(e).context("rebasing the source branch"),
        };

        // PUSH
        if self.shutting_down() {
            return Ok(Attempt::Aborted);
        }
        match self.repo.push(&tip, &mr.source_branch).await {
            Ok(()) => {}
            Err(GitError::PushRejected {
                reason: PushRejection::Stale,
            }) => return Ok(Attempt::Restart),
            Err(GitError::PushRejected {
                reason: PushRejection::Protected,
            }) => {
                self.give_up(
                    &mr,
                    &tip,
                    "I can't push rewritten changes to a protected source branch",
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
            Err(GitError::PushRejected {
                reason: PushRejection::Hook,
            }) => {
                self.give_up(&mr, &tip, "a server-side hook rejected my push")
                    .await?;
                return Ok(Attempt::Terminal);
            }
            Err(e) => return Err(e).context("pushing the rewritten branch"),
        }

        // REAPPROVE
        if self.project.reset_approvals_on_push && self.options.impersonate_approvers {
            if !self.reapprove(&mr, &approvals, &tip).await? {
                self.give_up(
                    &mr,
                    &tip,
                    "approvals did not re-settle after my push within the configured timeout",
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
        }

        // AWAIT_CI
        match self.await_ci(&mr, &tip, &target_sha).await? {
            CiWait::Green => {}
            CiWait::Restart => return Ok(Attempt::Restart),
            CiWait::Failed { status, url } => {
                let suffix = url.map(|u| format!(": {u}")).unwrap_or_default();
                self.give_up(&mr, &tip, &format!("CI {status} on {tip}{suffix}"))
                    .await?;
                return Ok(Attempt::Terminal);
            }
            CiWait::TimedOut => {
                self.give_up(
                    &mr,
                    &tip,
                    &format!(
                        "CI is taking too long (over {:?}); giving up on this run",
                        self.options.ci_timeout
                    ),
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
            CiWait::ExternallyMerged => return Ok(Attempt::Merged),
            CiWait::ExternallyClosed => {
                self.give_up(
                    &mr,
                    &tip,
                    "someone closed the merge request while I was waiting for CI",
                )
                .await?;
                return Ok(Attempt::Terminal);
            }
            CiWait::Aborted => return Ok(Attempt::Aborted),
        }

        // FINALISE
        self.finalise(&mr, &tip).await
    }

    /// Re-approve as each prior approver (admin impersonation) and, when
    /// a timeout is configured, wait for the approval set to re-settle.
    /// Returns false when the timeout expired with approvals missing.
    async fn reapprove(
        &mut self,
        mr: &MergeRequest,
        approvals: &Approvals,
        tip: &str,
    ) -> Result<bool> {
        info!("Re-approving MR !{} after my push", mr.iid);
        for approver in approvals.approvers() {
            if let Err(e) = self
                .forge
                .approve_mr(self.project.id, mr.iid, tip, Some(&approver.username))
                .await
            {
                // The forge's own approval gate will still arbitrate at
                // accept time.
                warn!(
                    "Couldn't impersonate {} to re-approve MR !{}: {e}",
                    approver.username, mr.iid
                );
            }
        }

        let Some(timeout) = self.options.approval_reset_timeout else {
            return Ok(true);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.forge.get_approvals(self.project.id, mr.iid).await?;
            if current.is_sufficient() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            debug!("Approvals haven't re-settled yet; sleeping");
            let nap = self.options.busy_sleep;
            self.sleep_checked(nap).await;
            if self.shutting_down() {
                return Ok(true);
            }
        }
    }

    /// Poll until the pipeline for the pushed sha concludes, the state
    /// goes stale, or the CI timeout expires.
    async fn await_ci(&mut self, mr: &MergeRequest, tip: &str, target_sha: &str) -> Result<CiWait> {
        let deadline = Instant::now() + self.options.ci_timeout;
        loop {
            if self.shutting_down() {
                return Ok(CiWait::Aborted);
            }
            if Instant::now() >= deadline {
                return Ok(CiWait::TimedOut);
            }

            let fresh = self.forge.get_mr(self.project.id, mr.iid).await?;
            match fresh.state {
                MrState::Merged => return Ok(CiWait::ExternallyMerged),
                MrState::Closed => return Ok(CiWait::ExternallyClosed),
                _ => {}
            }
            // Someone pushed over our rewritten branch.
            if fresh.sha.as_deref() != Some(tip) {
                info!("MR !{} moved to a new sha while waiting for CI", mr.iid);
                return Ok(CiWait::Restart);
            }
            // The target advanced; the rebase is stale by definition.
            let target_now = self
                .forge
                .get_branch_sha(self.project.id, &self.target_branch)
                .await?;
            if target_now != target_sha {
                info!(
                    "Target {} advanced under MR !{}; re-preparing",
                    self.target_branch, mr.iid
                );
                return Ok(CiWait::Restart);
            }

            let pipelines = self.forge.get_pipelines_for_mr(&fresh).await?;
            let pipeline = pipelines
                .iter()
                .find(|p| p.sha == tip && p.ref_name == mr.source_branch);
            if let Some(p) = pipeline {
                if p.status.is_green() {
                    return Ok(CiWait::Green);
                }
                if p.status.is_red() {
                    return Ok(CiWait::Failed {
                        status: format!("{:?}", p.status).to_lowercase(),
                        url: p.web_url.clone(),
                    });
                }
                debug!("Pipeline for {tip} is {:?}; waiting", p.status);
            } else {
                debug!("No pipeline for {tip} yet; waiting");
            }
            let nap = self.options.busy_sleep;
            self.sleep_checked(nap).await;
        }
    }

    /// Accept the merge with the pushed sha pinned, disambiguating the
    /// forge's refusals the way the API actually behaves.
    async fn finalise(&mut self, mr: &MergeRequest, tip: &str) -> Result<Attempt> {
        let mut locked_retries = 0;
        loop {
            if self.shutting_down() && locked_retries > 0 {
                // An in-flight finalise may complete, but we stop
                // stretching it with further locked retries.
                return Ok(Attempt::Aborted);
            }
            match self
                .forge
                .accept_mr(self.project.id, mr.iid, tip, true, mr.squash)
                .await
            {
                Ok(_) => {
                    info!(
                        "MR !{} merged into {} at {tip}",
                        mr.iid, self.target_branch
                    );
                    return Ok(Attempt::Merged);
                }
                Err(ClientError::MethodNotAllowed) => {
                    // 405 covers several distinct situations; a re-read
                    // tells them apart.
                    let fresh = self.forge.get_mr(self.project.id, mr.iid).await?;
                    if fresh.state == MrState::Merged {
                        return Ok(Attempt::Merged);
                    }
                    if fresh.state == MrState::Closed {
                        self.give_up(
                            mr,
                            tip,
                            "someone closed the merge request while I was attempting to merge it",
                        )
                        .await?;
                        return Ok(Attempt::Terminal);
                    }
                    if fresh.work_in_progress {
                        self.give_up(
                            mr,
                            tip,
                            "the request was marked as Work-In-Progress as I was processing it",
                        )
                        .await?;
                        return Ok(Attempt::Terminal);
                    }
                    if self.project.only_allow_merge_if_all_discussions_are_resolved
                        && fresh.blocking_discussions_resolved == Some(false)
                    {
                        self.give_up(
                            mr,
                            tip,
                            "the forge refused the merge; resolve the open discussions first",
                        )
                        .await?;
                        return Ok(Attempt::Terminal);
                    }
                    // Not-mergeable for reasons we can't see; the usual
                    // culprit is the target moving. Take it from the top.
                    return Ok(Attempt::Restart);
                }
                Err(ClientError::NotAcceptable) | Err(ClientError::Conflict) => {
                    debug!("Accept of MR !{} refused (stale state); re-preparing", mr.iid);
                    return Ok(Attempt::Restart);
                }
                Err(ClientError::Unprocessable { reason }) => {
                    debug!("Accept of MR !{} unprocessable ({reason}); re-preparing", mr.iid);
                    return Ok(Attempt::Restart);
                }
                Err(ClientError::Locked) => {
                    locked_retries += 1;
                    if locked_retries > MAX_LOCKED_RETRIES {
                        self.give_up(mr, tip, "the merge request is stuck in a locked state")
                            .await?;
                        return Ok(Attempt::Terminal);
                    }
                    debug!("MR !{} is locked; retrying finalise shortly", mr.iid);
                    let nap = self.options.busy_sleep;
                    self.sleep_checked(nap).await;
                }
                Err(ClientError::NotFound) => {
                    // Race: someone else merged and the branch vanished.
                    let fresh = self.forge.get_mr(self.project.id, mr.iid).await?;
                    if fresh.state == MrState::Merged {
                        return Ok(Attempt::Merged);
                    }
                    self.give_up(mr, tip, "the source branch vanished before I could merge")
                        .await?;
                    return Ok(Attempt::Terminal);
                }
                Err(e) => return Err(e).context("accepting the merge"),
            }
        }
    }

    /// Rebase the whole plan into one chain, test the combined tip once,
    /// then finalise the members in order.
    async fn execute_batch(&mut self, plan: &BatchPlan) -> Result<BatchOutcome> {
        info!(
            "Attempting batch of {} onto {}",
            plan.iids.len(),
            self.target_branch
        );
        self.repo.fetch().await.context("fetching from origin")?;
        let target_sha = self
            .repo
            .remote_branch_sha(&self.target_branch)
            .await
            .context("resolving target branch")?;

        // PREPARE: chain each member's rebase onto the previous tip.
        let mut members: Vec<(MergeRequest, String)> = Vec::new();
        for &iid in &plan.iids {
            if self.shutting_down() {
                return Ok(BatchOutcome::Done);
            }
            let mr = self.forge.get_mr(self.project.id, iid).await?;
            if !mr.state.is_open() || mr.work_in_progress {
                if members.is_empty() {
                    return Ok(BatchOutcome::Fallback);
                }
                break;
            }
            let approvals = self.forge.get_approvals(self.project.id, iid).await?;
            let trailers = match self.trailer_spec(&mr, &approvals).await? {
                Ok(spec) => spec,
                Err(_) => return Ok(BatchOutcome::Fallback),
            };
            let onto = members
                .last()
                .map(|(_, tip)| tip.clone())
                .unwrap_or_else(|| target_sha.clone());
            match self.repo.rebase_onto(&onto, &mr.source_branch, &trailers).await {
                Ok(tip) => {
                    members.push((mr, tip));
                }
                Err(GitError::RebaseConflict { .. }) | Err(GitError::EmptyDiff) => {
                    // Shrink the batch at the first member that doesn't
                    // chain cleanly; the single path will report it.
                    if members.is_empty() {
                        return Ok(BatchOutcome::Fallback);
                    }
                    break;
                }
                Err(GitError::HookRejected) => return Ok(BatchOutcome::Fallback),
                Err(e) => return Err(e).context("rebasing a batch member"),
            }
        }
        if members.len() < 2 {
            return Ok(BatchOutcome::Fallback);
        }

        // PUSH every member's rewritten branch.
        for (mr, tip) in &members {
            if let Err(e) = self.repo.push(tip, &mr.source_branch).await {
                return match e {
                    GitError::PushRejected { .. } => Ok(BatchOutcome::Fallback),
                    other => Err(other).context("pushing a batch member"),
                };
            }
        }

        // REAPPROVE each member.
        if self.project.reset_approvals_on_push && self.options.impersonate_approvers {
            let snapshot = members.clone();
            for (mr, tip) in &snapshot {
                let approvals = self.forge.get_approvals(self.project.id, mr.iid).await?;
                self.reapprove(mr, &approvals, tip).await?;
            }
        }

        // AWAIT_CI once, on the combined tip.
        let Some((last_mr, last_tip)) = members.last().cloned() else {
            return Ok(BatchOutcome::Fallback);
        };
        match self.await_ci(&last_mr, &last_tip, &target_sha).await? {
            CiWait::Green => {}
            CiWait::Aborted => return Ok(BatchOutcome::Done),
            outcome => {
                debug!("Batch CI wait ended with {outcome:?}; falling back");
                return Ok(BatchOutcome::Fallback);
            }
        }

        // FINALISE in order; a refused accept retries that member alone
        // against whatever tip the earlier merges produced.
        for (mr, tip) in &members {
            if self.shutting_down() {
                return Ok(BatchOutcome::Done);
            }
            match self.finalise(mr, tip).await? {
                Attempt::Merged | Attempt::Terminal => {}
                Attempt::Restart => self.execute_single(mr.iid).await?,
                Attempt::Aborted => return Ok(BatchOutcome::Done),
            }
        }
        Ok(BatchOutcome::Done)
    }
}

/// Errors after which the worker should retire rather than retry.
fn is_project_terminal(e: &anyhow::Error) -> bool {
    matches!(
        e.downcast_ref::<ClientError>(),
        Some(ClientError::Unauthorised) | Some(ClientError::Forbidden)
    )
}
