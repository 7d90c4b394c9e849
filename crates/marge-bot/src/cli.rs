//! Command-line surface
//!
//! Every flag has a `MARGE_*` environment equivalent; clap resolves the
//! argv-beats-env precedence, and the result feeds the config merge as
//! one [`Overrides`] layer. The auth token itself never appears here,
//! only the path of the file holding it.

use clap::{ArgAction, Parser};
use marge_config::Overrides;
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(
    name = "marge-bot",
    version,
    about = "An autonomous serialising merge-bot for GitLab"
)]
pub struct Cli {
    /// Config file path (default: ./marge-bot.toml, then ~/.marge-bot.toml).
    #[arg(long, env = "MARGE_CONFIG_FILE")]
    pub config_file: Option<PathBuf>,

    /// Forge instance, e.g. https://gitlab.example.com
    #[arg(long, env = "MARGE_GITLAB_URL")]
    pub gitlab_url: Option<String>,

    /// File containing the API token.
    #[arg(long, env = "MARGE_AUTH_TOKEN_FILE")]
    pub auth_token_file: Option<PathBuf>,

    /// Private SSH key used for clone and push.
    #[arg(long, env = "MARGE_SSH_KEY_FILE")]
    pub ssh_key_file: Option<PathBuf>,

    /// Add Reviewed-by trailers for each approver (requires admin).
    #[arg(long, env = "MARGE_ADD_REVIEWERS", num_args = 0..=1, default_missing_value = "true")]
    pub add_reviewers: Option<bool>,

    /// Add a Tested-by trailer on the tip commit.
    #[arg(long, env = "MARGE_ADD_TESTED", num_args = 0..=1, default_missing_value = "true")]
    pub add_tested: Option<bool>,

    /// Add a Part-of trailer on every commit.
    #[arg(long, env = "MARGE_ADD_PART_OF", num_args = 0..=1, default_missing_value = "true")]
    pub add_part_of: Option<bool>,

    /// Re-approve as prior approvers after a push (requires admin).
    #[arg(long, env = "MARGE_IMPERSONATE_APPROVERS", num_args = 0..=1, default_missing_value = "true")]
    pub impersonate_approvers: Option<bool>,

    /// Max wait for approvals to re-settle after a push, e.g. 30s.
    #[arg(long, env = "MARGE_APPROVAL_RESET_TIMEOUT")]
    pub approval_reset_timeout: Option<String>,

    /// Max wait for CI per candidate, e.g. 15m.
    #[arg(long, env = "MARGE_CI_TIMEOUT")]
    pub ci_timeout: Option<String>,

    /// Max wall time for any git operation, e.g. 2m.
    #[arg(long, env = "MARGE_GIT_TIMEOUT")]
    pub git_timeout: Option<String>,

    /// Merge embargo window, e.g. "Friday 18:00 - Monday 09:00 UTC".
    /// May be given several times.
    #[arg(long, env = "MARGE_EMBARGO", action = ArgAction::Append)]
    pub embargo: Option<Vec<String>>,

    /// Only process projects whose path matches.
    #[arg(long, env = "MARGE_PROJECT_REGEXP")]
    pub project_regexp: Option<String>,

    /// Only process MRs whose source branch matches.
    #[arg(long, env = "MARGE_BRANCH_REGEXP")]
    pub branch_regexp: Option<String>,

    /// Enable the batch merge planner.
    #[arg(long, env = "MARGE_BATCH", num_args = 0..=1, default_missing_value = "true")]
    pub batch: Option<bool>,

    /// Largest batch the planner may form.
    #[arg(long, env = "MARGE_BATCH_MAX_SIZE")]
    pub batch_max_size: Option<usize>,

    /// Use merge commits instead of rebasing (experimental).
    #[arg(long, env = "MARGE_USE_MERGE_STRATEGY", num_args = 0..=1, default_missing_value = "true")]
    pub use_merge_strategy: Option<bool>,

    /// Local reference repository forwarded to git clone.
    #[arg(long, env = "MARGE_REFERENCE")]
    pub reference: Option<PathBuf>,

    /// Sleep between poll cycles when idle, e.g. 60s.
    #[arg(long, env = "MARGE_IDLE_SLEEP")]
    pub idle_sleep: Option<String>,

    /// Sleep between forge polls while a merge is in flight, e.g. 2s.
    #[arg(long, env = "MARGE_BUSY_SLEEP")]
    pub busy_sleep: Option<String>,

    /// Candidate ordering: "created" (default) or "updated".
    #[arg(long, env = "MARGE_ORDERING")]
    pub ordering: Option<String>,

    /// Verbose logging. Secrets are never logged either way.
    #[arg(long, env = "MARGE_DEBUG", num_args = 0..=1, default_missing_value = "true")]
    pub debug: Option<bool>,
}

impl Cli {
    /// The env+argv override layer for the config merge.
    pub fn overrides(&self) -> Overrides {
        Overrides {
            gitlab_url: self.gitlab_url.clone(),
            auth_token_file: self.auth_token_file.clone(),
            ssh_key_file: self.ssh_key_file.clone(),
            add_reviewers: self.add_reviewers,
            add_tested: self.add_tested,
            add_part_of: self.add_part_of,
            impersonate_approvers: self.impersonate_approvers,
            approval_reset_timeout: self.approval_reset_timeout.clone(),
            ci_timeout: self.ci_timeout.clone(),
            git_timeout: self.git_timeout.clone(),
            embargo: self.embargo.clone(),
            project_regexp: self.project_regexp.clone(),
            branch_regexp: self.branch_regexp.clone(),
            batch: self.batch,
            batch_max_size: self.batch_max_size,
            use_merge_strategy: self.use_merge_strategy,
            reference: self.reference.clone(),
            idle_sleep: self.idle_sleep.clone(),
            busy_sleep: self.busy_sleep.clone(),
            ordering: self.ordering.clone(),
            debug: self.debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_flag_means_true() {
        let cli = Cli::parse_from(["marge-bot", "--add-reviewers", "--batch"]);
        assert_eq!(cli.add_reviewers, Some(true));
        assert_eq!(cli.batch, Some(true));
        assert_eq!(cli.add_tested, None);
    }

    #[test]
    fn test_explicit_false_overrides() {
        let cli = Cli::parse_from(["marge-bot", "--batch", "false"]);
        assert_eq!(cli.batch, Some(false));
    }

    #[test]
    fn test_embargo_may_repeat() {
        let cli = Cli::parse_from([
            "marge-bot",
            "--embargo",
            "Friday 18:00 - Monday 09:00 UTC",
            "--embargo",
            "Wednesday 12:00 - Wednesday 13:00 UTC",
        ]);
        assert_eq!(cli.embargo.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_overrides_carry_values() {
        let cli = Cli::parse_from([
            "marge-bot",
            "--gitlab-url",
            "https://gitlab.example.com",
            "--ci-timeout",
            "20m",
        ]);
        let over = cli.overrides();
        assert_eq!(over.gitlab_url.as_deref(), Some("https://gitlab.example.com"));
        assert_eq!(over.ci_timeout.as_deref(), Some("20m"));
        assert!(over.auth_token_file.is_none());
    }
}
