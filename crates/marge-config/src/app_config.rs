//! Bot configuration
//!
//! Resolution order, lowest to highest precedence: built-in default ->
//! config file -> environment variable -> command-line argument. The CLI
//! layer collapses env+argv into one [`Overrides`] value (clap resolves
//! that pair itself); this module owns defaults, the file layer and the
//! final merge.

use crate::duration::parse_duration;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// How candidates are ordered within a project.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CandidateOrder {
    /// Oldest MR first (by creation time).
    #[default]
    OldestCreated,
    /// Least recently updated MR first.
    OldestUpdated,
}

impl FromStr for CandidateOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(CandidateOrder::OldestCreated),
            "updated" => Ok(CandidateOrder::OldestUpdated),
            other => bail!("unknown ordering {other:?} (expected \"created\" or \"updated\")"),
        }
    }
}

/// Fully resolved configuration, injected immutably into the coordinator.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Forge base URL, e.g. `https://gitlab.example.com`.
    pub gitlab_url: String,

    /// File holding the API token. The token itself never crosses the
    /// command line and is never logged.
    pub auth_token_file: PathBuf,

    /// SSH private key used for clone and push; the sole identity.
    pub ssh_key_file: PathBuf,

    pub add_reviewers: bool,
    pub add_tested: bool,
    pub add_part_of: bool,
    pub impersonate_approvers: bool,

    /// Max wait for approvals to re-settle after a push; `None` waits
    /// not at all beyond the impersonation pass.
    pub approval_reset_timeout: Option<Duration>,

    pub ci_timeout: Duration,
    pub git_timeout: Duration,

    /// Raw embargo window strings; parsed by the engine.
    pub embargo: Vec<String>,

    pub project_regexp: String,
    pub branch_regexp: String,

    pub batch: bool,
    pub batch_max_size: usize,

    pub use_merge_strategy: bool,

    /// Local reference repository forwarded to `git clone --reference`.
    pub reference: Option<PathBuf>,

    /// Sleep between poll cycles with no work in flight.
    pub idle_sleep: Duration,

    /// Sleep between forge polls while a merge is in flight.
    pub busy_sleep: Duration,

    pub ordering: CandidateOrder,

    pub debug: bool,
}

impl BotConfig {
    /// Read and trim the auth token.
    pub fn read_token(&self) -> Result<String> {
        let raw = std::fs::read_to_string(&self.auth_token_file)
            .with_context(|| format!("reading token file {:?}", self.auth_token_file))?;
        let token = raw.trim().to_string();
        if token.is_empty() {
            bail!("token file {:?} is empty", self.auth_token_file);
        }
        Ok(token)
    }

    /// Merge the three configurable layers over the defaults.
    pub fn resolve(file: Option<ConfigFile>, over: Overrides) -> Result<BotConfig> {
        let file = file.unwrap_or_default();

        let gitlab_url = over
            .gitlab_url
            .or(file.gitlab_url)
            .context("gitlab URL not configured")?;
        let auth_token_file = over
            .auth_token_file
            .or(file.auth_token_file)
            .context("auth token file not configured")?;
        let ssh_key_file = over
            .ssh_key_file
            .or(file.ssh_key_file)
            .context("ssh key file not configured")?;

        let dur = |raw: Option<String>, default: Duration| -> Result<Duration> {
            raw.map(|s| parse_duration(&s)).transpose().map(|d| d.unwrap_or(default))
        };

        let ordering = over
            .ordering
            .or(file.ordering)
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or_default();

        Ok(BotConfig {
            gitlab_url,
            auth_token_file,
            ssh_key_file,
            add_reviewers: over.add_reviewers.or(file.add_reviewers).unwrap_or(false),
            add_tested: over.add_tested.or(file.add_tested).unwrap_or(false),
            add_part_of: over.add_part_of.or(file.add_part_of).unwrap_or(false),
            impersonate_approvers: over
                .impersonate_approvers
                .or(file.impersonate_approvers)
                .unwrap_or(false),
            approval_reset_timeout: over
                .approval_reset_timeout
                .or(file.approval_reset_timeout)
                .map(|s| parse_duration(&s))
                .transpose()?,
            ci_timeout: dur(
                over.ci_timeout.or(file.ci_timeout),
                Duration::from_secs(15 * 60),
            )?,
            git_timeout: dur(
                over.git_timeout.or(file.git_timeout),
                Duration::from_secs(2 * 60),
            )?,
            embargo: over.embargo.or(file.embargo).unwrap_or_default(),
            project_regexp: over
                .project_regexp
                .or(file.project_regexp)
                .unwrap_or_else(|| ".*".to_string()),
            branch_regexp: over
                .branch_regexp
                .or(file.branch_regexp)
                .unwrap_or_else(|| ".*".to_string()),
            batch: over.batch.or(file.batch).unwrap_or(false),
            batch_max_size: over.batch_max_size.or(file.batch_max_size).unwrap_or(4),
            use_merge_strategy: over
                .use_merge_strategy
                .or(file.use_merge_strategy)
                .unwrap_or(false),
            reference: over.reference.or(file.reference),
            idle_sleep: dur(over.idle_sleep.or(file.idle_sleep), Duration::from_secs(60))?,
            busy_sleep: dur(over.busy_sleep.or(file.busy_sleep), Duration::from_secs(2))?,
            ordering,
            debug: over.debug.or(file.debug).unwrap_or(false),
        })
    }
}

/// The config-file layer. Every field optional; durations stay strings
/// until the merge so file and flag values share one parser.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    pub gitlab_url: Option<String>,
    pub auth_token_file: Option<PathBuf>,
    pub ssh_key_file: Option<PathBuf>,
    pub add_reviewers: Option<bool>,
    pub add_tested: Option<bool>,
    pub add_part_of: Option<bool>,
    pub impersonate_approvers: Option<bool>,
    pub approval_reset_timeout: Option<String>,
    pub ci_timeout: Option<String>,
    pub git_timeout: Option<String>,
    pub embargo: Option<Vec<String>>,
    pub project_regexp: Option<String>,
    pub branch_regexp: Option<String>,
    pub batch: Option<bool>,
    pub batch_max_size: Option<usize>,
    pub use_merge_strategy: Option<bool>,
    pub reference: Option<PathBuf>,
    pub idle_sleep: Option<String>,
    pub busy_sleep: Option<String>,
    pub ordering: Option<String>,
    pub debug: Option<bool>,
}

const KNOWN_KEYS: [&str; 21] = [
    "gitlab_url",
    "auth_token_file",
    "ssh_key_file",
    "add_reviewers",
    "add_tested",
    "add_part_of",
    "impersonate_approvers",
    "approval_reset_timeout",
    "ci_timeout",
    "git_timeout",
    "embargo",
    "project_regexp",
    "branch_regexp",
    "batch",
    "batch_max_size",
    "use_merge_strategy",
    "reference",
    "idle_sleep",
    "busy_sleep",
    "ordering",
    "debug",
];

impl ConfigFile {
    /// Load from a TOML file. Unknown keys warn and are ignored.
    pub fn load(path: &Path) -> Result<ConfigFile> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {path:?}"))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ConfigFile> {
        let table: toml::Table = content.parse().context("parsing config file")?;
        for key in table.keys() {
            if !KNOWN_KEYS.contains(&key.as_str()) {
                log::warn!("Ignoring unknown config key {key:?}");
            }
        }
        ConfigFile::deserialize(toml::Value::Table(table)).context("invalid config value")
    }
}

/// The env+argv layer, produced by the CLI.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub gitlab_url: Option<String>,
    pub auth_token_file: Option<PathBuf>,
    pub ssh_key_file: Option<PathBuf>,
    pub add_reviewers: Option<bool>,
    pub add_tested: Option<bool>,
    pub add_part_of: Option<bool>,
    pub impersonate_approvers: Option<bool>,
    pub approval_reset_timeout: Option<String>,
    pub ci_timeout: Option<String>,
    pub git_timeout: Option<String>,
    pub embargo: Option<Vec<String>>,
    pub project_regexp: Option<String>,
    pub branch_regexp: Option<String>,
    pub batch: Option<bool>,
    pub batch_max_size: Option<usize>,
    pub use_merge_strategy: Option<bool>,
    pub reference: Option<PathBuf>,
    pub idle_sleep: Option<String>,
    pub busy_sleep: Option<String>,
    pub ordering: Option<String>,
    pub debug: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_overrides() -> Overrides {
        Overrides {
            gitlab_url: Some("https://gitlab.example.com".into()),
            auth_token_file: Some("/secrets/token".into()),
            ssh_key_file: Some("/secrets/id_ed25519".into()),
            ..Overrides::default()
        }
    }

    #[test]
    fn test_defaults_apply() {
        let cfg = BotConfig::resolve(None, minimal_overrides()).unwrap();
        assert_eq!(cfg.ci_timeout, Duration::from_secs(900));
        assert_eq!(cfg.git_timeout, Duration::from_secs(120));
        assert_eq!(cfg.idle_sleep, Duration::from_secs(60));
        assert_eq!(cfg.batch_max_size, 4);
        assert_eq!(cfg.project_regexp, ".*");
        assert_eq!(cfg.ordering, CandidateOrder::OldestCreated);
        assert!(!cfg.batch);
        assert!(cfg.approval_reset_timeout.is_none());
    }

    #[test]
    fn test_file_layer_beats_defaults() {
        let file = ConfigFile::parse(
            r#"
            gitlab_url = "https://file.example.com"
            ci_timeout = "30m"
            batch = true
            ordering = "updated"
            "#,
        )
        .unwrap();
        let mut over = minimal_overrides();
        over.gitlab_url = None;
        let cfg = BotConfig::resolve(Some(file), over).unwrap();
        assert_eq!(cfg.gitlab_url, "https://file.example.com");
        assert_eq!(cfg.ci_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.ordering, CandidateOrder::OldestUpdated);
        assert!(cfg.batch);
    }

    #[test]
    fn test_overrides_beat_file() {
        let file = ConfigFile::parse("ci_timeout = \"30m\"\ngitlab_url = \"https://file\"").unwrap();
        let mut over = minimal_overrides();
        over.ci_timeout = Some("5m".into());
        let cfg = BotConfig::resolve(Some(file), over).unwrap();
        assert_eq!(cfg.gitlab_url, "https://gitlab.example.com");
        assert_eq!(cfg.ci_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_unknown_keys_are_tolerated() {
        let file = ConfigFile::parse("definitely_not_a_key = 1\nbatch = true").unwrap();
        assert_eq!(file.batch, Some(true));
    }

    #[test]
    fn test_missing_required_field_errors() {
        let mut over = minimal_overrides();
        over.ssh_key_file = None;
        let err = BotConfig::resolve(None, over).unwrap_err();
        assert!(err.to_string().contains("ssh key"));
    }

    #[test]
    fn test_bad_duration_errors() {
        let mut over = minimal_overrides();
        over.git_timeout = Some("2 fortnights".into());
        assert!(BotConfig::resolve(None, over).is_err());
    }

    #[test]
    fn test_ordering_rejects_unknown() {
        assert!("oldest".parse::<CandidateOrder>().is_err());
        assert_eq!(
            "created".parse::<CandidateOrder>().unwrap(),
            CandidateOrder::OldestCreated
        );
    }
}
