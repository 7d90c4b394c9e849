//! Fleet coordination
//!
//! Discovers projects where the bot is a member, keeps one worker task
//! per (project, target branch) that actually holds assigned MRs, retires
//! workers whose project went away, and propagates shutdown.

use crate::embargo::IntervalUnion;
use crate::worker::{MergeOptions, ProjectWorker};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use marge_client::{ForgeClient, Project, User, ACCESS_LEVEL_REPORTER};
use marge_config::BotConfig;
use marge_git::{Identity, Worktree};
use regex::Regex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How often the project/MR discovery pass runs.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(3 * 60);

/// Multiplexes workers across projects.
pub struct Coordinator {
    forge: Arc<dyn ForgeClient>,
    config: BotConfig,
    bot: User,
    embargo: IntervalUnion,
    /// Root under which every worker gets its own clone directory.
    clone_root: PathBuf,
}

impl Coordinator {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        config: BotConfig,
        bot: User,
        embargo: IntervalUnion,
    ) -> Coordinator {
        let clone_root =
            std::env::temp_dir().join(format!("marge-bot-{}", std::process::id()));
        Coordinator {
            forge,
            config,
            bot,
            embargo,
            clone_root,
        }
    }

    /// Run discovery until shutdown, then wait the workers out.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let project_re = Regex::new(&self.config.project_regexp)
            .context("compiling project-regexp")?;
        let branch_re = Regex::new(&self.config.branch_regexp)
            .context("compiling branch-regexp")?;

        std::fs::create_dir_all(&self.clone_root)
            .with_context(|| format!("creating clone root {:?}", self.clone_root))?;

        let mut workers: HashMap<(u64, String), JoinHandle<()>> = HashMap::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            workers.retain(|key, handle| {
                if handle.is_finished() {
                    debug!("Worker for {key:?} finished");
                    false
                } else {
                    true
                }
            });

            match self.discover(&project_re).await {
                Ok(targets) => {
                    for (project, target_branch) in targets {
                        let key = (project.id, target_branch.clone());
                        if workers.contains_key(&key) {
                            continue;
                        }
                        let handle = self.spawn_worker(
                            project,
                            target_branch,
                            branch_re.clone(),
                            shutdown.clone(),
                        );
                        workers.insert(key, handle);
                    }
                }
                Err(e) => warn!("Project discovery failed (will retry): {e:#}"),
            }

            tokio::select! {
                _ = tokio::time::sleep(DISCOVERY_INTERVAL) => {}
                _ = shutdown.changed() => {}
            }
        }

        info!("Shutting down; waiting for {} worker(s)", workers.len());
        for (_, handle) in workers {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Every (project, target branch) currently holding assigned MRs.
    async fn discover(&self, project_re: &Regex) -> Result<Vec<(Project, String)>> {
        info!("Finding out my current projects...");
        let projects = self.forge.list_projects_for_member().await?;

        let mut targets = Vec::new();
        for project in projects {
            if !project_re.is_match(&project.path_with_namespace) {
                debug!(
                    "Project {} does not match project-regexp",
                    project.path_with_namespace
                );
                continue;
            }
            if project.permissions.is_some() && project.access_level() < ACCESS_LEVEL_REPORTER {
                warn!(
                    "Not enough permissions to browse merge requests in {}",
                    project.path_with_namespace
                );
                continue;
            }

            let mrs = self
                .forge
                .list_assigned_mrs(project.id, self.bot.id)
                .await?;
            let mut branches: Vec<String> =
                mrs.into_iter().map(|mr| mr.target_branch).collect();
            branches.sort();
            branches.dedup();
            for branch in branches {
                targets.push((project.clone(), branch));
            }
        }
        Ok(targets)
    }

    fn spawn_worker(
        &self,
        project: Project,
        target_branch: String,
        branch_re: Regex,
        shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let forge = Arc::clone(&self.forge);
        let bot = self.bot.clone();
        let options = MergeOptions::from_config(&self.config);
        let embargo = self.embargo.clone();
        let ssh_key_file = self.config.ssh_key_file.clone();
        let git_timeout = self.config.git_timeout;
        let reference = self.config.reference.clone();

        // Each (project, branch) pair owns a distinct directory; clones
        // of the same project share objects via the reference repo.
        let dir = self.clone_root.join(format!(
            "{}-{}",
            project.id,
            sanitize(&target_branch)
        ));

        info!(
            "Spawning worker for {} -> {}",
            project.path_with_namespace, target_branch
        );

        tokio::spawn(async move {
            let committer = Identity {
                name: bot.name.clone(),
                email: bot
                    .email
                    .clone()
                    .unwrap_or_else(|| format!("{}@invalid", bot.username)),
            };
            let worktree = match Worktree::clone(
                &project.ssh_url_to_repo,
                &dir,
                &ssh_key_file,
                committer,
                git_timeout,
                reference.as_deref(),
            )
            .await
            {
                Ok(tree) => tree,
                Err(e) => {
                    warn!(
                        "Couldn't clone {}: {e}; worker not started",
                        project.path_with_namespace
                    );
                    return;
                }
            };

            ProjectWorker::new(
                forge,
                Arc::new(worktree),
                project,
                target_branch,
                bot,
                options,
                branch_re,
                embargo,
                shutdown,
            )
            .run()
            .await;
        })
    }
}

/// Branch names become directory names; keep them filesystem-safe.
fn sanitize(branch: &str) -> String {
    branch
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_branch_names() {
        assert_eq!(sanitize("main"), "main");
        assert_eq!(sanitize("feat/login"), "feat_login");
        assert_eq!(sanitize("release-1.2"), "release-1.2");
        assert_eq!(sanitize("weird branch!"), "weird_branch_");
    }
}
