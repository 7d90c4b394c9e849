//! Long-lived local clone driving the `git` binary
//!
//! One worktree belongs to exactly one worker. Nothing here consults an
//! ssh-agent or `~/.ssh`: the only SSH identity is the key file handed to
//! [`Worktree::clone`]. All refs are fully qualified so branch names
//! containing `/`, or named like the target branch, need no special cases.

use crate::error::{GitError, PushRejection, Result};
use crate::trailers::{rewrite_message, TrailerSpec};
use async_trait::async_trait;
use log::debug;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Committer identity stamped onto rewritten commits.
#[derive(Debug, Clone)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

/// Git operations the merge engine needs.
///
/// `Worktree` is the production implementation; worker tests use an
/// in-memory fake.
#[async_trait]
pub trait Repo: Send + Sync {
    /// Prune and fetch from origin.
    async fn fetch(&self) -> Result<()>;

    /// Head sha of a remote-tracking branch, post-fetch.
    async fn remote_branch_sha(&self, branch: &str) -> Result<String>;

    /// Replay the source branch's commits onto `onto` (a sha or ref),
    /// rewriting each message with `trailers`. Returns the new tip sha.
    async fn rebase_onto(
        &self,
        onto: &str,
        source_branch: &str,
        trailers: &TrailerSpec,
    ) -> Result<String>;

    /// Merge `onto` into the source branch with a merge commit,
    /// stamping `trailers` on the merge commit. Returns the new tip sha.
    async fn merge_onto(
        &self,
        onto: &str,
        source_branch: &str,
        trailers: &TrailerSpec,
    ) -> Result<String>;

    /// Force-with-lease push of `sha` to the named branch.
    async fn push(&self, sha: &str, branch: &str) -> Result<()>;

    /// Commit shas in `range`, oldest first.
    async fn commit_shas(&self, range: &str) -> Result<Vec<String>>;

    /// Full commit message of one commit.
    async fn commit_message(&self, sha: &str) -> Result<String>;
}

/// A clone on disk.
pub struct Worktree {
    dir: PathBuf,
    ssh_key_file: PathBuf,
    committer: Identity,
    timeout: Duration,
}

impl Worktree {
    /// Clone `url` into `dir` and return the worktree.
    ///
    /// `reference` is forwarded to `git clone --reference` so sibling
    /// worktrees of the same project share an object store.
    pub async fn clone(
        url: &str,
        dir: &Path,
        ssh_key_file: &Path,
        committer: Identity,
        timeout: Duration,
        reference: Option<&Path>,
    ) -> Result<Worktree> {
        let tree = Worktree {
            dir: dir.to_path_buf(),
            ssh_key_file: ssh_key_file.to_path_buf(),
            committer,
            timeout,
        };

        let mut args = vec!["clone".to_string(), "--quiet".to_string()];
        if let Some(reference) = reference {
            args.push("--reference".to_string());
            args.push(reference.display().to_string());
        }
        args.push(url.to_string());
        args.push(dir.display().to_string());

        // `-C` would point at the not-yet-existing clone dir.
        let out = tree.run_in(None, &args, None).await?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(classify_remote_failure("clone", &stderr));
        }
        Ok(tree)
    }

    fn ssh_command(&self) -> String {
        format!(
            "ssh -i {} -o IdentitiesOnly=yes -o IdentityAgent=none -o BatchMode=yes",
            self.ssh_key_file.display()
        )
    }

    async fn run_in(
        &self,
        dir: Option<&Path>,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<std::process::Output> {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.args(args)
            .env("GIT_SSH_COMMAND", self.ssh_command())
            .env("GIT_COMMITTER_NAME", &self.committer.name)
            .env("GIT_COMMITTER_EMAIL", &self.committer.email)
            // Never pop an editor or prompt.
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("git {}", args.join(" "));

        let op = args.first().cloned().unwrap_or_default();
        let fut = async {
            let mut child = cmd.spawn()?;
            if let Some(input) = stdin {
                if let Some(mut pipe) = child.stdin.take() {
                    pipe.write_all(input.as_bytes()).await?;
                }
            }
            child.wait_with_output().await
        };

        match tokio::time::timeout(self.timeout, fut).await {
            Ok(out) => Ok(out?),
            Err(_) => Err(GitError::Timeout { op }),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        self.run_in(Some(&self.dir), &args, None).await
    }

    /// Run, demanding success; trimmed stdout on success.
    async fn run_ok(&self, args: &[&str]) -> Result<String> {
        let out = self.run(args).await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
        } else {
            Err(GitError::Failed {
                op: args.first().unwrap_or(&"git").to_string(),
                detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            })
        }
    }

    async fn rev_parse(&self, rev: &str) -> Result<String> {
        self.run_ok(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
            .await
    }

    /// Rewrite HEAD's message in place, preserving author and date.
    async fn amend_message(&self, message: &str) -> Result<()> {
        let args: Vec<String> = ["commit", "--amend", "--quiet", "--allow-empty", "-F", "-"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = self.run_in(Some(&self.dir), &args, Some(message)).await?;
        if out.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            if stderr.contains("hook") {
                return Err(GitError::HookRejected);
            }
            Err(GitError::Failed {
                op: "commit --amend".into(),
                detail: stderr.trim().to_string(),
            })
        }
    }

    /// Replay `commits` (oldest first) onto the current detached HEAD,
    /// amending each message through the trailer rewriter.
    async fn replay(&self, commits: &[String], trailers: &TrailerSpec) -> Result<()> {
        let last = commits.len().saturating_sub(1);
        for (idx, sha) in commits.iter().enumerate() {
            let pick = self
                .run(&["cherry-pick", "--allow-empty-message", sha.as_str()])
                .await?;
            if !pick.status.success() {
                let stderr = String::from_utf8_lossy(&pick.stderr).to_string();
                if stderr.contains("is now empty") {
                    // The change already landed upstream; drop it.
                    self.run(&["cherry-pick", "--skip"]).await?;
                    continue;
                }
                let diagnostic = self.conflict_diagnostic(&stderr).await;
                let _ = self.run(&["cherry-pick", "--abort"]).await;
                return Err(GitError::RebaseConflict { diagnostic });
            }

            if !trailers.is_empty() {
                let original = self.commit_message("HEAD").await?;
                let rewritten = rewrite_message(&original, trailers, idx == last);
                if rewritten != original {
                    self.amend_message(&rewritten).await?;
                }
            }
        }
        Ok(())
    }

    async fn conflict_diagnostic(&self, stderr: &str) -> String {
        let status = self
            .run_ok(&["status", "--porcelain"])
            .await
            .unwrap_or_default();
        let conflicted: Vec<&str> = status
            .lines()
            .filter(|l| l.starts_with("UU") || l.starts_with("AA") || l.starts_with("DU") || l.starts_with("UD"))
            .collect();
        if conflicted.is_empty() {
            stderr.trim().to_string()
        } else {
            format!("conflicting files:\n{}", conflicted.join("\n"))
        }
    }
}

#[async_trait]
impl Repo for Worktree {
    async fn fetch(&self) -> Result<()> {
        let out = self.run(&["fetch", "--prune", "--quiet", "origin"]).await?;
        if out.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Err(classify_remote_failure("fetch", &stderr))
        }
    }

    async fn remote_branch_sha(&self, branch: &str) -> Result<String> {
        self.rev_parse(&format!("refs/remotes/origin/{branch}")).await
    }

    async fn rebase_onto(
        &self,
        onto: &str,
        source_branch: &str,
        trailers: &TrailerSpec,
    ) -> Result<String> {
        let onto_sha = self.rev_parse(onto).await?;
        let source = format!("refs/remotes/origin/{source_branch}");

        let commits = self
            .commit_shas(&format!("{onto_sha}..{source}"))
            .await?;
        if commits.is_empty() {
            return Err(GitError::EmptyDiff);
        }

        // Detached HEAD; no local branches survive an iteration.
        self.run_ok(&["checkout", "--quiet", "--detach", &onto_sha])
            .await?;
        self.replay(&commits, trailers).await?;

        let tip = self.rev_parse("HEAD").await?;
        if tip == onto_sha {
            return Err(GitError::EmptyDiff);
        }
        Ok(tip)
    }

    async fn merge_onto(
        &self,
        onto: &str,
        source_branch: &str,
        trailers: &TrailerSpec,
    ) -> Result<String> {
        let onto_sha = self.rev_parse(onto).await?;
        let source = format!("refs/remotes/origin/{source_branch}");

        self.run_ok(&["checkout", "--quiet", "--detach", &source])
            .await?;

        let merge = self
            .run(&[
                "merge",
                "--no-ff",
                "--quiet",
                "-m",
                &format!("Merge latest target into '{source_branch}'"),
                &onto_sha,
            ])
            .await?;
        if !merge.status.success() {
            let stderr = String::from_utf8_lossy(&merge.stderr).to_string();
            let diagnostic = self.conflict_diagnostic(&stderr).await;
            let _ = self.run(&["merge", "--abort"]).await;
            return Err(GitError::RebaseConflict { diagnostic });
        }

        // Up-to-date merge produces no commit; nothing new to land.
        let tip = self.rev_parse("HEAD").await?;
        let diff = self.run(&["diff", "--quiet", &onto_sha, &tip]).await?;
        if diff.status.success() {
            return Err(GitError::EmptyDiff);
        }

        if !trailers.is_empty() {
            let original = self.commit_message("HEAD").await?;
            let rewritten = rewrite_message(&original, trailers, true);
            if rewritten != original {
                self.amend_message(&rewritten).await?;
            }
        }
        self.rev_parse("HEAD").await
    }

    async fn push(&self, sha: &str, branch: &str) -> Result<()> {
        let refspec = format!("{sha}:refs/heads/{branch}");
        let out = self
            .run(&["push", "--force-with-lease", "origin", &refspec])
            .await?;
        if out.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&out.stderr);
        Err(classify_push_failure(&stderr))
    }

    async fn commit_shas(&self, range: &str) -> Result<Vec<String>> {
        let out = self
            .run_ok(&["rev-list", "--reverse", "--no-merges", range])
            .await?;
        Ok(out.lines().map(|l| l.trim().to_string()).filter(|l| !l.is_empty()).collect())
    }

    async fn commit_message(&self, sha: &str) -> Result<String> {
        self.run_ok(&["show", "--no-patch", "--format=%B", sha])
            .await
            .map(|mut m| {
                m.push('\n');
                m
            })
    }
}

/// Sort a failed push into the taxonomy the worker cares about.
fn classify_push_failure(stderr: &str) -> GitError {
    let lower = stderr.to_lowercase();
    if lower.contains("protected branch") {
        GitError::PushRejected {
            reason: PushRejection::Protected,
        }
    } else if lower.contains("stale info") || lower.contains("fetch first") {
        GitError::PushRejected {
            reason: PushRejection::Stale,
        }
    } else if lower.contains("hook declined") || lower.contains("pre-receive hook") {
        GitError::PushRejected {
            reason: PushRejection::Hook,
        }
    } else if is_remote_unreachable(&lower) {
        GitError::Network {
            detail: stderr.trim().to_string(),
        }
    } else {
        GitError::Failed {
            op: "push".into(),
            detail: stderr.trim().to_string(),
        }
    }
}

fn classify_remote_failure(op: &str, stderr: &str) -> GitError {
    if is_remote_unreachable(&stderr.to_lowercase()) {
        GitError::Network {
            detail: stderr.trim().to_string(),
        }
    } else {
        GitError::Failed {
            op: op.into(),
            detail: stderr.trim().to_string(),
        }
    }
}

fn is_remote_unreachable(lower_stderr: &str) -> bool {
    lower_stderr.contains("could not resolve host")
        || lower_stderr.contains("connection refused")
        || lower_stderr.contains("connection timed out")
        || lower_stderr.contains("permission denied")
        || lower_stderr.contains("authentication failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_rejection_classification() {
        let protected = classify_push_failure(
            "remote: GitLab: You are not allowed to force push code to a protected branch",
        );
        assert!(matches!(
            protected,
            GitError::PushRejected {
                reason: PushRejection::Protected
            }
        ));

        let stale = classify_push_failure(
            "! [rejected] abc -> feat/x (stale info)\nerror: failed to push some refs",
        );
        assert!(matches!(
            stale,
            GitError::PushRejected {
                reason: PushRejection::Stale
            }
        ));

        let hook = classify_push_failure("remote: pre-receive hook declined");
        assert!(matches!(
            hook,
            GitError::PushRejected {
                reason: PushRejection::Hook
            }
        ));
    }

    #[test]
    fn test_network_failures_are_not_rejections() {
        let net = classify_push_failure("ssh: Could not resolve host: gitlab.example.com");
        assert!(matches!(net, GitError::Network { .. }));

        let auth = classify_remote_failure("fetch", "git@gitlab.example.com: Permission denied (publickey).");
        assert!(matches!(auth, GitError::Network { .. }));
    }

    #[test]
    fn test_unclassified_push_failure_is_preserved() {
        let other = classify_push_failure("fatal: the remote end hung up unexpectedly today");
        match other {
            GitError::Failed { op, detail } => {
                assert_eq!(op, "push");
                assert!(detail.contains("hung up"));
            }
            e => panic!("unexpected {e:?}"),
        }
    }
}
