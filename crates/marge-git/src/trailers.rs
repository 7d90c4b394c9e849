//! Commit message trailer rewriting
//!
//! Rewrites commit messages to carry `Reviewed-by`, `Tested-by` and
//! `Part-of` trailers while leaving the rest of the message alone. The
//! rewrite is idempotent: running it twice with the same approver set
//! yields byte-identical messages.

use crate::error::{GitError, Result};

/// Trailer keys this module owns. Existing occurrences of these are
/// stripped before the fresh set is appended.
const MANAGED_KEYS: [&str; 3] = ["Reviewed-by", "Tested-by", "Part-of"];

/// One approver, resolved to a usable identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reviewer {
    pub name: String,
    pub email: String,
    pub username: String,
}

impl Reviewer {
    /// Build a reviewer, failing loudly when the forge withheld the email
    /// (a non-admin token cannot see it).
    pub fn try_new(name: &str, username: &str, email: Option<&str>) -> Result<Reviewer> {
        let email = email.filter(|e| !e.is_empty()).ok_or_else(|| {
            GitError::MissingEmail {
                username: username.to_string(),
            }
        })?;
        Ok(Reviewer {
            name: name.to_string(),
            email: email.to_string(),
            username: username.to_string(),
        })
    }
}

/// The trailers to stamp onto a rewritten branch.
#[derive(Debug, Clone, Default)]
pub struct TrailerSpec {
    /// One `Reviewed-by` per approver, on every commit.
    pub reviewers: Vec<Reviewer>,

    /// `Tested-by: <bot> <mr-url>`, tip commit only.
    pub tested_by: Option<String>,

    /// `Part-of: <mr-url>`, on every commit.
    pub part_of: Option<String>,
}

impl TrailerSpec {
    /// True when rewriting would change nothing; the worktree skips the
    /// amend pass entirely in that case.
    pub fn is_empty(&self) -> bool {
        self.reviewers.is_empty() && self.tested_by.is_none() && self.part_of.is_none()
    }
}

/// Rewrite one commit message.
///
/// Strips every managed trailer, then appends the fresh block: `Part-of`
/// first, `Reviewed-by` per approver sorted by username, and (on the tip
/// commit only) `Tested-by`.
pub fn rewrite_message(original: &str, spec: &TrailerSpec, is_tip: bool) -> String {
    let mut body: Vec<&str> = original
        .lines()
        .filter(|line| !is_managed_trailer(line))
        .collect();

    while body.last().is_some_and(|l| l.trim().is_empty()) {
        body.pop();
    }

    let mut trailers = Vec::new();
    if let Some(url) = &spec.part_of {
        trailers.push(format!("Part-of: <{url}>"));
    }
    let mut reviewers: Vec<&Reviewer> = spec.reviewers.iter().collect();
    reviewers.sort_by(|a, b| a.username.cmp(&b.username));
    for r in reviewers {
        trailers.push(format!("Reviewed-by: {} <{}>", r.name, r.email));
    }
    if is_tip {
        if let Some(tested) = &spec.tested_by {
            trailers.push(format!("Tested-by: {tested}"));
        }
    }

    let mut out = body.join("\n");
    if !trailers.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&trailers.join("\n"));
    }
    out.push('\n');
    out
}

fn is_managed_trailer(line: &str) -> bool {
    MANAGED_KEYS
        .iter()
        .any(|key| line.starts_with(key) && line[key.len()..].starts_with(':'))
}

/// Parse `Key: Value` trailer lines out of a commit message.
///
/// Only lines matching the trailer shape count; regular prose survives.
pub fn parse_trailers(message: &str) -> Vec<(String, String)> {
    message
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            let key = key.trim();
            if key.is_empty() || key.contains(' ') {
                return None;
            }
            Some((key.to_string(), value.trim().to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with(reviewers: Vec<(&str, &str, &str)>) -> TrailerSpec {
        TrailerSpec {
            reviewers: reviewers
                .into_iter()
                .map(|(name, user, mail)| Reviewer::try_new(name, user, Some(mail)).unwrap())
                .collect(),
            tested_by: None,
            part_of: None,
        }
    }

    #[test]
    fn test_appends_reviewed_by_sorted_by_username() {
        let spec = spec_with(vec![
            ("Zoe Zulu", "zzulu", "zoe@example.com"),
            ("Al Alpha", "aalpha", "al@example.com"),
        ]);
        let out = rewrite_message("Fix the frobnicator\n", &spec, false);
        assert_eq!(
            out,
            "Fix the frobnicator\n\n\
             Reviewed-by: Al Alpha <al@example.com>\n\
             Reviewed-by: Zoe Zulu <zoe@example.com>\n"
        );
    }

    #[test]
    fn test_rewrite_is_idempotent() {
        let spec = spec_with(vec![("Alice", "alice", "alice@example.com")]);
        let once = rewrite_message("Add feature\n\nLong description here.\n", &spec, true);
        let twice = rewrite_message(&once, &spec, true);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_strips_stale_trailers() {
        let spec = spec_with(vec![("Bob", "bob", "bob@example.com")]);
        let original = "Do things\n\nReviewed-by: Old Hat <old@example.com>\nTested-by: bot <url>\n";
        let out = rewrite_message(original, &spec, false);
        assert!(!out.contains("Old Hat"));
        assert!(!out.contains("Tested-by"));
        assert!(out.contains("Reviewed-by: Bob <bob@example.com>"));
    }

    #[test]
    fn test_tested_by_only_on_tip() {
        let spec = TrailerSpec {
            reviewers: vec![],
            tested_by: Some("marge-bot <https://gitlab.example.com/g/r/merge_requests/42>".into()),
            part_of: None,
        };
        let tip = rewrite_message("msg\n", &spec, true);
        let mid = rewrite_message("msg\n", &spec, false);
        assert!(tip.contains("Tested-by: marge-bot"));
        assert!(!mid.contains("Tested-by"));
    }

    #[test]
    fn test_part_of_precedes_reviewed_by() {
        let spec = TrailerSpec {
            reviewers: spec_with(vec![("A", "a", "a@example.com")]).reviewers,
            tested_by: None,
            part_of: Some("https://gitlab.example.com/g/r/merge_requests/7".into()),
        };
        let out = rewrite_message("msg\n", &spec, false);
        let part = out.find("Part-of:").unwrap();
        let reviewed = out.find("Reviewed-by:").unwrap();
        assert!(part < reviewed);
    }

    #[test]
    fn test_empty_spec_leaves_message_alone() {
        let spec = TrailerSpec::default();
        assert!(spec.is_empty());
        assert_eq!(rewrite_message("keep me\n", &spec, true), "keep me\n");
    }

    #[test]
    fn test_trailer_round_trip_recovers_approvers() {
        let spec = spec_with(vec![
            ("Alice A", "alice", "alice@example.com"),
            ("Bob B", "bob", "bob@example.com"),
        ]);
        let msg = rewrite_message("Commit title\n", &spec, false);
        let trailers = parse_trailers(&msg);
        let reviewed: Vec<&str> = trailers
            .iter()
            .filter(|(k, _)| k == "Reviewed-by")
            .map(|(_, v)| v.as_str())
            .collect();
        assert_eq!(
            reviewed,
            vec![
                "Alice A <alice@example.com>",
                "Bob B <bob@example.com>"
            ]
        );
    }

    #[test]
    fn test_missing_email_is_a_distinct_error() {
        let err = Reviewer::try_new("Carol", "carol", None).unwrap_err();
        match err {
            GitError::MissingEmail { username } => assert_eq!(username, "carol"),
            e => panic!("unexpected {e:?}"),
        }
    }

    #[test]
    fn test_prose_with_colon_is_not_a_trailer() {
        let trailers = parse_trailers("Title\n\nNote: this has spaces before the colon? no.\nKey: value\n");
        assert_eq!(trailers, vec![("Note".into(), "this has spaces before the colon? no.".into()), ("Key".into(), "value".into())]);
    }
}
