// SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
// SPDX-License-Identifier: GPL-3.0-only

use std::{fmt, path::PathBuf, process::Command, thread, time::Duration};

use thiserror::Error;
use tracing::warn;

use crate::cmd;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Command(#[from] cmd::Error),
    #[error("Push failed after {attempts} attempts; local commit retained")]
    PushRetriesExhausted {
        attempts: u32,
        #[source]
        source: cmd::Error,
    },
}

type Result<T> = std::result::Result<T, Error>;

/// Seam for the `git` CLI so the branch and push logic can be tested without
/// a repository.
pub trait GitRunner {
    fn run(&self, args: &[&str]) -> cmd::Result<()>;

    fn output(&self, args: &[&str]) -> cmd::Result<String>;
}

pub struct Git {
    repo_dir: PathBuf,
}

impl Git {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new("git");
        command.arg("-C").arg(&self.repo_dir);
        command.args(args);
        command
    }
}

impl GitRunner for Git {
    fn run(&self, args: &[&str]) -> cmd::Result<()> {
        cmd::run(&mut self.command(args))
    }

    fn output(&self, args: &[&str]) -> cmd::Result<String> {
        cmd::output(&mut self.command(args))
    }
}

/// Short revision of HEAD plus whether tracked files have uncommitted
/// changes. Untracked files (eg. the scratch directory) do not count as
/// dirty.
pub fn current_revision(git: &dyn GitRunner) -> Result<(String, bool)> {
    let revision = git.output(&["rev-parse", "--short", "HEAD"])?;
    let status = git.output(&["status", "--porcelain", "--untracked-files=no"])?;

    Ok((revision, !status.is_empty()))
}

/// Scoped checkout of another branch. The original checkout (branch or
/// detached commit) is restored on every exit path, including errors.
pub struct BranchGuard<'a> {
    git: &'a dyn GitRunner,
    original: String,
    detached: bool,
}

impl<'a> BranchGuard<'a> {
    pub fn switch(git: &'a dyn GitRunner, branch: &str) -> Result<Self> {
        let mut original = git.output(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let detached = original == "HEAD";

        if detached {
            original = git.output(&["rev-parse", "HEAD"])?;
        }

        if branch_exists(git, branch) {
            git.run(&["switch", branch])?;
        } else {
            // First publication: the branch does not exist yet anywhere.
            git.run(&["switch", "--orphan", branch])?;
        }

        Ok(Self {
            git,
            original,
            detached,
        })
    }
}

impl fmt::Debug for BranchGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchGuard")
            .field("original", &self.original)
            .field("detached", &self.detached)
            .finish_non_exhaustive()
    }
}

/// Whether the branch exists locally or on the default remote. `git switch`
/// creates a tracking branch for the latter on its own.
fn branch_exists(git: &dyn GitRunner, branch: &str) -> bool {
    [
        format!("refs/heads/{branch}"),
        format!("refs/remotes/origin/{branch}"),
    ]
    .iter()
    .any(|r| git.run(&["rev-parse", "--verify", "--quiet", r]).is_ok())
}

impl Drop for BranchGuard<'_> {
    fn drop(&mut self) {
        let result = if self.detached {
            self.git.run(&["switch", "--detach", &self.original])
        } else {
            self.git.run(&["switch", &self.original])
        };

        if let Err(e) = result {
            warn!("Failed to restore original checkout {}: {e}", self.original);
        }
    }
}

/// Push with a bounded pull-rebase-then-push retry loop. Exhausting the
/// attempts is fatal, but the local commit stays intact so a later run can
/// push it.
pub fn push_with_retry(
    git: &dyn GitRunner,
    branch: &str,
    attempts: u32,
    delay: Duration,
) -> Result<()> {
    let mut last = None;

    for attempt in 1..=attempts {
        if let Err(e) = git.run(&["pull", "--rebase", "origin", branch]) {
            // The remote branch may not exist yet.
            warn!("Pull failed (continuing): {e}");
        }

        match git.run(&["push", "origin", branch]) {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!("Push attempt {attempt}/{attempts} failed: {e}");
                last = Some(e);

                if attempt < attempts {
                    thread::sleep(delay);
                }
            }
        }
    }

    Err(Error::PushRetriesExhausted {
        attempts,
        source: last.expect("at least one push attempt"),
    })
}
