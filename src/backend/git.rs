// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git backend.
//!
//! Staging and committing go through libgit2, since both are purely local
//! index and object database work. Anything that talks to a remote, i.e.,
//! push, pull, and clone, goes through the `git` executable so that transport
//! configuration, credential helpers, and merge behavior are exactly what the
//! user gets from Git itself.
//!
//! External Git processes never prompt. When an [`SshIdentity`] is configured
//! it is handed to SSH through `GIT_SSH_COMMAND`, pinning both the private key
//! and the known hosts file.

use crate::{
    backend::{Backend, BackendError, CommitOutcome, PushOutcome, Result},
    config::SshIdentity,
};

use git2::{Commit, ErrorCode, IndexAddOption, Repository, Signature};
use std::{
    ffi::OsStr,
    io::Read,
    path::Path,
    process::{Command, Stdio},
};
use tracing::{debug, instrument};

/// Marker Git prints when a push has nothing to send.
const UP_TO_DATE: &str = "Everything up-to-date";

/// Repository operations through libgit2 and the `git` executable.
#[derive(Debug, Default, Clone)]
pub struct GitBackend {
    ssh: Option<SshIdentity>,
}

impl GitBackend {
    /// Construct new Git backend.
    pub fn new(ssh: Option<SshIdentity>) -> Self {
        Self { ssh }
    }

    fn git(&self, workdir: Option<&Path>) -> Command {
        let mut command = Command::new("git");
        command.env("GIT_TERMINAL_PROMPT", "0");
        if let Some(ssh) = &self.ssh {
            command.env("GIT_SSH_COMMAND", ssh_command(ssh));
        }

        if let Some(workdir) = workdir {
            command.current_dir(workdir);
        }

        command
    }
}

impl Backend for GitBackend {
    #[instrument(skip(self), level = "debug")]
    fn stage(&self, repo: &Path) -> Result<()> {
        let repository = Repository::open(repo)?;
        let mut index = repository.index()?;

        // INVARIANT: Pick up new and modified files, then drop deleted ones.
        index.add_all(["*"], IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"], None)?;
        index.write()?;

        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    fn commit(&self, repo: &Path, message: &str) -> Result<CommitOutcome> {
        let repository = Repository::open(repo)?;
        let mut index = repository.index()?;
        let tree_id = index.write_tree()?;

        let parent = match repository.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(error) if matches!(error.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => {
                None
            }
            Err(error) => return Err(error.into()),
        };

        let unchanged = match &parent {
            Some(parent) => parent.tree_id() == tree_id,
            None => index.is_empty(),
        };
        if unchanged {
            debug!("nothing to commit in {}", repo.display());
            return Ok(CommitOutcome::NothingToCommit);
        }

        let tree = repository.find_tree(tree_id)?;
        let signature = repository
            .signature()
            .or_else(|_| Signature::now("glint", "glint@localhost"))?;
        let parents = parent.iter().collect::<Vec<&Commit<'_>>>();
        repository.commit(Some("HEAD"), &signature, &signature, message, &tree, &parents)?;

        Ok(CommitOutcome::Committed)
    }

    #[instrument(skip(self), level = "debug")]
    fn push(&self, repo: &Path) -> Result<PushOutcome> {
        let output = run("push", self.git(Some(repo)).arg("push"))?;
        if output.contains(UP_TO_DATE) {
            return Ok(PushOutcome::UpToDate);
        }

        Ok(PushOutcome::Pushed)
    }

    #[instrument(skip(self), level = "debug")]
    fn pull(&self, repo: &Path) -> Result<()> {
        run(
            "pull",
            self.git(Some(repo)).args(["pull", "--no-rebase", "--no-edit"]),
        )?;

        Ok(())
    }

    #[instrument(skip(self, progress), level = "debug")]
    fn clone_remote(&self, url: &str, dest: &Path, progress: &mut dyn FnMut(&str)) -> Result<()> {
        let mut child = self
            .git(None)
            .args([OsStr::new("clone"), OsStr::new("--progress"), OsStr::new(url)])
            .arg(dest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut last_line = String::new();
        if let Some(stderr) = child.stderr.take() {
            split_progress(stderr, |line| {
                progress(line);
                last_line = line.to_string();
            })?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(BackendError::command("clone", last_line));
        }

        Ok(())
    }
}

/// Build SSH command line that pins identity and known hosts.
pub fn ssh_command(ssh: &SshIdentity) -> String {
    format!(
        "ssh -i \"{}\" -o UserKnownHostsFile=\"{}\" -o IdentitiesOnly=yes -o PasswordAuthentication=no -F /dev/null",
        ssh.private_key.display(),
        ssh.known_hosts.display(),
    )
}

fn run(name: &str, command: &mut Command) -> Result<String> {
    let output = command.output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        let message = if stderr.trim().is_empty() { stdout } else { stderr };
        return Err(BackendError::command(name, message.trim()));
    }

    let mut message = String::new();
    message.push_str(stdout.trim_end());
    if !stderr.trim().is_empty() {
        if !message.is_empty() {
            message.push('\n');
        }
        message.push_str(stderr.trim_end());
    }
    debug!("git {name}: {message}");

    Ok(message)
}

/// Split Git's progress stream into lines.
///
/// Git redraws progress in place with carriage returns, so both `\r` and `\n`
/// end a line. Empty lines are skipped.
fn split_progress(mut reader: impl Read, mut on_line: impl FnMut(&str)) -> std::io::Result<()> {
    let mut pending = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let read = reader.read(&mut chunk)?;
        if read == 0 {
            break;
        }

        for byte in &chunk[..read] {
            if matches!(byte, b'\r' | b'\n') {
                emit_line(&mut pending, &mut on_line);
            } else {
                pending.push(*byte);
            }
        }
    }

    emit_line(&mut pending, &mut on_line);

    Ok(())
}

fn emit_line(pending: &mut Vec<u8>, on_line: &mut impl FnMut(&str)) {
    let line = String::from_utf8_lossy(pending);
    let line = line.trim();
    if !line.is_empty() {
        on_line(line);
    }
    pending.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::fs;

    fn init_repo(path: &Path) -> anyhow::Result<Repository> {
        let repository = Repository::init(path)?;
        let mut config = repository.config()?;
        config.set_str("user.name", "John Doe")?;
        config.set_str("user.email", "john@doe.com")?;

        Ok(repository)
    }

    fn head_files(repository: &Repository) -> anyhow::Result<Vec<String>> {
        let tree = repository.head()?.peel_to_tree()?;
        Ok(tree
            .iter()
            .filter_map(|entry| entry.name().map(ToString::to_string))
            .collect())
    }

    #[test]
    fn ssh_command_pins_identity() {
        let ssh = SshIdentity {
            private_key: "/home/u/.config/glint/ssh/id.key".into(),
            known_hosts: "/home/u/.config/glint/ssh/known_hosts".into(),
        };

        assert_eq!(
            ssh_command(&ssh),
            "ssh -i \"/home/u/.config/glint/ssh/id.key\" \
             -o UserKnownHostsFile=\"/home/u/.config/glint/ssh/known_hosts\" \
             -o IdentitiesOnly=yes -o PasswordAuthentication=no -F /dev/null"
        );
    }

    #[test]
    fn progress_splits_on_carriage_returns() -> anyhow::Result<()> {
        let stream = "Cloning into 'repo'...\nReceiving objects:  50% (1/2)\rReceiving objects: 100% (2/2), done.\n\n";
        let mut lines = Vec::new();
        split_progress(stream.as_bytes(), |line| lines.push(line.to_string()))?;

        assert_eq!(
            lines,
            vec![
                "Cloning into 'repo'...",
                "Receiving objects:  50% (1/2)",
                "Receiving objects: 100% (2/2), done.",
            ]
        );

        Ok(())
    }

    #[test]
    fn commit_only_when_tree_changes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repository = init_repo(dir.path())?;
        let backend = GitBackend::default();

        backend.stage(dir.path())?;
        assert_eq!(
            backend.commit(dir.path(), "Sync")?,
            CommitOutcome::NothingToCommit
        );

        fs::write(dir.path().join("a.txt"), "a")?;
        fs::write(dir.path().join("b.txt"), "b")?;
        backend.stage(dir.path())?;
        assert_eq!(backend.commit(dir.path(), "a.txt")?, CommitOutcome::Committed);
        assert_eq!(head_files(&repository)?, vec!["a.txt", "b.txt"]);
        assert_eq!(
            repository.head()?.peel_to_commit()?.message(),
            Some("a.txt")
        );

        backend.stage(dir.path())?;
        assert_eq!(
            backend.commit(dir.path(), "Sync")?,
            CommitOutcome::NothingToCommit
        );

        Ok(())
    }

    #[test]
    fn stage_picks_up_deletions() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let repository = init_repo(dir.path())?;
        let backend = GitBackend::default();

        fs::write(dir.path().join("a.txt"), "a")?;
        fs::write(dir.path().join("b.txt"), "b")?;
        backend.stage(dir.path())?;
        backend.commit(dir.path(), "initial")?;

        fs::remove_file(dir.path().join("a.txt"))?;
        backend.stage(dir.path())?;
        assert_eq!(backend.commit(dir.path(), "a.txt")?, CommitOutcome::Committed);
        assert_eq!(head_files(&repository)?, vec!["b.txt"]);

        Ok(())
    }

    #[test]
    fn stage_outside_repository_fails() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let result = GitBackend::default().stage(dir.path());
        assert!(matches!(result, Err(BackendError::Git2(_))));

        Ok(())
    }
}
