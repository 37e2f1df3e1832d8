// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Git backend.
//!
//! Inspection and cloning go through libgit2. Mutating an existing working
//! directory (reconfiguring its remote, fetching, switching references) goes
//! through the Git binary, run inside the working directory, so that the
//! user's own credential helpers and hooks apply.
//!
//! # Remote
//!
//! An external always follows the remote named "origin". Relocating an
//! external to a new remote rewrites the URL of "origin" rather than adding a
//! second remote, so a working directory never tracks more than one remote.
//!
//! # Dirtiness
//!
//! A working directory is dirty when it has uncommitted changes, untracked
//! files that are not ignored, or commits at HEAD that cannot be reached from
//! any remote-tracking branch or tag. The last condition protects local work
//! that was committed but never pushed. Nested externals cloned inside a
//! working directory are never untracked files of it, whether or not the
//! working directory ignores them.

use crate::{
    backend::{is_nested, same_remote, syscall_non_interactive, Backend, BackendError, Result},
    config::{Reference, Target},
};

use auth_git2::{GitAuthenticator, Prompter};
use git2::{
    build::RepoBuilder, BranchType, Config, ErrorCode, FetchOptions, Oid, RemoteCallbacks,
    Repository, Status, StatusOptions,
};
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Password, Text};
use std::{
    path::{Path, PathBuf},
    time,
};
use tracing::{debug, info, instrument};

/// Name of the remote every external follows.
pub const REMOTE: &str = "origin";

/// Git repositories through libgit2 and the Git binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct GitBackend;

impl GitBackend {
    /// Construct new Git backend.
    pub fn new() -> Self {
        Self
    }

    fn open(&self, dir: &Path) -> Result<Repository> {
        let repository = Repository::open(dir).map_err(|_| BackendError::NotARepository {
            dir: dir.to_path_buf(),
            kind: "git",
        })?;

        // INVARIANT: Externals always have a working tree.
        if repository.is_bare() {
            return Err(BackendError::NotARepository {
                dir: dir.to_path_buf(),
                kind: "git",
            });
        }

        Ok(repository)
    }

    fn gitcall(&self, dir: &Path, args: &[&str]) -> Result<String> {
        syscall_non_interactive("git", Some(dir), &[], args)
    }
}

impl Backend for GitBackend {
    /// Clone remote into target directory.
    ///
    /// The progress of the clone is displayed through a progress bar. If the
    /// remote requires credentials, then the user will be prompted for them,
    /// and the progress bar is suspended for the duration of the prompt.
    ///
    /// The working directory is left on the remote's default branch. Moving
    /// it onto the target reference is left to [`GitBackend::checkout`].
    #[instrument(skip(self, target), level = "debug")]
    fn clone_repo(&self, target: &Target, dir: &Path) -> Result<()> {
        info!("clone {} into {:?}", target.url, dir.display());
        if let Some(parent) = dir.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent)?;
        }

        let bar = ProgressBar::new(0);
        let style = ProgressStyle::with_template(
            "{elapsed_precise:.green}  {msg:<50}  [{wide_bar:.yellow/blue}]",
        )?
        .progress_chars("-Cco.");
        bar.set_style(style);
        bar.set_message(target.url.clone());
        bar.enable_steady_tick(time::Duration::from_millis(100));

        let prompter = IndicatifPrompter::new(bar.clone());
        let authenticator = GitAuthenticator::default().set_prompter(prompter);
        let config = Config::open_default()?;

        let mut throttle = time::Instant::now();
        let mut rc = RemoteCallbacks::new();
        rc.credentials(authenticator.credentials(&config));
        rc.transfer_progress(|progress| {
            let stats = progress.to_owned();
            if throttle.elapsed() > time::Duration::from_millis(10) {
                throttle = time::Instant::now();
                bar.set_length(stats.total_objects() as u64);
                bar.set_position(stats.received_objects() as u64);
            }
            true
        });

        let mut fo = FetchOptions::new();
        fo.remote_callbacks(rc);
        let result = RepoBuilder::new().fetch_options(fo).clone(target.url.as_str(), dir);
        bar.finish_and_clear();

        result.map_err(|err| BackendError::Fetch {
            url: target.url.clone(),
            reason: err.message().to_string(),
        })?;

        Ok(())
    }

    fn current_reference(&self, dir: &Path) -> Result<Reference> {
        let repository = self.open(dir)?;
        let head = repository.head()?;
        if head.is_branch() {
            if let Some(branch) = head.shorthand() {
                return Ok(Reference::Branch(branch.to_string()));
            }
        }

        // INVARIANT: Detached HEAD is described by a tag when one points at it.
        let commit = head.peel_to_commit()?.id();
        let tags = repository.tag_names(None)?;
        for tag in tags.iter().flatten() {
            if resolve_commit(&repository, &format!("refs/tags/{tag}"))? == Some(commit) {
                return Ok(Reference::Tag(tag.to_string()));
            }
        }

        Ok(Reference::Hash(commit.to_string()))
    }

    fn remote_url(&self, dir: &Path) -> Result<Option<String>> {
        let repository = self.open(dir)?;
        origin_url(&repository)
    }

    fn is_dirty(&self, dir: &Path, nested: &[PathBuf]) -> Result<bool> {
        let repository = self.open(dir)?;
        is_dirty(&repository, nested)
    }

    fn modified_files(&self, dir: &Path, nested: &[PathBuf]) -> Result<Vec<String>> {
        let repository = self.open(dir)?;
        let mut files = changed_files(&repository, nested)?;

        let head = repository.head()?.peel_to_commit()?.id();
        if has_unpushed(&repository, head)? {
            files.push(format!("!! HEAD {head} has unpushed commits"));
        }

        Ok(files)
    }

    fn matches_target(&self, dir: &Path, target: &Target) -> Result<bool> {
        let repository = self.open(dir)?;
        let remote_matches = origin_url(&repository)?
            .map(|url| same_remote(url, &target.url))
            .unwrap_or(false);
        if !remote_matches {
            return Ok(false);
        }

        let head = repository.head()?;
        let commit = head.peel_to_commit()?.id();
        let matches = match &target.reference {
            Reference::Tag(tag) => {
                resolve_commit(&repository, &format!("refs/tags/{tag}"))? == Some(commit)
            }
            Reference::Hash(hash) => {
                repository
                    .revparse_single(hash)
                    .and_then(|object| object.peel_to_commit())
                    .map(|found| found.id())
                    .ok()
                    == Some(commit)
            }
            Reference::Branch(branch) => {
                // INVARIANT: Sharing a name is not enough, the branch must
                //   track the remote branch.
                let expect = format!("refs/remotes/{REMOTE}/{branch}");
                let upstream = match head.name() {
                    Some(name) if head.is_branch() => repository
                        .branch_upstream_name(name)
                        .ok()
                        .and_then(|buf| buf.as_str().map(ToString::to_string)),
                    _ => None,
                };

                upstream.as_deref() == Some(expect.as_str())
                    && resolve_commit(&repository, &expect)? == Some(commit)
            }
        };

        Ok(matches)
    }

    #[instrument(skip(self, target, nested), level = "debug")]
    fn checkout(&self, dir: &Path, target: &Target, nested: &[PathBuf]) -> Result<()> {
        let repository = self.open(dir)?;
        if is_dirty(&repository, nested)? {
            return Err(BackendError::Dirty {
                dir: dir.to_path_buf(),
            });
        }

        let refuse = |reason: String| BackendError::Checkout {
            dir: dir.to_path_buf(),
            reference: target.reference.clone(),
            reason,
        };

        // INVARIANT: Never reset a local branch that holds unpushed commits.
        if let Reference::Branch(branch) = &target.reference {
            if let Ok(local) = repository.find_branch(branch, BranchType::Local) {
                if let Some(oid) = local.get().target() {
                    if has_unpushed(&repository, oid)? {
                        return Err(refuse(format!(
                            "local branch {branch} has unpushed commits"
                        )));
                    }
                }
            }
        }

        match origin_url(&repository)? {
            Some(url) if same_remote(&url, &target.url) => {}
            Some(url) => {
                info!("relocate {:?} from {url} to {}", dir.display(), target.url);
                repository.remote_set_url(REMOTE, &target.url)?;
            }
            None => {
                info!("add remote {} to {:?}", target.url, dir.display());
                repository.remote(REMOTE, &target.url)?;
            }
        }

        debug!("fetch {} into {:?}", target.url, dir.display());
        self.gitcall(dir, &["fetch", "--quiet", "--tags", "--force", REMOTE])
            .map_err(|err| BackendError::Fetch {
                url: target.url.clone(),
                reason: err.to_string(),
            })?;

        info!("check out {} in {:?}", target.reference, dir.display());
        let result = match &target.reference {
            Reference::Tag(tag) => {
                let tag = format!("refs/tags/{tag}");
                self.gitcall(dir, &["checkout", "--quiet", "--detach", tag.as_str()])
            }
            Reference::Branch(branch) => {
                let upstream = format!("{REMOTE}/{branch}");
                self.gitcall(
                    dir,
                    &[
                        "checkout",
                        "--quiet",
                        "-B",
                        branch.as_str(),
                        "--track",
                        upstream.as_str(),
                    ],
                )
            }
            Reference::Hash(hash) => {
                self.gitcall(dir, &["checkout", "--quiet", "--detach", hash.as_str()])
            }
        };

        result.map_err(|err| refuse(err.to_string()))?;

        Ok(())
    }
}

fn origin_url(repository: &Repository) -> Result<Option<String>> {
    match repository.find_remote(REMOTE) {
        Ok(remote) => Ok(remote.url().map(ToString::to_string)),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn resolve_commit(repository: &Repository, refname: &str) -> Result<Option<Oid>> {
    match repository.find_reference(refname) {
        Ok(reference) => Ok(Some(reference.peel_to_commit()?.id())),
        Err(err) if err.code() == ErrorCode::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn is_dirty(repository: &Repository, nested: &[PathBuf]) -> Result<bool> {
    if !changed_files(repository, nested)?.is_empty() {
        return Ok(true);
    }

    let head = repository.head()?.peel_to_commit()?.id();
    has_unpushed(repository, head)
}

// INVARIANT: Untracked directories are listed file by file, so that content
//   next to a nested external still counts, and the nested external itself
//   does not.
fn changed_files(repository: &Repository, nested: &[PathBuf]) -> Result<Vec<String>> {
    let mut options = StatusOptions::new();
    options
        .include_untracked(true)
        .include_ignored(false)
        .recurse_untracked_dirs(true);

    let statuses = repository.statuses(Some(&mut options))?;
    let files = statuses
        .iter()
        .filter(|entry| !entry.status().is_ignored())
        .filter(|entry| !entry.path().is_some_and(|path| is_nested(path, nested)))
        .map(|entry| {
            format!(
                "{} {}",
                status_code(entry.status()),
                entry.path().unwrap_or("<non-utf8 path>")
            )
        })
        .collect();

    Ok(files)
}

// INVARIANT: Reachable from any remote-tracking branch or tag means pushed.
fn has_unpushed(repository: &Repository, start: Oid) -> Result<bool> {
    let mut walk = repository.revwalk()?;
    walk.push(start)?;

    for reference in repository.references()?.flatten() {
        let is_counterpart = reference
            .name()
            .map(|name| name.starts_with("refs/remotes/") || name.starts_with("refs/tags/"))
            .unwrap_or(false);
        if !is_counterpart {
            continue;
        }

        if let Ok(commit) = reference.peel_to_commit() {
            walk.hide(commit.id())?;
        }
    }

    Ok(walk.next().is_some())
}

fn status_code(status: Status) -> &'static str {
    if status.is_conflicted() {
        "UU"
    } else if status.is_wt_new() {
        "??"
    } else if status.is_index_new() {
        "A "
    } else if status.is_index_deleted() || status.is_wt_deleted() {
        " D"
    } else if status.is_index_renamed() || status.is_wt_renamed() {
        " R"
    } else if status.is_index_typechange() || status.is_wt_typechange() {
        " T"
    } else {
        " M"
    }
}

/// Git2 authentication prompter for progress bar.
#[derive(Debug, Clone)]
pub struct IndicatifPrompter {
    pub(crate) bar: ProgressBar,
}

impl IndicatifPrompter {
    /// Construct new progress bar authenticator.
    pub fn new(bar: ProgressBar) -> Self {
        Self { bar }
    }
}

impl Prompter for IndicatifPrompter {
    #[instrument(skip(self, url, _config), level = "debug")]
    fn prompt_username_password(
        &mut self,
        url: &str,
        _config: &git2::Config,
    ) -> Option<(String, String)> {
        info!("authentication required at {url}");
        self.bar.suspend(|| -> Option<(String, String)> {
            let username = Text::new("username").prompt().ok()?;
            let password = Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()?;
            Some((username, password))
        })
    }

    #[instrument(skip(self, username, url, _config), level = "debug")]
    fn prompt_password(
        &mut self,
        username: &str,
        url: &str,
        _config: &git2::Config,
    ) -> Option<String> {
        info!("authentication required at {url} for user {username}");
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }

    #[instrument(skip(self, ssh_key_path, _config), level = "debug")]
    fn prompt_ssh_key_passphrase(
        &mut self,
        ssh_key_path: &Path,
        _config: &git2::Config,
    ) -> Option<String> {
        info!(
            "authentication required with ssh key at {}",
            ssh_key_path.display()
        );
        self.bar.suspend(|| -> Option<String> {
            Password::new("password")
                .without_confirmation()
                .prompt()
                .ok()
        })
    }
}
