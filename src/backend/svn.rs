// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Subversion backend.
//!
//! Subversion has no branches or tags of its own, only directories. A tag or
//! branch of an external is therefore a path appended to its repository URL,
//! e.g., tag "tags/v1.0" of "https://svn.example.org/lib" lives at
//! "https://svn.example.org/lib/tags/v1.0". A hash pins the repository URL
//! itself to a revision.
//!
//! Everything goes through the Subversion binary. Its output is read under
//! the "C" locale.
//!
//! A working copy whose repository moved to another root URL is relocated
//! root to root before switching, so that `svn relocate` only ever rewrites
//! the root of a working copy.
//!
//! Branch targets match by URL alone. Telling whether a branch gained new
//! revisions would require contacting the server, which inspection never
//! does.

use crate::{
    backend::{is_nested, same_remote, syscall_non_interactive, Backend, BackendError, Result},
    config::{Reference, Target},
};

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};
use tracing::{info, instrument};

/// Subversion repositories through the Subversion binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct SvnBackend;

impl SvnBackend {
    /// Construct new Subversion backend.
    pub fn new() -> Self {
        Self
    }

    fn svncall(
        &self,
        cwd: Option<&Path>,
        args: impl IntoIterator<Item = impl Into<OsString>>,
    ) -> Result<String> {
        let mut bin_args: Vec<OsString> = vec!["--non-interactive".into()];
        bin_args.extend(args.into_iter().map(Into::into));
        syscall_non_interactive("svn", cwd, SVN_ENV, bin_args)
    }

    fn info(&self, dir: &Path, item: &str) -> Result<String> {
        self.svncall(Some(dir), ["info", "--show-item", item, "."])
            .map(|output| output.trim().to_string())
            .map_err(|_| BackendError::NotARepository {
                dir: dir.to_path_buf(),
                kind: "svn",
            })
    }

    fn status_lines(&self, dir: &Path, nested: &[PathBuf]) -> Result<Vec<String>> {
        let output = self.svncall(Some(dir), ["status", "--ignore-externals", "."])?;
        Ok(modified_lines(&output, nested))
    }
}

impl Backend for SvnBackend {
    #[instrument(skip(self, target), level = "debug")]
    fn clone_repo(&self, target: &Target, dir: &Path) -> Result<()> {
        info!("check out {} into {:?}", target, dir.display());
        if let Some(parent) = dir.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            mkdirp::mkdirp(parent)?;
        }

        let mut args: Vec<OsString> = vec!["checkout".into(), "--quiet".into()];
        args.push(pinned_url(target).into());
        args.push(dir.as_os_str().to_os_string());

        self.svncall(None, args).map_err(|err| BackendError::Fetch {
            url: target.url.clone(),
            reason: err.to_string(),
        })?;

        Ok(())
    }

    fn current_reference(&self, dir: &Path) -> Result<Reference> {
        let url = self.info(dir, "url")?;
        let root = self.info(dir, "repos-root-url")?;
        let relative = url
            .strip_prefix(root.as_str())
            .unwrap_or(url.as_str())
            .trim_matches('/');

        if relative.is_empty() {
            return Ok(Reference::Hash(self.info(dir, "revision")?));
        }

        let is_tag = relative.starts_with("tags/") || relative.contains("/tags/");
        match is_tag {
            true => Ok(Reference::Tag(relative.to_string())),
            false => Ok(Reference::Branch(relative.to_string())),
        }
    }

    fn remote_url(&self, dir: &Path) -> Result<Option<String>> {
        Ok(Some(self.info(dir, "url")?))
    }

    fn is_dirty(&self, dir: &Path, nested: &[PathBuf]) -> Result<bool> {
        Ok(!self.status_lines(dir, nested)?.is_empty())
    }

    fn modified_files(&self, dir: &Path, nested: &[PathBuf]) -> Result<Vec<String>> {
        self.status_lines(dir, nested)
    }

    fn matches_target(&self, dir: &Path, target: &Target) -> Result<bool> {
        let url = self.info(dir, "url")?;
        if !same_remote(&url, target_url(target)) {
            return Ok(false);
        }

        match &target.reference {
            Reference::Hash(revision) => Ok(self.info(dir, "revision")? == *revision),
            Reference::Tag(_) | Reference::Branch(_) => Ok(true),
        }
    }

    #[instrument(skip(self, target, nested), level = "debug")]
    fn checkout(&self, dir: &Path, target: &Target, nested: &[PathBuf]) -> Result<()> {
        if self.is_dirty(dir, nested)? {
            return Err(BackendError::Dirty {
                dir: dir.to_path_buf(),
            });
        }

        let refuse = |err: BackendError| BackendError::Checkout {
            dir: dir.to_path_buf(),
            reference: target.reference.clone(),
            reason: err.to_string(),
        };

        // INVARIANT: Relocate when declared URL lies outside of the working
        //   copy's repository root, switch in any case.
        let root = self.info(dir, "repos-root-url")?;
        let destination = target_url(target);
        if !is_within(&destination, &root) {
            let new_root = self
                .svncall(None, ["info", "--show-item", "repos-root-url", destination.as_str()])
                .map_err(refuse)?;
            let new_root = new_root.trim();
            info!("relocate {:?} from {root} to {new_root}", dir.display());
            self.svncall(Some(dir), ["relocate", root.as_str(), new_root, "."])
                .map_err(refuse)?;
        }

        info!("switch {:?} to {}", dir.display(), target);
        self.svncall(
            Some(dir),
            ["switch", "--quiet", "--ignore-ancestry", pinned_url(target).as_str(), "."],
        )
        .map_err(refuse)?;

        Ok(())
    }
}

// INVARIANT: Always read Subversion output in the "C" locale.
const SVN_ENV: &[(&str, &str)] = &[("LC_ALL", "C")];

fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn target_url(target: &Target) -> String {
    match &target.reference {
        Reference::Tag(path) | Reference::Branch(path) => join_url(&target.url, path),
        Reference::Hash(_) => target.url.clone(),
    }
}

// INVARIANT: Only whole path segments are within a root, so ".../lib2" is not
//   within ".../lib".
fn is_within(url: &str, root: &str) -> bool {
    let root = root.trim_end_matches('/');
    let url = url.trim_end_matches('/');
    url == root
        || url
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('/'))
}

fn pinned_url(target: &Target) -> String {
    match &target.reference {
        Reference::Hash(revision) => format!("{}@{revision}", target.url.trim_end_matches('/')),
        _ => target_url(target),
    }
}

// INVARIANT: External definitions, their status headers, and nested
//   externals are not local modifications.
fn modified_lines(output: &str, nested: &[PathBuf]) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.starts_with('X'))
        .filter(|line| !line.starts_with("Performing status on external item"))
        .filter(|line| {
            !line
                .get(STATUS_COLUMNS..)
                .is_some_and(|path| is_nested(path.trim(), nested))
        })
        .map(ToString::to_string)
        .collect()
}

// Status columns and the blank that separates them from the path.
const STATUS_COLUMNS: usize = 8;
