// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Repository backends.
//!
//! A __backend__ manages exactly one kind of version-controlled working
//! directory. It knows how to materialize a working directory from a remote,
//! how to tell where that working directory currently sits, and how to move it
//! to the reference an external is declared to sit on.
//!
//! # Closed Set of Backends
//!
//! Each [`Protocol`] that names a repository maps to one backend:
//!
//! - [`GitBackend`] for "git", through libgit2 and the Git binary.
//! - [`SvnBackend`] for "svn", through the Subversion binary.
//!
//! Everything outside of this module only depends on the [`Backend`] trait.
//! Every operation receives the working directory it must act upon
//! explicitly. The current directory of the process is never changed.
//!
//! # Probing
//!
//! Inspection of a working directory is bundled into a single [`Probe`]. A
//! probe of a directory that does not exist, or that is empty, reports
//! [`Probe::Missing`]. A probe whose inspection fails, e.g., because the
//! directory is not a repository of the expected kind, reports
//! [`Probe::Unrecognized`]. Anything else is [`Probe::Present`].
//!
//! # Nested Externals
//!
//! Externals of a nested description land inside the working directory of
//! their parent. Operations that look for local modifications receive the
//! destinations of those nested externals, relative to the working directory,
//! and never count anything beneath them as a modification of the parent.

pub mod git;
pub mod svn;

pub use git::GitBackend;
pub use svn::SvnBackend;

use crate::{
    config::{Protocol, Reference, Target},
    path::is_vacant,
};

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    process::Command,
};
use tracing::{debug, instrument};

/// Capabilities of a repository backend over one working directory.
pub trait Backend {
    /// Materialize working directory of target's remote at `dir`.
    ///
    /// Creates `dir` and any missing parent directories.
    fn clone_repo(&self, target: &Target, dir: &Path) -> Result<()>;

    /// Reference working directory currently sits on.
    fn current_reference(&self, dir: &Path) -> Result<Reference>;

    /// Remote the working directory is configured to follow.
    fn remote_url(&self, dir: &Path) -> Result<Option<String>>;

    /// Check for uncommitted changes, untracked files, or unpushed commits.
    ///
    /// Anything beneath one of the `nested` destinations is ignored.
    fn is_dirty(&self, dir: &Path, nested: &[PathBuf]) -> Result<bool>;

    /// List local modifications as short status lines.
    fn modified_files(&self, dir: &Path, nested: &[PathBuf]) -> Result<Vec<String>>;

    /// Check if working directory sits on target's reference and remote.
    fn matches_target(&self, dir: &Path, target: &Target) -> Result<bool>;

    /// Move working directory onto target.
    ///
    /// Reconfigures the remote when it differs from the target's, fetches,
    /// and switches to the target's reference.
    ///
    /// # Errors
    ///
    /// - Return [`BackendError::Dirty`] if working directory has local
    ///   modifications.
    /// - Return [`BackendError::Fetch`] if remote cannot be fetched from.
    /// - Return [`BackendError::Checkout`] if reference cannot be switched to.
    fn checkout(&self, dir: &Path, target: &Target, nested: &[PathBuf]) -> Result<()>;

    /// Inspect working directory against target in one go.
    #[instrument(skip(self, target, nested), level = "debug")]
    fn probe(&self, dir: &Path, target: &Target, nested: &[PathBuf]) -> Probe {
        if is_vacant(dir) {
            return Probe::Missing;
        }

        let inspect = || -> Result<Inspection> {
            let dirty = self.is_dirty(dir, nested)?;
            let modified = match dirty {
                true => self.modified_files(dir, nested)?,
                false => Vec::new(),
            };

            Ok(Inspection {
                current: self.current_reference(dir)?,
                remote: self.remote_url(dir)?,
                dirty,
                matches: self.matches_target(dir, target)?,
                modified,
            })
        };

        match inspect() {
            Ok(inspection) => Probe::Present(inspection),
            Err(error) => {
                debug!("cannot inspect {:?}: {error}", dir.display());
                Probe::Unrecognized(error.to_string())
            }
        }
    }
}

/// Select backend for a protocol.
pub trait SelectBackend {
    /// Backend managing repositories of protocol.
    ///
    /// Protocols without a repository have no backend.
    fn select(&self, protocol: Protocol) -> Option<&dyn Backend>;
}

impl<T> SelectBackend for &T
where
    T: SelectBackend + ?Sized,
{
    fn select(&self, protocol: Protocol) -> Option<&dyn Backend> {
        (**self).select(protocol)
    }
}

/// Default set of backends.
#[derive(Debug, Default)]
pub struct Backends {
    git: GitBackend,
    svn: SvnBackend,
}

impl Backends {
    /// Construct new set of backends.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SelectBackend for Backends {
    fn select(&self, protocol: Protocol) -> Option<&dyn Backend> {
        match protocol {
            Protocol::Git => Some(&self.git),
            Protocol::Svn => Some(&self.svn),
            Protocol::ExternalsOnly => None,
        }
    }
}

/// Result of inspecting a working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// Nothing to inspect yet.
    Missing,

    /// Directory exists, but cannot be inspected.
    Unrecognized(String),

    /// Directory is a working directory of the backend.
    Present(Inspection),
}

impl Probe {
    /// Inspection details if working directory is present.
    pub fn inspection(&self) -> Option<&Inspection> {
        match self {
            Self::Present(inspection) => Some(inspection),
            _ => None,
        }
    }
}

/// Inspection details of present working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inspection {
    /// Reference working directory sits on.
    pub current: Reference,

    /// Remote working directory follows.
    pub remote: Option<String>,

    /// Working directory has local modifications.
    pub dirty: bool,

    /// Working directory sits on declared target.
    pub matches: bool,

    /// Short status lines of local modifications.
    pub modified: Vec<String>,
}

/// Compare remote URLs, ignoring trailing slashes.
pub fn same_remote(first: impl AsRef<str>, second: impl AsRef<str>) -> bool {
    first.as_ref().trim_end_matches('/') == second.as_ref().trim_end_matches('/')
}

/// Check if a path reported relative to a working directory lies beneath
/// one of the `nested` destinations.
pub(crate) fn is_nested(path: impl AsRef<Path>, nested: &[PathBuf]) -> bool {
    let path = path.as_ref();
    nested.iter().any(|dest| path.starts_with(dest))
}

/// Run external command to completion, and capture its standard output.
///
/// The command runs inside `cwd` when given, with `env` added to the
/// environment it inherits. Standard error is only reported when the command
/// fails.
pub(crate) fn syscall_non_interactive(
    cmd: impl AsRef<OsStr>,
    cwd: Option<&Path>,
    env: &[(&str, &str)],
    args: impl IntoIterator<Item = impl AsRef<OsStr>>,
) -> Result<String> {
    let mut command = Command::new(cmd.as_ref());
    command.args(args);
    command.envs(env.iter().copied());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!("run {command:?}");
    let output = command.output()?;
    let stdout = String::from_utf8_lossy(output.stdout.as_slice()).into_owned();
    let stderr = String::from_utf8_lossy(output.stderr.as_slice()).into_owned();

    if !output.status.success() {
        let message = match stderr.trim() {
            "" => stdout.trim().to_string(),
            stderr => stderr.to_string(),
        };

        return Err(BackendError::Command {
            command: format!("{command:?}"),
            message,
        });
    }

    // INVARIANT: Chomp trailing newlines.
    let stdout = stdout
        .strip_suffix("\r\n")
        .or(stdout.strip_suffix('\n'))
        .map(ToString::to_string)
        .unwrap_or(stdout);

    Ok(stdout)
}

/// Backend error types.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Directory is not a working directory of the backend.
    #[error("{:?} is not a {kind} working directory", dir.display())]
    NotARepository { dir: PathBuf, kind: &'static str },

    /// Working directory has local modifications.
    #[error("{:?} has local modifications", dir.display())]
    Dirty { dir: PathBuf },

    /// Remote cannot be cloned or fetched from.
    #[error("failed to fetch from {url}: {reason}")]
    Fetch { url: String, reason: String },

    /// Working directory cannot be switched to reference.
    #[error("failed to check out {reference} in {:?}: {reason}", dir.display())]
    Checkout {
        dir: PathBuf,
        reference: Reference,
        reason: String,
    },

    /// External command exited unsuccessfully.
    #[error("command {command} failed: {message}")]
    Command { command: String, message: String },

    /// Style template cannot be set for progress bars.
    #[error(transparent)]
    IndicatifStyleTemplate(#[from] indicatif::style::TemplateError),

    /// Operations from libgit2 fail.
    #[error(transparent)]
    Git2(#[from] git2::Error),

    /// External command cannot be spawned, or directory cannot be made.
    #[error(transparent)]
    Syscall(#[from] std::io::Error),
}

/// Friendly result alias :3
pub type Result<T, E = BackendError> = std::result::Result<T, E>;
