// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Resolution engine.
//!
//! The engine walks a tree of externals depth-first. Starting from a
//! top-level description, it probes every declared external through the
//! backend of its protocol, classifies what it finds, and, when asked to,
//! moves the external onto its declared target.
//!
//! # Run Modes
//!
//! - [`RunMode::Status`] only probes and classifies. Nothing on disk is ever
//!   touched.
//! - [`RunMode::Checkout`] clones missing externals, and checks out externals
//!   that sit somewhere other than their target. Externals with local
//!   modifications are never touched, and only reported.
//!
//! # Nested Externals
//!
//! An external may name a nested description inside its own working tree.
//! The engine only descends into an external that ends up synchronized,
//! because a nested description read from the wrong revision would declare
//! the wrong externals. A declared nested description that does not exist is
//! fine. One that cannot be loaded aborts the subtree rooted at its external,
//! but never its siblings.
//!
//! Nested externals land inside the working directory of their parent. The
//! destinations declared by the nested description are handed to the
//! backend, so that they never make their parent look modified.
//!
//! # Failures
//!
//! Failures while synchronizing one external are recorded on its
//! [`ResolutionResult`], and the walk carries on. The same goes for an
//! external whose repository URL refers to an unset environment variable.
//! Only failures that happen
//! before anything could be touched, i.e., loading the top-level description
//! or selecting components, abort a run as a whole.

use crate::{
    backend::{same_remote, Backend, Backends, Inspection, Probe, SelectBackend},
    config::{DependencyEntry, DescriptionDocument, DescriptionError, Protocol, Target},
    path::{description_root, display_path, normalize_relative},
    status::{classify, SyncState},
};

use std::{
    error::Error,
    fmt::{Display, Formatter, Result as FmtResult},
    fs::canonicalize,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument, warn};

/// What a run is allowed to do.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Report state of externals without touching them.
    Status,

    /// Synchronize externals with their declarations.
    #[default]
    Checkout,
}

/// Options of a run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EngineOptions {
    /// What run is allowed to do.
    pub mode: RunMode,

    /// Also clone optional externals that are missing.
    pub include_optional: bool,

    /// Restrict top-level externals to these names, all if empty.
    pub components: Vec<String>,
}

/// Action taken on an external.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    #[default]
    None,
    Cloned,
    CheckedOut,
    Relocated,
    SkippedDirty,
    SkippedMissingOptional,
}

impl Display for Action {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let action = match self {
            Self::None => "none",
            Self::Cloned => "cloned",
            Self::CheckedOut => "checked out",
            Self::Relocated => "relocated and checked out",
            Self::SkippedDirty => "skipped, has local modifications",
            Self::SkippedMissingOptional => "skipped, optional",
        };
        fmt.write_str(action)
    }
}

/// Outcome of resolving one external.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionResult {
    /// Name of external in its description.
    pub name: String,

    /// Location of working directory.
    pub path: PathBuf,

    /// Location shown to the user, relative to top-level description.
    pub display_path: String,

    pub protocol: Protocol,
    pub required: bool,

    /// Declared target, if external is backed by a repository.
    pub target: Option<Target>,

    /// State before run touched anything.
    pub before: SyncState,

    pub action: Action,

    /// State at the end of run.
    pub after: SyncState,

    /// Inspection of working directory at the end of run.
    pub inspection: Option<Inspection>,

    /// Reason external could not be resolved.
    pub failure: Option<String>,

    /// Externals of nested description.
    pub children: Vec<ResolutionResult>,
}

impl ResolutionResult {
    fn pending(top: &Path, dir: &Path, entry: &DependencyEntry) -> Self {
        Self {
            name: entry.name.clone(),
            path: dir.to_path_buf(),
            display_path: display_path(top, dir),
            protocol: entry.protocol,
            required: entry.required,
            target: entry.target(),
            before: SyncState::Unknown,
            action: Action::None,
            after: SyncState::Unknown,
            inspection: None,
            failure: None,
            children: Vec::new(),
        }
    }

    fn record(&mut self, state: SyncState, probe: &Probe) {
        self.after = state;
        self.inspection = probe.inspection().cloned();
    }

    fn collect<'a>(&'a self, results: &mut Vec<&'a ResolutionResult>) {
        results.push(self);
        for child in &self.children {
            child.collect(results);
        }
    }

    // INVARIANT: Optional externals and everything beneath them never fail a
    //   run.
    fn is_settled(&self, mode: RunMode, ancestors_required: bool) -> bool {
        let required = ancestors_required && self.required;
        let settled = match mode {
            RunMode::Status => self.after != SyncState::Unknown,
            RunMode::Checkout => self.after == SyncState::Synced,
        };

        if required && (!settled || self.failure.is_some()) {
            return false;
        }

        self.children
            .iter()
            .all(|child| child.is_settled(mode, required))
    }
}

/// Outcome of a whole run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub mode: RunMode,

    /// Outcomes of top-level externals.
    pub results: Vec<ResolutionResult>,
}

impl Resolution {
    /// All outcomes depth-first.
    pub fn flatten(&self) -> Vec<&ResolutionResult> {
        let mut results = Vec::new();
        for result in &self.results {
            result.collect(&mut results);
        }
        results
    }

    /// Find outcome by display path, e.g., "./externals/simp_tag".
    pub fn find(&self, display_path: &str) -> Option<&ResolutionResult> {
        self.flatten()
            .into_iter()
            .find(|result| result.display_path == display_path)
    }

    /// Check if every required external ended up where run mode expects.
    ///
    /// In status mode a required external only fails a run when it cannot
    /// be inspected, or has a failure. In checkout mode every required
    /// external must end up synchronized without failure.
    pub fn is_success(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.is_settled(self.mode, true))
    }

    /// Process exit code of run.
    pub fn exit_code(&self) -> i32 {
        match self.is_success() {
            true => 0,
            false => 1,
        }
    }
}

/// Recursive driver over a tree of externals.
#[derive(Debug, Default)]
pub struct Engine<S = Backends> {
    backends: S,
    options: EngineOptions,
}

impl<S> Engine<S>
where
    S: SelectBackend,
{
    /// Construct new engine.
    pub fn new(backends: S, options: EngineOptions) -> Self {
        Self { backends, options }
    }

    /// Resolve tree of externals rooted at top-level description.
    ///
    /// # Errors
    ///
    /// - Return [`EngineError::Description`] if top-level description cannot
    ///   be loaded.
    /// - Return [`EngineError::UnknownComponent`] if a selected component is
    ///   not declared by top-level description.
    ///
    /// In either case nothing on disk has been touched.
    pub fn run(&self, description: impl AsRef<Path>) -> Result<Resolution> {
        let description = description.as_ref();
        info!("resolve externals of {:?}", description.display());
        let document = DescriptionDocument::load(description)?;

        if let Some(unknown) = self
            .options
            .components
            .iter()
            .find(|component| !document.entries.contains_key(*component))
        {
            return Err(EngineError::UnknownComponent(unknown.clone()));
        }

        let top = description_root(description);
        let mut visited = vec![identity(description)];
        let mut results = Vec::new();
        for entry in document.entries.values() {
            if !self.options.components.is_empty() && !self.options.components.contains(&entry.name) {
                continue;
            }

            results.push(self.resolve(&top, &top, entry, &mut visited));
        }

        Ok(Resolution {
            mode: self.options.mode,
            results,
        })
    }

    #[instrument(skip(self, entry, visited), fields(entry = %entry.name), level = "debug")]
    fn resolve(
        &self,
        top: &Path,
        root: &Path,
        entry: &DependencyEntry,
        visited: &mut Vec<PathBuf>,
    ) -> ResolutionResult {
        let dir = root.join(&entry.path);
        let mut result = ResolutionResult::pending(top, &dir, entry);

        if let Some(unresolved) = &entry.unresolved {
            warn!("skip {}: {unresolved}", result.display_path);
            result.failure = Some(error_chain(unresolved));
            return result;
        }

        match (entry.target(), self.backends.select(entry.protocol)) {
            (Some(target), Some(backend)) => {
                self.synchronize(backend, &dir, entry, &target, &mut result)
            }
            (Some(_), None) => {
                result.failure = Some(format!("no backend for protocol {}", entry.protocol));
            }
            (None, _) => locate(&dir, entry, &mut result),
        }

        // INVARIANT: Only descend into externals sitting on their target.
        if result.after == SyncState::Synced && result.failure.is_none() {
            if let Some(nested) = &entry.externals {
                self.descend(top, &dir.join(nested), visited, &mut result);
            }
        }

        result
    }

    fn synchronize(
        &self,
        backend: &dyn Backend,
        dir: &Path,
        entry: &DependencyEntry,
        target: &Target,
        result: &mut ResolutionResult,
    ) {
        let nested = nested_destinations(dir, entry);
        let probe = backend.probe(dir, target, &nested);
        let before = classify(entry, &probe);
        result.before = before;
        result.record(before, &probe);

        if let Probe::Unrecognized(reason) = &probe {
            match entry.required {
                true => result.failure = Some(reason.clone()),
                false => warn!("skip optional external {}: {reason}", result.display_path),
            }
            return;
        }

        if self.options.mode == RunMode::Status {
            return;
        }

        let action = match before {
            SyncState::Empty => Action::Cloned,
            SyncState::EmptyOptional if self.options.include_optional => Action::Cloned,
            SyncState::EmptyOptional => {
                debug!("skip missing optional external {}", result.display_path);
                result.action = Action::SkippedMissingOptional;
                return;
            }
            SyncState::Modified => {
                warn!("skip {}, it has local modifications", result.display_path);
                result.action = Action::SkippedDirty;
                return;
            }
            SyncState::OutOfSync => {
                let relocate = probe
                    .inspection()
                    .and_then(|inspection| inspection.remote.as_deref())
                    .is_some_and(|remote| !same_remote(remote, &target.url));
                match relocate {
                    true => Action::Relocated,
                    false => Action::CheckedOut,
                }
            }
            SyncState::Synced | SyncState::Unknown => return,
        };

        info!("{} {}: {}", result.display_path, target, action);
        result.action = action;
        let outcome = match action {
            Action::Cloned => backend
                .clone_repo(target, dir)
                .and_then(|_| backend.checkout(dir, target, &nested)),
            _ => backend.checkout(dir, target, &nested),
        };

        if let Err(error) = outcome {
            warn!("failed to synchronize {}: {error}", result.display_path);
            result.failure = Some(error_chain(&error));
        }

        // INVARIANT: The nested description may differ after a checkout.
        let nested = nested_destinations(dir, entry);
        let probe = backend.probe(dir, target, &nested);
        result.record(classify(entry, &probe), &probe);
    }

    fn descend(
        &self,
        top: &Path,
        description: &Path,
        visited: &mut Vec<PathBuf>,
        result: &mut ResolutionResult,
    ) {
        if !description.is_file() {
            debug!("no nested description at {:?}", description.display());
            return;
        }

        let nested = identity(description);
        if visited.contains(&nested) {
            result.failure = Some(format!(
                "description {:?} includes itself",
                description.display()
            ));
            return;
        }

        let document = match DescriptionDocument::load(description) {
            Ok(document) => document,
            Err(error) => {
                warn!("cannot load nested description of {}: {error}", result.display_path);
                result.failure = Some(error_chain(&error));
                return;
            }
        };

        let root = description_root(description);
        visited.push(nested);
        for entry in document.entries.values() {
            let child = self.resolve(top, &root, entry, visited);
            result.children.push(child);
        }
        visited.pop();
    }
}

// INVARIANT: Externals without a repository are synchronized whenever their
//   directory exists.
fn locate(dir: &Path, entry: &DependencyEntry, result: &mut ResolutionResult) {
    let state = match (dir.is_dir(), entry.required) {
        (true, _) => SyncState::Synced,
        (false, true) => SyncState::Empty,
        (false, false) => SyncState::EmptyOptional,
    };

    if state != SyncState::Synced {
        warn!("{:?} does not exist", dir.display());
    }

    result.before = state;
    result.after = state;
}

/// Destinations of externals declared by nested description of `entry`,
/// relative to its working directory `dir`.
///
/// Anything that keeps the nested description from being read yields no
/// destinations. Loading it for real is left to the walk.
fn nested_destinations(dir: &Path, entry: &DependencyEntry) -> Vec<PathBuf> {
    let Some(externals) = &entry.externals else {
        return Vec::new();
    };

    let description = dir.join(externals);
    if !description.is_file() {
        return Vec::new();
    }

    let document = match DescriptionDocument::load(&description) {
        Ok(document) => document,
        Err(error) => {
            debug!("no nested destinations in {:?}: {error}", description.display());
            return Vec::new();
        }
    };

    let base = Path::new(externals).parent().unwrap_or(Path::new(""));
    document
        .entries
        .values()
        .filter(|child| child.protocol != Protocol::ExternalsOnly)
        .filter_map(|child| normalize_relative(base.join(&child.path)))
        .filter(|path| !path.as_os_str().is_empty())
        .collect()
}

fn identity(description: &Path) -> PathBuf {
    canonicalize(description).unwrap_or_else(|_| description.to_path_buf())
}

fn error_chain(error: &dyn Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(cause.to_string().as_str());
        source = cause.source();
    }

    message
}

/// Engine error types.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Top-level description cannot be loaded.
    #[error(transparent)]
    Description(#[from] DescriptionError),

    /// Selected component is not declared.
    #[error("no external named {0:?} in description")]
    UnknownComponent(String),
}

/// Friendly result alias :3
type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::BackendError,
        config::{Reference, SchemaError},
    };
    use indoc::{formatdoc, indoc};
    use pretty_assertions::assert_eq;
    use sealed_test::prelude::*;
    use std::{
        cell::{Cell, RefCell},
        collections::HashMap,
        fs::{create_dir_all, write},
    };

    #[derive(Debug, Clone)]
    struct FakeRepo {
        url: String,
        reference: Reference,
        dirty: bool,
    }

    /// Scripted backend keeping repositories in memory.
    ///
    /// Cloning leaves a marker file in the working directory so that probing
    /// sees a non-vacant directory, plus any scripted files of the remote.
    #[derive(Debug, Default)]
    struct FakeBackend {
        repos: RefCell<HashMap<PathBuf, FakeRepo>>,
        files: HashMap<String, Vec<(String, String)>>,
        failing: Vec<String>,
        mutations: Cell<usize>,
    }

    impl FakeBackend {
        fn with_file(mut self, url: &str, name: &str, data: &str) -> Self {
            self.files
                .entry(url.into())
                .or_default()
                .push((name.into(), data.into()));
            self
        }

        fn with_failing(mut self, url: &str) -> Self {
            self.failing.push(url.into());
            self
        }

        fn seed(&self, dir: &str, url: &str, reference: Reference, dirty: bool) -> anyhow::Result<()> {
            create_dir_all(dir)?;
            write(Path::new(dir).join(".fake"), url)?;
            self.repos.borrow_mut().insert(
                PathBuf::from(dir),
                FakeRepo {
                    url: url.into(),
                    reference,
                    dirty,
                },
            );
            Ok(())
        }

        fn repo(&self, dir: &Path) -> Result<FakeRepo, BackendError> {
            self.repos
                .borrow()
                .get(dir)
                .cloned()
                .ok_or_else(|| BackendError::NotARepository {
                    dir: dir.to_path_buf(),
                    kind: "fake",
                })
        }

        fn mutate(&self) {
            self.mutations.set(self.mutations.get() + 1);
        }
    }

    impl Backend for FakeBackend {
        fn clone_repo(&self, target: &Target, dir: &Path) -> Result<(), BackendError> {
            self.mutate();
            if self.failing.contains(&target.url) {
                return Err(BackendError::Fetch {
                    url: target.url.clone(),
                    reason: "remote hung up unexpectedly".into(),
                });
            }

            create_dir_all(dir)?;
            write(dir.join(".fake"), target.url.as_str())?;
            for (name, data) in self.files.get(&target.url).into_iter().flatten() {
                write(dir.join(name), data)?;
            }

            self.repos.borrow_mut().insert(
                dir.to_path_buf(),
                FakeRepo {
                    url: target.url.clone(),
                    reference: Reference::Branch("main".into()),
                    dirty: false,
                },
            );

            Ok(())
        }

        fn current_reference(&self, dir: &Path) -> Result<Reference, BackendError> {
            Ok(self.repo(dir)?.reference)
        }

        fn remote_url(&self, dir: &Path) -> Result<Option<String>, BackendError> {
            Ok(Some(self.repo(dir)?.url))
        }

        fn is_dirty(&self, dir: &Path, nested: &[PathBuf]) -> Result<bool, BackendError> {
            Ok(!self.modified_files(dir, nested)?.is_empty())
        }

        // Any directory next to the marker file that is not a nested external
        // counts as untracked.
        fn modified_files(&self, dir: &Path, nested: &[PathBuf]) -> Result<Vec<String>, BackendError> {
            let mut files = match self.repo(dir)?.dirty {
                true => vec![" M file.txt".to_string()],
                false => Vec::new(),
            };

            let externals = dir.join("externals");
            if externals.is_dir() {
                for child in std::fs::read_dir(&externals)? {
                    let name = Path::new("externals").join(child?.file_name());
                    if !nested.iter().any(|dest| name.starts_with(dest)) {
                        files.push(format!("?? {}/", name.display()));
                    }
                }
            }

            files.sort();
            Ok(files)
        }

        fn matches_target(&self, dir: &Path, target: &Target) -> Result<bool, BackendError> {
            let repo = self.repo(dir)?;
            Ok(same_remote(&repo.url, &target.url) && repo.reference == target.reference)
        }

        fn checkout(&self, dir: &Path, target: &Target, nested: &[PathBuf]) -> Result<(), BackendError> {
            self.mutate();
            if self.is_dirty(dir, nested)? {
                return Err(BackendError::Dirty {
                    dir: dir.to_path_buf(),
                });
            }

            let mut repos = self.repos.borrow_mut();
            let repo = repos.get_mut(dir).ok_or_else(|| BackendError::NotARepository {
                dir: dir.to_path_buf(),
                kind: "fake",
            })?;

            repo.url = target.url.clone();
            repo.reference = target.reference.clone();
            Ok(())
        }
    }

    impl SelectBackend for FakeBackend {
        fn select(&self, protocol: Protocol) -> Option<&dyn Backend> {
            match protocol {
                Protocol::Git | Protocol::Svn => Some(self),
                Protocol::ExternalsOnly => None,
            }
        }
    }

    fn status() -> EngineOptions {
        EngineOptions {
            mode: RunMode::Status,
            ..Default::default()
        }
    }

    fn external(name: &str, url: &str, reference: &str, required: bool) -> String {
        formatdoc! {r#"
            [{name}]
            local_path = externals/{name}
            protocol = git
            repo_url = {url}
            {reference}
            required = {required}

        "#}
    }

    fn description(externals: &[String]) -> String {
        let mut data = String::from("[externals_description]\nschema_version = 1.0.0\n\n");
        for external in externals {
            data.push_str(external);
        }
        data
    }

    #[sealed_test]
    fn checkout_is_idempotent() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[external("simp_tag", "/srv/simple-ext.git", "tag = tag1", true)]),
        )?;
        let fake = FakeBackend::default();

        let first = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let result = &first.results[0];
        assert_eq!(result.display_path, "./externals/simp_tag");
        assert_eq!(result.before, SyncState::Empty);
        assert_eq!(result.action, Action::Cloned);
        assert_eq!(result.after, SyncState::Synced);
        assert_eq!(first.exit_code(), 0);
        assert_eq!(fake.mutations.get(), 2);

        let second = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        assert_eq!(second.results[0].before, SyncState::Synced);
        assert_eq!(second.results[0].action, Action::None);
        assert_eq!(second.exit_code(), 0);
        assert_eq!(fake.mutations.get(), 2);

        let status = Engine::new(&fake, status()).run("externals.cfg")?;
        assert_eq!(status.results, second.results);

        Ok(())
    }

    #[sealed_test]
    fn status_never_mutates() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[external("simp_tag", "/srv/simple-ext.git", "tag = tag1", true)]),
        )?;
        let fake = FakeBackend::default();

        let resolution = Engine::new(&fake, status()).run("externals.cfg")?;
        assert_eq!(resolution.results[0].before, SyncState::Empty);
        assert_eq!(resolution.results[0].after, SyncState::Empty);
        assert_eq!(resolution.results[0].action, Action::None);
        assert_eq!(resolution.exit_code(), 0);
        assert_eq!(fake.mutations.get(), 0);
        assert!(!Path::new("externals").exists());

        Ok(())
    }

    #[sealed_test]
    fn missing_optional_is_tolerated() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[external("simp_opt", "/srv/simple-ext.git", "branch = feature2", false)]),
        )?;
        let fake = FakeBackend::default();

        let skipped = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        assert_eq!(skipped.results[0].before, SyncState::EmptyOptional);
        assert_eq!(skipped.results[0].action, Action::SkippedMissingOptional);
        assert_eq!(skipped.exit_code(), 0);
        assert_eq!(fake.mutations.get(), 0);

        let options = EngineOptions {
            include_optional: true,
            ..Default::default()
        };
        let included = Engine::new(&fake, options).run("externals.cfg")?;
        assert_eq!(included.results[0].action, Action::Cloned);
        assert_eq!(included.results[0].after, SyncState::Synced);
        assert_eq!(included.exit_code(), 0);

        Ok(())
    }

    #[sealed_test]
    fn dirty_external_is_never_touched() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[external("simp_tag", "/srv/simple-ext.git", "tag = tag2", true)]),
        )?;
        let fake = FakeBackend::default();
        fake.seed("./externals/simp_tag", "/srv/simple-ext.git", Reference::Tag("tag1".into()), true)?;

        let status = Engine::new(&fake, status()).run("externals.cfg")?;
        assert_eq!(status.results[0].before, SyncState::Modified);
        assert_eq!(status.exit_code(), 0);

        let checkout = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let result = &checkout.results[0];
        assert_eq!(result.action, Action::SkippedDirty);
        assert_eq!(result.after, SyncState::Modified);
        assert_eq!(
            result.inspection.as_ref().map(|inspection| inspection.modified.clone()),
            Some(vec![" M file.txt".to_string()])
        );
        assert_eq!(checkout.exit_code(), 1);
        assert_eq!(fake.mutations.get(), 0);

        Ok(())
    }

    #[sealed_test]
    fn relocate_changed_remote() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[
                external("moved", "/srv/simple-ext-fork.git", "branch = feature2", true),
                external("retagged", "/srv/simple-ext.git", "tag = tag2", true),
            ]),
        )?;
        let fake = FakeBackend::default();
        fake.seed("./externals/moved", "/srv/simple-ext.git", Reference::Branch("feature2".into()), false)?;
        fake.seed("./externals/retagged", "/srv/simple-ext.git", Reference::Tag("tag1".into()), false)?;

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;

        let moved = resolution.find("./externals/moved").ok_or(anyhow::anyhow!("no moved"))?;
        assert_eq!(moved.before, SyncState::OutOfSync);
        assert_eq!(moved.action, Action::Relocated);
        assert_eq!(moved.after, SyncState::Synced);
        assert_eq!(
            moved.inspection.as_ref().and_then(|inspection| inspection.remote.clone()),
            Some("/srv/simple-ext-fork.git".to_string())
        );

        let retagged = resolution.find("./externals/retagged").ok_or(anyhow::anyhow!("no retagged"))?;
        assert_eq!(retagged.action, Action::CheckedOut);
        assert_eq!(retagged.after, SyncState::Synced);
        assert_eq!(resolution.exit_code(), 0);

        Ok(())
    }

    #[sealed_test]
    fn discover_nested_externals_in_one_pass() -> anyhow::Result<()> {
        let container = external("container", "/srv/mixed-cont-ext.git", "branch = main", true)
            .replace("required = true", "required = true\nexternals = sub-ext.cfg");
        write("externals.cfg", description(&[container]))?;

        let nested = description(&[external("child", "/srv/simple-ext.git", "tag = tag1", true)]);
        let fake = FakeBackend::default().with_file("/srv/mixed-cont-ext.git", "sub-ext.cfg", &nested);

        let status = Engine::new(&fake, status()).run("externals.cfg")?;
        assert!(status.results[0].children.is_empty());

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let paths = resolution
            .flatten()
            .iter()
            .map(|result| (result.display_path.clone(), result.after))
            .collect::<Vec<_>>();
        assert_eq!(
            paths,
            vec![
                ("./externals/container".to_string(), SyncState::Synced),
                ("./externals/container/externals/child".to_string(), SyncState::Synced),
            ]
        );
        assert_eq!(resolution.exit_code(), 0);

        // INVARIANT: Nested externals never make their container modified.
        let again = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        assert_eq!(again.results[0].before, SyncState::Synced);
        assert_eq!(again.flatten().len(), 2);
        assert_eq!(again.exit_code(), 0);
        assert_eq!(fake.mutations.get(), 4);

        let third = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        assert_eq!(again.results, third.results);

        Ok(())
    }

    #[sealed_test]
    fn failed_clone_does_not_stop_siblings() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[
                external("broken", "/srv/broken.git", "tag = tag1", true),
                external("fine", "/srv/simple-ext.git", "tag = tag1", true),
            ]),
        )?;
        let fake = FakeBackend::default().with_failing("/srv/broken.git");

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let broken = &resolution.results[0];
        assert_eq!(broken.action, Action::Cloned);
        assert_eq!(broken.after, SyncState::Empty);
        assert!(broken
            .failure
            .as_deref()
            .is_some_and(|failure| failure.contains("remote hung up unexpectedly")));

        assert_eq!(resolution.results[1].after, SyncState::Synced);
        assert_eq!(resolution.exit_code(), 1);

        Ok(())
    }

    #[sealed_test]
    fn unset_variable_fails_only_its_external() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[
                external("broken", "${OXTERNALS_SURELY_UNSET}/broken.git", "tag = tag1", true),
                external("fine", "/srv/simple-ext.git", "tag = tag1", true),
            ]),
        )?;
        let fake = FakeBackend::default();

        let status = Engine::new(&fake, status()).run("externals.cfg")?;
        assert_eq!(status.results[1].after, SyncState::Empty);
        assert_eq!(status.exit_code(), 1);

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let broken = &resolution.results[0];
        assert_eq!(broken.action, Action::None);
        assert_eq!(broken.after, SyncState::Unknown);
        assert!(broken
            .failure
            .as_deref()
            .is_some_and(|failure| failure.contains("OXTERNALS_SURELY_UNSET")));
        assert!(!Path::new("externals/broken").exists());

        let fine = &resolution.results[1];
        assert_eq!(fine.action, Action::Cloned);
        assert_eq!(fine.after, SyncState::Synced);
        assert_eq!(resolution.exit_code(), 1);

        Ok(())
    }

    #[sealed_test]
    fn content_next_to_nested_externals_is_modification() -> anyhow::Result<()> {
        let container = external("container", "/srv/nested-cont-ext.git", "branch = main", true)
            .replace("required = true", "required = true\nexternals = sub-ext.cfg");
        write("externals.cfg", description(&[container]))?;

        let nested = description(&[external("child", "/srv/simple-ext.git", "tag = tag1", true)]);
        let fake = FakeBackend::default().with_file("/srv/nested-cont-ext.git", "sub-ext.cfg", &nested);
        Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;

        create_dir_all("externals/container/externals/scratch")?;

        let status = Engine::new(&fake, status()).run("externals.cfg")?;
        let container = &status.results[0];
        assert_eq!(container.after, SyncState::Modified);
        assert_eq!(
            container.inspection.as_ref().map(|inspection| inspection.modified.clone()),
            Some(vec!["?? externals/scratch/".to_string()])
        );

        Ok(())
    }

    #[sealed_test]
    fn unrecognized_directories() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[
                external("junk_opt", "/srv/simple-ext.git", "tag = tag1", false),
                external("junk_req", "/srv/simple-ext.git", "tag = tag1", true),
            ]),
        )?;
        for dir in ["externals/junk_opt", "externals/junk_req"] {
            create_dir_all(dir)?;
            write(Path::new(dir).join("README"), "not a repository")?;
        }
        let fake = FakeBackend::default();

        let resolution = Engine::new(&fake, status()).run("externals.cfg")?;
        assert_eq!(resolution.results[0].after, SyncState::Unknown);
        assert_eq!(resolution.results[0].failure, None);
        assert_eq!(resolution.results[1].after, SyncState::Unknown);
        assert!(resolution.results[1].failure.is_some());
        assert_eq!(resolution.exit_code(), 1);

        let checkout = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        assert_eq!(checkout.exit_code(), 1);
        assert_eq!(fake.mutations.get(), 0);

        Ok(())
    }

    #[sealed_test]
    fn reject_schema_before_touching_anything() -> anyhow::Result<()> {
        let data = description(&[external("simp_tag", "/srv/simple-ext.git", "tag = tag1", true)])
            .replace("1.0.0", "2.0.0");
        write("externals.cfg", data)?;
        let fake = FakeBackend::default();

        let result = Engine::new(&fake, EngineOptions::default()).run("externals.cfg");
        assert!(matches!(
            result,
            Err(EngineError::Description(DescriptionError::Schema(SchemaError::Unsupported(_))))
        ));
        assert_eq!(fake.mutations.get(), 0);
        assert!(!Path::new("externals").exists());

        Ok(())
    }

    #[sealed_test]
    fn restrict_to_components() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            description(&[
                external("first", "/srv/first.git", "tag = v1", true),
                external("second", "/srv/second.git", "tag = v1", true),
            ]),
        )?;
        let fake = FakeBackend::default();

        let options = EngineOptions {
            components: vec!["second".into()],
            ..Default::default()
        };
        let resolution = Engine::new(&fake, options).run("externals.cfg")?;
        assert_eq!(resolution.results.len(), 1);
        assert_eq!(resolution.results[0].name, "second");
        assert!(!Path::new("externals/first").exists());

        let options = EngineOptions {
            components: vec!["third".into()],
            ..Default::default()
        };
        let result = Engine::new(&fake, options).run("externals.cfg");
        assert!(matches!(result, Err(EngineError::UnknownComponent(name)) if name == "third"));

        Ok(())
    }

    #[sealed_test]
    fn malformed_nested_description_aborts_subtree() -> anyhow::Result<()> {
        let container = external("container", "/srv/mixed-cont-ext.git", "branch = main", true)
            .replace("required = true", "required = true\nexternals = sub-ext.cfg");
        write(
            "externals.cfg",
            description(&[container, external("sibling", "/srv/simple-ext.git", "tag = tag1", true)]),
        )?;
        let fake = FakeBackend::default().with_file(
            "/srv/mixed-cont-ext.git",
            "sub-ext.cfg",
            indoc! {r#"
                [externals_description]
                schema_version = 9.0.0
            "#},
        );

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let container = &resolution.results[0];
        assert_eq!(container.after, SyncState::Synced);
        assert!(container.children.is_empty());
        assert!(container
            .failure
            .as_deref()
            .is_some_and(|failure| failure.contains("unsupported schema version")));
        assert_eq!(resolution.results[1].after, SyncState::Synced);
        assert_eq!(resolution.exit_code(), 1);

        Ok(())
    }

    #[sealed_test]
    fn optional_subtree_never_fails_run() -> anyhow::Result<()> {
        let container = external("container", "/srv/mixed-cont-ext.git", "branch = main", false)
            .replace("required = false", "required = false\nexternals = sub-ext.cfg");
        write("externals.cfg", description(&[container]))?;

        let fake = FakeBackend::default().with_failing("/srv/broken.git");
        fake.seed(
            "./externals/container",
            "/srv/mixed-cont-ext.git",
            Reference::Branch("main".into()),
            false,
        )?;
        write(
            "externals/container/sub-ext.cfg",
            description(&[external("child", "/srv/broken.git", "tag = v1", true)]),
        )?;

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let child = resolution
            .find("./externals/container/externals/child")
            .ok_or(anyhow::anyhow!("no child"))?;
        assert!(child.failure.is_some());
        assert_eq!(resolution.exit_code(), 0);

        Ok(())
    }

    #[sealed_test]
    fn externals_only_points_at_nested_description() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            indoc! {r#"
                [externals_description]
                schema_version = 1.0.0

                [tools]
                local_path = .
                protocol = externals_only
                externals = tools.cfg
            "#},
        )?;
        write(
            "tools.cfg",
            description(&[external("lint", "/srv/lint.git", "tag = v1", true)]),
        )?;
        let fake = FakeBackend::default();

        let resolution = Engine::new(&fake, EngineOptions::default()).run("externals.cfg")?;
        let tools = &resolution.results[0];
        assert_eq!(tools.display_path, ".");
        assert_eq!(tools.after, SyncState::Synced);
        assert_eq!(tools.children[0].display_path, "./externals/lint");
        assert_eq!(tools.children[0].action, Action::Cloned);
        assert_eq!(resolution.exit_code(), 0);

        Ok(())
    }

    #[sealed_test]
    fn self_inclusion_is_a_failure() -> anyhow::Result<()> {
        write(
            "externals.cfg",
            indoc! {r#"
                [externals_description]
                schema_version = 1.0.0

                [again]
                local_path = .
                protocol = externals_only
                externals = externals.cfg
            "#},
        )?;

        let resolution = Engine::new(FakeBackend::default(), EngineOptions::default()).run("externals.cfg")?;
        assert!(resolution.results[0]
            .failure
            .as_deref()
            .is_some_and(|failure| failure.contains("includes itself")));
        assert_eq!(resolution.exit_code(), 1);

        Ok(())
    }
}
