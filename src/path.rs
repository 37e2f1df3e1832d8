// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Path resolution utilities.
//!
//! Determine where externals live on disk relative to the description that
//! declares them, and how those locations are shown to the user.

use std::{
    fs::read_dir,
    path::{Component, Path, PathBuf},
};

/// Default file name of top-level externals description.
pub const DEFAULT_DESCRIPTION: &str = "externals.cfg";

/// Determine directory that paths of a description are relative to.
///
/// This is the directory containing the description file itself. A bare file
/// name resolves to the current directory.
pub fn description_root(description: impl AsRef<Path>) -> PathBuf {
    match description.as_ref().parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Normalize relative path lexically.
///
/// Drops "." components, and folds ".." into preceding components where
/// possible. The description directory itself normalizes to an empty path.
/// Returns [`None`] for absolute paths.
pub fn normalize_relative(path: impl AsRef<Path>) -> Option<PathBuf> {
    let mut normal = PathBuf::new();
    for component in path.as_ref().components() {
        match component {
            Component::CurDir => continue,
            Component::Normal(part) => normal.push(part),
            Component::ParentDir => {
                let can_fold = matches!(normal.components().next_back(), Some(Component::Normal(_)));
                if can_fold {
                    normal.pop();
                } else {
                    normal.push("..");
                }
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    Some(normal)
}

/// Check if two normalized relative paths share or nest their destination.
pub fn paths_overlap(first: impl AsRef<Path>, second: impl AsRef<Path>) -> bool {
    let (first, second) = (first.as_ref(), second.as_ref());
    first.starts_with(second) || second.starts_with(first)
}

/// Show path relative to top-level root as "./path".
///
/// Paths outside of the root are shown as is.
pub fn display_path(root: impl AsRef<Path>, path: impl AsRef<Path>) -> String {
    match path.as_ref().strip_prefix(root.as_ref()) {
        Ok(relative) if relative.as_os_str().is_empty() => ".".into(),
        Ok(relative) => format!("./{}", relative.display()),
        Err(_) => path.as_ref().display().to_string(),
    }
}

/// Check if directory does not exist, or exists without any content.
///
/// Either way there is nothing to inspect, and a clone may target it.
pub fn is_vacant(dir: impl AsRef<Path>) -> bool {
    match read_dir(dir.as_ref()) {
        Ok(mut entries) => entries.next().is_none(),
        Err(_) => !dir.as_ref().exists(),
    }
}
