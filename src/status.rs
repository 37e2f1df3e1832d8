// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Synchronization state of externals.

use crate::{backend::Probe, config::DependencyEntry};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// How an external's working directory relates to its declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Required external has no working directory yet.
    Empty,

    /// Optional external has no working directory yet.
    EmptyOptional,

    /// Working directory sits on declared target without local changes.
    Synced,

    /// Working directory has local changes.
    Modified,

    /// Working directory sits somewhere other than declared target.
    OutOfSync,

    /// Working directory cannot be inspected.
    Unknown,
}

impl SyncState {
    /// Terse symbol of state for status reports.
    pub fn symbol(&self) -> char {
        match self {
            Self::Empty => 'e',
            Self::EmptyOptional => '-',
            Self::Synced => ' ',
            Self::Modified => 'M',
            Self::OutOfSync => 's',
            Self::Unknown => '?',
        }
    }
}

impl Display for SyncState {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            Self::Empty => "empty",
            Self::EmptyOptional => "empty optional",
            Self::Synced => "synced",
            Self::Modified => "modified",
            Self::OutOfSync => "out of sync",
            Self::Unknown => "unknown",
        };
        fmt.write_str(name)
    }
}

/// Classify probe of an external's working directory.
///
/// Local modifications take precedence over a mismatching target, so a
/// dirty working directory is never reported as merely out of sync.
pub fn classify(entry: &DependencyEntry, probe: &Probe) -> SyncState {
    match probe {
        Probe::Missing if entry.required => SyncState::Empty,
        Probe::Missing => SyncState::EmptyOptional,
        Probe::Unrecognized(_) => SyncState::Unknown,
        Probe::Present(inspection) if inspection.dirty => SyncState::Modified,
        Probe::Present(inspection) if inspection.matches => SyncState::Synced,
        Probe::Present(_) => SyncState::OutOfSync,
    }
}
