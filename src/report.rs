// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Status report of a run.
//!
//! Every external gets one line, depth-first, made of its state symbol, an
//! "o" for optional externals, and its path relative to the top-level
//! description:
//!
//! ```text
//! e  ./externals/simp_tag
//! -o ./externals/simp_opt
//! M  ./externals/mixed_req
//!    ./externals/mixed_req/externals/sub
//! ```
//!
//! Failures are always listed beneath their external. A verbose report
//! additionally lists local modifications, how an out of sync external
//! differs from its declaration, and what a checkout did.

use crate::{
    engine::{Action, Resolution, ResolutionResult, RunMode},
    status::SyncState,
};

use std::fmt::{Display, Formatter, Result as FmtResult};

/// Printable report of a resolution.
#[derive(Debug, Clone, Copy)]
pub struct StatusReport<'a> {
    resolution: &'a Resolution,
    verbose: bool,
}

impl<'a> StatusReport<'a> {
    pub fn new(resolution: &'a Resolution) -> Self {
        Self {
            resolution,
            verbose: false,
        }
    }

    /// Toggle verbose details.
    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    fn details(&self, fmt: &mut Formatter<'_>, result: &ResolutionResult) -> FmtResult {
        if result.after == SyncState::Modified {
            for line in result.inspection.iter().flat_map(|inspection| &inspection.modified) {
                writeln!(fmt, "    {line}")?;
            }
        }

        if result.after == SyncState::OutOfSync {
            if let (Some(target), Some(inspection)) = (&result.target, &result.inspection) {
                writeln!(fmt, "    declared {target}")?;
                match &inspection.remote {
                    Some(remote) => writeln!(fmt, "    found {} at {remote}", inspection.current)?,
                    None => writeln!(fmt, "    found {}", inspection.current)?,
                }
            }
        }

        if self.resolution.mode == RunMode::Checkout && result.action != Action::None {
            writeln!(fmt, "    action: {}", result.action)?;
        }

        Ok(())
    }
}

impl Display for StatusReport<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> FmtResult {
        for result in self.resolution.flatten() {
            let optional = match result.required {
                true => ' ',
                false => 'o',
            };
            writeln!(fmt, "{}{optional} {}", result.after.symbol(), result.display_path)?;

            if let Some(failure) = &result.failure {
                writeln!(fmt, "    error: {failure}")?;
            }

            if self.verbose {
                self.details(fmt, result)?;
            }
        }

        Ok(())
    }
}
