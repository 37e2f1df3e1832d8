// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Recursive checkout of external source trees.
//!
//! An __external__ is a source tree that a project depends on, pinned to a
//! tag, branch, or commit of some remote repository, and checked out at a
//! fixed path inside the project. Externals are declared in an externals
//! description. An external may carry an externals description of its own,
//! so externals form a tree of arbitrary depth.
//!
//! Oxternals walks that tree. It reports how every external relates to its
//! declaration, and moves externals onto their declared targets without ever
//! discarding local work.
//!
//! # Layout
//!
//! - [`config`] loads and validates externals descriptions.
//! - [`backend`] inspects and mutates working directories of Git and
//!   Subversion repositories.
//! - [`status`] classifies what a backend finds.
//! - [`engine`] drives the depth-first walk.
//! - [`report`] renders the outcome of a walk.

pub mod backend;
pub mod config;
pub mod engine;
pub mod path;
pub mod report;
pub mod status;

pub use engine::{Engine, EngineError, EngineOptions, Resolution, RunMode};
pub use report::StatusReport;
pub use status::SyncState;
